// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use crate::resources::ScalarQuantities;
use serde::{Deserialize, Serialize};

/// A guaranteed minimum of scalar quantities for a role. Quota is a
/// guarantee, not a limit: a role may hold more than its guarantee, and the
/// allocator only withholds headroom for the unsatisfied part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub guarantee: ScalarQuantities,
}

impl Quota {
    pub fn new(guarantee: ScalarQuantities) -> Self {
        Self { guarantee }
    }
}
