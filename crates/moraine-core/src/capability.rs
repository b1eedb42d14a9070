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

use serde::{Deserialize, Serialize};

/// Capabilities a framework declares at (re-)subscription. Every flag gates
/// what the allocator may offer it or which terminal task states it can
/// understand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameworkCapabilities {
    pub multi_role: bool,
    pub hierarchical_role: bool,
    pub partition_aware: bool,
    pub gpu_resources: bool,
    pub revocable_resources: bool,
    pub region_aware: bool,
    pub reservation_refinement: bool,
    pub shared_resources: bool,
    pub task_killing_state: bool,
}

/// Capabilities an agent reports at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub multi_role: bool,
    pub hierarchical_role: bool,
    pub resource_provider: bool,
}
