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

use moraine_core::{AgentId, FrameworkId, Resources, RoleName};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Identifies one installed filter for the whole of its scheduled lifetime.
/// Handles are monotonic and never reused, so an expiry firing after the
/// filter was logically removed is a harmless no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FilterHandle(pub u64);

/// A per-(framework, role, agent) exclusion from offers.
#[derive(Debug, Clone)]
pub enum OfferFilter {
    /// Installed when a framework declines an offer: future offers are
    /// suppressed while the declined bundle is a superset of what would be
    /// offered.
    Refused { resources: Resources },
}

impl OfferFilter {
    pub fn filter(&self, offered: &Resources) -> bool {
        match self {
            OfferFilter::Refused { resources } => resources.contains(offered),
        }
    }
}

/// Inverse offers are whole-agent, so their filters are time-based only.
#[derive(Debug, Clone)]
pub struct InverseOfferFilter {
    pub expires_at: Instant,
}

impl InverseOfferFilter {
    pub fn filter(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A scheduled offer-filter expiry the driver turns into a timer. The timer
/// fires `expire_offer_filter` with the same coordinates.
#[derive(Debug, Clone)]
pub struct OfferFilterExpiry {
    pub framework_id: FrameworkId,
    pub role: RoleName,
    pub agent_id: AgentId,
    pub handle: FilterHandle,
    pub after: Duration,
}

#[derive(Debug, Clone)]
pub struct InverseOfferFilterExpiry {
    pub framework_id: FrameworkId,
    pub agent_id: AgentId,
    pub handle: FilterHandle,
    pub after: Duration,
}
