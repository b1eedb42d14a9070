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

use crate::filter::{
    FilterHandle, InverseOfferFilter, InverseOfferFilterExpiry, OfferFilter, OfferFilterExpiry,
};
use crate::sorter::DrfSorter;
use moraine_core::{
    AgentCapabilities, AgentId, FrameworkCapabilities, FrameworkId, Quota, Resource,
    ResourceConversion, Resources, RoleName, Scalar, ScalarQuantities,
};
use protocols::{
    DomainInfo, FrameworkInfo, InverseOfferResponse, Unavailability, UnavailableResources,
};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocatorError {
    #[error("Operations race an in-flight allocation: {0}")]
    ConversionConflict(String),
}

pub type AllocatorResult<T> = Result<T, AllocatorError>;

const AGENT_RECOVERY_FACTOR: f64 = 0.8;
pub const RECOVERY_RESUME_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_REFUSE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REFUSE_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub allocation_interval: Duration,
    pub fairness_excluded_resource_names: BTreeSet<String>,
    /// Withhold agents with GPUs from frameworks that are not GPU-aware.
    pub filter_gpu_resources: bool,
    pub domain: Option<DomainInfo>,
    pub min_allocatable_cpus: f64,
    pub min_allocatable_mem: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            allocation_interval: Duration::from_secs(1),
            fairness_excluded_resource_names: BTreeSet::new(),
            filter_gpu_resources: true,
            domain: None,
            min_allocatable_cpus: 0.01,
            min_allocatable_mem: 32.0,
        }
    }
}

/// Offers and inverse offers flow out of the allocator as events; the master
/// turns them into wire offers.
#[derive(Debug)]
pub enum AllocatorEvent {
    Offers {
        framework_id: FrameworkId,
        offers: HashMap<RoleName, HashMap<AgentId, Resources>>,
    },
    InverseOffers {
        framework_id: FrameworkId,
        unavailable: HashMap<AgentId, UnavailableResources>,
    },
}

#[derive(Debug)]
struct FrameworkState {
    roles: BTreeSet<RoleName>,
    suppressed_roles: BTreeSet<RoleName>,
    capabilities: FrameworkCapabilities,
    active: bool,
    offer_filters: HashMap<RoleName, HashMap<AgentId, BTreeMap<FilterHandle, OfferFilter>>>,
    inverse_offer_filters: HashMap<AgentId, BTreeMap<FilterHandle, InverseOfferFilter>>,
}

#[derive(Debug)]
struct Maintenance {
    unavailability: Unavailability,
    offers_outstanding: HashSet<FrameworkId>,
    statuses: HashMap<FrameworkId, InverseOfferResponse>,
}

#[derive(Debug)]
struct AgentState {
    hostname: String,
    domain: Option<DomainInfo>,
    capabilities: AgentCapabilities,
    activated: bool,
    total: Resources,
    allocated: Resources,
    maintenance: Option<Maintenance>,
}

impl AgentState {
    fn available(&self) -> Resources {
        self.total.clone() - self.allocated.clone()
    }
}

/// The hierarchical two-stage DRF allocator. All methods take `&mut self`;
/// the async driver in `driver.rs` serialises access and owns the timers.
/// Operations on unknown ids are contract violations and panic.
pub struct HierarchicalAllocator {
    config: AllocatorConfig,
    events: mpsc::UnboundedSender<AllocatorEvent>,

    frameworks: HashMap<FrameworkId, FrameworkState>,
    agents: HashMap<AgentId, AgentState>,
    /// Frameworks tracked under each role, either subscribed or still
    /// holding an allocation.
    roles: HashMap<RoleName, BTreeSet<FrameworkId>>,
    quotas: HashMap<RoleName, Quota>,

    role_sorter: DrfSorter,
    quota_role_sorter: DrfSorter,
    framework_sorters: HashMap<RoleName, DrfSorter>,

    /// Total reserved scalar quantities per role, allocated or not.
    reservation_quantities: HashMap<RoleName, ScalarQuantities>,

    allocation_candidates: HashSet<AgentId>,
    whitelist: Option<HashSet<String>>,

    paused: bool,
    expected_agent_count: Option<usize>,

    next_filter_handle: u64,
    /// Handles logically removed ahead of their scheduled expiry; the timer
    /// callback frees them.
    parked_filters: HashSet<FilterHandle>,
}

impl HierarchicalAllocator {
    pub fn new(config: AllocatorConfig, events: mpsc::UnboundedSender<AllocatorEvent>) -> Self {
        let excluded = config.fairness_excluded_resource_names.clone();
        Self {
            config,
            events,
            frameworks: HashMap::new(),
            agents: HashMap::new(),
            roles: HashMap::new(),
            quotas: HashMap::new(),
            role_sorter: DrfSorter::new(excluded.clone()),
            quota_role_sorter: DrfSorter::new(excluded),
            framework_sorters: HashMap::new(),
            reservation_quantities: HashMap::new(),
            allocation_candidates: HashSet::new(),
            whitelist: None,
            paused: false,
            expected_agent_count: None,
            next_filter_handle: 0,
            parked_filters: HashSet::new(),
        }
    }

    /// Master failover: delay allocations while agents re-register so quota
    /// maths does not run against a partial view of the cluster. Returns
    /// true when the caller must schedule the unconditional resume timer.
    pub fn recover(
        &mut self,
        expected_agent_count: usize,
        quotas: HashMap<RoleName, Quota>,
    ) -> bool {
        assert!(self.agents.is_empty(), "recover() after agents were added");
        assert_eq!(self.quota_role_sorter.count(), 0);

        if quotas.is_empty() {
            debug!("Skipping allocator recovery: nothing to recover");
            return false;
        }

        for (role, quota) in quotas {
            self.set_quota(role, quota);
        }

        let expected = (expected_agent_count as f64 * AGENT_RECOVERY_FACTOR) as usize;
        if expected == 0 {
            debug!("Skipping allocator recovery: no reconnecting agents to wait for");
            return false;
        }

        self.expected_agent_count = Some(expected);
        self.pause();

        info!(
            expected_agents = expected,
            "Triggered allocator recovery: waiting for agents to reconnect"
        );
        true
    }

    pub fn pause(&mut self) {
        if !self.paused {
            debug!("Allocation paused");
            self.paused = true;
        }
    }

    pub fn resume(&mut self) {
        if self.paused {
            debug!("Allocation resumed");
            self.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // ---- Framework lifecycle -------------------------------------------

    pub fn add_framework(
        &mut self,
        framework_id: FrameworkId,
        info: &FrameworkInfo,
        used: HashMap<AgentId, Resources>,
        active: bool,
        suppressed_roles: BTreeSet<RoleName>,
    ) {
        assert!(
            !self.frameworks.contains_key(&framework_id),
            "framework {framework_id} added twice"
        );

        self.frameworks.insert(
            framework_id.clone(),
            FrameworkState {
                roles: info.roles.iter().cloned().collect(),
                suppressed_roles: suppressed_roles.clone(),
                capabilities: info.capabilities,
                active,
                offer_filters: HashMap::new(),
                inverse_offer_filters: HashMap::new(),
            },
        );

        for role in info.roles.clone() {
            self.track_framework_under_role(&framework_id, &role);

            let sorter = self
                .framework_sorters
                .get_mut(&role)
                .expect("sorter created by tracking");
            if suppressed_roles.contains(&role) {
                sorter.deactivate(framework_id.as_str());
            } else {
                sorter.activate(framework_id.as_str());
            }
        }

        for (agent_id, resources) in used {
            // The master may know about allocations on agents that have not
            // re-registered yet; those are tracked when the agent arrives.
            if !self.agents.contains_key(&agent_id) {
                continue;
            }
            self.track_allocated(&agent_id, &framework_id, &resources);
        }

        info!(framework = %framework_id, "Added framework");

        if active {
            self.trigger_allocation_for_all();
        } else {
            self.deactivate_framework(&framework_id);
        }
    }

    pub fn remove_framework(&mut self, framework_id: &FrameworkId) {
        let framework = self
            .frameworks
            .get(framework_id)
            .unwrap_or_else(|| panic!("removed unknown framework {framework_id}"));

        for role in framework.roles.clone() {
            let tracked = self
                .framework_sorters
                .get(&role)
                .is_some_and(|sorter| sorter.contains(framework_id.as_str()));
            if !tracked {
                continue;
            }

            let allocation = self.framework_sorters[&role].allocation(framework_id.as_str());
            for (agent_id, allocated) in allocation {
                self.untrack_allocated(&agent_id, framework_id, &allocated);
                if let Some(agent) = self.agents.get_mut(&agent_id) {
                    agent.allocated -= &allocated;
                }
            }

            self.untrack_framework_under_role(framework_id, &role);
        }

        // Filters stay parked until their scheduled expiry fires.
        let framework = self
            .frameworks
            .remove(framework_id)
            .expect("presence checked above");
        self.park_framework_filters(framework);

        info!(framework = %framework_id, "Removed framework");
    }

    pub fn activate_framework(&mut self, framework_id: &FrameworkId) {
        let framework = self.framework_mut(framework_id);
        framework.active = true;

        let roles: Vec<RoleName> = framework
            .roles
            .difference(&framework.suppressed_roles)
            .cloned()
            .collect();
        for role in roles {
            self.framework_sorters
                .get_mut(&role)
                .unwrap_or_else(|| panic!("no sorter for role {role}"))
                .activate(framework_id.as_str());
        }

        info!(framework = %framework_id, "Activated framework");
        self.trigger_allocation_for_all();
    }

    pub fn deactivate_framework(&mut self, framework_id: &FrameworkId) {
        let framework = self.framework_mut(framework_id);
        framework.active = false;

        let roles: Vec<RoleName> = framework.roles.iter().cloned().collect();

        // The sorters keep the allocation so a failed-over framework still
        // owns its resources when it reactivates.
        let offer_filters = std::mem::take(&mut self.framework_mut(framework_id).offer_filters);
        let inverse_filters =
            std::mem::take(&mut self.framework_mut(framework_id).inverse_offer_filters);
        self.park_filter_tables(offer_filters, inverse_filters);

        for role in roles {
            self.framework_sorters
                .get_mut(&role)
                .unwrap_or_else(|| panic!("no sorter for role {role}"))
                .deactivate(framework_id.as_str());
        }

        info!(framework = %framework_id, "Deactivated framework");
    }

    /// Applies a changed role set / suppression set / capability set.
    pub fn update_framework(
        &mut self,
        framework_id: &FrameworkId,
        info: &FrameworkInfo,
        suppressed_roles: BTreeSet<RoleName>,
    ) {
        let framework = self.framework_mut(framework_id);
        let old_roles = framework.roles.clone();
        let old_suppressed = framework.suppressed_roles.clone();
        let new_roles: BTreeSet<RoleName> = info.roles.iter().cloned().collect();

        let removed_roles: BTreeSet<RoleName> =
            old_roles.difference(&new_roles).cloned().collect();
        let added_roles: BTreeSet<RoleName> = new_roles.difference(&old_roles).cloned().collect();
        let newly_suppressed: BTreeSet<RoleName> = suppressed_roles
            .difference(&old_suppressed)
            .cloned()
            .collect();
        let newly_revived: BTreeSet<RoleName> = old_suppressed
            .difference(&suppressed_roles)
            .cloned()
            .collect();

        for role in removed_roles.union(&newly_suppressed) {
            self.framework_sorters
                .get_mut(role)
                .unwrap_or_else(|| panic!("no sorter for role {role}"))
                .deactivate(framework_id.as_str());
        }

        for role in &removed_roles {
            // Keep tracking the role while resources remain allocated to it;
            // recover_resources unwinds the tracking later.
            if self.framework_sorters[role]
                .allocation(framework_id.as_str())
                .is_empty()
            {
                self.untrack_framework_under_role(framework_id, role);
            }

            if let Some(filters) = self.framework_mut(framework_id).offer_filters.remove(role) {
                self.park_filter_tables(
                    HashMap::from([(role.clone(), filters)]),
                    HashMap::new(),
                );
            }
        }

        for role in &added_roles {
            if !self.is_framework_tracked_under_role(framework_id, role) {
                self.track_framework_under_role(framework_id, role);
            }
        }

        for role in added_roles.union(&newly_revived) {
            self.framework_sorters
                .get_mut(role)
                .unwrap_or_else(|| panic!("no sorter for role {role}"))
                .activate(framework_id.as_str());
        }

        let framework = self.framework_mut(framework_id);
        framework.roles = new_roles;
        framework.suppressed_roles = suppressed_roles;
        framework.capabilities = info.capabilities;
    }

    // ---- Agent lifecycle -----------------------------------------------

    /// Returns true when this addition completed a paused recovery and the
    /// allocator resumed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_agent(
        &mut self,
        agent_id: AgentId,
        hostname: String,
        domain: Option<DomainInfo>,
        capabilities: AgentCapabilities,
        unavailability: Option<Unavailability>,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    ) -> bool {
        assert!(
            !self.agents.contains_key(&agent_id),
            "agent {agent_id} added twice"
        );

        let allocated = Resources::sum(used.values().cloned());

        self.agents.insert(
            agent_id.clone(),
            AgentState {
                hostname,
                domain,
                capabilities,
                activated: true,
                total: total.clone(),
                allocated,
                maintenance: unavailability.map(|unavailability| Maintenance {
                    unavailability,
                    offers_outstanding: HashSet::new(),
                    statuses: HashMap::new(),
                }),
            },
        );

        self.track_reservations(&total);

        self.role_sorter.add_total(&agent_id, &total);
        // Revocable resources never satisfy quota.
        self.quota_role_sorter
            .add_total(&agent_id, &total.non_revocable());

        for (framework_id, allocation) in used {
            if !self.frameworks.contains_key(&framework_id) {
                continue;
            }
            self.track_allocated(&agent_id, &framework_id, &allocation);
        }

        let mut resumed = false;
        if self.paused
            && self
                .expected_agent_count
                .is_some_and(|expected| self.agents.len() >= expected)
        {
            info!(
                agents = self.agents.len(),
                "Recovery complete: sufficient agents re-registered"
            );
            self.expected_agent_count = None;
            self.resume();
            resumed = true;
        }

        info!(agent = %agent_id, total = %self.agents[&agent_id].total, "Added agent");

        self.trigger_allocation_for(agent_id);
        resumed
    }

    pub fn remove_agent(&mut self, agent_id: &AgentId) {
        let agent = self
            .agents
            .get(agent_id)
            .unwrap_or_else(|| panic!("removed unknown agent {agent_id}"));
        let total = agent.total.clone();

        self.role_sorter.remove_total(agent_id, &total);
        self.quota_role_sorter
            .remove_total(agent_id, &total.non_revocable());
        self.untrack_reservations(&total);

        self.agents.remove(agent_id);
        self.allocation_candidates.remove(agent_id);

        // Filters for this agent die by their scheduled expiry.

        info!(agent = %agent_id, "Removed agent");
    }

    pub fn update_agent(
        &mut self,
        agent_id: &AgentId,
        attributes_changed: bool,
        total: Option<Resources>,
        capabilities: Option<AgentCapabilities>,
    ) {
        assert!(
            self.agents.contains_key(agent_id),
            "updated unknown agent {agent_id}"
        );

        let mut updated = false;

        // Schedulers may have declined this agent based on attributes that
        // no longer hold; force a fresh decision.
        if attributes_changed {
            updated = true;
            self.remove_agent_filters(agent_id);
        }

        if let Some(capabilities) = capabilities {
            let agent = self.agents.get_mut(agent_id).expect("checked above");
            if agent.capabilities != capabilities {
                agent.capabilities = capabilities;
                updated = true;
                info!(agent = %agent_id, "Agent updated with new capabilities");
            }
        }

        if let Some(total) = total {
            updated = self.update_agent_total(agent_id, total) || updated;
        }

        if updated {
            self.trigger_allocation_for(agent_id.clone());
        }
    }

    /// Grows an agent in place when a resource provider subscribes.
    pub fn add_resource_provider(
        &mut self,
        agent_id: &AgentId,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    ) {
        assert!(
            self.agents.contains_key(agent_id),
            "resource provider added to unknown agent {agent_id}"
        );

        for (framework_id, allocation) in &used {
            if !self.frameworks.contains_key(framework_id) {
                continue;
            }
            self.track_allocated(agent_id, framework_id, allocation);
        }

        let grown = self.agents[agent_id].total.clone() + total;
        self.update_agent_total(agent_id, grown);

        let agent = self.agents.get_mut(agent_id).expect("checked above");
        agent.allocated += Resources::sum(used.into_values());

        debug!(agent = %agent_id, "Grew agent with provider resources");
    }

    pub fn activate_agent(&mut self, agent_id: &AgentId) {
        self.agent_mut(agent_id).activated = true;
        info!(agent = %agent_id, "Agent activated");
    }

    pub fn deactivate_agent(&mut self, agent_id: &AgentId) {
        self.agent_mut(agent_id).activated = false;
        info!(agent = %agent_id, "Agent deactivated");
    }

    pub fn update_whitelist(&mut self, whitelist: Option<HashSet<String>>) {
        self.whitelist = whitelist;
        if let Some(hostnames) = &self.whitelist {
            info!(count = hostnames.len(), "Updated agent whitelist");
        } else {
            info!("Cleared agent whitelist");
        }
    }

    // ---- Allocation state updates --------------------------------------

    /// Applies speculative conversions from an accepted offer to the
    /// framework's allocation and the agent's total.
    pub fn update_allocation(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        offered: &Resources,
        conversions: &[ResourceConversion],
    ) {
        assert!(self.agents.contains_key(agent_id));
        assert!(self.frameworks.contains_key(framework_id));

        let allocations = offered.allocations();
        assert_eq!(allocations.len(), 1, "offer spans multiple roles");
        let role = allocations.keys().next().expect("one role").clone();

        let updated_offered = offered
            .apply(conversions)
            .unwrap_or_else(|e| panic!("conversions failed on offered resources: {e}"));

        {
            let agent = self.agents.get_mut(agent_id).expect("checked above");
            agent.allocated -= offered;
            agent.allocated += &updated_offered;
        }

        let sorter = self
            .framework_sorters
            .get_mut(&role)
            .unwrap_or_else(|| panic!("no sorter for role {role}"));
        sorter.update(framework_id.as_str(), agent_id, offered, &updated_offered);
        sorter.remove_total(agent_id, offered);
        sorter.add_total(agent_id, &updated_offered);
        self.role_sorter
            .update(role.as_str(), agent_id, offered, &updated_offered);

        if self.quotas.contains_key(&role) {
            self.quota_role_sorter.update(
                role.as_str(),
                agent_id,
                &offered.non_revocable(),
                &updated_offered.non_revocable(),
            );
        }

        // The agent total is stored unallocated; strip allocation metadata
        // and the shared-resource bootstrap conversions (empty consumed).
        let stripped: Vec<ResourceConversion> = conversions
            .iter()
            .filter(|conversion| !conversion.consumed.is_empty())
            .map(|conversion| {
                let mut consumed = conversion.consumed.clone();
                let mut converted = conversion.converted.clone();
                consumed.unallocate();
                converted.unallocate();
                ResourceConversion::new(consumed, converted)
            })
            .collect();

        let updated_total = self.agents[agent_id]
            .total
            .apply(&stripped)
            .unwrap_or_else(|e| panic!("conversions failed on agent total: {e}"));
        self.update_agent_total(agent_id, updated_total);

        debug!(
            framework = %framework_id,
            agent = %agent_id,
            "Updated allocation with accepted conversions"
        );
    }

    /// Applies operator-initiated conversions to unoffered resources. Fails
    /// when the conversions race with an allocation that has already offered
    /// the resources out.
    pub fn update_available(
        &mut self,
        agent_id: &AgentId,
        conversions: &[ResourceConversion],
    ) -> AllocatorResult<()> {
        let agent = self
            .agents
            .get(agent_id)
            .unwrap_or_else(|| panic!("updated available on unknown agent {agent_id}"));

        agent
            .available()
            .apply(conversions)
            .map_err(|e| AllocatorError::ConversionConflict(e.to_string()))?;

        let updated_total = agent
            .total
            .apply(conversions)
            .expect("total contains available");
        self.update_agent_total(agent_id, updated_total);
        Ok(())
    }

    pub fn update_unavailability(
        &mut self,
        agent_id: &AgentId,
        unavailability: Option<Unavailability>,
    ) {
        assert!(self.agents.contains_key(agent_id));

        // Unavailability reshapes failure-domain maths; make frameworks
        // re-decide by dropping their inverse-offer filters for this agent.
        let mut parked = Vec::new();
        for framework in self.frameworks.values_mut() {
            if let Some(filters) = framework.inverse_offer_filters.remove(agent_id) {
                parked.extend(filters.into_keys());
            }
        }
        self.parked_filters.extend(parked);

        let agent = self.agents.get_mut(agent_id).expect("checked above");
        agent.maintenance = unavailability.map(|unavailability| Maintenance {
            unavailability,
            offers_outstanding: HashSet::new(),
            statuses: HashMap::new(),
        });

        self.trigger_allocation_for(agent_id.clone());
    }

    /// Records a framework's response to an inverse offer. Returns a filter
    /// expiry for the driver to schedule when a refusal filter was
    /// installed.
    pub fn update_inverse_offer(
        &mut self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        response: Option<InverseOfferResponse>,
        refuse_timeout: Option<Duration>,
        now: Instant,
    ) -> Option<InverseOfferFilterExpiry> {
        assert!(self.frameworks.contains_key(framework_id));
        let agent = self.agent_mut(agent_id);
        let maintenance = agent
            .maintenance
            .as_mut()
            .expect("inverse offer response for agent without maintenance");

        // Only an outstanding offer can be answered; anything else is stale.
        if maintenance.offers_outstanding.remove(framework_id) {
            if let Some(response) = response {
                maintenance.statuses.insert(framework_id.clone(), response);
            }
        }

        let timeout = clamp_refuse_timeout(refuse_timeout?);
        if timeout.is_zero() {
            return None;
        }

        let handle = self.next_handle();
        let framework = self.framework_mut(framework_id);
        framework
            .inverse_offer_filters
            .entry(agent_id.clone())
            .or_default()
            .insert(
                handle,
                InverseOfferFilter {
                    expires_at: now + timeout,
                },
            );

        debug!(
            framework = %framework_id,
            agent = %agent_id,
            ?timeout,
            "Framework filtered inverse offers"
        );

        Some(InverseOfferFilterExpiry {
            framework_id: framework_id.clone(),
            agent_id: agent_id.clone(),
            handle,
            after: timeout,
        })
    }

    pub fn inverse_offer_statuses(
        &self,
    ) -> HashMap<AgentId, HashMap<FrameworkId, InverseOfferResponse>> {
        self.agents
            .iter()
            .filter_map(|(agent_id, agent)| {
                agent
                    .maintenance
                    .as_ref()
                    .map(|maintenance| (agent_id.clone(), maintenance.statuses.clone()))
            })
            .collect()
    }

    /// Returns resources from a declined or rescinded offer, optionally
    /// installing a refusal filter. Returns a filter expiry to schedule.
    pub fn recover_resources(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        resources: &Resources,
        refuse_timeout: Option<Duration>,
    ) -> Option<OfferFilterExpiry> {
        if resources.is_empty() {
            return None;
        }

        // Resources are recovered within a single allocation role.
        let allocations = resources.allocations();
        assert_eq!(allocations.len(), 1, "recovered bundle spans roles");
        let role = allocations.keys().next().expect("one role").clone();

        // The framework may already be gone: offers can race removal.
        if self.frameworks.contains_key(framework_id) {
            let tracked = self
                .framework_sorters
                .get(&role)
                .is_some_and(|sorter| sorter.contains(framework_id.as_str()));
            if tracked {
                self.untrack_allocated(agent_id, framework_id, resources);

                let unsubscribed = !self.frameworks[framework_id].roles.contains(&role);
                if unsubscribed
                    && self.framework_sorters[&role]
                        .allocation(framework_id.as_str())
                        .is_empty()
                {
                    self.untrack_framework_under_role(framework_id, &role);
                }
            }
        }

        // The agent may be gone too: offers can race agent removal.
        if let Some(agent) = self.agents.get_mut(agent_id) {
            assert!(
                agent.allocated.contains(resources),
                "agent {agent_id} allocation does not contain recovered {resources}"
            );
            agent.allocated -= resources;

            debug!(
                framework = %framework_id,
                agent = %agent_id,
                total = %agent.total,
                allocated = %agent.allocated,
                "Recovered resources"
            );
        }

        let timeout = clamp_refuse_timeout(refuse_timeout?);
        if timeout.is_zero() {
            return None;
        }
        if !self.frameworks.contains_key(framework_id) || !self.agents.contains_key(agent_id) {
            return None;
        }

        // Filters are per-role already; store the bundle unallocated.
        let mut unallocated = resources.clone();
        unallocated.unallocate();

        let handle = self.next_handle();
        self.framework_mut(framework_id)
            .offer_filters
            .entry(role.clone())
            .or_default()
            .entry(agent_id.clone())
            .or_default()
            .insert(
                handle,
                OfferFilter::Refused {
                    resources: unallocated,
                },
            );

        debug!(
            framework = %framework_id,
            agent = %agent_id,
            role = %role,
            ?timeout,
            "Framework filtered agent"
        );

        // Never expire before the next allocation cycle runs for this
        // agent, otherwise the same offer reappears immediately.
        let after = timeout.max(self.config.allocation_interval);

        Some(OfferFilterExpiry {
            framework_id: framework_id.clone(),
            role,
            agent_id: agent_id.clone(),
            handle,
            after,
        })
    }

    pub fn suppress_offers(&mut self, framework_id: &FrameworkId, roles: BTreeSet<RoleName>) {
        let framework = self.framework_mut(framework_id);
        let targets = if roles.is_empty() {
            framework.roles.clone()
        } else {
            roles
        };

        for role in &targets {
            self.framework_sorters
                .get_mut(role)
                .unwrap_or_else(|| panic!("no sorter for role {role}"))
                .deactivate(framework_id.as_str());
            self.framework_mut(framework_id)
                .suppressed_roles
                .insert(role.clone());
        }

        info!(framework = %framework_id, roles = ?targets, "Suppressed offers");
    }

    pub fn revive_offers(&mut self, framework_id: &FrameworkId, roles: BTreeSet<RoleName>) {
        let framework = self.framework_mut(framework_id);
        let offer_filters = std::mem::take(&mut framework.offer_filters);
        let inverse_filters = std::mem::take(&mut framework.inverse_offer_filters);
        self.park_filter_tables(offer_filters, inverse_filters);

        let framework = self.framework_mut(framework_id);
        let targets = if roles.is_empty() {
            framework.roles.clone()
        } else {
            roles
        };

        for role in &targets {
            self.framework_sorters
                .get_mut(role)
                .unwrap_or_else(|| panic!("no sorter for role {role}"))
                .activate(framework_id.as_str());
            self.framework_mut(framework_id)
                .suppressed_roles
                .remove(role);
        }

        info!(framework = %framework_id, roles = ?targets, "Revived offers");
        self.trigger_allocation_for_all();
    }

    // ---- Quota and weights ---------------------------------------------

    /// Moves a role into the quota allocation group. Setting quota differs
    /// from updating it: a quota'd role sorts in a dedicated sorter.
    pub fn set_quota(&mut self, role: RoleName, quota: Quota) {
        assert!(
            !self.quotas.contains_key(&role),
            "quota for role {role} set twice"
        );
        assert!(role.is_quotable(), "role {role} cannot carry quota");

        self.quotas.insert(role.clone(), quota.clone());
        self.quota_role_sorter.add(role.as_str());
        self.quota_role_sorter.activate(role.as_str());

        if self.role_sorter.contains(role.as_str()) {
            for (agent_id, resources) in self.role_sorter.allocation(role.as_str()) {
                self.quota_role_sorter.allocated(
                    role.as_str(),
                    &agent_id,
                    &resources.non_revocable(),
                );
            }
        }

        info!(role = %role, guarantee = %quota.guarantee, "Set quota");
        // Quota changes take effect at the next allocation cycle; no
        // rebalancing of outstanding offers.
    }

    pub fn remove_quota(&mut self, role: &RoleName) {
        let quota = self
            .quotas
            .remove(role)
            .unwrap_or_else(|| panic!("removed quota for role {role} which has none"));
        assert!(self.quota_role_sorter.contains(role.as_str()));

        info!(role = %role, guarantee = %quota.guarantee, "Removed quota");

        // Unwind the sorter's allocation tracking before dropping the role.
        for (agent_id, resources) in self.quota_role_sorter.allocation(role.as_str()) {
            self.quota_role_sorter
                .unallocated(role.as_str(), &agent_id, &resources);
        }
        self.quota_role_sorter.remove(role.as_str());
    }

    pub fn update_weights(&mut self, weights: Vec<(RoleName, f64)>) {
        for (role, weight) in weights {
            self.quota_role_sorter.update_weight(role.as_str(), weight);
            self.role_sorter.update_weight(role.as_str(), weight);
        }
        // Weight changes are reflected in subsequent allocation cycles.
    }

    // ---- Filter expiry --------------------------------------------------

    /// Timer callback: frees a parked handle or removes the live filter.
    pub fn expire_offer_filter(
        &mut self,
        framework_id: &FrameworkId,
        role: &RoleName,
        agent_id: &AgentId,
        handle: FilterHandle,
    ) {
        if self.parked_filters.remove(&handle) {
            return;
        }

        if let Some(framework) = self.frameworks.get_mut(framework_id) {
            if let Some(by_agent) = framework.offer_filters.get_mut(role) {
                if let Some(filters) = by_agent.get_mut(agent_id) {
                    filters.remove(&handle);
                    if filters.is_empty() {
                        by_agent.remove(agent_id);
                    }
                }
                if by_agent.is_empty() {
                    framework.offer_filters.remove(role);
                }
            }
        }
    }

    pub fn expire_inverse_offer_filter(
        &mut self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        handle: FilterHandle,
    ) {
        if self.parked_filters.remove(&handle) {
            return;
        }

        if let Some(framework) = self.frameworks.get_mut(framework_id) {
            if let Some(filters) = framework.inverse_offer_filters.get_mut(agent_id) {
                filters.remove(&handle);
                if filters.is_empty() {
                    framework.inverse_offer_filters.remove(agent_id);
                }
            }
        }
    }

    // ---- Allocation ----------------------------------------------------

    /// Merges candidates and runs an allocation cycle unless paused. The
    /// driver serialises callers, so at most one cycle runs at a time.
    pub fn trigger_allocation_for(&mut self, agent_id: AgentId) {
        self.allocation_candidates.insert(agent_id);
        self.perform_allocation(Instant::now());
    }

    pub fn trigger_allocation_for_all(&mut self) {
        let all: Vec<AgentId> = self.agents.keys().cloned().collect();
        self.allocation_candidates.extend(all);
        self.perform_allocation(Instant::now());
    }

    /// One allocation cycle over the accumulated candidates: the two-stage
    /// offer generation followed by inverse-offer generation.
    pub fn perform_allocation(&mut self, now: Instant) {
        if self.paused {
            debug!("Skipped allocation: allocator is paused");
            return;
        }

        self.generate_offers();
        self.generate_inverse_offers(now);
        self.allocation_candidates.clear();
    }

    fn generate_offers(&mut self) {
        let mut agent_ids: Vec<AgentId> = self
            .allocation_candidates
            .iter()
            .filter(|agent_id| {
                self.agents
                    .get(*agent_id)
                    .is_some_and(|agent| agent.activated && self.is_whitelisted(agent))
            })
            .cloned()
            .collect();

        // Randomise agent order so the same agents do not always get
        // chopped or offered first.
        agent_ids.shuffle(&mut rand::thread_rng());

        let mut offerable: HashMap<FrameworkId, HashMap<RoleName, HashMap<AgentId, Resources>>> =
            HashMap::new();

        // Reserved quantities already allocated, per quota'd role. Needed to
        // charge unallocated reservations against quota exactly once.
        let mut allocated_reservations: HashMap<RoleName, ScalarQuantities> = HashMap::new();
        for role in self.quotas.keys() {
            let mut quantities = ScalarQuantities::new();
            for resources in self.quota_role_sorter.allocation(role.as_str()).values() {
                quantities += resources.reserved_any().to_quantities();
            }
            allocated_reservations.insert(role.clone(), quantities);
        }

        // Unreserved headroom that must be kept free to satisfy unmet
        // quota:  sum over quota'd roles of
        //   unsatisfied quota - unallocated reservations.
        let mut required_headroom = ScalarQuantities::new();
        for (role, quota) in &self.quotas {
            let allocated = self
                .quota_role_sorter
                .allocation_scalar_quantities(role.as_str());
            if allocated.contains(&quota.guarantee) {
                continue;
            }
            let unallocated = quota.guarantee.clone() - allocated;

            let unallocated_reservations = self
                .reservation_quantities
                .get(role)
                .cloned()
                .unwrap_or_default()
                - allocated_reservations.get(role).cloned().unwrap_or_default();

            required_headroom += unallocated - unallocated_reservations;
        }

        // Available headroom = total - allocated - unallocated reservations
        // - unallocated revocable.
        let mut available_headroom = self.role_sorter.total_scalar_quantities();
        for role in self.roles.keys() {
            available_headroom -= self
                .role_sorter
                .allocation_scalar_quantities(role.as_str());
        }
        for (role, reserved) in &self.reservation_quantities {
            let allocations = if self.quota_role_sorter.contains(role.as_str()) {
                self.quota_role_sorter.allocation(role.as_str())
            } else if self.role_sorter.contains(role.as_str()) {
                self.role_sorter.allocation(role.as_str())
            } else {
                HashMap::new()
            };

            let mut unallocated = reserved.clone();
            for resources in allocations.values() {
                unallocated -= resources.reserved_any().to_quantities();
            }
            available_headroom -= unallocated;
        }
        for agent in self.agents.values() {
            available_headroom -= agent.available().revocable().to_quantities();
        }

        // A shared resource may be offered at most once per framework per
        // cycle; track what went out per agent.
        let mut offered_shared: HashMap<AgentId, Resources> = HashMap::new();

        // Stage 1: quota'd roles, in quota-sorter order.
        for agent_id in &agent_ids {
            for role_name in self.quota_role_sorter.sort() {
                let role = RoleName::assume(role_name);
                let quota = self.quotas[&role].clone();

                // No active frameworks in this role: nothing to do.
                if !self.roles.contains_key(&role) {
                    continue;
                }

                let role_reservations = self
                    .reservation_quantities
                    .get(&role)
                    .cloned()
                    .unwrap_or_default();
                let role_allocated_reservations = allocated_reservations
                    .get(&role)
                    .cloned()
                    .unwrap_or_default();

                // Consumed quota = reservations + unreserved allocation;
                // reservations charge the role whether allocated or not.
                let quota_allocated = self
                    .quota_role_sorter
                    .allocation_scalar_quantities(role.as_str());
                let charged = role_reservations.clone()
                    + (quota_allocated - role_allocated_reservations);

                let mut unsatisfied_quota = quota.guarantee.clone() - charged;

                let framework_order = self.framework_sorters[&role].sort();
                for framework_name in framework_order {
                    let framework_id = FrameworkId::new(framework_name);
                    let framework = &self.frameworks[&framework_id];
                    assert!(framework.active, "suppressed framework in sort order");
                    let capabilities = framework.capabilities;

                    if self.is_agent_withheld(&framework_id, agent_id) {
                        continue;
                    }

                    let agent = &self.agents[agent_id];
                    let mut available = agent.available().non_shared();
                    if capabilities.shared_resources {
                        available += agent.total.shared_part();
                        if let Some(already) = offered_shared.get(agent_id) {
                            available -= already;
                        }
                    }

                    // Reservations for the role always go out; unreserved
                    // scalars are chopped against quota and headroom.
                    let mut resources = available.reserved(&role).non_revocable();

                    let mut new_quota_allocation = ScalarQuantities::new();
                    let mut non_quota_resources = Resources::new();

                    let mut unreserved: Vec<Resource> = available
                        .non_revocable()
                        .unreserved()
                        .iter()
                        .cloned()
                        .collect();
                    // Shuffle so repeated cycles do not always chop the
                    // same instance of interchangeable resources.
                    unreserved.shuffle(&mut rand::thread_rng());

                    for mut resource in unreserved {
                        if !resource.is_scalar() {
                            // Quota is scalar-only; ranges and sets ride
                            // along when anything else is allocated.
                            non_quota_resources.push(resource);
                            continue;
                        }

                        if quota.guarantee.get(&resource.name).is_zero() {
                            // No quota for this name: bounded by headroom.
                            let limit_pool = available_headroom.clone()
                                - required_headroom.clone()
                                - (new_quota_allocation.clone()
                                    + non_quota_resources.to_quantities());
                            let limit = limit_pool.get(&resource.name);
                            if limit.is_zero() {
                                continue;
                            }
                            if resource.shrink(limit) {
                                non_quota_resources.push(resource);
                            }
                        } else {
                            // Quota'd name: bounded by unsatisfied quota.
                            let limit_pool =
                                unsatisfied_quota.clone() - new_quota_allocation.clone();
                            let limit = limit_pool.get(&resource.name);
                            if limit.is_zero() {
                                continue;
                            }
                            if resource.shrink(limit) {
                                new_quota_allocation +=
                                    Resources::from(resource.clone()).to_quantities();
                                resources.push(resource);
                            }
                        }
                    }

                    // Non-quota resources ride along only when the role is
                    // already being allocated something.
                    if !resources.is_empty() {
                        resources += non_quota_resources;
                    }

                    // Every framework under the role sees the same bundle,
                    // so an unallocatable bundle ends the role on this
                    // agent.
                    if !self.is_allocatable(&resources) {
                        break;
                    }

                    if !capabilities.reservation_refinement {
                        resources = resources.without_refinements();
                    }

                    if self.is_filtered(&framework_id, &role, agent_id, &resources) {
                        continue;
                    }

                    debug!(
                        framework = %framework_id,
                        agent = %agent_id,
                        role = %role,
                        resources = %resources,
                        "Allocating towards role quota"
                    );

                    resources.allocate(&role);

                    *offerable
                        .entry(framework_id.clone())
                        .or_default()
                        .entry(role.clone())
                        .or_default()
                        .entry(agent_id.clone())
                        .or_default() += &resources;
                    *offered_shared.entry(agent_id.clone()).or_default() +=
                        resources.shared_part();

                    unsatisfied_quota -= new_quota_allocation.clone();
                    required_headroom -= new_quota_allocation.clone();
                    available_headroom -= resources.unreserved().to_quantities();

                    // Shared copies not yet held on this agent charge the
                    // reservation tracking exactly once.
                    let agent = &self.agents[agent_id];
                    let new_shared = resources
                        .shared_part()
                        .filter(|resource| !agent.allocated.contains_resource(resource));
                    *allocated_reservations.entry(role.clone()).or_default() +=
                        (resources.reserved(&role).non_shared() + new_shared).to_quantities();

                    let agent = self.agents.get_mut(agent_id).expect("agent exists");
                    agent.allocated += &resources;

                    self.track_allocated(agent_id, &framework_id, &resources);
                }
            }
        }

        // Stage 2: fair share for non-quota roles. Reservations and
        // revocable resources are not headroom and always ride along.
        for agent_id in &agent_ids {
            for role_name in self.role_sorter.sort() {
                let role = RoleName::assume(role_name);
                if self.quotas.contains_key(&role) {
                    continue;
                }

                let framework_order = self.framework_sorters[&role].sort();
                for framework_name in framework_order {
                    let framework_id = FrameworkId::new(framework_name);
                    let capabilities = self.frameworks[&framework_id].capabilities;

                    if self.is_agent_withheld(&framework_id, agent_id) {
                        continue;
                    }

                    let agent = &self.agents[agent_id];
                    let mut available = agent.available().non_shared();
                    if capabilities.shared_resources {
                        available += agent.total.shared_part();
                        if let Some(already) = offered_shared.get(agent_id) {
                            available -= already;
                        }
                    }

                    let mut resources = available.allocatable_to(&role);

                    // The whole role sees the same resources; stop early.
                    if !self.is_allocatable(&resources) {
                        break;
                    }

                    if !capabilities.revocable_resources {
                        resources = resources.non_revocable();
                    }
                    if !capabilities.reservation_refinement {
                        resources = resources.without_refinements();
                    }

                    // Hold the bundle back if granting it would eat the
                    // headroom reserved for unmet quota.
                    let headroom_to_allocate =
                        resources.scalars().unreserved().non_revocable();
                    let sufficient_headroom = (available_headroom.clone()
                        - headroom_to_allocate.to_quantities())
                    .contains(&required_headroom);
                    if !sufficient_headroom {
                        resources -= headroom_to_allocate.clone();
                    }

                    // Another framework under this role might still accept
                    // revocable resources; do not break.
                    if !self.is_allocatable(&resources) {
                        continue;
                    }

                    if self.is_filtered(&framework_id, &role, agent_id, &resources) {
                        continue;
                    }

                    debug!(
                        framework = %framework_id,
                        agent = %agent_id,
                        role = %role,
                        resources = %resources,
                        "Allocating remaining agent resources"
                    );

                    resources.allocate(&role);

                    // Coarse-grained: the remainder of the agent goes to a
                    // single framework per role.
                    *offerable
                        .entry(framework_id.clone())
                        .or_default()
                        .entry(role.clone())
                        .or_default()
                        .entry(agent_id.clone())
                        .or_default() += &resources;
                    *offered_shared.entry(agent_id.clone()).or_default() +=
                        resources.shared_part();

                    if sufficient_headroom {
                        available_headroom -= headroom_to_allocate.to_quantities();
                    }

                    let agent = self.agents.get_mut(agent_id).expect("agent exists");
                    agent.allocated += &resources;

                    self.track_allocated(agent_id, &framework_id, &resources);
                }
            }
        }

        if offerable.is_empty() {
            debug!("No allocations performed");
            return;
        }

        for (framework_id, offers) in offerable {
            let _ = self.events.send(AllocatorEvent::Offers {
                framework_id,
                offers,
            });
        }
    }

    /// Inverse offers for agents with a maintenance window: every active
    /// framework holding resources there is asked to vacate, at most one
    /// outstanding inverse offer per (framework, agent).
    fn generate_inverse_offers(&mut self, now: Instant) {
        if self.roles.is_empty() {
            return;
        }

        let mut offerable: HashMap<FrameworkId, HashMap<AgentId, UnavailableResources>> =
            HashMap::new();

        let candidates: Vec<AgentId> = self.allocation_candidates.iter().cloned().collect();
        let sorter_roles: Vec<RoleName> = self.framework_sorters.keys().cloned().collect();

        for role in sorter_roles {
            for agent_id in &candidates {
                let Some(agent) = self.agents.get(agent_id) else {
                    continue;
                };
                if agent.maintenance.is_none() {
                    continue;
                }

                let holders = self.framework_sorters[&role].allocation_on(agent_id);
                for framework_name in holders.keys() {
                    let framework_id = FrameworkId::new(framework_name.clone());
                    let framework = &self.frameworks[&framework_id];

                    // Inactive frameworks never see inverse offers.
                    if !framework.active {
                        continue;
                    }

                    if offerable
                        .get(&framework_id)
                        .is_some_and(|by_agent| by_agent.contains_key(agent_id))
                    {
                        continue;
                    }

                    let maintenance = self.agents[agent_id]
                        .maintenance
                        .as_ref()
                        .expect("checked above");
                    if maintenance.offers_outstanding.contains(&framework_id) {
                        continue;
                    }

                    if self.is_inverse_filtered(&framework_id, agent_id, now) {
                        continue;
                    }

                    // Maintenance is whole-agent; the resources field stays
                    // empty for now.
                    offerable.entry(framework_id.clone()).or_default().insert(
                        agent_id.clone(),
                        UnavailableResources {
                            resources: Resources::new(),
                            unavailability: maintenance.unavailability.clone(),
                        },
                    );

                    self.agents
                        .get_mut(agent_id)
                        .expect("agent exists")
                        .maintenance
                        .as_mut()
                        .expect("maintenance exists")
                        .offers_outstanding
                        .insert(framework_id.clone());
                }
            }
        }

        if offerable.is_empty() {
            return;
        }

        for (framework_id, unavailable) in offerable {
            let _ = self.events.send(AllocatorEvent::InverseOffers {
                framework_id,
                unavailable,
            });
        }
    }

    // ---- Predicates -----------------------------------------------------

    fn is_whitelisted(&self, agent: &AgentState) -> bool {
        self.whitelist
            .as_ref()
            .map_or(true, |hostnames| hostnames.contains(&agent.hostname))
    }

    fn is_allocatable(&self, resources: &Resources) -> bool {
        resources.cpus() >= Scalar::from_f64(self.config.min_allocatable_cpus)
            || resources.mem() >= Scalar::from_f64(self.config.min_allocatable_mem)
    }

    /// Global compatibility constraints checked per (framework, agent)
    /// before any per-role work.
    fn is_agent_withheld(&self, framework_id: &FrameworkId, agent_id: &AgentId) -> bool {
        let framework = &self.frameworks[framework_id];
        let agent = &self.agents[agent_id];

        if self.config.filter_gpu_resources
            && !framework.capabilities.gpu_resources
            && agent.total.gpus().is_positive()
        {
            return true;
        }

        if !framework.capabilities.region_aware && self.is_remote_agent(agent) {
            return true;
        }

        false
    }

    fn is_remote_agent(&self, agent: &AgentState) -> bool {
        let Some(agent_domain) = &agent.domain else {
            return false;
        };
        let master_domain = self
            .config
            .domain
            .as_ref()
            .expect("agent with domain registered against domainless master");
        agent_domain.fault_domain.region != master_domain.fault_domain.region
    }

    fn is_filtered(
        &self,
        framework_id: &FrameworkId,
        role: &RoleName,
        agent_id: &AgentId,
        resources: &Resources,
    ) -> bool {
        let framework = &self.frameworks[framework_id];
        let agent = &self.agents[agent_id];

        // A multi-role framework cannot decode offers from an agent that
        // predates multi-role allocation.
        if framework.capabilities.multi_role && !agent.capabilities.multi_role {
            warn!(
                agent = %agent_id,
                framework = %framework_id,
                "Withholding agent: framework is multi-role capable but the agent is not"
            );
            return true;
        }

        if role.is_hierarchical() && !agent.capabilities.hierarchical_role {
            warn!(
                agent = %agent_id,
                role = %role,
                "Withholding agent: role is hierarchical but the agent is not capable"
            );
            return true;
        }

        let Some(by_agent) = framework.offer_filters.get(role) else {
            return false;
        };
        let Some(filters) = by_agent.get(agent_id) else {
            return false;
        };

        for filter in filters.values() {
            if filter.filter(resources) {
                debug!(
                    agent = %agent_id,
                    role = %role,
                    framework = %framework_id,
                    resources = %resources,
                    "Filtered offer"
                );
                return true;
            }
        }

        false
    }

    fn is_inverse_filtered(
        &self,
        framework_id: &FrameworkId,
        agent_id: &AgentId,
        now: Instant,
    ) -> bool {
        let framework = &self.frameworks[framework_id];
        framework
            .inverse_offer_filters
            .get(agent_id)
            .is_some_and(|filters| filters.values().any(|filter| filter.filter(now)))
    }

    // ---- Tracking helpers ----------------------------------------------

    fn is_framework_tracked_under_role(
        &self,
        framework_id: &FrameworkId,
        role: &RoleName,
    ) -> bool {
        self.roles
            .get(role)
            .is_some_and(|tracked| tracked.contains(framework_id))
    }

    fn track_framework_under_role(&mut self, framework_id: &FrameworkId, role: &RoleName) {
        if !self.roles.contains_key(role) {
            self.roles.insert(role.clone(), BTreeSet::new());
            assert!(!self.role_sorter.contains(role.as_str()));
            self.role_sorter.add(role.as_str());
            self.role_sorter.activate(role.as_str());

            assert!(!self.framework_sorters.contains_key(role));
            self.framework_sorters.insert(
                role.clone(),
                DrfSorter::new(self.config.fairness_excluded_resource_names.clone()),
            );
        }

        let tracked = self.roles.get_mut(role).expect("inserted above");
        assert!(
            tracked.insert(framework_id.clone()),
            "framework {framework_id} already tracked under role {role}"
        );

        let sorter = self.framework_sorters.get_mut(role).expect("exists");
        assert!(!sorter.contains(framework_id.as_str()));
        sorter.add(framework_id.as_str());
    }

    fn untrack_framework_under_role(&mut self, framework_id: &FrameworkId, role: &RoleName) {
        let tracked = self
            .roles
            .get_mut(role)
            .unwrap_or_else(|| panic!("role {role} is not tracked"));
        assert!(
            tracked.remove(framework_id),
            "framework {framework_id} is not tracked under role {role}"
        );
        self.framework_sorters
            .get_mut(role)
            .expect("sorter exists while role is tracked")
            .remove(framework_id.as_str());

        // Many role names come and go over a cluster's lifetime; drop all
        // role state once the last framework leaves. A quota'd role stays in
        // the quota sorter regardless: quota shapes allocation even with no
        // subscribed frameworks.
        if tracked.is_empty() {
            assert_eq!(self.framework_sorters[role].count(), 0);
            self.roles.remove(role);
            self.role_sorter.remove(role.as_str());
            self.framework_sorters.remove(role);
        }
    }

    fn track_reservations(&mut self, resources: &Resources) {
        for (role, reserved) in resources.reservations() {
            let quantities = reserved.to_quantities();
            *self
                .reservation_quantities
                .entry(role)
                .or_default() += quantities;
        }
    }

    fn untrack_reservations(&mut self, resources: &Resources) {
        for (role, reserved) in resources.reservations() {
            let quantities = reserved.to_quantities();
            let current = self
                .reservation_quantities
                .get_mut(&role)
                .unwrap_or_else(|| panic!("reservations for role {role} are not tracked"));
            assert!(
                current.contains(&quantities),
                "untracked more reservations than tracked for role {role}"
            );
            *current -= quantities;
            if current.is_empty() {
                self.reservation_quantities.remove(&role);
            }
        }
    }

    fn update_agent_total(&mut self, agent_id: &AgentId, total: Resources) -> bool {
        let agent = self.agents.get_mut(agent_id).expect("agent exists");
        let old_total = agent.total.clone();
        if old_total == total {
            return false;
        }
        agent.total = total.clone();

        self.untrack_reservations(&old_total);
        self.track_reservations(&total);

        // The root sorters carry the full agent total; swap it wholesale.
        self.role_sorter.remove_total(agent_id, &old_total);
        self.role_sorter.add_total(agent_id, &total);
        self.quota_role_sorter
            .remove_total(agent_id, &old_total.non_revocable());
        self.quota_role_sorter
            .add_total(agent_id, &total.non_revocable());

        true
    }

    fn track_allocated(
        &mut self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        allocated: &Resources,
    ) {
        assert!(self.agents.contains_key(agent_id));
        assert!(self.frameworks.contains_key(framework_id));

        for (role, allocation) in allocated.allocations() {
            // The framework may hold resources under a role it has since
            // unsubscribed from; track it regardless.
            if !self.is_framework_tracked_under_role(framework_id, &role) {
                self.track_framework_under_role(framework_id, &role);
            }

            self.role_sorter
                .allocated(role.as_str(), agent_id, &allocation);

            let sorter = self
                .framework_sorters
                .get_mut(&role)
                .expect("sorter exists while role is tracked");
            sorter.add_total(agent_id, &allocation);
            sorter.allocated(framework_id.as_str(), agent_id, &allocation);

            if self.quotas.contains_key(&role) {
                self.quota_role_sorter.allocated(
                    role.as_str(),
                    agent_id,
                    &allocation.non_revocable(),
                );
            }
        }
    }

    fn untrack_allocated(
        &mut self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        allocated: &Resources,
    ) {
        assert!(self.frameworks.contains_key(framework_id));

        for (role, allocation) in allocated.allocations() {
            let sorter = self
                .framework_sorters
                .get_mut(&role)
                .unwrap_or_else(|| panic!("no sorter for role {role}"));
            sorter.unallocated(framework_id.as_str(), agent_id, &allocation);
            sorter.remove_total(agent_id, &allocation);

            self.role_sorter
                .unallocated(role.as_str(), agent_id, &allocation);

            if self.quotas.contains_key(&role) {
                self.quota_role_sorter.unallocated(
                    role.as_str(),
                    agent_id,
                    &allocation.non_revocable(),
                );
            }
        }
    }

    // ---- Filter parking -------------------------------------------------

    /// Drops every filter that names this agent, parking the handles for
    /// their scheduled expiries.
    fn remove_agent_filters(&mut self, agent_id: &AgentId) {
        let mut parked = Vec::new();
        for framework in self.frameworks.values_mut() {
            for by_agent in framework.offer_filters.values_mut() {
                if let Some(filters) = by_agent.remove(agent_id) {
                    parked.extend(filters.into_keys());
                }
            }
            framework
                .offer_filters
                .retain(|_, by_agent| !by_agent.is_empty());
            if let Some(filters) = framework.inverse_offer_filters.remove(agent_id) {
                parked.extend(filters.into_keys());
            }
        }
        self.parked_filters.extend(parked);
    }

    fn next_handle(&mut self) -> FilterHandle {
        let handle = FilterHandle(self.next_filter_handle);
        self.next_filter_handle += 1;
        handle
    }

    fn park_framework_filters(&mut self, framework: FrameworkState) {
        self.park_filter_tables(framework.offer_filters, framework.inverse_offer_filters);
    }

    fn park_filter_tables(
        &mut self,
        offer_filters: HashMap<RoleName, HashMap<AgentId, BTreeMap<FilterHandle, OfferFilter>>>,
        inverse_filters: HashMap<AgentId, BTreeMap<FilterHandle, InverseOfferFilter>>,
    ) {
        for by_agent in offer_filters.into_values() {
            for filters in by_agent.into_values() {
                self.parked_filters.extend(filters.into_keys());
            }
        }
        for filters in inverse_filters.into_values() {
            self.parked_filters.extend(filters.into_keys());
        }
    }

    // ---- Accessors ------------------------------------------------------

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn has_framework(&self, framework_id: &FrameworkId) -> bool {
        self.frameworks.contains_key(framework_id)
    }

    pub fn agent_allocated(&self, agent_id: &AgentId) -> Resources {
        self.agents
            .get(agent_id)
            .map(|agent| agent.allocated.clone())
            .unwrap_or_default()
    }

    pub fn agent_total(&self, agent_id: &AgentId) -> Resources {
        self.agents
            .get(agent_id)
            .map(|agent| agent.total.clone())
            .unwrap_or_default()
    }

    fn framework_mut(&mut self, framework_id: &FrameworkId) -> &mut FrameworkState {
        self.frameworks
            .get_mut(framework_id)
            .unwrap_or_else(|| panic!("unknown framework {framework_id}"))
    }

    fn agent_mut(&mut self, agent_id: &AgentId) -> &mut AgentState {
        self.agents
            .get_mut(agent_id)
            .unwrap_or_else(|| panic!("unknown agent {agent_id}"))
    }
}

fn clamp_refuse_timeout(requested: Duration) -> Duration {
    if requested > MAX_REFUSE_TIMEOUT {
        warn!("Clamping refuse timeout to 365 days: requested value is too large");
        MAX_REFUSE_TIMEOUT
    } else {
        requested
    }
}
