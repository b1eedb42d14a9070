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

use crate::allocator::{
    AllocatorConfig, AllocatorEvent, HierarchicalAllocator, RECOVERY_RESUME_TIMEOUT,
};
use moraine_core::{
    AgentCapabilities, AgentId, FrameworkId, Quota, ResourceConversion, Resources, RoleName,
};
use protocols::{DomainInfo, FrameworkInfo, InverseOfferResponse, Unavailability};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::debug;

/// Async front door to the allocator. A single mutex serialises every call
/// and every timer callback, so the core runs strictly one operation at a
/// time; callers awaiting the lock are the component's message queue.
#[derive(Clone)]
pub struct Allocator {
    inner: Arc<Mutex<HierarchicalAllocator>>,
}

impl Allocator {
    /// Creates the allocator and starts the periodic allocation driver.
    /// Offers and inverse offers arrive on the returned receiver.
    pub fn start(config: AllocatorConfig) -> (Self, mpsc::UnboundedReceiver<AllocatorEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let allocation_interval = config.allocation_interval;
        let inner = Arc::new(Mutex::new(HierarchicalAllocator::new(config, events)));

        let allocator = Self { inner };

        let ticker = allocator.clone();
        tokio::spawn(async move {
            let mut timer = interval(allocation_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                ticker.inner.lock().await.trigger_allocation_for_all();
            }
        });

        (allocator, event_rx)
    }

    pub async fn recover(&self, expected_agent_count: usize, quotas: HashMap<RoleName, Quota>) {
        let paused = self
            .inner
            .lock()
            .await
            .recover(expected_agent_count, quotas);

        if paused {
            // Resume unconditionally after the hold-off window; agents that
            // never come back must not park the cluster forever.
            let allocator = self.clone();
            tokio::spawn(async move {
                sleep(RECOVERY_RESUME_TIMEOUT).await;
                let mut inner = allocator.inner.lock().await;
                if inner.is_paused() {
                    debug!("Allocator recovery hold-off expired; resuming");
                    inner.resume();
                }
            });
        }
    }

    pub async fn add_framework(
        &self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
        used: HashMap<AgentId, Resources>,
        active: bool,
        suppressed_roles: BTreeSet<RoleName>,
    ) {
        self.inner
            .lock()
            .await
            .add_framework(framework_id, &info, used, active, suppressed_roles);
    }

    pub async fn remove_framework(&self, framework_id: FrameworkId) {
        self.inner.lock().await.remove_framework(&framework_id);
    }

    pub async fn activate_framework(&self, framework_id: FrameworkId) {
        self.inner.lock().await.activate_framework(&framework_id);
    }

    pub async fn deactivate_framework(&self, framework_id: FrameworkId) {
        self.inner.lock().await.deactivate_framework(&framework_id);
    }

    pub async fn update_framework(
        &self,
        framework_id: FrameworkId,
        info: FrameworkInfo,
        suppressed_roles: BTreeSet<RoleName>,
    ) {
        self.inner
            .lock()
            .await
            .update_framework(&framework_id, &info, suppressed_roles);
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_agent(
        &self,
        agent_id: AgentId,
        hostname: String,
        domain: Option<DomainInfo>,
        capabilities: AgentCapabilities,
        unavailability: Option<Unavailability>,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    ) {
        self.inner.lock().await.add_agent(
            agent_id,
            hostname,
            domain,
            capabilities,
            unavailability,
            total,
            used,
        );
    }

    pub async fn remove_agent(&self, agent_id: AgentId) {
        self.inner.lock().await.remove_agent(&agent_id);
    }

    pub async fn update_agent(
        &self,
        agent_id: AgentId,
        attributes_changed: bool,
        total: Option<Resources>,
        capabilities: Option<AgentCapabilities>,
    ) {
        self.inner
            .lock()
            .await
            .update_agent(&agent_id, attributes_changed, total, capabilities);
    }

    pub async fn add_resource_provider(
        &self,
        agent_id: AgentId,
        total: Resources,
        used: HashMap<FrameworkId, Resources>,
    ) {
        self.inner
            .lock()
            .await
            .add_resource_provider(&agent_id, total, used);
    }

    pub async fn activate_agent(&self, agent_id: AgentId) {
        self.inner.lock().await.activate_agent(&agent_id);
    }

    pub async fn deactivate_agent(&self, agent_id: AgentId) {
        self.inner.lock().await.deactivate_agent(&agent_id);
    }

    pub async fn update_whitelist(&self, whitelist: Option<HashSet<String>>) {
        self.inner.lock().await.update_whitelist(whitelist);
    }

    pub async fn update_allocation(
        &self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        offered: Resources,
        conversions: Vec<ResourceConversion>,
    ) {
        self.inner
            .lock()
            .await
            .update_allocation(&framework_id, &agent_id, &offered, &conversions);
    }

    pub async fn update_available(
        &self,
        agent_id: AgentId,
        conversions: Vec<ResourceConversion>,
    ) -> crate::allocator::AllocatorResult<()> {
        self.inner
            .lock()
            .await
            .update_available(&agent_id, &conversions)
    }

    pub async fn update_unavailability(
        &self,
        agent_id: AgentId,
        unavailability: Option<Unavailability>,
    ) {
        self.inner
            .lock()
            .await
            .update_unavailability(&agent_id, unavailability);
    }

    pub async fn update_inverse_offer(
        &self,
        agent_id: AgentId,
        framework_id: FrameworkId,
        response: Option<InverseOfferResponse>,
        refuse_timeout: Option<Duration>,
    ) {
        let expiry = self.inner.lock().await.update_inverse_offer(
            &agent_id,
            &framework_id,
            response,
            refuse_timeout,
            Instant::now(),
        );

        if let Some(expiry) = expiry {
            let allocator = self.clone();
            tokio::spawn(async move {
                sleep(expiry.after).await;
                allocator.inner.lock().await.expire_inverse_offer_filter(
                    &expiry.framework_id,
                    &expiry.agent_id,
                    expiry.handle,
                );
            });
        }
    }

    pub async fn inverse_offer_statuses(
        &self,
    ) -> HashMap<AgentId, HashMap<FrameworkId, InverseOfferResponse>> {
        self.inner.lock().await.inverse_offer_statuses()
    }

    pub async fn recover_resources(
        &self,
        framework_id: FrameworkId,
        agent_id: AgentId,
        resources: Resources,
        refuse_timeout: Option<Duration>,
    ) {
        let expiry = self.inner.lock().await.recover_resources(
            &framework_id,
            &agent_id,
            &resources,
            refuse_timeout,
        );

        // Resource recovery deliberately does not trigger an allocation
        // cycle; the periodic tick picks the agent up. The filter expiry is
        // scheduled past the next cycle so the decline actually sticks.
        if let Some(expiry) = expiry {
            let allocator = self.clone();
            tokio::spawn(async move {
                sleep(expiry.after).await;
                allocator.inner.lock().await.expire_offer_filter(
                    &expiry.framework_id,
                    &expiry.role,
                    &expiry.agent_id,
                    expiry.handle,
                );
            });
        }
    }

    pub async fn suppress_offers(&self, framework_id: FrameworkId, roles: BTreeSet<RoleName>) {
        self.inner
            .lock()
            .await
            .suppress_offers(&framework_id, roles);
    }

    pub async fn revive_offers(&self, framework_id: FrameworkId, roles: BTreeSet<RoleName>) {
        self.inner.lock().await.revive_offers(&framework_id, roles);
    }

    pub async fn set_quota(&self, role: RoleName, quota: Quota) {
        self.inner.lock().await.set_quota(role, quota);
    }

    pub async fn remove_quota(&self, role: RoleName) {
        self.inner.lock().await.remove_quota(&role);
    }

    pub async fn update_weights(&self, weights: Vec<(RoleName, f64)>) {
        self.inner.lock().await.update_weights(weights);
    }

    /// Runs an allocation cycle immediately for the given agents (or all).
    pub async fn allocate(&self, agents: Option<Vec<AgentId>>) {
        let mut inner = self.inner.lock().await;
        match agents {
            Some(agents) => {
                for agent_id in agents {
                    inner.trigger_allocation_for(agent_id);
                }
            }
            None => inner.trigger_allocation_for_all(),
        }
    }

    pub async fn pause(&self) {
        self.inner.lock().await.pause();
    }

    pub async fn resume(&self) {
        self.inner.lock().await.resume();
    }
}
