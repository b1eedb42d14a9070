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

use moraine_core::{AgentId, Resources, Scalar, ScalarQuantities};
use std::collections::{BTreeSet, HashMap};

/// Weighted dominant-resource-fairness ordering over clients sharing a total
/// resource pool. Clients are plain strings: role paths in the role sorters,
/// framework ids in the per-role framework sorters.
///
/// Deactivated clients keep their allocation but are excluded from `sort`.
/// Bookkeeping violations (removing resources that were never tracked,
/// duplicating a distinct resource instance) are process-fatal.
#[derive(Debug, Default)]
pub struct DrfSorter {
    clients: HashMap<String, Client>,
    /// Tie-break order: first insertion wins.
    insertion: Vec<String>,
    /// Weights survive client churn so a weight set before a client joins
    /// still applies.
    weights: HashMap<String, f64>,
    total: Pool,
    fairness_excluded: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Client {
    active: bool,
    allocations: HashMap<AgentId, Resources>,
    quantities: ScalarQuantities,
}

#[derive(Debug, Default)]
struct Pool {
    resources: HashMap<AgentId, Resources>,
    quantities: ScalarQuantities,
}

impl DrfSorter {
    pub fn new(fairness_excluded: BTreeSet<String>) -> Self {
        Self {
            fairness_excluded,
            ..Self::default()
        }
    }

    pub fn contains(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn add(&mut self, client: &str) {
        assert!(
            !self.clients.contains_key(client),
            "sorter already tracks client '{client}'"
        );
        self.clients.insert(client.to_string(), Client::default());
        self.insertion.push(client.to_string());
    }

    pub fn remove(&mut self, client: &str) {
        let state = self
            .clients
            .remove(client)
            .unwrap_or_else(|| panic!("sorter does not track client '{client}'"));
        assert!(
            state.allocations.values().all(Resources::is_empty),
            "removed client '{client}' still holds an allocation"
        );
        self.insertion.retain(|name| name != client);
    }

    pub fn activate(&mut self, client: &str) {
        self.client_mut(client).active = true;
    }

    pub fn deactivate(&mut self, client: &str) {
        self.client_mut(client).active = false;
    }

    pub fn update_weight(&mut self, client: &str, weight: f64) {
        assert!(weight > 0.0, "weight for '{client}' must be positive");
        self.weights.insert(client.to_string(), weight);
    }

    /// Grows the total pool with an agent's resources.
    pub fn add_total(&mut self, agent_id: &AgentId, resources: &Resources) {
        if resources.is_empty() {
            return;
        }
        *self
            .total
            .resources
            .entry(agent_id.clone())
            .or_default() += resources;
        self.total.quantities += resources.to_quantities();
    }

    /// Shrinks the total pool. The resources must have been added before.
    pub fn remove_total(&mut self, agent_id: &AgentId, resources: &Resources) {
        if resources.is_empty() {
            return;
        }
        let pool = self
            .total
            .resources
            .get_mut(agent_id)
            .unwrap_or_else(|| panic!("agent {agent_id} is not in the sorter pool"));
        assert!(
            pool.contains(resources),
            "pool for agent {agent_id} does not contain {resources}"
        );
        *pool -= resources;
        if pool.is_empty() {
            self.total.resources.remove(agent_id);
        }
        self.total.quantities -= resources.to_quantities();
    }

    /// Tracks an allocation to a client. A distinct resource instance (a
    /// non-shared persistent volume) may be held at most once per client.
    pub fn allocated(&mut self, client: &str, agent_id: &AgentId, resources: &Resources) {
        if resources.is_empty() {
            return;
        }
        let state = self.client_mut(client);
        let held = state.allocations.entry(agent_id.clone()).or_default();

        for resource in resources.iter() {
            if resource.is_persistent_volume()
                && !resource.shared
                && held.contains_resource(resource)
            {
                panic!(
                    "client '{client}' allocated duplicate instance {resource} on {agent_id}"
                );
            }
        }

        *held += resources;
        state.quantities += resources.to_quantities();
    }

    /// Reverses `allocated`. Removing resources that are not tracked is a
    /// bookkeeping violation.
    pub fn unallocated(&mut self, client: &str, agent_id: &AgentId, resources: &Resources) {
        if resources.is_empty() {
            return;
        }
        let state = self.client_mut(client);
        let held = state
            .allocations
            .get_mut(agent_id)
            .unwrap_or_else(|| panic!("client '{client}' holds nothing on {agent_id}"));
        assert!(
            held.contains(resources),
            "client '{client}' does not hold {resources} on {agent_id}"
        );
        *held -= resources;
        if held.is_empty() {
            state.allocations.remove(agent_id);
        }
        state.quantities -= resources.to_quantities();
    }

    /// Replaces part of a client's allocation in place (offer operations
    /// that convert resources without changing quantities).
    pub fn update(
        &mut self,
        client: &str,
        agent_id: &AgentId,
        old: &Resources,
        new: &Resources,
    ) {
        self.unallocated(client, agent_id, old);
        self.allocated(client, agent_id, new);
    }

    pub fn allocation(&self, client: &str) -> HashMap<AgentId, Resources> {
        self.clients
            .get(client)
            .map(|state| state.allocations.clone())
            .unwrap_or_default()
    }

    pub fn allocation_on(&self, agent_id: &AgentId) -> HashMap<String, Resources> {
        let mut result = HashMap::new();
        for (name, state) in &self.clients {
            if let Some(held) = state.allocations.get(agent_id) {
                if !held.is_empty() {
                    result.insert(name.clone(), held.clone());
                }
            }
        }
        result
    }

    pub fn allocation_scalar_quantities(&self, client: &str) -> ScalarQuantities {
        self.clients
            .get(client)
            .map(|state| state.quantities.clone())
            .unwrap_or_default()
    }

    pub fn total_scalar_quantities(&self) -> ScalarQuantities {
        self.total.quantities.clone()
    }

    /// Active clients ordered by ascending dominant share scaled by inverse
    /// weight; ties break by insertion order.
    pub fn sort(&self) -> Vec<String> {
        let mut ranked: Vec<(f64, usize, &String)> = self
            .insertion
            .iter()
            .enumerate()
            .filter(|(_, name)| self.clients[*name].active)
            .map(|(index, name)| {
                let share = self.dominant_share(&self.clients[name]);
                let weight = self.weights.get(name).copied().unwrap_or(1.0);
                (share / weight, index, name)
            })
            .collect();

        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, _, name)| name.clone()).collect()
    }

    fn dominant_share(&self, client: &Client) -> f64 {
        let mut share: f64 = 0.0;
        for (name, allocated) in client.quantities.iter() {
            if self.fairness_excluded.contains(name) {
                continue;
            }
            let total = self.total.quantities.get(name);
            if total > Scalar::ZERO {
                share = share.max(allocated.as_f64() / total.as_f64());
            }
        }
        share
    }

    fn client_mut(&mut self, client: &str) -> &mut Client {
        self.clients
            .get_mut(client)
            .unwrap_or_else(|| panic!("sorter does not track client '{client}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moraine_core::Resource;

    fn agent(name: &str) -> AgentId {
        AgentId::new(name)
    }

    fn cpus_mem(cpus: f64, mem: f64) -> Resources {
        Resources::from(vec![
            Resource::scalar("cpus", cpus),
            Resource::scalar("mem", mem),
        ])
    }

    fn sorter_with_pool() -> DrfSorter {
        let mut sorter = DrfSorter::new(BTreeSet::new());
        sorter.add_total(&agent("a1"), &cpus_mem(10.0, 10240.0));
        sorter
    }

    #[test]
    fn orders_by_dominant_share() {
        let mut sorter = sorter_with_pool();
        sorter.add("x");
        sorter.activate("x");
        sorter.add("y");
        sorter.activate("y");

        // x dominates on cpus (0.5), y on mem (0.25).
        sorter.allocated("x", &agent("a1"), &cpus_mem(5.0, 1024.0));
        sorter.allocated("y", &agent("a1"), &cpus_mem(1.0, 2560.0));

        assert_eq!(sorter.sort(), vec!["y".to_string(), "x".to_string()]);
    }

    #[test]
    fn weight_scales_share_down() {
        let mut sorter = sorter_with_pool();
        sorter.add("x");
        sorter.activate("x");
        sorter.add("y");
        sorter.activate("y");
        sorter.update_weight("x", 4.0);

        sorter.allocated("x", &agent("a1"), &cpus_mem(4.0, 0.0));
        sorter.allocated("y", &agent("a1"), &cpus_mem(2.0, 0.0));

        // x: 0.4 / 4 = 0.1; y: 0.2 / 1 = 0.2.
        assert_eq!(sorter.sort(), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut sorter = sorter_with_pool();
        for name in ["b", "a", "c"] {
            sorter.add(name);
            sorter.activate(name);
        }
        assert_eq!(
            sorter.sort(),
            vec!["b".to_string(), "a".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn deactivated_clients_keep_allocation_but_do_not_sort() {
        let mut sorter = sorter_with_pool();
        sorter.add("x");
        sorter.activate("x");
        sorter.allocated("x", &agent("a1"), &cpus_mem(2.0, 0.0));
        sorter.deactivate("x");

        assert!(sorter.sort().is_empty());
        assert_eq!(
            sorter.allocation_scalar_quantities("x"),
            ScalarQuantities::of([("cpus", 2.0)])
        );
    }

    #[test]
    fn excluded_names_do_not_count_toward_share() {
        let mut sorter = DrfSorter::new(["gpus".to_string()].into_iter().collect());
        sorter.add_total(
            &agent("a1"),
            &Resources::from(vec![
                Resource::scalar("cpus", 10.0),
                Resource::scalar("gpus", 1.0),
            ]),
        );
        sorter.add("x");
        sorter.activate("x");
        sorter.add("y");
        sorter.activate("y");

        sorter.allocated("x", &agent("a1"), &Resources::from(Resource::scalar("gpus", 1.0)));
        sorter.allocated("y", &agent("a1"), &Resources::from(Resource::scalar("cpus", 1.0)));

        // x's gpu does not count, so x sorts first despite holding the
        // whole gpu pool.
        assert_eq!(sorter.sort(), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn unallocating_untracked_resources_is_fatal() {
        let mut sorter = sorter_with_pool();
        sorter.add("x");
        sorter.allocated("x", &agent("a1"), &cpus_mem(1.0, 0.0));
        sorter.unallocated("x", &agent("a1"), &cpus_mem(2.0, 0.0));
    }
}
