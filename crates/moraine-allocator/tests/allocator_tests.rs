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

use moraine_allocator::{Allocator, AllocatorConfig, AllocatorEvent, HierarchicalAllocator};
use moraine_core::{
    AgentCapabilities, AgentId, DiskInfo, FrameworkCapabilities, FrameworkId, Persistence, Quota,
    Reservation, Resource, Resources, RoleName, Scalar, ScalarQuantities, Volume, VolumeMode,
};
use protocols::FrameworkInfo;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn role(name: &str) -> RoleName {
    RoleName::parse(name).unwrap()
}

fn framework_info(roles: &[&str], capabilities: FrameworkCapabilities) -> FrameworkInfo {
    FrameworkInfo {
        id: None,
        name: "test-framework".to_string(),
        user: "nobody".to_string(),
        roles: roles.iter().map(|r| role(r)).collect(),
        capabilities,
        checkpoint: false,
        principal: None,
    }
}

fn cpus_mem(cpus: f64, mem: f64) -> Resources {
    Resources::from(vec![
        Resource::scalar("cpus", cpus),
        Resource::scalar("mem", mem),
    ])
}

struct Cluster {
    allocator: HierarchicalAllocator,
    events: mpsc::UnboundedReceiver<AllocatorEvent>,
}

impl Cluster {
    fn new(config: AllocatorConfig) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            allocator: HierarchicalAllocator::new(config, tx),
            events,
        }
    }

    fn add_framework(&mut self, name: &str, info: &FrameworkInfo) -> FrameworkId {
        let id = FrameworkId::new(name);
        self.allocator
            .add_framework(id.clone(), info, HashMap::new(), true, BTreeSet::new());
        id
    }

    fn add_agent(&mut self, name: &str, total: Resources) -> AgentId {
        let id = AgentId::new(name);
        self.allocator.add_agent(
            id.clone(),
            format!("{name}.example.org"),
            None,
            AgentCapabilities {
                multi_role: true,
                hierarchical_role: true,
                resource_provider: false,
            },
            None,
            total,
            HashMap::new(),
        );
        id
    }

    /// Drains queued events into per-framework offered resources.
    fn drain_offers(&mut self) -> HashMap<FrameworkId, Resources> {
        let mut offered: HashMap<FrameworkId, Resources> = HashMap::new();
        while let Ok(event) = self.events.try_recv() {
            if let AllocatorEvent::Offers {
                framework_id,
                offers,
            } = event
            {
                for by_agent in offers.into_values() {
                    for resources in by_agent.into_values() {
                        *offered.entry(framework_id.clone()).or_default() += resources;
                    }
                }
            }
        }
        offered
    }
}

#[test]
fn quota_role_is_satisfied_before_fair_share() {
    let mut cluster = Cluster::new(AllocatorConfig::default());

    cluster
        .allocator
        .set_quota(role("alpha"), Quota::new(ScalarQuantities::of([("cpus", 10.0)])));

    let fw_alpha = cluster.add_framework(
        "fw-alpha",
        &framework_info(&["alpha"], FrameworkCapabilities::default()),
    );
    let fw_beta = cluster.add_framework(
        "fw-beta",
        &framework_info(&["beta"], FrameworkCapabilities::default()),
    );

    cluster.add_agent("a1", cpus_mem(10.0, 1024.0));
    cluster.add_agent("a2", cpus_mem(10.0, 1024.0));

    let offered = cluster.drain_offers();

    let alpha_cpus = offered
        .get(&fw_alpha)
        .map(Resources::cpus)
        .unwrap_or_default();
    let beta_cpus = offered
        .get(&fw_beta)
        .map(Resources::cpus)
        .unwrap_or_default();

    assert!(
        alpha_cpus >= Scalar::from_f64(10.0),
        "quota'd role got {alpha_cpus} cpus, expected at least its 10-cpu guarantee"
    );
    assert!(
        beta_cpus <= Scalar::from_f64(10.0),
        "unquota'd role got {beta_cpus} cpus, expected at most the remainder"
    );
}

#[test]
fn refused_offer_is_filtered_until_expiry() {
    let config = AllocatorConfig {
        allocation_interval: Duration::from_secs(1),
        ..AllocatorConfig::default()
    };
    let mut cluster = Cluster::new(config);

    let fw = cluster.add_framework(
        "fw",
        &framework_info(&["web"], FrameworkCapabilities::default()),
    );
    let agent = cluster.add_agent("a1", cpus_mem(4.0, 2048.0));

    let offered = cluster.drain_offers();
    let bundle = offered.get(&fw).cloned().expect("initial offer");

    // Decline everything for 60 seconds.
    let expiry = cluster
        .allocator
        .recover_resources(&fw, &agent, &bundle, Some(Duration::from_secs(60)))
        .expect("a refusal filter is installed");
    assert_eq!(expiry.after, Duration::from_secs(60));

    // Ten subsequent cycles produce nothing for this agent.
    for cycle in 0..10 {
        cluster.allocator.trigger_allocation_for(agent.clone());
        let offered = cluster.drain_offers();
        assert!(
            !offered.contains_key(&fw),
            "cycle {cycle} re-offered refused resources"
        );
    }

    // The timer fires at >= 60s and the next cycle offers again.
    cluster
        .allocator
        .expire_offer_filter(&expiry.framework_id, &expiry.role, &expiry.agent_id, expiry.handle);
    cluster.allocator.trigger_allocation_for(agent.clone());

    let offered = cluster.drain_offers();
    assert_eq!(
        offered.get(&fw).map(Resources::cpus),
        Some(Scalar::from_f64(4.0)),
        "offer must resume after filter expiry"
    );
}

#[test]
fn short_refusals_never_expire_before_the_next_cycle() {
    let config = AllocatorConfig {
        allocation_interval: Duration::from_secs(30),
        ..AllocatorConfig::default()
    };
    let mut cluster = Cluster::new(config);

    let fw = cluster.add_framework(
        "fw",
        &framework_info(&["web"], FrameworkCapabilities::default()),
    );
    let agent = cluster.add_agent("a1", cpus_mem(1.0, 512.0));

    let bundle = cluster.drain_offers().remove(&fw).expect("initial offer");
    let expiry = cluster
        .allocator
        .recover_resources(&fw, &agent, &bundle, Some(Duration::from_secs(5)))
        .expect("filter installed");

    assert_eq!(
        expiry.after,
        Duration::from_secs(30),
        "expiry is stretched to the allocation interval"
    );
}

#[test]
fn declined_resources_return_to_the_agent_pool() {
    let mut cluster = Cluster::new(AllocatorConfig::default());

    let fw = cluster.add_framework(
        "fw",
        &framework_info(&["web"], FrameworkCapabilities::default()),
    );
    let agent = cluster.add_agent("a1", cpus_mem(4.0, 2048.0));

    let bundle = cluster.drain_offers().remove(&fw).expect("initial offer");
    assert_eq!(
        cluster.allocator.agent_allocated(&agent).cpus(),
        Scalar::from_f64(4.0)
    );

    cluster
        .allocator
        .recover_resources(&fw, &agent, &bundle, None);

    assert!(
        cluster.allocator.agent_allocated(&agent).is_empty(),
        "recovered resources must be unallocated again"
    );
}

#[test]
fn shared_resource_is_offered_at_most_once_per_cycle() {
    let mut cluster = Cluster::new(AllocatorConfig::default());

    let capabilities = FrameworkCapabilities {
        shared_resources: true,
        ..FrameworkCapabilities::default()
    };

    let fw1 = cluster.add_framework("fw1", &framework_info(&["web"], capabilities));
    let fw2 = cluster.add_framework("fw2", &framework_info(&["web"], capabilities));

    let volume = Resource::scalar("disk", 512.0)
        .reserved_for(Reservation::dynamically(role("web"), "ops"))
        .with_disk(DiskInfo {
            persistence: Some(Persistence {
                id: "vol-1".to_string(),
                principal: None,
            }),
            volume: Some(Volume {
                container_path: "data".to_string(),
                mode: VolumeMode::ReadWrite,
            }),
            source: None,
        })
        .as_shared();

    let mut total = cpus_mem(8.0, 4096.0);
    total += Resources::from(volume.clone());

    cluster.add_agent("a1", total);

    let offered = cluster.drain_offers();

    let mut copies = 0;
    for fw in [&fw1, &fw2] {
        if let Some(bundle) = offered.get(fw) {
            let held = bundle
                .iter_counted()
                .filter(|(resource, _)| resource.shared)
                .map(|(_, count)| count)
                .sum::<u64>();
            assert!(
                held <= 1,
                "framework {fw} received the shared resource more than once in a cycle"
            );
            copies += held;
        }
    }
    assert!(copies <= 2, "shared resource over-offered within one cycle");
    assert_eq!(copies, 1, "exactly one framework sees the volume this cycle");
}

#[test]
fn suppressed_roles_receive_no_offers_until_revived() {
    let mut cluster = Cluster::new(AllocatorConfig::default());

    let fw = cluster.add_framework(
        "fw",
        &framework_info(&["web"], FrameworkCapabilities::default()),
    );

    cluster
        .allocator
        .suppress_offers(&fw, BTreeSet::from([role("web")]));

    cluster.add_agent("a1", cpus_mem(2.0, 1024.0));
    assert!(
        cluster.drain_offers().is_empty(),
        "suppressed framework must not be offered resources"
    );

    cluster
        .allocator
        .revive_offers(&fw, BTreeSet::from([role("web")]));

    let offered = cluster.drain_offers();
    assert_eq!(
        offered.get(&fw).map(Resources::cpus),
        Some(Scalar::from_f64(2.0))
    );
}

#[test]
fn recovery_pauses_until_enough_agents_return() {
    let mut cluster = Cluster::new(AllocatorConfig::default());

    let mut quotas = HashMap::new();
    quotas.insert(
        role("alpha"),
        Quota::new(ScalarQuantities::of([("cpus", 4.0)])),
    );

    // 2 expected agents * 0.8 rounds down to 1.
    assert!(cluster.allocator.recover(2, quotas));
    assert!(cluster.allocator.is_paused());

    cluster.add_framework(
        "fw",
        &framework_info(&["alpha"], FrameworkCapabilities::default()),
    );

    cluster.add_agent("a1", cpus_mem(8.0, 4096.0));
    assert!(!cluster.allocator.is_paused(), "one agent satisfies 80% of two");

    cluster.allocator.perform_allocation(Instant::now());
    let offered = cluster.drain_offers();
    assert!(!offered.is_empty(), "allocation resumes after recovery");
}

#[tokio::test]
async fn driver_delivers_offers_from_the_periodic_cycle() {
    let config = AllocatorConfig {
        allocation_interval: Duration::from_millis(20),
        ..AllocatorConfig::default()
    };
    let (allocator, mut events) = Allocator::start(config);

    allocator
        .add_framework(
            FrameworkId::new("fw"),
            framework_info(&["web"], FrameworkCapabilities::default()),
            HashMap::new(),
            true,
            BTreeSet::new(),
        )
        .await;
    allocator
        .add_agent(
            AgentId::new("a1"),
            "a1.example.org".to_string(),
            None,
            AgentCapabilities {
                multi_role: true,
                hierarchical_role: true,
                resource_provider: false,
            },
            None,
            cpus_mem(2.0, 1024.0),
            HashMap::new(),
        )
        .await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("an offer arrives within the deadline")
        .expect("allocator stays alive");

    match event {
        AllocatorEvent::Offers { framework_id, .. } => {
            assert_eq!(framework_id, FrameworkId::new("fw"));
        }
        other => panic!("expected offers, got {other:?}"),
    }
}

#[test]
fn unsubscribed_role_keeps_tracking_until_resources_return() {
    let mut cluster = Cluster::new(AllocatorConfig::default());

    let fw = cluster.add_framework(
        "fw",
        &framework_info(&["web"], FrameworkCapabilities::default()),
    );
    let agent = cluster.add_agent("a1", cpus_mem(4.0, 2048.0));

    let bundle = cluster.drain_offers().remove(&fw).expect("initial offer");

    // The framework moves off the role while still holding the offer.
    cluster.allocator.update_framework(
        &fw,
        &framework_info(&["batch"], FrameworkCapabilities::default()),
        BTreeSet::new(),
    );

    // Returning the outstanding resources unwinds the old role tracking.
    cluster
        .allocator
        .recover_resources(&fw, &agent, &bundle, None);

    cluster.allocator.trigger_allocation_for(agent.clone());
    let offered = cluster.drain_offers();
    let bundle = offered.get(&fw).expect("offer under the new role");
    assert_eq!(bundle.cpus(), Scalar::from_f64(4.0));
}
