// SPDX-License-Identifier: AGPL-3.0-only
// Minimal bootstrap; all runtime logic resides in library modules.
use anyhow::Result;
use clap::Parser;
use moraine_agent::{AgentContext, AgentFlags, AgentRuntime, PermissiveAuthorizer};
use moraine_core::{AgentCapabilities, Resource, Resources};
use protocols::{AgentInfo, DomainInfo, FaultDomain};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

mod containerizer;

use containerizer::ProcessContainerizer;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let flags = AgentFlags::parse();
    if let Err(e) = flags.validate() {
        error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    let info = build_agent_info(&flags)?;
    info!(hostname = %info.hostname, resources = %info.resources, "Starting agent");

    let context = AgentContext {
        flags,
        info,
        capabilities: AgentCapabilities {
            multi_role: true,
            hierarchical_role: true,
            resource_provider: false,
        },
        boot_id: moraine_agent::checkpoint::current_boot_id().await,
    };

    // The master transport plugs in here: incoming MasterToAgent messages
    // are delivered through the handle, outgoing ones drained from this
    // channel.
    let (master_tx, mut master_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(message) = master_rx.recv().await {
            tracing::debug!(?message, "Outbound message for master");
        }
    });

    let (runtime, _handle) = AgentRuntime::new(
        context,
        Arc::new(ProcessContainerizer::new()),
        Arc::new(PermissiveAuthorizer),
        master_tx,
    );

    let code = runtime.run().await;
    std::process::exit(code);
}

fn build_agent_info(flags: &AgentFlags) -> Result<AgentInfo> {
    let hostname = match &flags.hostname {
        Some(hostname) => hostname.clone(),
        None if flags.hostname_lookup => std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|name| name.trim().to_string())
            .unwrap_or_else(|_| "localhost".to_string()),
        None => "localhost".to_string(),
    };

    let domain = flags.domain.as_ref().map(|domain| {
        let (region, zone) = domain
            .split_once(':')
            .expect("validated as region:zone");
        DomainInfo {
            fault_domain: FaultDomain {
                region: region.to_string(),
                zone: zone.to_string(),
            },
        }
    });

    let resources = match &flags.resources {
        Some(spec) => parse_resources(spec)?,
        None => probe_host_resources(),
    };

    Ok(AgentInfo {
        id: None,
        hostname,
        port: 5051,
        domain,
        resources,
        attributes: flags.attributes.clone().unwrap_or_default(),
    })
}

/// Parses "cpus:8;mem:16384;ports:[31000-32000]".
fn parse_resources(spec: &str) -> Result<Resources> {
    let mut resources = Resources::new();
    for pair in spec.split(';').filter(|pair| !pair.is_empty()) {
        let (name, value) = pair
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("resource '{pair}' is not name:value"))?;
        if let Some(ranges) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
            let mut parsed = Vec::new();
            for range in ranges.split(',') {
                let (begin, end) = range
                    .split_once('-')
                    .ok_or_else(|| anyhow::anyhow!("range '{range}' is not begin-end"))?;
                parsed.push((begin.trim().parse()?, end.trim().parse()?));
            }
            resources += Resources::from(Resource {
                name: name.to_string(),
                ..Resource::ports(parsed)
            });
        } else {
            let amount: f64 = value.parse()?;
            resources += Resources::from(Resource::scalar(name, amount));
        }
    }
    Ok(resources)
}

fn probe_host_resources() -> Resources {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0);
    // Probe total memory from /proc; fall back to a conservative default.
    let mem_mb = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|body| {
            body.lines()
                .find(|line| line.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<f64>().ok())
                .map(|kb| kb / 1024.0)
        })
        .unwrap_or(1024.0);

    Resources::from(vec![
        Resource::scalar("cpus", cpus),
        Resource::scalar("mem", mem_mb),
        Resource::ports(vec![(31000, 32000)]),
    ])
}
