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

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Flag --{flag} is invalid: {reason}")]
    InvalidFlag { flag: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// What to do with executors that survived an agent restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// Reconnect to live executors and resume managing their tasks.
    Reconnect,
    /// Kill every recovered executor and exit once they are gone.
    Cleanup,
}

/// How a changed agent configuration is reconciled with checkpointed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ReconfigurationPolicy {
    /// Any difference from the checkpointed info is fatal.
    Equal,
    /// Attributes may gain keys and resources may grow, nothing may shrink.
    Additive,
}

fn parse_duration_secs(value: &str) -> Result<Duration, String> {
    let seconds: f64 = value
        .parse()
        .map_err(|_| format!("'{value}' is not a number of seconds"))?;
    if seconds < 0.0 {
        return Err("duration must not be negative".to_string());
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn parse_attributes(value: &str) -> Result<BTreeMap<String, String>, String> {
    let mut attributes = BTreeMap::new();
    for pair in value.split(';').filter(|pair| !pair.is_empty()) {
        let (key, val) = pair
            .split_once(':')
            .ok_or_else(|| format!("attribute '{pair}' is not key:value"))?;
        attributes.insert(key.to_string(), val.to_string());
    }
    Ok(attributes)
}

/// The agent daemon's flag surface.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "agentd", about = "Moraine cluster agent")]
pub struct AgentFlags {
    /// Directory for executor sandboxes and checkpointed state.
    #[arg(long)]
    pub work_dir: PathBuf,

    #[arg(long, value_enum, default_value = "reconnect")]
    pub recover: RecoveryMode,

    #[arg(long, value_enum, default_value = "equal")]
    pub reconfiguration_policy: ReconfigurationPolicy,

    /// Upper bound b for the registration backoff interval b*2.
    #[arg(long, value_parser = parse_duration_secs, default_value = "1")]
    pub registration_backoff_factor: Duration,

    /// Base b of the authentication backoff U[0, b*2^n).
    #[arg(long, value_parser = parse_duration_secs, default_value = "1")]
    pub authentication_backoff_factor: Duration,

    /// How long a newly launched executor may take to register before its
    /// container is destroyed.
    #[arg(long, value_parser = parse_duration_secs, default_value = "60")]
    pub executor_registration_timeout: Duration,

    /// How long recovered executors may take to re-register after an agent
    /// restart.
    #[arg(long, value_parser = parse_duration_secs, default_value = "2")]
    pub executor_reregistration_timeout: Duration,

    /// Optional retry cadence for ReconnectExecutor messages during
    /// recovery, to defeat dropped packets.
    #[arg(long, value_parser = parse_duration_secs)]
    pub executor_reregistration_retry_interval: Option<Duration>,

    /// Grace between asking an executor to shut down and destroying its
    /// container. An executor-specified override wins.
    #[arg(long, value_parser = parse_duration_secs, default_value = "5")]
    pub executor_shutdown_grace_period: Duration,

    /// Delay before a scheduled sandbox or meta directory is removed.
    #[arg(long, value_parser = parse_duration_secs, default_value = "604800")]
    pub gc_delay: Duration,

    /// Fraction of disk to keep free; exceeding it prunes GC-scheduled
    /// paths ahead of their deadline.
    #[arg(long, default_value_t = 0.1)]
    pub gc_disk_headroom: f64,

    #[arg(long, value_parser = parse_duration_secs, default_value = "60")]
    pub disk_watch_interval: Duration,

    #[arg(long, value_parser = parse_duration_secs, default_value = "15")]
    pub oversubscribed_resources_interval: Duration,

    #[arg(long, value_parser = parse_duration_secs, default_value = "0")]
    pub qos_correction_interval_min: Duration,

    #[arg(long)]
    pub hostname: Option<String>,

    /// Whether to resolve the hostname through DNS when not given.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub hostname_lookup: bool,

    /// Fault domain as region:zone.
    #[arg(long)]
    pub domain: Option<String>,

    /// Attributes as key:value pairs separated by ';'.
    #[arg(long, value_parser = parse_attributes)]
    pub attributes: Option<BTreeMap<String, String>>,

    /// Resource specification, e.g. "cpus:8;mem:16384". Defaults to probed
    /// host resources.
    #[arg(long)]
    pub resources: Option<String>,

    /// Optional feature toggles, separated by ','.
    #[arg(long)]
    pub agent_features: Option<String>,
}

impl AgentFlags {
    /// Flag combinations clap cannot express are validated here; the daemon
    /// exits non-zero on any error.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.gc_disk_headroom) {
            return Err(ConfigError::InvalidFlag {
                flag: "gc_disk_headroom".to_string(),
                reason: format!("{} is not within [0.0, 1.0]", self.gc_disk_headroom),
            });
        }

        if self.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidFlag {
                flag: "work_dir".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        if let Some(domain) = &self.domain {
            if domain.split_once(':').is_none() {
                return Err(ConfigError::InvalidFlag {
                    flag: "domain".to_string(),
                    reason: format!("'{domain}' is not region:zone"),
                });
            }
        }

        Ok(())
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.work_dir.join("meta")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_flags() -> AgentFlags {
        AgentFlags::parse_from(["agentd", "--work-dir", "/tmp/agent"])
    }

    #[test]
    fn defaults_are_valid() {
        assert!(base_flags().validate().is_ok());
    }

    #[test]
    fn gc_disk_headroom_is_bounded() {
        let mut flags = base_flags();
        flags.gc_disk_headroom = 1.5;
        assert!(flags.validate().is_err());
    }

    #[test]
    fn domain_requires_region_and_zone() {
        let mut flags = base_flags();
        flags.domain = Some("us-east".to_string());
        assert!(flags.validate().is_err());
        flags.domain = Some("us-east:zone-a".to_string());
        assert!(flags.validate().is_ok());
    }

    #[test]
    fn attributes_parse_as_pairs() {
        let flags = AgentFlags::parse_from([
            "agentd",
            "--work-dir",
            "/tmp/agent",
            "--attributes",
            "rack:r1;pool:batch",
        ]);
        let attributes = flags.attributes.unwrap();
        assert_eq!(attributes.get("rack"), Some(&"r1".to_string()));
        assert_eq!(attributes.get("pool"), Some(&"batch".to_string()));
    }
}
