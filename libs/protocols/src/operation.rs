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

use chrono::{DateTime, Utc};
use moraine_core::{
    AgentId, FrameworkId, OperationId, ResourceConversion, ResourceError, ResourceValue,
    Resources,
};
use serde::{Deserialize, Serialize};

/// A resource operation applied against an agent's (or a provider's)
/// resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationInfo {
    Reserve { resources: Resources },
    Unreserve { resources: Resources },
    Create { volumes: Resources },
    Destroy { volumes: Resources },
    GrowVolume { volume: Resources, addition: Resources },
    ShrinkVolume { volume: Resources, subtract: Resources },
    CreateDisk { source: Resources },
    DestroyDisk { source: Resources },
}

impl OperationInfo {
    /// Speculative operations have a locally computable effect on totals;
    /// the others need a resource-provider round trip.
    pub fn is_speculative(&self) -> bool {
        matches!(
            self,
            OperationInfo::Reserve { .. }
                | OperationInfo::Unreserve { .. }
                | OperationInfo::Create { .. }
                | OperationInfo::Destroy { .. }
                | OperationInfo::GrowVolume { .. }
                | OperationInfo::ShrinkVolume { .. }
        )
    }

    /// The conversions a speculative operation performs on a resource
    /// bundle. The payload carries the post-state; the pre-state is derived
    /// by popping the finest reservation or stripping the volume.
    pub fn conversions(&self) -> Result<Vec<ResourceConversion>, ResourceError> {
        match self {
            OperationInfo::Reserve { resources } => {
                let consumed = resources
                    .iter()
                    .map(|resource| {
                        if resource.is_unreserved() {
                            return Err(ResourceError::InvalidResource(format!(
                                "reserve payload {resource} is unreserved"
                            )));
                        }
                        Ok(resource.popped_reservation())
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(vec![ResourceConversion::new(
                    Resources::from(consumed),
                    resources.clone(),
                )])
            }
            OperationInfo::Unreserve { resources } => {
                let converted = resources
                    .iter()
                    .map(|resource| {
                        if resource.is_unreserved() {
                            return Err(ResourceError::InvalidResource(format!(
                                "unreserve payload {resource} is unreserved"
                            )));
                        }
                        Ok(resource.popped_reservation())
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(vec![ResourceConversion::new(
                    resources.clone(),
                    Resources::from(converted),
                )])
            }
            OperationInfo::Create { volumes } => {
                let consumed: Vec<_> = volumes
                    .iter()
                    .map(|volume| volume.without_volume())
                    .collect();
                Ok(vec![ResourceConversion::new(
                    Resources::from(consumed),
                    volumes.clone(),
                )])
            }
            OperationInfo::Destroy { volumes } => {
                let converted: Vec<_> = volumes
                    .iter()
                    .map(|volume| volume.without_volume())
                    .collect();
                Ok(vec![ResourceConversion::new(
                    volumes.clone(),
                    Resources::from(converted),
                )])
            }
            OperationInfo::GrowVolume { volume, addition } => {
                let (Some(current), Some(extra)) = (
                    volume.iter().next().and_then(|r| r.scalar_value()),
                    addition.iter().next().and_then(|r| r.scalar_value()),
                ) else {
                    return Err(ResourceError::InvalidResource(
                        "grow volume requires scalar disk payloads".to_string(),
                    ));
                };
                let mut grown = volume
                    .iter()
                    .next()
                    .cloned()
                    .expect("volume payload is non-empty");
                grown.value = ResourceValue::Scalar(current + extra);
                Ok(vec![ResourceConversion::new(
                    volume.clone() + addition.clone(),
                    Resources::from(grown),
                )])
            }
            OperationInfo::ShrinkVolume { volume, subtract } => {
                let (Some(current), Some(freed)) = (
                    volume.iter().next().and_then(|r| r.scalar_value()),
                    subtract.iter().next().and_then(|r| r.scalar_value()),
                ) else {
                    return Err(ResourceError::InvalidResource(
                        "shrink volume requires scalar disk payloads".to_string(),
                    ));
                };
                if freed >= current {
                    return Err(ResourceError::InvalidResource(
                        "shrink must leave a non-empty volume".to_string(),
                    ));
                }
                let mut shrunk = volume
                    .iter()
                    .next()
                    .cloned()
                    .expect("volume payload is non-empty");
                shrunk.value = ResourceValue::Scalar(current - freed);
                let mut released = shrunk.without_volume();
                released.value = ResourceValue::Scalar(freed);
                Ok(vec![ResourceConversion::new(
                    volume.clone(),
                    Resources::from(vec![shrunk, released]),
                )])
            }
            OperationInfo::CreateDisk { .. } | OperationInfo::DestroyDisk { .. } => {
                Err(ResourceError::InvalidResource(
                    "provider-backed operations are not locally convertible".to_string(),
                ))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Pending,
    Finished,
    Failed,
    Error,
    Dropped,
    Unreachable,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Finished
                | OperationState::Failed
                | OperationState::Error
                | OperationState::Dropped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: OperationId,
    pub state: OperationState,
    pub message: Option<String>,
    pub converted_resources: Option<Resources>,
    pub timestamp: DateTime<Utc>,
}

impl OperationStatus {
    pub fn new(operation_id: OperationId, state: OperationState) -> Self {
        Self {
            operation_id,
            state,
            message: None,
            converted_resources: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: OperationId,
    /// Absent for operator-initiated operations.
    pub framework_id: Option<FrameworkId>,
    pub agent_id: AgentId,
    pub info: OperationInfo,
    pub latest_status: OperationStatus,
    pub status_history: Vec<OperationStatus>,
}

impl Operation {
    pub fn pending(
        operation_id: OperationId,
        framework_id: Option<FrameworkId>,
        agent_id: AgentId,
        info: OperationInfo,
    ) -> Self {
        let status = OperationStatus::new(operation_id, OperationState::Pending);
        Self {
            operation_id,
            framework_id,
            agent_id,
            info,
            latest_status: status.clone(),
            status_history: vec![status],
        }
    }

    pub fn record_status(&mut self, status: OperationStatus) {
        self.latest_status = status.clone();
        self.status_history.push(status);
    }
}
