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

//! Logical wire contracts between the master, agents, and executors. The
//! concrete transport is out of scope; every channel carries one of these
//! serde-serialisable message enums.

pub mod executor;
pub mod info;
pub mod master;
pub mod operation;
pub mod status;

pub use executor::{AgentToExecutor, ExecutorToAgent};
pub use info::{
    AgentInfo, CommandInfo, DomainInfo, ExecutorInfo, ExecutorKind, FaultDomain, FrameworkInfo,
    KillPolicy, TaskGroupInfo, TaskInfo, Unavailability, UnavailableResources,
};
pub use master::{
    AgentToMaster, InverseOfferResponse, MasterToAgent, ResourceVersions, TaskSummary,
};
pub use operation::{Operation, OperationInfo, OperationState, OperationStatus};
pub use status::{StatusUpdate, StatusUpdateReason, TaskState, TaskStatus, UpdateSource};
