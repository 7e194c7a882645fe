// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bootstraps a two-node, datastore-backed k3s cluster and prepares the
//! Rancher install and upgrade that follow it.
//!
//! The [`Sequencer`] founds the cluster on the first node, carries its join
//! token over to the second, waits for both to report a healthy service and
//! then hands a kubeconfig and two phases of Helm variables to a
//! [`ConfigurationEmitter`]. Nodes are reached through a
//! [`CommandExecutor`](ha_orchestrator::CommandExecutor).

pub mod artifacts;
pub mod command;
pub mod founder;
pub mod phase;
pub mod poll;
pub mod request;
pub mod sequencer;

#[cfg(test)]
mod testing;

pub use artifacts::{ArtifactLayout, FileEmitter, clean, promote_upgrade};
pub use command::DatastoreSettings;
pub use founder::{AdminCredentialBundle, JoinToken, rewrite_endpoint};
pub use phase::{ConfigurationEmitter, Phase, PhaseConfiguration, ReleaseConfig, ReleaseValues};
pub use poll::{PollConfig, ReadinessError, wait_until_ready};
pub use request::ClusterBootstrapRequest;
pub use sequencer::{
    BootstrapError, BootstrapOutcome, BootstrapState, FailurePolicy, Sequencer, SequencerConfig,
    SequencerError,
};
