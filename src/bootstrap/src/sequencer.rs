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

//! Drives a bootstrap from two bare nodes to a joined cluster.
//!
//! A run moves through the states of [`BootstrapState`] strictly in order:
//!
//! ```text
//! Init -> FoundingNode1 -> AwaitingNode1Ready -> JoiningNode2
//!      -> AwaitingNode2Ready -> EmittingConfiguration -> Done
//! ```
//!
//! Any state may end in `Failed`. The joining node is never touched before
//! the founding node has handed over its join token, and configuration is
//! only emitted once both nodes have been waited on.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ha_orchestrator::{CommandExecutor, DEFAULT_SSH_PORT, DEFAULT_SSH_USER, ExecError, RemoteHost};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::command::{
    DatastoreSettings, FOUNDER_TOKEN_PLACEHOLDER, SERVICE_PROBE_COMMAND, ServerInstall,
};
use crate::founder::{
    FounderState, RetrieveError, control_plane_endpoint, retrieve_founder_state, rewrite_endpoint,
};
use crate::phase::{ConfigurationEmitter, Phase, PhaseConfiguration, ReleaseConfig};
use crate::poll::{PollConfig, ReadinessError, wait_until_ready};
use crate::request::{ClusterBootstrapRequest, InvalidAddress};

/// The progress of a bootstrap run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootstrapState {
    Init,
    FoundingNode1,
    AwaitingNode1Ready,
    JoiningNode2,
    AwaitingNode2Ready,
    EmittingConfiguration,
    Done,
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootstrapState::Init => "init",
            BootstrapState::FoundingNode1 => "founding node 1",
            BootstrapState::AwaitingNode1Ready => "awaiting node 1 ready",
            BootstrapState::JoiningNode2 => "joining node 2",
            BootstrapState::AwaitingNode2Ready => "awaiting node 2 ready",
            BootstrapState::EmittingConfiguration => "emitting configuration",
            BootstrapState::Done => "done",
            BootstrapState::Failed => "failed",
        })
    }
}

/// What a run does when a node step fails.
///
/// Failures to emit configuration, and cancellation, end the run under
/// either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// End the run at the first failed step.
    #[default]
    Abort,
    /// Record the failure and carry on with the next step.
    Continue,
}

/// How a [`Sequencer`] runs.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub k3s_version: String,
    pub datastore: DatastoreSettings,
    pub ssh_user: String,
    pub ssh_port: u16,
    /// The cadence of service probes.
    pub readiness: PollConfig,
    /// The cadence of join token and kubeconfig reads.
    pub founder_reads: PollConfig,
    pub failure_policy: FailurePolicy,
    pub release: ReleaseConfig,
}

impl SequencerConfig {
    /// A configuration installing `k3s_version` and the given Rancher
    /// releases, with defaults for everything else.
    pub fn new(k3s_version: impl Into<String>, release: ReleaseConfig) -> SequencerConfig {
        SequencerConfig {
            k3s_version: k3s_version.into(),
            datastore: DatastoreSettings::default(),
            ssh_user: DEFAULT_SSH_USER.into(),
            ssh_port: DEFAULT_SSH_PORT,
            readiness: PollConfig::default(),
            founder_reads: PollConfig::default(),
            failure_policy: FailurePolicy::default(),
            release,
        }
    }
}

/// Why a step failed.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidAddress),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
    #[error(transparent)]
    FounderState(#[from] RetrieveError),
    #[error("bootstrap cancelled")]
    Cancelled,
    #[error("failed to emit configuration: {0:#}")]
    Emit(anyhow::Error),
}

impl BootstrapError {
    /// Reports whether the error stems from cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            BootstrapError::Cancelled
                | BootstrapError::Readiness(ReadinessError::Cancelled { .. })
                | BootstrapError::FounderState(RetrieveError::Cancelled { .. })
        )
    }
}

/// A failed run.
#[derive(Debug, thiserror::Error)]
#[error("bootstrap failed while {state}: {source}")]
pub struct SequencerError {
    /// The state the run was in when it failed.
    pub state: BootstrapState,
    pub source: BootstrapError,
}

/// A step failure a run carried on past.
#[derive(Debug)]
pub struct StepFailure {
    pub state: BootstrapState,
    pub node: IpAddr,
    pub error: BootstrapError,
}

/// A completed run.
#[derive(Debug)]
pub struct BootstrapOutcome {
    /// The cluster API endpoint the kubeconfig points at.
    pub endpoint: String,
    pub install: PhaseConfiguration,
    pub upgrade: PhaseConfiguration,
    /// Failures recorded under [`FailurePolicy::Continue`].
    pub step_failures: Vec<StepFailure>,
}

/// Bootstraps two-node clusters.
#[derive(Debug)]
pub struct Sequencer {
    executor: Arc<dyn CommandExecutor>,
    emitter: Arc<dyn ConfigurationEmitter>,
    config: SequencerConfig,
}

impl Sequencer {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        emitter: Arc<dyn ConfigurationEmitter>,
        config: SequencerConfig,
    ) -> Sequencer {
        Sequencer {
            executor,
            emitter,
            config,
        }
    }

    /// Runs a bootstrap for `request`.
    ///
    /// Node addresses are validated before any remote call. Cancelling
    /// `cancel` ends the run at the next remote call or wait.
    pub async fn run(
        &self,
        request: &ClusterBootstrapRequest,
        cancel: &CancellationToken,
    ) -> Result<BootstrapOutcome, SequencerError> {
        let mut run = Run {
            state: BootstrapState::Init,
            policy: self.config.failure_policy,
            step_failures: vec![],
            cancel,
        };

        let addresses = match request.validate() {
            Ok(addresses) => addresses,
            Err(e) => return Err(run.fail(e.into())),
        };
        let founder = self.host(addresses.founder);
        let joiner = self.host(addresses.joiner);
        info!(
            "bootstrapping cluster {} on {founder} and {joiner}",
            request.rancher_url
        );

        run.enter(BootstrapState::FoundingNode1);
        run.check_cancelled()?;
        let command = self.install_command(request, FOUNDER_TOKEN_PLACEHOLDER, addresses.founder);
        if let Err(e) = self.executor.execute(&command, &founder).await {
            run.tolerate(addresses.founder, e.into())?;
        }
        run.check_cancelled()?;
        let founder_state = match retrieve_founder_state(
            &*self.executor,
            &founder,
            self.config.founder_reads,
            cancel,
        )
        .await
        {
            Ok(state) => state,
            Err(e) => {
                run.tolerate(addresses.founder, e.into())?;
                FounderState::empty()
            }
        };

        run.enter(BootstrapState::AwaitingNode1Ready);
        self.await_ready(&mut run, &founder).await?;

        run.enter(BootstrapState::JoiningNode2);
        run.check_cancelled()?;
        let command =
            self.install_command(request, founder_state.token.expose(), addresses.joiner);
        if let Err(e) = self.executor.execute(&command, &joiner).await {
            run.tolerate(addresses.joiner, e.into())?;
        }

        run.enter(BootstrapState::AwaitingNode2Ready);
        self.await_ready(&mut run, &joiner).await?;

        run.enter(BootstrapState::EmittingConfiguration);
        run.check_cancelled()?;
        let credentials = rewrite_endpoint(&founder_state.credentials, addresses.founder);
        let install = self.config.release.phase(Phase::Install, &request.rancher_url);
        let upgrade = self.config.release.phase(Phase::Upgrade, &request.rancher_url);
        let emitted = self
            .emitter
            .write_credentials(&credentials)
            .and_then(|()| self.emitter.write_phase(&install))
            .and_then(|()| self.emitter.write_phase(&upgrade));
        if let Err(e) = emitted {
            return Err(run.fail(BootstrapError::Emit(e)));
        }

        run.enter(BootstrapState::Done);
        Ok(BootstrapOutcome {
            endpoint: control_plane_endpoint(addresses.founder),
            install,
            upgrade,
            step_failures: run.step_failures,
        })
    }

    fn host(&self, address: IpAddr) -> RemoteHost {
        RemoteHost {
            address,
            port: self.config.ssh_port,
            user: self.config.ssh_user.clone(),
        }
    }

    fn install_command(
        &self,
        request: &ClusterBootstrapRequest,
        token: &str,
        external_ip: IpAddr,
    ) -> String {
        ServerInstall {
            k3s_version: &self.config.k3s_version,
            token,
            datastore: &self.config.datastore,
            datastore_password: &request.datastore_password,
            datastore_endpoint: &request.datastore_endpoint,
            tls_san: &request.rancher_url,
            external_ip,
        }
        .to_command()
    }

    async fn await_ready(&self, run: &mut Run<'_>, host: &RemoteHost) -> Result<(), SequencerError> {
        match wait_until_ready(
            &*self.executor,
            host,
            SERVICE_PROBE_COMMAND,
            self.config.readiness,
            run.cancel,
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(e) => run.tolerate(host.address, e.into()),
        }
    }
}

/// The mutable state of one run.
struct Run<'a> {
    state: BootstrapState,
    policy: FailurePolicy,
    step_failures: Vec<StepFailure>,
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    fn enter(&mut self, state: BootstrapState) {
        info!("bootstrap: {} -> {}", self.state, state);
        self.state = state;
    }

    fn fail(&self, source: BootstrapError) -> SequencerError {
        error!("bootstrap: {} -> {}: {source}", self.state, BootstrapState::Failed);
        SequencerError {
            state: self.state,
            source,
        }
    }

    fn check_cancelled(&self) -> Result<(), SequencerError> {
        if self.cancel.is_cancelled() {
            Err(self.fail(BootstrapError::Cancelled))
        } else {
            Ok(())
        }
    }

    /// Applies the failure policy to a failed step on `node`.
    fn tolerate(&mut self, node: IpAddr, error: BootstrapError) -> Result<(), SequencerError> {
        if self.policy == FailurePolicy::Abort || error.is_cancellation() {
            return Err(self.fail(error));
        }
        warn!("continuing past failure while {} on {node}: {error}", self.state);
        self.step_failures.push(StepFailure {
            state: self.state,
            node,
            error,
        });
        Ok(())
    }
}
