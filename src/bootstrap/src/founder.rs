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

//! State produced by the founding node: the join token and the admin
//! kubeconfig.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ha_orchestrator::{CommandExecutor, ExecError, RemoteHost};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::command::{READ_KUBECONFIG_COMMAND, READ_TOKEN_COMMAND};
use crate::poll::{self, AttemptError, FirstAttempt, PollConfig, StopReason, Stopped};

/// The port the k3s API server listens on.
pub const CONTROL_PLANE_PORT: u16 = 6443;

/// The API endpoint k3s writes into the kubeconfig it generates.
pub const LOOPBACK_ENDPOINT: &str = "https://127.0.0.1:6443";

/// The secret a node presents to join the cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct JoinToken(Zeroizing<String>);

impl JoinToken {
    /// Accepts `token` if it is non-empty and has no whitespace.
    ///
    /// A half-written token file shows up as empty output or with a stray
    /// line break.
    pub fn parse(token: impl Into<String>) -> Option<JoinToken> {
        let token = Zeroizing::new(token.into());
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            None
        } else {
            Some(JoinToken(token))
        }
    }

    /// An empty token, for runs that continue past a failed read.
    pub fn empty() -> JoinToken {
        JoinToken(Zeroizing::new(String::new()))
    }

    /// Exposes the token for interpolation into the join command.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JoinToken(<redacted>)")
    }
}

/// A kubeconfig granting cluster-admin access.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentialBundle(Zeroizing<String>);

impl AdminCredentialBundle {
    pub fn new(contents: impl Into<String>) -> AdminCredentialBundle {
        AdminCredentialBundle(Zeroizing::new(contents.into()))
    }

    /// Accepts `contents` if it looks like a kubeconfig with a cluster
    /// endpoint.
    pub fn parse(contents: impl Into<String>) -> Option<AdminCredentialBundle> {
        let bundle = AdminCredentialBundle::new(contents);
        bundle.0.contains("server:").then_some(bundle)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AdminCredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AdminCredentialBundle(<{} bytes>)", self.0.len())
    }
}

/// What the joining node and the operator need from the founding node.
#[derive(Debug, Clone)]
pub struct FounderState {
    pub token: JoinToken,
    pub credentials: AdminCredentialBundle,
}

impl FounderState {
    /// Placeholder state for runs that continue past a failed read.
    pub fn empty() -> FounderState {
        FounderState {
            token: JoinToken::empty(),
            credentials: AdminCredentialBundle::new(""),
        }
    }
}

/// The founding node never produced usable state.
#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    #[error(
        "could not read join token and kubeconfig from {host} within {timeout:?} \
         ({attempts} attempts): {last_failure}"
    )]
    Unavailable {
        host: String,
        timeout: Duration,
        attempts: u32,
        last_failure: String,
    },
    #[error("gave up reading join token and kubeconfig from {host} after {attempts} attempts: {reason}")]
    Rejected {
        host: String,
        attempts: u32,
        reason: String,
    },
    #[error("cancelled while reading join token and kubeconfig from {host}")]
    Cancelled { host: String },
}

/// Reads the join token and admin kubeconfig off the founding node.
///
/// Both files appear some time after the install command returns, so reads
/// are retried on the cadence of `config` until both are well formed. A read
/// that fails in a way no retry can fix, such as an unusable key, ends the
/// wait at once.
pub async fn retrieve_founder_state(
    executor: &dyn CommandExecutor,
    host: &RemoteHost,
    config: PollConfig,
    cancel: &CancellationToken,
) -> Result<FounderState, RetrieveError> {
    let result = poll::poll(config, FirstAttempt::Immediately, cancel, move |attempt| async move {
        let token = executor
            .execute(READ_TOKEN_COMMAND, host)
            .await
            .map_err(|e| read_failure("reading join token", &e))?;
        let token = JoinToken::parse(token).ok_or("join token is empty or malformed")?;
        if cancel.is_cancelled() {
            return Err(AttemptError::Retry("cancelled".into()));
        }
        let credentials = executor
            .execute(READ_KUBECONFIG_COMMAND, host)
            .await
            .map_err(|e| read_failure("reading kubeconfig", &e))?;
        let credentials = AdminCredentialBundle::parse(credentials)
            .ok_or("kubeconfig has no server endpoint")?;
        debug!("read founder state from {host} on attempt {attempt}");
        Ok::<_, AttemptError>(FounderState { token, credentials })
    })
    .await;

    match result {
        Ok((state, attempts)) => {
            info!("retrieved join token and kubeconfig from {host} after {attempts} attempts");
            Ok(state)
        }
        Err(Stopped {
            reason: StopReason::Cancelled,
            ..
        }) => Err(RetrieveError::Cancelled {
            host: host.to_string(),
        }),
        Err(Stopped {
            reason: StopReason::Deadline,
            attempts,
            last_failure,
        }) => Err(RetrieveError::Unavailable {
            host: host.to_string(),
            timeout: config.timeout,
            attempts,
            last_failure: last_failure.unwrap_or_else(|| "no attempt completed".into()),
        }),
        Err(Stopped {
            reason: StopReason::GaveUp,
            attempts,
            last_failure,
        }) => Err(RetrieveError::Rejected {
            host: host.to_string(),
            attempts,
            reason: last_failure.unwrap_or_default(),
        }),
    }
}

fn read_failure(what: &str, error: &ExecError) -> AttemptError {
    let failure = format!("{what}: {error}");
    if error.is_transient() {
        AttemptError::Retry(failure)
    } else {
        AttemptError::Fatal(failure)
    }
}

/// The API endpoint of the cluster as reached through `founder`.
pub fn control_plane_endpoint(founder: IpAddr) -> String {
    format!("https://{}", SocketAddr::new(founder, CONTROL_PLANE_PORT))
}

/// Points `bundle` at the founding node instead of the loopback interface.
///
/// Every occurrence of [`LOOPBACK_ENDPOINT`] is replaced; nothing else
/// changes.
pub fn rewrite_endpoint(bundle: &AdminCredentialBundle, founder: IpAddr) -> AdminCredentialBundle {
    AdminCredentialBundle::new(
        bundle
            .as_str()
            .replace(LOOPBACK_ENDPOINT, &control_plane_endpoint(founder)),
    )
}
