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

//! Remote command execution against cluster nodes.
//!
//! The [`CommandExecutor`] trait is the seam between the bootstrap logic and
//! the transport used to reach a node. The intent is that you can implement
//! `CommandExecutor` with SSH sessions in production and with a scripted stub
//! in tests.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;

/// The login identity used on freshly provisioned nodes.
pub const DEFAULT_SSH_USER: &str = "ubuntu";

/// The administrative port nodes accept remote shell sessions on.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Runs one command on one remote host.
///
/// Every call is independent: implementations must not reuse connections
/// across calls, and must release whatever they acquired before returning,
/// on the error paths too. Implementations do not retry.
#[async_trait]
pub trait CommandExecutor: fmt::Debug + Send + Sync {
    /// Runs `command` on `host` and returns its standard output with trailing
    /// carriage returns and newlines removed.
    async fn execute(&self, command: &str, host: &RemoteHost) -> Result<String, ExecError>;
}

/// A single machine reachable over the remote shell channel.
///
/// The credential used to authenticate is held by the [`CommandExecutor`],
/// not by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    /// The public address of the machine.
    pub address: IpAddr,
    /// The administrative port.
    pub port: u16,
    /// The login identity.
    pub user: String,
}

impl RemoteHost {
    /// Describes `address` with the default port and login identity.
    pub fn new(address: IpAddr) -> RemoteHost {
        RemoteHost {
            address,
            port: DEFAULT_SSH_PORT,
            user: DEFAULT_SSH_USER.into(),
        }
    }
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(addr) => write!(f, "{}@{}:{}", self.user, addr, self.port),
            IpAddr::V6(addr) => write!(f, "{}@[{}]:{}", self.user, addr, self.port),
        }
    }
}

/// The broad class of an [`ExecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The configured private key cannot be used.
    Credential,
    /// The host could not be reached or refused to open a session.
    Connectivity,
    /// The command ran and failed.
    Command,
}

/// A failed remote command.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The private key could not be parsed or staged for use.
    #[error("unusable private key for {host}: {reason}")]
    Credential { host: String, reason: String },
    /// Establishing the connection to the host failed.
    #[error("failed to establish ssh connection to {host}: {source:#}")]
    Connect {
        host: String,
        source: anyhow::Error,
    },
    /// The connection was established but a session could not be opened.
    #[error("failed to create ssh session on {host}: {source:#}")]
    Session {
        host: String,
        source: anyhow::Error,
    },
    /// The command exited unsuccessfully.
    #[error("command on {host} failed with {}", display_status(.status))]
    Command { host: String, status: Option<i32> },
}

fn display_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "no exit status".into(),
    }
}

impl ExecError {
    /// Reports the broad class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExecError::Credential { .. } => ErrorClass::Credential,
            ExecError::Connect { .. } | ExecError::Session { .. } => ErrorClass::Connectivity,
            ExecError::Command { .. } => ErrorClass::Command,
        }
    }

    /// Reports whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self.class(), ErrorClass::Credential)
    }
}

/// Removes trailing carriage returns and newlines from command output.
pub fn trim_output(output: &str) -> &str {
    output.trim_end_matches(['\r', '\n'])
}
