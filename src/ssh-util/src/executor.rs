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

//! A [`CommandExecutor`] that runs commands over OpenSSH.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ha_orchestrator::{CommandExecutor, ExecError, RemoteHost, trim_output};
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use tracing::{debug, warn};

use crate::keys::{KeyError, SshPrivateKey};

/// The default bound on establishing a connection to a node.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the identity of a node is verified.
///
/// Every policy refuses a node whose recorded key has changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Only connect to nodes whose key is already listed in `known_hosts`.
    Pinned { known_hosts: PathBuf },
    /// Record the key of a node seen for the first time in `known_hosts` and
    /// refuse to connect if a recorded key later changes.
    TrustOnFirstUse { known_hosts: PathBuf },
}

impl HostKeyPolicy {
    fn known_hosts_check(&self) -> KnownHosts {
        match self {
            HostKeyPolicy::Pinned { .. } => KnownHosts::Strict,
            HostKeyPolicy::TrustOnFirstUse { .. } => KnownHosts::Add,
        }
    }

    /// The file host keys are checked against.
    pub fn known_hosts_file(&self) -> &Path {
        match self {
            HostKeyPolicy::Pinned { known_hosts } => known_hosts,
            HostKeyPolicy::TrustOnFirstUse { known_hosts } => known_hosts,
        }
    }
}

/// Settings shared by every session an [`SshExecutor`] opens.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// How node identities are verified.
    pub host_keys: HostKeyPolicy,
    /// The bound on establishing each connection.
    pub connect_timeout: Duration,
}

/// Runs each command on a fresh SSH connection.
///
/// For every call the private key is staged into a private temporary
/// directory that also holds the multiplexing control socket. The session is
/// closed and the directory removed before the call returns, whether or not
/// the command succeeded.
#[derive(Debug)]
pub struct SshExecutor {
    key: SshPrivateKey,
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(key: SshPrivateKey, config: SshConfig) -> SshExecutor {
        SshExecutor { key, config }
    }

    async fn connect(
        &self,
        host: &RemoteHost,
        keyfile: &Path,
        control_dir: &Path,
    ) -> Result<Session, ExecError> {
        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(self.config.host_keys.known_hosts_check())
            .user_known_hosts_file(self.config.host_keys.known_hosts_file())
            .user(host.user.clone())
            .port(host.port)
            .keyfile(keyfile)
            .control_directory(control_dir)
            .connect_timeout(self.config.connect_timeout);
        builder
            .connect_mux(host.address.to_string())
            .await
            .map_err(|e| ExecError::Connect {
                host: host.to_string(),
                source: e.into(),
            })
    }
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    async fn execute(&self, command: &str, host: &RemoteHost) -> Result<String, ExecError> {
        let staged = self
            .key
            .stage()
            .map_err(|e| credential_error(host, &e))?;
        let session = self.connect(host, staged.path(), staged.dir()).await?;

        let result = run(&session, command, host).await;

        if let Err(e) = session.close().await {
            warn!("failed to close ssh session to {host}: {e}");
        }
        drop(staged);
        result
    }
}

fn credential_error(host: &RemoteHost, error: &KeyError) -> ExecError {
    ExecError::Credential {
        host: host.to_string(),
        reason: error.to_string(),
    }
}

async fn run(session: &Session, command: &str, host: &RemoteHost) -> Result<String, ExecError> {
    debug!("running remote command on {host}");
    let output = session
        .raw_command(command)
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| ExecError::Session {
            host: host.to_string(),
            source: e.into(),
        })?;
    if !output.status.success() {
        return Err(ExecError::Command {
            host: host.to_string(),
            status: output.status.code(),
        });
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(trim_output(&stdout).to_string())
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    use ha_orchestrator::ErrorClass;

    use super::*;

    #[test]
    fn staging_failures_name_the_host() {
        let host = RemoteHost::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        let err = credential_error(
            &host,
            &KeyError::Io(io::Error::new(io::ErrorKind::StorageFull, "no space left")),
        );
        assert_eq!(err.class(), ErrorClass::Credential);
        assert!(!err.is_transient());
        let message = err.to_string();
        assert!(message.contains("ubuntu@10.0.0.2:22"), "{message}");
        assert!(message.contains("no space left"), "{message}");
    }

    #[test]
    fn host_key_policies_never_accept_unknown_changes() {
        let pinned = HostKeyPolicy::Pinned {
            known_hosts: PathBuf::from("/etc/ha/known_hosts"),
        };
        assert!(matches!(pinned.known_hosts_check(), KnownHosts::Strict));
        assert_eq!(pinned.known_hosts_file(), Path::new("/etc/ha/known_hosts"));

        let tofu = HostKeyPolicy::TrustOnFirstUse {
            known_hosts: PathBuf::from("known_hosts"),
        };
        assert!(matches!(tofu.known_hosts_check(), KnownHosts::Add));
        assert_eq!(tofu.known_hosts_file(), Path::new("known_hosts"));
    }
}
