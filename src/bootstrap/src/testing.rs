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

//! Test doubles for the remote and local side effects of a bootstrap.

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use ha_orchestrator::{CommandExecutor, ExecError, RemoteHost};

use crate::command::{READ_KUBECONFIG_COMMAND, READ_TOKEN_COMMAND, SERVICE_PROBE_COMMAND};
use crate::founder::AdminCredentialBundle;
use crate::phase::{ConfigurationEmitter, Phase, PhaseConfiguration};

pub const SAMPLE_KUBECONFIG: &str = "apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTg==
    server: https://127.0.0.1:6443
  name: default
kind: Config
";

/// The kinds of command a bootstrap runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandKind {
    Install,
    Probe,
    ReadToken,
    ReadKubeconfig,
}

impl CommandKind {
    fn of(command: &str) -> CommandKind {
        match command {
            SERVICE_PROBE_COMMAND => CommandKind::Probe,
            READ_TOKEN_COMMAND => CommandKind::ReadToken,
            READ_KUBECONFIG_COMMAND => CommandKind::ReadKubeconfig,
            _ => CommandKind::Install,
        }
    }
}

/// A scripted result of one call.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(String),
    ConnectFailure,
    CommandFailure,
    CredentialFailure,
}

impl Reply {
    pub fn output(s: &str) -> Reply {
        Reply::Output(s.into())
    }

    pub fn connect_failure() -> Reply {
        Reply::ConnectFailure
    }

    pub fn command_failure() -> Reply {
        Reply::CommandFailure
    }

    pub fn credential_failure() -> Reply {
        Reply::CredentialFailure
    }

    fn into_result(self, host: &RemoteHost) -> Result<String, ExecError> {
        match self {
            Reply::Output(s) => Ok(s),
            Reply::ConnectFailure => Err(ExecError::Connect {
                host: host.to_string(),
                source: anyhow::anyhow!("connection refused"),
            }),
            Reply::CommandFailure => Err(ExecError::Command {
                host: host.to_string(),
                status: Some(1),
            }),
            Reply::CredentialFailure => Err(ExecError::Credential {
                host: host.to_string(),
                reason: "private key is encrypted".into(),
            }),
        }
    }
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub host: IpAddr,
    pub kind: CommandKind,
    pub command: String,
}

/// A [`CommandExecutor`] that replays scripted replies and records calls.
///
/// Replies are consumed in order per host and command kind; the last one
/// repeats. Unscripted calls succeed with a healthy node's output.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<Call>>,
    replies: Mutex<BTreeMap<(IpAddr, CommandKind), VecDeque<Reply>>>,
}

impl ScriptedExecutor {
    pub fn new() -> ScriptedExecutor {
        ScriptedExecutor::default()
    }

    pub fn script(
        &self,
        host: IpAddr,
        kind: CommandKind,
        replies: impl IntoIterator<Item = Reply>,
    ) {
        self.replies
            .lock()
            .expect("lock poisoned")
            .insert((host, kind), replies.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    pub fn calls_of(&self, host: IpAddr, kind: CommandKind) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.host == host && call.kind == kind)
            .count()
    }

    fn next_reply(&self, host: IpAddr, kind: CommandKind) -> Reply {
        let mut replies = self.replies.lock().expect("lock poisoned");
        match replies.get_mut(&(host, kind)) {
            Some(queue) if queue.len() > 1 => queue.pop_front().expect("non-empty"),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => match kind {
                CommandKind::Install => Reply::output(""),
                CommandKind::Probe => Reply::output("active"),
                CommandKind::ReadToken => Reply::output("tok-123"),
                CommandKind::ReadKubeconfig => Reply::output(SAMPLE_KUBECONFIG),
            },
        }
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, command: &str, host: &RemoteHost) -> Result<String, ExecError> {
        let kind = CommandKind::of(command);
        self.calls.lock().expect("lock poisoned").push(Call {
            host: host.address,
            kind,
            command: command.into(),
        });
        self.next_reply(host.address, kind).into_result(host)
    }
}

/// A [`ConfigurationEmitter`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    pub credentials: Mutex<Option<String>>,
    pub phases: Mutex<BTreeMap<Phase, PhaseConfiguration>>,
    pub fail: bool,
}

impl MemoryEmitter {
    pub fn failing() -> MemoryEmitter {
        MemoryEmitter {
            fail: true,
            ..Default::default()
        }
    }

    pub fn credentials(&self) -> Option<String> {
        self.credentials.lock().expect("lock poisoned").clone()
    }

    pub fn phase(&self, phase: Phase) -> Option<PhaseConfiguration> {
        self.phases.lock().expect("lock poisoned").get(&phase).cloned()
    }
}

impl ConfigurationEmitter for MemoryEmitter {
    fn write_credentials(&self, credentials: &AdminCredentialBundle) -> Result<(), anyhow::Error> {
        if self.fail {
            anyhow::bail!("disk full");
        }
        *self.credentials.lock().expect("lock poisoned") = Some(credentials.as_str().into());
        Ok(())
    }

    fn write_phase(&self, config: &PhaseConfiguration) -> Result<(), anyhow::Error> {
        if self.fail {
            anyhow::bail!("disk full");
        }
        self.phases
            .lock()
            .expect("lock poisoned")
            .insert(config.phase, config.clone());
        Ok(())
    }
}
