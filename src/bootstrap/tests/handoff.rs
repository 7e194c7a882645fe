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

//! A bootstrap against healthy nodes, through to the files the Helm stage
//! consumes.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ha_bootstrap::command::{READ_KUBECONFIG_COMMAND, READ_TOKEN_COMMAND, SERVICE_PROBE_COMMAND};
use ha_bootstrap::{
    ArtifactLayout, BootstrapState, ClusterBootstrapRequest, FileEmitter, PollConfig,
    ReleaseConfig, ReleaseValues, Sequencer, SequencerConfig, clean, promote_upgrade,
};
use ha_orchestrator::{CommandExecutor, ExecError, RemoteHost};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Two nodes that install, start and serve their state without delay.
#[derive(Debug, Default)]
struct HealthyNodes {
    commands: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CommandExecutor for HealthyNodes {
    async fn execute(&self, command: &str, host: &RemoteHost) -> Result<String, ExecError> {
        self.commands
            .lock()
            .unwrap()
            .push((host.address.to_string(), command.to_string()));
        let output = match command {
            SERVICE_PROBE_COMMAND => "active\n",
            READ_TOKEN_COMMAND => "K10deadbeef::server:cafe\n",
            READ_KUBECONFIG_COMMAND => {
                "apiVersion: v1\nclusters:\n- cluster:\n    server: https://127.0.0.1:6443\n"
            }
            _ => "[INFO]  systemd: Starting k3s\n",
        };
        Ok(ha_orchestrator::trim_output(output).to_string())
    }
}

fn release() -> ReleaseConfig {
    ReleaseConfig {
        repository_url: "https://releases.rancher.com/server-charts/latest".into(),
        bootstrap_password: Zeroizing::new("admin-pw".into()),
        psp_enabled: false,
        install: ReleaseValues {
            version: "2.7.3".into(),
            image_tag: "v2.7.3".into(),
        },
        upgrade: ReleaseValues {
            version: "2.7.5".into(),
            image_tag: "v2.7.5".into(),
        },
    }
}

fn request() -> ClusterBootstrapRequest {
    ClusterBootstrapRequest {
        datastore_password: Zeroizing::new("p4ss".into()),
        datastore_endpoint: "db.example.com:3306".into(),
        rancher_url: "rancher.example.com".into(),
        node1_address: "192.168.1.10".into(),
        node2_address: "192.168.1.11".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn bootstrap_then_upgrade_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path().join("ha.yml"), &dir.path().join("helm"));
    let executor = Arc::new(HealthyNodes::default());

    let mut config = SequencerConfig::new("v1.24.14+k3s1", release());
    config.readiness = PollConfig {
        interval: Duration::from_secs(10),
        timeout: Duration::from_secs(300),
    };
    let sequencer = Sequencer::new(
        Arc::clone(&executor) as Arc<dyn CommandExecutor>,
        Arc::new(FileEmitter::new(layout.clone())),
        config,
    );
    let outcome = sequencer
        .run(&request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.endpoint, "https://192.168.1.10:6443");

    let commands = executor.commands.lock().unwrap().clone();
    let join = commands
        .iter()
        .find(|(host, command)| host == "192.168.1.11" && command.starts_with("curl"))
        .unwrap();
    assert!(join.1.contains("--token='K10deadbeef::server:cafe'"));

    let kubeconfig = fs::read_to_string(&layout.kubeconfig).unwrap();
    assert!(kubeconfig.contains("server: https://192.168.1.10:6443"));

    let install: serde_json::Value =
        serde_json::from_slice(&fs::read(&layout.install_vars).unwrap()).unwrap();
    assert_eq!(install["rancher_url"], "rancher.example.com");
    assert_eq!(install["rancher_version"], "2.7.3");
    assert_eq!(install["psp_bool"], false);

    promote_upgrade(&layout).unwrap();
    let promoted: serde_json::Value =
        serde_json::from_slice(&fs::read(&layout.install_vars).unwrap()).unwrap();
    assert_eq!(promoted["rancher_version"], "2.7.5");
    assert_eq!(promoted["image_tag"], "v2.7.5");

    let removed = clean(&layout).unwrap();
    assert_eq!(removed, vec![layout.kubeconfig.clone(), layout.install_vars.clone()]);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_written_for_an_invalid_request() {
    let dir = tempfile::tempdir().unwrap();
    let layout = ArtifactLayout::new(dir.path().join("ha.yml"), dir.path());
    let executor = Arc::new(HealthyNodes::default());
    let sequencer = Sequencer::new(
        Arc::clone(&executor) as Arc<dyn CommandExecutor>,
        Arc::new(FileEmitter::new(layout.clone())),
        SequencerConfig::new("v1.24.14+k3s1", release()),
    );
    let mut request = request();
    request.node2_address = "node-2.internal".into();

    let err = sequencer
        .run(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.state, BootstrapState::Init);
    assert!(err.to_string().contains("node 2"), "{err}");
    assert!(executor.commands.lock().unwrap().is_empty());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}
