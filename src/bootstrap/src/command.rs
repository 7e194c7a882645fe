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

//! The shell commands run on nodes.

use std::net::IpAddr;

/// Stands in for the join token on the founding node, which has none yet.
pub const FOUNDER_TOKEN_PLACEHOLDER: &str = "SECRET";

/// Prints `active` once the k3s service is up.
pub const SERVICE_PROBE_COMMAND: &str = "systemctl is-active k3s";

/// Prints the cluster join token of a server node.
pub const READ_TOKEN_COMMAND: &str = "sudo cat /var/lib/rancher/k3s/server/token";

/// Prints the admin kubeconfig of a server node.
pub const READ_KUBECONFIG_COMMAND: &str = "sudo cat /etc/rancher/k3s/k3s.yaml";

const INSTALL_SCRIPT_URL: &str = "https://get.k3s.io";

/// How k3s reaches its MySQL datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreSettings {
    /// The datastore user k3s logs in as.
    pub user: String,
    /// The database k3s keeps its state in.
    pub database: String,
}

impl Default for DatastoreSettings {
    fn default() -> Self {
        DatastoreSettings {
            user: "tfadmin".into(),
            database: "k3s".into(),
        }
    }
}

/// Installs k3s as a datastore-backed server.
///
/// The same shape founds the cluster (with [`FOUNDER_TOKEN_PLACEHOLDER`] as
/// the token) and joins it (with the founder's real token).
pub struct ServerInstall<'a> {
    pub k3s_version: &'a str,
    pub token: &'a str,
    pub datastore: &'a DatastoreSettings,
    pub datastore_password: &'a str,
    pub datastore_endpoint: &'a str,
    pub tls_san: &'a str,
    pub external_ip: IpAddr,
}

impl ServerInstall<'_> {
    /// Renders the install pipeline.
    ///
    /// Every interpolated value except the IP address is shell-quoted.
    pub fn to_command(&self) -> String {
        let datastore_uri = format!(
            "mysql://{}:{}@tcp({})/{}",
            self.datastore.user,
            self.datastore_password,
            self.datastore_endpoint,
            self.datastore.database,
        );
        format!(
            "curl -sfL {INSTALL_SCRIPT_URL} | INSTALL_K3S_VERSION={} sh -s - server \
             --token={} --datastore-endpoint={} --tls-san {} --node-external-ip {}",
            quote(self.k3s_version),
            quote(self.token),
            quote(&datastore_uri),
            quote(self.tls_san),
            self.external_ip,
        )
    }
}

/// Single-quotes `s` for a POSIX shell.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
