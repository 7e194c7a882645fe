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

//! The input to a bootstrap run.

use std::fmt;
use std::net::{AddrParseError, IpAddr};

use zeroize::Zeroizing;

/// Everything a bootstrap run needs to know about the provisioned
/// infrastructure.
///
/// Node addresses are kept as the raw strings the infrastructure reported;
/// [`ClusterBootstrapRequest::validate`] turns them into addresses.
#[derive(Clone)]
pub struct ClusterBootstrapRequest {
    /// The password of the datastore's admin user.
    pub datastore_password: Zeroizing<String>,
    /// The datastore's `host:port`.
    pub datastore_endpoint: String,
    /// The public DNS name the cluster is served under.
    pub rancher_url: String,
    /// The public address of the founding node.
    pub node1_address: String,
    /// The public address of the joining node.
    pub node2_address: String,
}

/// The parsed addresses of both nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddresses {
    pub founder: IpAddr,
    pub joiner: IpAddr,
}

/// A node address that is not an IP address.
#[derive(Debug, thiserror::Error)]
#[error("{node} address {value:?} is not a valid IP address: {source}")]
pub struct InvalidAddress {
    pub node: &'static str,
    pub value: String,
    pub source: AddrParseError,
}

impl ClusterBootstrapRequest {
    /// Checks that both node addresses are IP addresses.
    pub fn validate(&self) -> Result<NodeAddresses, InvalidAddress> {
        Ok(NodeAddresses {
            founder: parse_address("node 1", &self.node1_address)?,
            joiner: parse_address("node 2", &self.node2_address)?,
        })
    }
}

fn parse_address(node: &'static str, value: &str) -> Result<IpAddr, InvalidAddress> {
    value.parse().map_err(|source| InvalidAddress {
        node,
        value: value.to_string(),
        source,
    })
}

impl fmt::Debug for ClusterBootstrapRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterBootstrapRequest")
            .field("datastore_endpoint", &self.datastore_endpoint)
            .field("rancher_url", &self.rancher_url)
            .field("node1_address", &self.node1_address)
            .field("node2_address", &self.node2_address)
            .finish_non_exhaustive()
    }
}
