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

//! Rancher release configuration for the install and upgrade phases.
//!
//! A bootstrap hands off to the Helm stage twice: once to install Rancher at
//! the initial release and once to upgrade it. Both phases share everything
//! but the chart version and image tag.

use std::fmt;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::founder::AdminCredentialBundle;

/// Which Helm run a [`PhaseConfiguration`] is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Install,
    Upgrade,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Install => f.write_str("install"),
            Phase::Upgrade => f.write_str("upgrade"),
        }
    }
}

/// The chart version and image tag of one Rancher release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseValues {
    pub version: String,
    pub image_tag: String,
}

/// The operator's choice of Rancher releases.
#[derive(Clone)]
pub struct ReleaseConfig {
    /// The Helm repository the chart is pulled from.
    pub repository_url: String,
    /// The initial admin password of the Rancher UI.
    pub bootstrap_password: Zeroizing<String>,
    /// Whether the chart should install pod security policies.
    pub psp_enabled: bool,
    pub install: ReleaseValues,
    pub upgrade: ReleaseValues,
}

impl ReleaseConfig {
    /// Builds the configuration of `phase` for a cluster served at
    /// `rancher_url`.
    pub fn phase(&self, phase: Phase, rancher_url: &str) -> PhaseConfiguration {
        let release = match phase {
            Phase::Install => &self.install,
            Phase::Upgrade => &self.upgrade,
        };
        PhaseConfiguration {
            phase,
            rancher_url: rancher_url.into(),
            repository_url: self.repository_url.clone(),
            bootstrap_password: self.bootstrap_password.clone(),
            rancher_version: release.version.clone(),
            image_tag: release.image_tag.clone(),
            psp_enabled: self.psp_enabled,
        }
    }
}

impl fmt::Debug for ReleaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseConfig")
            .field("repository_url", &self.repository_url)
            .field("psp_enabled", &self.psp_enabled)
            .field("install", &self.install)
            .field("upgrade", &self.upgrade)
            .finish_non_exhaustive()
    }
}

/// The variables handed to the Helm stage for one phase.
///
/// Serializes to the flat variable names the Helm stage reads. `psp_bool`
/// is only present when pod security policies are disabled; the chart
/// enables them by default.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct PhaseConfiguration {
    #[serde(skip)]
    pub phase: Phase,
    pub rancher_url: String,
    pub repository_url: String,
    pub bootstrap_password: Zeroizing<String>,
    pub rancher_version: String,
    pub image_tag: String,
    #[serde(rename = "psp_bool", skip_serializing_if = "is_true")]
    pub psp_enabled: bool,
}

fn is_true(b: &bool) -> bool {
    *b
}

impl PhaseConfiguration {
    /// Renders the variables as a JSON document.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        Ok(json)
    }
}

impl fmt::Debug for PhaseConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseConfiguration")
            .field("phase", &self.phase)
            .field("rancher_url", &self.rancher_url)
            .field("repository_url", &self.repository_url)
            .field("rancher_version", &self.rancher_version)
            .field("image_tag", &self.image_tag)
            .field("psp_enabled", &self.psp_enabled)
            .finish_non_exhaustive()
    }
}

/// Persists what a bootstrap hands to the next stage.
pub trait ConfigurationEmitter: fmt::Debug + Send + Sync {
    /// Persists the admin kubeconfig.
    fn write_credentials(&self, credentials: &AdminCredentialBundle) -> Result<(), anyhow::Error>;

    /// Persists the variables of one phase.
    fn write_phase(&self, config: &PhaseConfiguration) -> Result<(), anyhow::Error>;
}
