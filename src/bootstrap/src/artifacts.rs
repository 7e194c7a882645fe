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

//! The files a bootstrap leaves behind for the Helm stage.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use tempfile::NamedTempFile;
use tracing::info;

use crate::founder::AdminCredentialBundle;
use crate::phase::{ConfigurationEmitter, Phase, PhaseConfiguration};

/// The default name of the admin kubeconfig.
pub const DEFAULT_KUBECONFIG_FILE: &str = "ha.yml";

/// The file the Helm stage reads its variables from.
pub const INSTALL_VARS_FILE: &str = "terraform.tfvars.json";

/// The file the upgrade variables wait in until promoted.
pub const UPGRADE_VARS_FILE: &str = "upgrade.tfvars.json";

/// Where each artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    pub kubeconfig: PathBuf,
    pub install_vars: PathBuf,
    pub upgrade_vars: PathBuf,
}

impl ArtifactLayout {
    /// Lays out the variable files inside `helm_module_dir`.
    pub fn new(kubeconfig: impl Into<PathBuf>, helm_module_dir: &Path) -> ArtifactLayout {
        ArtifactLayout {
            kubeconfig: kubeconfig.into(),
            install_vars: helm_module_dir.join(INSTALL_VARS_FILE),
            upgrade_vars: helm_module_dir.join(UPGRADE_VARS_FILE),
        }
    }

    pub fn phase_vars(&self, phase: Phase) -> &Path {
        match phase {
            Phase::Install => &self.install_vars,
            Phase::Upgrade => &self.upgrade_vars,
        }
    }

    fn all(&self) -> [&Path; 3] {
        [&self.kubeconfig, &self.install_vars, &self.upgrade_vars]
    }
}

/// Writes artifacts to the local filesystem.
///
/// Every file is replaced atomically and readable by the owner only, as
/// each one carries a credential.
#[derive(Debug, Clone)]
pub struct FileEmitter {
    layout: ArtifactLayout,
}

impl FileEmitter {
    pub fn new(layout: ArtifactLayout) -> FileEmitter {
        FileEmitter { layout }
    }
}

impl ConfigurationEmitter for FileEmitter {
    fn write_credentials(&self, credentials: &AdminCredentialBundle) -> Result<(), anyhow::Error> {
        write_atomic(&self.layout.kubeconfig, credentials.as_str().as_bytes())?;
        info!("wrote kubeconfig to {}", self.layout.kubeconfig.display());
        Ok(())
    }

    fn write_phase(&self, config: &PhaseConfiguration) -> Result<(), anyhow::Error> {
        let path = self.layout.phase_vars(config.phase);
        let json = config
            .to_json()
            .with_context(|| format!("serializing {} variables", config.phase))?;
        write_atomic(path, &json)?;
        info!("wrote {} variables to {}", config.phase, path.display());
        Ok(())
    }
}

/// Replaces `path` with `contents`.
///
/// The contents are staged in a sibling temporary file, which is created
/// with mode 0600, and renamed over `path` once synced.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), anyhow::Error> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut file =
        NamedTempFile::new_in(dir).with_context(|| format!("staging {}", path.display()))?;
    file.write_all(contents)
        .and_then(|()| file.as_file().sync_all())
        .with_context(|| format!("writing {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Makes the upgrade variables the ones the Helm stage reads next.
///
/// The install variables are overwritten.
pub fn promote_upgrade(layout: &ArtifactLayout) -> Result<(), anyhow::Error> {
    if !layout.upgrade_vars.exists() {
        bail!(
            "no upgrade variables at {}; run a bootstrap first",
            layout.upgrade_vars.display()
        );
    }
    fs::rename(&layout.upgrade_vars, &layout.install_vars).with_context(|| {
        format!(
            "moving {} to {}",
            layout.upgrade_vars.display(),
            layout.install_vars.display()
        )
    })?;
    info!(
        "promoted upgrade variables to {}",
        layout.install_vars.display()
    );
    Ok(())
}

/// Removes every artifact and returns the paths that existed.
pub fn clean(layout: &ArtifactLayout) -> Result<Vec<PathBuf>, anyhow::Error> {
    let mut removed = vec![];
    for path in layout.all() {
        match fs::remove_file(path) {
            Ok(()) => {
                info!("removed {}", path.display());
                removed.push(path.to_path_buf());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
    Ok(removed)
}
