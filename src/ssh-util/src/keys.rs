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

//! Utilities for loading and staging SSH private keys.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use openssl::pkey::PKey;
use ssh_key::PrivateKey;
use tempfile::TempDir;
use zeroize::Zeroizing;

/// The encoding a private key was supplied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// The proprietary OpenSSH format (`BEGIN OPENSSH PRIVATE KEY`).
    OpenSsh,
    /// A PEM-encoded PKCS#1 or PKCS#8 key, as cloud providers hand out.
    Pem,
}

/// An error loading or staging a private key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("private key is empty")]
    Empty,
    #[error("private key is encrypted, but sessions run non-interactively")]
    Encrypted,
    #[error("failed to parse private key: {0}")]
    Parse(String),
    #[error("failed to read or stage private key: {0}")]
    Io(#[from] io::Error),
}

/// A validated private key used to authenticate to every node.
///
/// The key material is zeroed on `Drop` and never printed.
#[derive(Clone)]
pub struct SshPrivateKey {
    material: Zeroizing<String>,
    format: KeyFormat,
}

impl SshPrivateKey {
    /// Validates `material` as an unencrypted private key.
    ///
    /// OpenSSH-format keys are parsed with [`ssh_key`]; anything else must be
    /// a PEM key that OpenSSL understands.
    pub fn parse(material: impl Into<String>) -> Result<SshPrivateKey, KeyError> {
        let mut material = Zeroizing::new(material.into());
        if material.trim().is_empty() {
            return Err(KeyError::Empty);
        }
        // ssh refuses key files without a final newline.
        if !material.ends_with('\n') {
            material.push('\n');
        }

        let format = if material.contains("BEGIN OPENSSH PRIVATE KEY") {
            let key = PrivateKey::from_openssh(material.as_bytes())
                .map_err(|e| KeyError::Parse(e.to_string()))?;
            if key.is_encrypted() {
                return Err(KeyError::Encrypted);
            }
            KeyFormat::OpenSsh
        } else {
            if material.contains("ENCRYPTED") {
                return Err(KeyError::Encrypted);
            }
            // An empty passphrase keeps OpenSSL from prompting on a terminal.
            PKey::private_key_from_pem_passphrase(material.as_bytes(), b"")
                .map_err(|e| KeyError::Parse(e.to_string()))?;
            KeyFormat::Pem
        };

        Ok(SshPrivateKey { material, format })
    }

    /// Reads and validates the key stored at `path`.
    pub fn from_file(path: &Path) -> Result<SshPrivateKey, KeyError> {
        let material = Zeroizing::new(std::fs::read_to_string(path)?);
        SshPrivateKey::parse(material.as_str())
    }

    /// Returns the encoding the key was supplied in.
    pub fn format(&self) -> KeyFormat {
        self.format
    }

    /// Writes the key to a fresh private directory so `ssh` can read it.
    ///
    /// The directory and everything in it is removed when the returned
    /// [`StagedKey`] is dropped.
    pub fn stage(&self) -> Result<StagedKey, KeyError> {
        let dir = tempfile::Builder::new().prefix("ha-ssh-").tempdir()?;
        let path = dir.path().join("key");
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        file.write_all(self.material.as_bytes())?;
        file.sync_all()?;
        Ok(StagedKey { dir, path })
    }
}

impl fmt::Debug for SshPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshPrivateKey")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// A private key written to disk for the duration of one session.
#[derive(Debug)]
pub struct StagedKey {
    dir: TempDir,
    path: PathBuf,
}

impl StagedKey {
    /// The path of the key file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The private directory holding the key file.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}
