//! On-disk storage for vault envelopes, one JSON file per name.

use std::path::{Path, PathBuf};

use tracing::info;

use super::{VaultEnvelope, VaultError};

/// Directory of vault envelopes, one JSON file per name.
#[derive(Debug, Clone)]
pub struct VaultStore {
    dir: PathBuf,
}

impl VaultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, filename: &str) -> Result<PathBuf, VaultError> {
        let bad = filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains('\0')
            || filename == "."
            || filename.contains("..");
        if bad {
            return Err(VaultError::InvalidName(filename.to_string()));
        }
        Ok(self.dir.join(filename))
    }

    pub fn load(&self, filename: &str) -> Result<VaultEnvelope, VaultError> {
        let path = self.path_for(filename)?;
        let raw = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Write via a temp file in the same directory, then rename over the
    /// target so readers never see a partial envelope.
    pub fn save(&self, filename: &str, envelope: &VaultEnvelope) -> Result<(), VaultError> {
        let path = self.path_for(filename)?;
        std::fs::create_dir_all(&self.dir)?;
        let tmp = self.dir.join(format!(".{filename}.tmp"));
        let json = serde_json::to_vec_pretty(envelope)?;
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        info!("Vault {} saved", path.display());
        Ok(())
    }
}
