//! Content-addressed model artifact store: one binary artifact and one
//! JSON metadata document per content hash, written atomically via temp
//! file and rename.

use super::TrainerError;
use crate::models::ModelMetadata;
use log::warn;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> ArtifactStore {
        ArtifactStore { root: root.into() }
    }

    pub fn model_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{}.bin", hash))
    }

    pub fn metadata_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{}.json", hash))
    }

    pub fn write(
        &self,
        hash: &str,
        model_bytes: &[u8],
        metadata: &ModelMetadata,
    ) -> Result<(), TrainerError> {
        std::fs::create_dir_all(&self.root)?;
        write_atomically(&self.model_path(hash), model_bytes)?;
        write_atomically(&self.metadata_path(hash), &serde_json::to_vec(metadata)?)?;
        Ok(())
    }

    /// Returns the metadata stored under a content hash, or `None` when the
    /// artifact has not been trained yet. A corrupt metadata document counts
    /// as a miss.
    pub fn load_metadata(&self, hash: &str) -> Option<ModelMetadata> {
        let path = self.metadata_path(hash);
        if !path.exists() {
            return None;
        }

        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    warn!("Corrupt model metadata at {:?}: {}", path, e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read model metadata at {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn load_model_bytes(&self, hash: &str) -> Option<Vec<u8>> {
        let path = self.model_path(hash);
        if !path.exists() {
            return None;
        }

        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to read model artifact at {:?}: {}", path, e);
                None
            }
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), TrainerError> {
    let temp_path = path.with_extension("tmp");
    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
    }
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
