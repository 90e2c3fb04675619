//! In-memory journey map with crash-recovery snapshot persistence.
//! The snapshot is a zlib-compressed bincode document, written via a temp
//! file and rename so a crash never leaves a torn file behind.

use crate::models::{Journey, JourneySummary};
use ahash::AHashMap;
use log::warn;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("snapshot decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

pub struct JourneyStore {
    journeys: RwLock<AHashMap<String, Journey>>,
}

impl JourneyStore {
    pub fn new() -> JourneyStore {
        JourneyStore {
            journeys: RwLock::new(AHashMap::new()),
        }
    }

    /// Restores from the last durable snapshot. A missing or corrupt
    /// snapshot starts the store empty and is not fatal.
    pub fn load_or_default(path: &Path) -> JourneyStore {
        match read_snapshot(path) {
            Ok(Some(journeys)) => JourneyStore {
                journeys: RwLock::new(journeys),
            },
            Ok(None) => JourneyStore::new(),
            Err(e) => {
                warn!("Failed to restore journey snapshot from {:?}: {}", path, e);
                JourneyStore::new()
            }
        }
    }

    pub async fn get(&self, journey_ref: &str) -> Option<Journey> {
        self.journeys.read().await.get(journey_ref).cloned()
    }

    pub async fn contains(&self, journey_ref: &str) -> bool {
        self.journeys.read().await.contains_key(journey_ref)
    }

    pub async fn upsert(&self, journey: Journey) {
        self.journeys
            .write()
            .await
            .insert(journey.journey_ref.clone(), journey);
    }

    pub async fn remove(&self, journey_ref: &str) -> bool {
        self.journeys.write().await.remove(journey_ref).is_some()
    }

    pub async fn len(&self) -> usize {
        self.journeys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.journeys.read().await.is_empty()
    }

    /// Runs a read-only closure against one journey.
    pub async fn with_journey<R>(
        &self,
        journey_ref: &str,
        f: impl FnOnce(&Journey) -> R,
    ) -> Option<R> {
        self.journeys.read().await.get(journey_ref).map(f)
    }

    /// Runs a mutating closure against one journey under the exclusive
    /// lock. All field writes of one handler commit together.
    pub async fn with_journey_mut<R>(
        &self,
        journey_ref: &str,
        f: impl FnOnce(&mut Journey) -> R,
    ) -> Option<R> {
        self.journeys.write().await.get_mut(journey_ref).map(f)
    }

    pub async fn map_journeys<R>(&self, mut f: impl FnMut(&Journey) -> R) -> Vec<R> {
        self.journeys.read().await.values().map(&mut f).collect()
    }

    pub async fn summaries(&self) -> Vec<JourneySummary> {
        self.map_journeys(|journey| JourneySummary::from(journey)).await
    }

    pub async fn snapshot_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        let bytes = {
            let guard = self.journeys.read().await;
            crate::bincode_serialize(&*guard)?
        };
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&bytes)?;
        Ok(encoder.finish()?)
    }

    pub async fn restore_bytes(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let journeys = decode_snapshot(bytes)?;
        *self.journeys.write().await = journeys;
        Ok(())
    }

    pub async fn write_snapshot(&self, path: &Path) -> Result<(), SnapshotError> {
        let compressed = self.snapshot_bytes().await?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp_path = path.with_extension("tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&compressed)?;
            writer.flush()?;
        }
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl Default for JourneyStore {
    fn default() -> Self {
        JourneyStore::new()
    }
}

fn decode_snapshot(bytes: &[u8]) -> Result<AHashMap<String, Journey>, SnapshotError> {
    let mut decoder = flate2::read::ZlibDecoder::new(bytes);
    let mut buffer = Vec::new();
    decoder.read_to_end(&mut buffer)?;
    Ok(crate::bincode_deserialize(&buffer)?)
}

fn read_snapshot(path: &Path) -> Result<Option<AHashMap<String, Journey>>, SnapshotError> {
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut compressed = Vec::new();
    reader.read_to_end(&mut compressed)?;
    Ok(Some(decode_snapshot(&compressed)?))
}
