//! `ModelStore`: content-addressed storage of model blobs and round
//! artifacts on disk.
//!
//! The persisted layout mirrors spec §6:
//! ```text
//! models/global/<modelKind>/aggregated.<version>.bin
//! rounds/<roundId>/round_info.json
//! rounds/<roundId>/global_model/{model.bin,aggregated.bin}
//! rounds/<roundId>/client_models/<clientId>.bin
//! rounds/<roundId>/metrics.json
//! keys/...
//! ```
//! All blobs additionally live once, content-addressed, under `blobs/<hash>.bin`;
//! the per-round paths are hard links into that store so identical content
//! never occupies disk twice (spec invariant: "identical contents collapse
//! to a single ref").
pub mod error;

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;

use crate::{crypto::CryptoKit, db::error::StoreError};

pub type StoreResult<T> = Result<T, StoreError>;

/// The kind of a stored model blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlobKind {
    GlobalInitial,
    GlobalAggregated,
    ClientUpload,
}

/// Content-addressed, on-disk storage for model blobs and round artifacts.
#[derive(Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn blob_path(&self, content_ref: &str) -> PathBuf {
        self.blobs_dir().join(format!("{content_ref}.bin"))
    }

    fn rounds_dir(&self) -> PathBuf {
        self.root.join("rounds")
    }

    fn round_dir(&self, round_id: &str) -> PathBuf {
        self.rounds_dir().join(round_id)
    }

    fn global_model_dir(&self, model_kind: &str) -> PathBuf {
        self.root.join("models").join("global").join(model_kind)
    }

    /// Writes `bytes` content-addressed under `blobs/`, atomically, and
    /// returns its SHA-256 hex ref. A second write of identical content is
    /// a no-op and returns the same ref.
    pub async fn put_blob(&self, bytes: &[u8]) -> StoreResult<String> {
        let content_ref = CryptoKit::hash(bytes);
        let path = self.blob_path(&content_ref);
        if !fs::try_exists(&path).await? {
            fs::create_dir_all(self.blobs_dir()).await?;
            write_atomic(&path, bytes).await?;
        }
        Ok(content_ref)
    }

    /// Reads a blob previously written via [`Self::put_blob`].
    pub async fn get_blob(&self, content_ref: &str) -> StoreResult<Vec<u8>> {
        let path = self.blob_path(content_ref);
        fs::read(&path)
            .await
            .map_err(|_| StoreError::NotFound(content_ref.to_string()))
    }

    /// Creates `rounds/<roundId>/{client_models,global_model}/` for a new round.
    pub async fn open_round_scope(&self, round_id: &str) -> StoreResult<RoundScope<'_>> {
        let dir = self.round_dir(round_id);
        fs::create_dir_all(dir.join("client_models")).await?;
        fs::create_dir_all(dir.join("global_model")).await?;
        Ok(RoundScope {
            store: self,
            round_id: round_id.to_string(),
        })
    }

    /// Atomically snapshots a round record as `round_info.json`. Readers
    /// never observe a torn write.
    pub async fn snapshot_round<T: Serialize>(&self, round_id: &str, record: &T) -> StoreResult<()> {
        let dir = self.round_dir(round_id);
        fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        write_atomic(&dir.join("round_info.json"), &bytes).await
    }

    /// Loads a previously snapshotted round record, if any.
    pub async fn load_round_snapshot<T: DeserializeOwned>(
        &self,
        round_id: &str,
    ) -> StoreResult<Option<T>> {
        let path = self.round_dir(round_id).join("round_info.json");
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        let record = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(Some(record))
    }

    /// Writes the round's aggregation/evaluation metrics.
    pub async fn write_metrics<T: Serialize>(&self, round_id: &str, metrics: &T) -> StoreResult<()> {
        let dir = self.round_dir(round_id);
        fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(metrics).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        write_atomic(&dir.join("metrics.json"), &bytes).await
    }

    /// Publishes a new global-model version for `model_kind`.
    pub async fn publish_global_model(
        &self,
        model_kind: &str,
        version: u32,
        bytes: &[u8],
    ) -> StoreResult<PathBuf> {
        let dir = self.global_model_dir(model_kind);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("aggregated.{version}.bin"));
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    /// Reads the latest (or a specific) published global-model version.
    pub async fn read_global_model(
        &self,
        model_kind: &str,
        version: Option<u32>,
    ) -> StoreResult<Option<(u32, Vec<u8>)>> {
        let dir = self.global_model_dir(model_kind);
        if !fs::try_exists(&dir).await? {
            return Ok(None);
        }
        let target_version = match version {
            Some(v) => Some(v),
            None => latest_version(&dir).await?,
        };
        let Some(target_version) = target_version else {
            return Ok(None);
        };
        let path = dir.join(format!("aggregated.{target_version}.bin"));
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some((target_version, bytes))),
            Err(_) => Ok(None),
        }
    }

    /// Removes all artifacts of a round. Refuses unless the round is
    /// terminal, as asserted by the caller-supplied `is_terminal`.
    pub async fn purge_round(&self, round_id: &str, is_terminal: bool) -> StoreResult<()> {
        if !is_terminal {
            return Err(StoreError::NotTerminal(round_id.to_string()));
        }
        let dir = self.round_dir(round_id);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

async fn latest_version(dir: &Path) -> StoreResult<Option<u32>> {
    let mut entries = fs::read_dir(dir).await?;
    let mut best: Option<u32> = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name
            .strip_prefix("aggregated.")
            .and_then(|r| r.strip_suffix(".bin"))
        {
            if let Ok(v) = rest.parse::<u32>() {
                best = Some(best.map_or(v, |b: u32| b.max(v)));
            }
        }
    }
    Ok(best)
}

/// A handle into the `rounds/<roundId>/` directory tree, exposing helpers
/// for the round's global and aggregated model paths.
pub struct RoundScope<'a> {
    store: &'a ModelStore,
    round_id: String,
}

impl<'a> RoundScope<'a> {
    /// Writes the round's initial global blob, content-addressing it and
    /// linking it into `global_model/model.bin`.
    pub async fn write_global_model(&self, bytes: &[u8]) -> StoreResult<String> {
        let content_ref = self.store.put_blob(bytes).await?;
        let dest = self
            .store
            .round_dir(&self.round_id)
            .join("global_model")
            .join("model.bin");
        link_or_copy(&self.store.blob_path(&content_ref), &dest).await?;
        Ok(content_ref)
    }

    /// Writes the round's aggregated output blob.
    pub async fn write_aggregated_model(&self, bytes: &[u8]) -> StoreResult<String> {
        let content_ref = self.store.put_blob(bytes).await?;
        let dest = self
            .store
            .round_dir(&self.round_id)
            .join("global_model")
            .join("aggregated.bin");
        link_or_copy(&self.store.blob_path(&content_ref), &dest).await?;
        Ok(content_ref)
    }

    /// Stores one client's upload, content-addressed and linked into
    /// `client_models/<clientId>.bin`.
    pub async fn write_client_upload(&self, client_id: &str, bytes: &[u8]) -> StoreResult<String> {
        let content_ref = self.store.put_blob(bytes).await?;
        let dest = self
            .store
            .round_dir(&self.round_id)
            .join("client_models")
            .join(format!("{client_id}.bin"));
        link_or_copy(&self.store.blob_path(&content_ref), &dest).await?;
        Ok(content_ref)
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }
}

async fn link_or_copy(src: &Path, dest: &Path) -> StoreResult<()> {
    if fs::try_exists(dest).await? {
        fs::remove_file(dest).await?;
    }
    if fs::hard_link(src, dest).await.is_err() {
        fs::copy(src, dest).await?;
    }
    Ok(())
}

/// Write-temp-then-rename: readers never observe a partially written file.
async fn write_atomic(dest: &Path, bytes: &[u8]) -> StoreResult<()> {
    let tmp = dest.with_extension(format!(
        "{}.tmp",
        dest.extension().and_then(|e| e.to_str()).unwrap_or("part")
    ));
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, dest).await?;
    Ok(())
}
