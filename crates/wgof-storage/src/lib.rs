//! Historical store files: loading, backups, atomic replace and archives.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;
use wgof_core::{MergeStats, Posting};

pub const CRATE_NAME: &str = "wgof-storage";

pub const CANONICAL_FILE: &str = "historical_positions.json";
pub const VERIFIED_FILE: &str = "verified_graduate_assistantships.json";
pub const ARCHIVE_DIR: &str = "archive";
pub const MANIFEST_FILE: &str = "manifest.json";

const ARCHIVE_PREFIX: &str = "merged_positions_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed JSON in {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} is neither a record array nor an object with `positions` or `jobs`", .path.display())]
    Shape { path: PathBuf },
    #[error("serializing store document: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("replacing {} with {}: {}", .to.display(), .from.display(), .source)]
    Replace {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub merge_timestamp: DateTime<Utc>,
    pub total_positions: usize,
    pub merge_stats: MergeStats,
    #[serde(default)]
    pub data_sources: Vec<String>,
    #[serde(default)]
    pub run_id: Option<Uuid>,
}

/// On-disk shape of the canonical store and every archive copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDocument {
    pub metadata: StoreMetadata,
    pub positions: Vec<Posting>,
}

/// Raw records of a document, before per-record validation.
#[derive(Debug, Clone, Default)]
pub struct LoadedDocument {
    pub records: Vec<JsonValue>,
    pub metadata: Option<JsonValue>,
}

pub fn parse_document(path: &Path, bytes: &[u8]) -> Result<LoadedDocument, StoreError> {
    let value: JsonValue = serde_json::from_slice(bytes).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    match value {
        JsonValue::Array(records) => Ok(LoadedDocument {
            records,
            metadata: None,
        }),
        JsonValue::Object(mut map) => {
            let records = match map.remove("positions").or_else(|| map.remove("jobs")) {
                Some(JsonValue::Array(records)) => records,
                _ => return Err(StoreError::Shape { path: path.to_path_buf() }),
            };
            Ok(LoadedDocument {
                records,
                metadata: map.remove("metadata"),
            })
        }
        _ => Err(StoreError::Shape { path: path.to_path_buf() }),
    }
}

/// `None` when the file does not exist.
pub fn load_document(path: &Path) -> Result<Option<LoadedDocument>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    parse_document(path, &bytes).map(Some)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// A fully written sibling temp file waiting to be renamed over its target.
/// Dropping it uncommitted removes the temp file and leaves the target alone.
#[derive(Debug)]
pub struct StagedWrite {
    temp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub fn stage(target: &Path, bytes: &[u8]) -> Result<Self, StoreError> {
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        // Owns the temp path from here on so every early return cleans up.
        let staged = Self {
            temp_path,
            target: target.to_path_buf(),
            committed: false,
        };
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staged.temp_path)
            .map_err(|err| StoreError::io(&staged.temp_path, err))?;
        file.write_all(bytes)
            .map_err(|err| StoreError::io(&staged.temp_path, err))?;
        file.flush()
            .map_err(|err| StoreError::io(&staged.temp_path, err))?;
        file.sync_all()
            .map_err(|err| StoreError::io(&staged.temp_path, err))?;
        drop(file);
        debug!(temp = %staged.temp_path.display(), target = %staged.target.display(), "staged write");
        Ok(staged)
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename the temp file over the target. This is the only step that makes
    /// the new content visible.
    pub fn commit(mut self) -> Result<PathBuf, StoreError> {
        match fs::rename(&self.temp_path, &self.target) {
            Ok(()) => {
                self.committed = true;
                Ok(self.target.clone())
            }
            Err(source) => Err(StoreError::Replace {
                from: self.temp_path.clone(),
                to: self.target.clone(),
                source,
            }),
        }
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
    StagedWrite::stage(target, bytes)?.commit()
}

pub fn write_json_atomic<T: Serialize>(target: &Path, value: &T) -> Result<PathBuf, StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(StoreError::Serialize)?;
    write_atomic(target, &bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifestFile {
    pub name: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub created_at: DateTime<Utc>,
    pub files: Vec<BackupManifestFile>,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub dir: PathBuf,
    pub manifest: BackupManifest,
}

/// Directory layout of one historical store.
#[derive(Debug, Clone)]
pub struct HistoricalStore {
    root: PathBuf,
}

impl HistoricalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn canonical_path(&self) -> PathBuf {
        self.root.join(CANONICAL_FILE)
    }

    pub fn verified_path(&self) -> PathBuf {
        self.root.join(VERIFIED_FILE)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    pub fn backup_dir(&self, at: DateTime<Utc>) -> PathBuf {
        self.archive_dir().join(format!("backup_{}", stamp(at)))
    }

    pub fn archive_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.archive_dir()
            .join(format!("{ARCHIVE_PREFIX}{}.json", stamp(at)))
    }

    pub fn load_canonical(&self) -> Result<Option<LoadedDocument>, StoreError> {
        load_document(&self.canonical_path())
    }

    pub fn load_verified(&self) -> Result<Option<LoadedDocument>, StoreError> {
        load_document(&self.verified_path())
    }

    /// Copy the existing store files into `archive/backup_<stamp>/` with a
    /// checksum manifest. `None` when there is nothing to back up yet.
    pub fn backup(&self, at: DateTime<Utc>) -> Result<Option<BackupReport>, StoreError> {
        let sources: Vec<PathBuf> = [self.canonical_path(), self.verified_path()]
            .into_iter()
            .filter(|path| path.is_file())
            .collect();
        if sources.is_empty() {
            return Ok(None);
        }

        let dir = self.backup_dir(at);
        fs::create_dir_all(&dir).map_err(|err| StoreError::io(&dir, err))?;
        let mut files = Vec::with_capacity(sources.len());
        for source in &sources {
            let bytes = fs::read(source).map_err(|err| StoreError::io(source, err))?;
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            write_atomic(&dir.join(&name), &bytes)?;
            files.push(BackupManifestFile {
                name,
                sha256: sha256_hex(&bytes),
                bytes: bytes.len() as u64,
            });
        }
        let manifest = BackupManifest {
            created_at: at,
            files,
        };
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)?;
        info!(dir = %dir.display(), files = manifest.files.len(), "backed up historical store");
        Ok(Some(BackupReport { dir, manifest }))
    }

    pub fn stage_canonical(&self, document: &StoreDocument) -> Result<StagedWrite, StoreError> {
        let bytes = serde_json::to_vec_pretty(document).map_err(StoreError::Serialize)?;
        StagedWrite::stage(&self.canonical_path(), &bytes)
    }

    pub fn write_archive(&self, document: &StoreDocument, at: DateTime<Utc>) -> Result<PathBuf, StoreError> {
        write_json_atomic(&self.archive_path(at), document)
    }

    /// Archived merge outputs, oldest first.
    pub fn list_archives(&self) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.archive_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&dir, err)),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| StoreError::io(&dir, err))?.path();
            let is_archive = path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(ARCHIVE_PREFIX) && n.ends_with(".json"));
            if is_archive {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[derive(Debug, Deserialize)]
struct MetadataOnly {
    metadata: StoreMetadata,
}

pub fn read_metadata(path: &Path) -> Result<StoreMetadata, StoreError> {
    let bytes = fs::read(path).map_err(|err| StoreError::io(path, err))?;
    let doc: MetadataOnly = serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(doc.metadata)
}
