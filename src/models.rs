//! Core data models: source files, manifests, changesets and remote
//! operations.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Schema marker written into every persisted manifest.
pub const MANIFEST_VERSION: u32 = 1;

/// How a source file becomes markdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Sent to the conversion backend.
    Convert,
    /// Already text; copied into the markdown tree.
    Passthrough,
}

/// One discoverable input document, as seen by a single scan.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub ext: String,
    pub size_bytes: u64,
    pub mtime: i64,
    pub fingerprint: Fingerprint,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Pending,
    Converted,
    Failed,
    /// Never converted: too large, or a duplicate of another path.
    Skipped,
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversionStatus::Pending => "pending",
            ConversionStatus::Converted => "converted",
            ConversionStatus::Failed => "failed",
            ConversionStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// An image extracted from a converted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub figure_id: Option<String>,
    pub path: PathBuf,
    pub public_url: String,
    pub sha256: String,
    pub caption: Option<String>,
    pub title: Option<String>,
}

/// Files produced for one source document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    pub markdown: Option<PathBuf>,
    pub markdown_sha256: Option<String>,
    pub markdown_public_url: Option<String>,
    pub docling_json: Option<PathBuf>,
    pub docling_zip: Option<PathBuf>,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
}

impl Artifacts {
    /// Every file this record points at.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = [&self.markdown, &self.docling_json, &self.docling_zip]
            .into_iter()
            .flatten()
            .cloned()
            .collect();
        out.extend(self.images.iter().map(|img| img.path.clone()));
        out
    }
}

/// Persisted record of one known source path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub ext: String,
    pub kind: FileKind,
    pub size_bytes: u64,
    pub mtime: i64,
    pub fingerprint: Fingerprint,
    pub last_seen: DateTime<Utc>,
    pub status: ConversionStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Canonical path when this one is a skipped duplicate source, or a
    /// converted entry whose markdown matches a shorter path's.
    #[serde(default)]
    pub duplicate_of: Option<String>,
    #[serde(default)]
    pub artifacts: Artifacts,
    /// Stable path-derived key under which the document is stored remotely.
    pub file_source: String,
}

impl ManifestEntry {
    pub fn from_source(file: &SourceFile, file_source: String, seen: DateTime<Utc>) -> Self {
        Self {
            rel_path: file.rel_path.clone(),
            abs_path: file.abs_path.clone(),
            ext: file.ext.clone(),
            kind: file.kind,
            size_bytes: file.size_bytes,
            mtime: file.mtime,
            fingerprint: file.fingerprint.clone(),
            last_seen: seen,
            status: ConversionStatus::Pending,
            error: None,
            warnings: Vec::new(),
            duplicate_of: None,
            artifacts: Artifacts::default(),
            file_source,
        }
    }

    /// Back to `Pending`, forgetting every artifact reference.
    pub fn reset_conversion(&mut self) {
        self.status = ConversionStatus::Pending;
        self.error = None;
        self.warnings.clear();
        self.duplicate_of = None;
        self.artifacts = Artifacts::default();
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.reset_conversion();
        self.status = ConversionStatus::Skipped;
        self.error = Some(reason.into());
    }

    /// Converted with a markdown artifact whose digest is known, and not a
    /// copy of another path's markdown.
    pub fn is_syncable(&self) -> bool {
        self.status == ConversionStatus::Converted
            && self.duplicate_of.is_none()
            && self.artifacts.markdown.is_some()
            && self.artifacts.markdown_sha256.is_some()
    }
}

/// Path-keyed snapshot of the source tree plus conversion state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub root_dir: PathBuf,
    pub generated_at: Option<DateTime<Utc>>,
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new(root_dir: PathBuf) -> Self {
        Self {
            version: MANIFEST_VERSION,
            root_dir,
            generated_at: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn count_status(&self, status: ConversionStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }
}

/// Last-known-pushed state of one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub file_source: String,
    pub fingerprint: Fingerprint,
    pub markdown_sha256: String,
    pub remote_id: Option<String>,
    pub synced_at: DateTime<Utc>,
}

/// What the remote store is believed to contain, keyed by source path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteManifest {
    pub version: u32,
    pub updated_at: Option<DateTime<Utc>>,
    pub entries: BTreeMap<String, RemoteEntry>,
}

impl Default for RemoteManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            updated_at: None,
            entries: BTreeMap::new(),
        }
    }
}

/// Path classification between two manifests. All vectors are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Whether a previous manifest existed.
    pub has_state: bool,
}

impl Changeset {
    /// No added, modified or removed paths.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len() + self.unchanged.len()
    }
}

/// A unit of work for the remote store. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOperation {
    Upsert {
        path: String,
        file_source: String,
        markdown: PathBuf,
        markdown_sha256: String,
        fingerprint: Fingerprint,
        remote_id: Option<String>,
    },
    /// `path` is `None` for remote orphans that no manifest knows about.
    Delete {
        path: Option<String>,
        file_source: String,
        remote_id: Option<String>,
    },
}

impl RemoteOperation {
    pub fn file_source(&self) -> &str {
        match self {
            RemoteOperation::Upsert { file_source, .. } => file_source,
            RemoteOperation::Delete { file_source, .. } => file_source,
        }
    }

    /// Label used in summaries: the source path, or the remote key for orphans.
    pub fn label(&self) -> &str {
        match self {
            RemoteOperation::Upsert { path, .. } => path,
            RemoteOperation::Delete {
                path: Some(path), ..
            } => path,
            RemoteOperation::Delete { file_source, .. } => file_source,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RemoteOperation::Delete { .. })
    }
}

/// Pipeline stage a failure or warning belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scan,
    Convert,
    Sync,
    Clear,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Scan => "scan",
            Stage::Convert => "convert",
            Stage::Sync => "sync",
            Stage::Clear => "clear",
        };
        f.write_str(s)
    }
}

/// A path plus the reason it did not make it through a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub stage: Stage,
    pub path: String,
    pub reason: String,
}

impl Failure {
    pub fn new(stage: Stage, path: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            stage,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
