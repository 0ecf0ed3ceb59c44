//! Sync reconciler.
//!
//! [`plan`] compares the local manifest with what was last pushed (the
//! remote-sync manifest) and, optionally, with a live listing of the remote
//! store. [`apply`] executes the resulting operations one at a time and
//! checkpoints the remote-sync manifest after every success, so a crash
//! after K of N operations leaves exactly K recorded.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::backends::{RemoteDoc, RemoteStore};
use crate::cancel::CancelFlag;
use crate::error::ItemError;
use crate::fingerprint::fingerprint_bytes;
use crate::models::{
    ConversionStatus, Failure, Manifest, RemoteEntry, RemoteManifest, RemoteOperation, Stage,
};
use crate::progress::{ProgressEvent, ProgressReporter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Deletes first, then upserts; each group sorted by label.
    pub operations: Vec<RemoteOperation>,
    /// Paths left alone because the remote copy is still being ingested.
    pub skipped_inflight: Vec<String>,
    /// Paths with a remote copy whose local conversion is pending or failed.
    /// Their last pushed version stays remote.
    pub held_back: Vec<String>,
}

impl SyncPlan {
    pub fn upserts(&self) -> usize {
        self.operations.iter().filter(|op| !op.is_delete()).count()
    }

    pub fn deletes(&self) -> usize {
        self.operations.iter().filter(|op| op.is_delete()).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub uploaded: usize,
    pub deleted: usize,
    pub failures: Vec<Failure>,
    /// Operations never attempted because the run was cancelled.
    pub not_attempted: usize,
}

/// Build the operation list.
///
/// - Upsert every converted entry the remote manifest lacks, or holds with a
///   different fingerprint, markdown digest or `file_source`.
/// - Delete remote-manifest entries that vanished locally, became
///   `Skipped`, or now duplicate another path's markdown. A changed
///   `file_source` deletes the old key.
/// - With a `listing`: re-upsert entries missing remotely or reported
///   failed, leave in-flight ones alone, and (if `delete_orphans`) delete
///   documents under the prefix that no local entry accounts for.
pub fn plan(
    local: &Manifest,
    remote: &RemoteManifest,
    listing: Option<&[RemoteDoc]>,
    delete_orphans: bool,
) -> SyncPlan {
    let mut deletes: Vec<RemoteOperation> = Vec::new();
    let mut upserts: Vec<RemoteOperation> = Vec::new();
    let mut skipped_inflight = Vec::new();
    let mut held_back = Vec::new();
    let mut deleted_sources: BTreeSet<String> = BTreeSet::new();

    let listed: Option<HashMap<&str, Vec<&RemoteDoc>>> = listing.map(|docs| {
        let mut map: HashMap<&str, Vec<&RemoteDoc>> = HashMap::new();
        for doc in docs {
            map.entry(doc.file_source.as_str()).or_default().push(doc);
        }
        map
    });
    let in_flight = |file_source: &str| {
        listed
            .as_ref()
            .and_then(|m| m.get(file_source))
            .map(|docs| docs.iter().any(|d| d.is_in_flight()))
            .unwrap_or(false)
    };

    for (path, pushed) in &remote.entries {
        let stale_key = match local.get(path) {
            None => true,
            Some(entry) if entry.status == ConversionStatus::Skipped => true,
            Some(entry) if entry.duplicate_of.is_some() => true,
            Some(entry) if entry.file_source != pushed.file_source => true,
            Some(entry) => {
                if matches!(
                    entry.status,
                    ConversionStatus::Pending | ConversionStatus::Failed
                ) {
                    held_back.push(path.clone());
                }
                false
            }
        };
        if !stale_key {
            continue;
        }
        if in_flight(&pushed.file_source) {
            skipped_inflight.push(path.clone());
            continue;
        }
        if deleted_sources.insert(pushed.file_source.clone()) {
            deletes.push(RemoteOperation::Delete {
                path: Some(path.clone()),
                file_source: pushed.file_source.clone(),
                remote_id: pushed.remote_id.clone(),
            });
        }
    }

    for (path, entry) in &local.entries {
        if !entry.is_syncable() {
            continue;
        }
        let (Some(markdown), Some(markdown_sha256)) = (
            entry.artifacts.markdown.as_ref(),
            entry.artifacts.markdown_sha256.as_ref(),
        ) else {
            continue;
        };
        if in_flight(&entry.file_source) {
            skipped_inflight.push(path.clone());
            continue;
        }

        let pushed = remote.entries.get(path);
        let mut needed = match pushed {
            None => true,
            Some(p) => {
                p.fingerprint != entry.fingerprint
                    || &p.markdown_sha256 != markdown_sha256
                    || p.file_source != entry.file_source
            }
        };
        if let Some(map) = &listed {
            match map.get(entry.file_source.as_str()) {
                None => needed = true,
                Some(docs) if docs.iter().any(|d| d.is_failed()) => needed = true,
                Some(_) => {}
            }
        }
        if needed {
            upserts.push(RemoteOperation::Upsert {
                path: path.clone(),
                file_source: entry.file_source.clone(),
                markdown: markdown.clone(),
                markdown_sha256: markdown_sha256.clone(),
                fingerprint: entry.fingerprint.clone(),
                remote_id: pushed.and_then(|p| p.remote_id.clone()),
            });
        }
    }

    if let (Some(docs), true) = (listing, delete_orphans) {
        let known: BTreeSet<&str> = local
            .entries
            .values()
            .filter(|e| e.status != ConversionStatus::Skipped && e.duplicate_of.is_none())
            .map(|e| e.file_source.as_str())
            .collect();
        for doc in docs {
            if known.contains(doc.file_source.as_str())
                || deleted_sources.contains(&doc.file_source)
            {
                continue;
            }
            if doc.is_in_flight() {
                skipped_inflight.push(doc.file_source.clone());
                continue;
            }
            deleted_sources.insert(doc.file_source.clone());
            deletes.push(RemoteOperation::Delete {
                path: None,
                file_source: doc.file_source.clone(),
                remote_id: Some(doc.id.clone()),
            });
        }
    }

    deletes.sort_by(|a, b| a.label().cmp(b.label()));
    upserts.sort_by(|a, b| a.label().cmp(b.label()));
    skipped_inflight.sort();
    skipped_inflight.dedup();

    let mut operations = deletes;
    operations.extend(upserts);
    SyncPlan {
        operations,
        skipped_inflight,
        held_back,
    }
}

/// Execute `operations` in order. After each success `remote` is updated and
/// handed to `checkpoint`; a checkpoint error aborts the loop since progress
/// could no longer be recorded. Per-operation failures are collected. An
/// upsert whose path just failed to delete its old key is not attempted.
pub async fn apply<F>(
    operations: Vec<RemoteOperation>,
    store: &dyn RemoteStore,
    remote: &mut RemoteManifest,
    cancel: &CancelFlag,
    progress: &dyn ProgressReporter,
    mut checkpoint: F,
) -> Result<SyncReport>
where
    F: FnMut(&RemoteManifest) -> Result<()>,
{
    let mut report = SyncReport::default();
    let total = operations.len() as u64;
    // Paths whose old key could not be deleted. Uploading under the new key
    // would overwrite the only record of the old one.
    let mut stale_key_kept: BTreeSet<String> = BTreeSet::new();

    for (idx, op) in operations.into_iter().enumerate() {
        if cancel.is_cancelled() {
            report.not_attempted = total as usize - idx;
            warn!(remaining = report.not_attempted, "cancelled; remote operations left for the next run");
            break;
        }
        progress.report(ProgressEvent::Syncing {
            n: idx as u64 + 1,
            total,
        });

        let label = op.label().to_string();
        if let RemoteOperation::Upsert { path, .. } = &op {
            if stale_key_kept.contains(path) {
                warn!(path = %label, "old key still stored remotely; upload deferred");
                report.failures.push(Failure::new(
                    Stage::Sync,
                    label,
                    "upload deferred: previous file_source could not be deleted",
                ));
                continue;
            }
        }
        match execute(&op, store).await {
            Ok(Applied::Upserted(entry, path)) => {
                remote.entries.insert(path, entry);
                report.uploaded += 1;
                info!(path = %label, "uploaded");
            }
            Ok(Applied::Deleted) => {
                if let RemoteOperation::Delete {
                    path: Some(path),
                    file_source,
                    ..
                } = &op
                {
                    if remote
                        .entries
                        .get(path)
                        .map(|e| &e.file_source == file_source)
                        .unwrap_or(false)
                    {
                        remote.entries.remove(path);
                    }
                }
                report.deleted += 1;
                info!(path = %label, "deleted");
            }
            Err(e) => {
                if let RemoteOperation::Delete { path: Some(path), .. } = &op {
                    stale_key_kept.insert(path.clone());
                }
                warn!(path = %label, error = %e, retryable = e.is_retryable(), "remote operation failed");
                report.failures.push(Failure::new(Stage::Sync, label, e));
                continue;
            }
        }

        remote.updated_at = Some(Utc::now());
        checkpoint(remote)?;
    }

    Ok(report)
}

enum Applied {
    Upserted(RemoteEntry, String),
    Deleted,
}

async fn execute(op: &RemoteOperation, store: &dyn RemoteStore) -> Result<Applied, ItemError> {
    match op {
        RemoteOperation::Upsert {
            path,
            file_source,
            markdown,
            markdown_sha256,
            fingerprint,
            ..
        } => {
            let text = tokio::fs::read_to_string(markdown)
                .await
                .map_err(|e| ItemError::io(markdown.display(), e))?;
            if fingerprint_bytes(text.as_bytes()).as_str() != markdown_sha256 {
                return Err(ItemError::io(
                    markdown.display(),
                    "markdown changed since conversion",
                ));
            }
            let remote_id = store.upsert(file_source, &text).await?;
            Ok(Applied::Upserted(
                RemoteEntry {
                    file_source: file_source.clone(),
                    fingerprint: fingerprint.clone(),
                    markdown_sha256: markdown_sha256.clone(),
                    remote_id: Some(remote_id),
                    synced_at: Utc::now(),
                },
                path.clone(),
            ))
        }
        RemoteOperation::Delete {
            file_source,
            remote_id,
            ..
        } => {
            store.delete(file_source, remote_id.as_deref()).await?;
            Ok(Applied::Deleted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Artifacts, FileKind, ManifestEntry};
    use std::path::PathBuf;

    fn entry(path: &str, content: &str, status: ConversionStatus) -> ManifestEntry {
        ManifestEntry {
            rel_path: path.into(),
            abs_path: PathBuf::from("/in").join(path),
            ext: ".pdf".into(),
            kind: FileKind::Convert,
            size_bytes: 1,
            mtime: 0,
            fingerprint: fingerprint_bytes(content.as_bytes()),
            last_seen: Utc::now(),
            status,
            error: None,
            warnings: vec![],
            duplicate_of: None,
            artifacts: if status == ConversionStatus::Converted {
                Artifacts {
                    markdown: Some(PathBuf::from("/out").join(format!("{}.md", path))),
                    markdown_sha256: Some(format!("md-{}", content)),
                    ..Artifacts::default()
                }
            } else {
                Artifacts::default()
            },
            file_source: format!("kb/{}", path),
        }
    }

    fn pushed(path: &str, content: &str) -> RemoteEntry {
        RemoteEntry {
            file_source: format!("kb/{}", path),
            fingerprint: fingerprint_bytes(content.as_bytes()),
            markdown_sha256: format!("md-{}", content),
            remote_id: Some(format!("id-{}", path)),
            synced_at: Utc::now(),
        }
    }

    fn local(entries: Vec<ManifestEntry>) -> Manifest {
        let mut m = Manifest::new(PathBuf::from("/in"));
        for e in entries {
            m.entries.insert(e.rel_path.clone(), e);
        }
        m
    }

    fn remote(entries: Vec<(&str, &str)>) -> RemoteManifest {
        let mut r = RemoteManifest::default();
        for (path, content) in entries {
            r.entries.insert(path.into(), pushed(path, content));
        }
        r
    }

    fn labels(plan: &SyncPlan) -> Vec<(bool, String)> {
        plan.operations
            .iter()
            .map(|op| (op.is_delete(), op.label().to_string()))
            .collect()
    }

    #[test]
    fn upserts_new_and_changed_deletes_removed() {
        let l = local(vec![
            entry("a.pdf", "a2", ConversionStatus::Converted),
            entry("b.pdf", "b", ConversionStatus::Converted),
            entry("c.pdf", "c", ConversionStatus::Converted),
        ]);
        let r = remote(vec![("a.pdf", "a1"), ("b.pdf", "b"), ("gone.pdf", "g")]);
        let p = plan(&l, &r, None, true);
        assert_eq!(
            labels(&p),
            vec![
                (true, "gone.pdf".to_string()),
                (false, "a.pdf".to_string()),
                (false, "c.pdf".to_string()),
            ]
        );
        match &p.operations[1] {
            RemoteOperation::Upsert { remote_id, .. } => {
                assert_eq!(remote_id.as_deref(), Some("id-a.pdf"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn failed_and_pending_keep_last_known_good() {
        let l = local(vec![
            entry("a.pdf", "a2", ConversionStatus::Failed),
            entry("b.pdf", "b2", ConversionStatus::Pending),
        ]);
        let r = remote(vec![("a.pdf", "a1"), ("b.pdf", "b1")]);
        let p = plan(&l, &r, None, true);
        assert!(p.operations.is_empty());
        assert_eq!(p.held_back, vec!["a.pdf", "b.pdf"]);
    }

    #[test]
    fn skipped_entries_are_deleted() {
        let l = local(vec![entry("a.pdf", "a", ConversionStatus::Skipped)]);
        let r = remote(vec![("a.pdf", "a")]);
        let p = plan(&l, &r, None, true);
        assert_eq!(labels(&p), vec![(true, "a.pdf".to_string())]);
    }

    #[test]
    fn changed_file_source_deletes_old_key_first() {
        let mut e = entry("a.pdf", "a", ConversionStatus::Converted);
        e.file_source = "kb2/a.pdf".into();
        let l = local(vec![e]);
        let r = remote(vec![("a.pdf", "a")]);
        let p = plan(&l, &r, None, true);
        assert_eq!(p.operations.len(), 2);
        assert_eq!(p.operations[0].file_source(), "kb/a.pdf");
        assert!(p.operations[0].is_delete());
        assert_eq!(p.operations[1].file_source(), "kb2/a.pdf");
    }

    #[test]
    fn listing_drives_orphans_failures_and_inflight() {
        let l = local(vec![
            entry("a.pdf", "a", ConversionStatus::Converted),
            entry("b.pdf", "b", ConversionStatus::Converted),
            entry("c.pdf", "c", ConversionStatus::Converted),
            entry("d.pdf", "d", ConversionStatus::Converted),
        ]);
        let r = remote(vec![("a.pdf", "a"), ("b.pdf", "b"), ("c.pdf", "c"), ("d.pdf", "d")]);
        let doc = |fs: &str, status: &str| RemoteDoc {
            id: format!("doc-{}", fs),
            file_source: fs.into(),
            status: status.into(),
        };
        let listing = vec![
            doc("kb/a.pdf", "processed"),
            doc("kb/b.pdf", "failed"),
            doc("kb/c.pdf", "processing"),
            // d.pdf missing remotely
            doc("kb/orphan.pdf", "processed"),
            doc("kb/busy-orphan.pdf", "pending"),
        ];
        let p = plan(&l, &r, Some(&listing), true);
        assert_eq!(
            labels(&p),
            vec![
                (true, "kb/orphan.pdf".to_string()),
                (false, "b.pdf".to_string()),
                (false, "d.pdf".to_string()),
            ]
        );
        assert_eq!(p.skipped_inflight, vec!["c.pdf", "kb/busy-orphan.pdf"]);

        let without_orphans = plan(&l, &r, Some(&listing), false);
        assert_eq!(without_orphans.deletes(), 0);
        assert_eq!(without_orphans.upserts(), 2);
    }

    #[test]
    fn converged_state_plans_nothing() {
        let l = local(vec![entry("a.pdf", "a", ConversionStatus::Converted)]);
        let r = remote(vec![("a.pdf", "a")]);
        assert!(plan(&l, &r, None, true).operations.is_empty());
    }
}
