//! State coordinator: the single owner of every persisted manifest.
//!
//! Each command is a method on [`Coordinator`]. Components never write
//! state themselves; they receive `&Manifest` and hand back outcomes, which
//! are folded in here and persisted atomically before the next one is
//! taken.
//!
//! # Persisted Layout
//!
//! | File | Contents |
//! |------|----------|
//! | `state_dir/scan_index.json` | local manifest |
//! | `state_dir/remote_index.json` | remote-sync manifest |
//! | `state_dir/changes.json` | changeset of the last scan |
//! | `state_dir/caption_cache.json` | captions keyed by image SHA-256 |
//! | `state_dir/sync2rag.lock` | run lock |
//! | `manifest.full_path` | published local manifest |
//! | `manifest.rag_path` | published upload set |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::backends::{Backends, RemoteStore};
use crate::cancel::CancelFlag;
use crate::caption::CaptionCache;
use crate::clear::{clear_dir, remove_file};
use crate::config::Config;
use crate::convert::{apply_outcome, needs_conversion, prune_stale_artifacts, Converter};
use crate::error::bail_config;
use crate::lock::{RunLock, LOCK_FILE};
use crate::manifest::{
    load_manifest, load_remote_manifest, mark_markdown_duplicates, rag_view, read_json, write_json,
};
use crate::models::{Changeset, ConversionStatus, Failure, Manifest, RemoteOperation, Stage};
use crate::progress::{NoProgress, ProgressReporter};
use crate::reconcile;
use crate::scanner;
use crate::summary::RunSummary;

#[derive(Debug, Clone)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub scan_index: PathBuf,
    pub remote_index: PathBuf,
    pub changes: PathBuf,
    pub caption_cache: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            scan_index: dir.join("scan_index.json"),
            remote_index: dir.join("remote_index.json"),
            changes: dir.join("changes.json"),
            caption_cache: dir.join("caption_cache.json"),
        }
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }
}

pub struct Coordinator {
    config: Config,
    paths: StatePaths,
    backends: Backends,
    progress: Box<dyn ProgressReporter>,
    cancel: CancelFlag,
}

impl Coordinator {
    pub fn new(config: Config, backends: Backends) -> Self {
        let paths = StatePaths::new(&config.runtime.state_dir);
        Self {
            config,
            paths,
            backends,
            progress: Box::new(NoProgress),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Scan and report what changed since the last persisted scan. Writes
    /// nothing.
    pub fn changes(&self) -> Result<Changeset> {
        let root = scanner::resolve_root(&self.config)?;
        let previous = load_manifest(&self.paths.scan_index, &root)?;
        let out = scanner::scan(&self.config, previous.as_ref(), self.progress.as_ref())?;
        Ok(out.changeset)
    }

    pub fn scan(&self) -> Result<RunSummary> {
        let _lock = RunLock::acquire(&self.paths.dir)?;
        let mut summary = RunSummary::new("scan");
        let manifest = self.scan_and_persist(&mut summary)?;
        self.publish(&manifest)?;
        Ok(summary)
    }

    /// Scan, convert whatever needs it, then sync.
    pub async fn run(&self, force: bool, manifest_override: Option<&Path>) -> Result<RunSummary> {
        let store = self.require_store()?;
        let _lock = RunLock::acquire(&self.paths.dir)?;
        let mut summary = RunSummary::new("run");
        summary.dry_run = self.config.runtime.dry_run;

        let mut manifest = self.scan_and_persist(&mut summary)?;

        let targets: Vec<_> = manifest
            .entries
            .values()
            .filter(|e| needs_conversion(e, force))
            .cloned()
            .collect();
        info!(targets = targets.len(), force, "conversion start");

        let converter = self.converter();
        let scan_index = self.paths.scan_index.clone();
        converter
            .convert_all(
                targets,
                self.config.runtime.max_workers,
                &self.cancel,
                self.progress.as_ref(),
                |outcome| {
                    match &outcome.result {
                        Ok(converted) => {
                            summary.converted += 1;
                            summary.warnings.extend(
                                converted
                                    .warnings
                                    .iter()
                                    .map(|w| (outcome.path.clone(), w.clone())),
                            );
                        }
                        Err(e) => {
                            summary.conversion_failed += 1;
                            summary
                                .failures
                                .push(Failure::new(Stage::Convert, outcome.path.clone(), e));
                        }
                    }
                    if apply_outcome(&mut manifest, outcome) {
                        write_json(&scan_index, &manifest)?;
                    }
                    Ok(())
                },
            )
            .await?;

        let duplicates = mark_markdown_duplicates(&mut manifest);
        if duplicates > 0 {
            info!(duplicates, "converted paths share markdown with a shorter path");
        }
        write_json(&self.paths.scan_index, &manifest)?;

        if converter.has_captioner() {
            if let Err(e) = converter.save_cache(&self.paths.caption_cache) {
                warn!(error = %format!("{:#}", e), "failed to save caption cache");
            }
        }
        self.publish(&manifest)?;

        if self.cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }

        let local = match manifest_override {
            Some(path) => read_override(path)?,
            None => manifest,
        };
        self.sync_manifest(store.as_ref(), &local, &mut summary)
            .await?;
        Ok(summary)
    }

    /// Reconcile the remote store with the persisted (or given) manifest.
    pub async fn sync(&self, manifest_override: Option<&Path>) -> Result<RunSummary> {
        let store = self.require_store()?;
        let _lock = RunLock::acquire(&self.paths.dir)?;
        let mut summary = RunSummary::new("sync");
        summary.dry_run = self.config.runtime.dry_run;

        let local = match manifest_override {
            Some(path) => read_override(path)?,
            None => {
                let root = scanner::resolve_root(&self.config)?;
                load_manifest(&self.paths.scan_index, &root)?.with_context(|| {
                    format!(
                        "no scan state at {}; run `sync2rag scan` first",
                        self.paths.scan_index.display()
                    )
                })?
            }
        };
        self.sync_manifest(store.as_ref(), &local, &mut summary)
            .await?;
        Ok(summary)
    }

    /// Reset local state. With `all`, first delete every document recorded
    /// in the remote-sync manifest, then remove artifacts and published
    /// manifests too.
    pub async fn clear(&self, all: bool) -> Result<RunSummary> {
        let _lock = RunLock::acquire(&self.paths.dir)?;
        let mut summary = RunSummary::new(if all { "clear --all" } else { "clear" });
        let mut keep = vec![self.paths.lock_file()];

        if all {
            let mut remote = load_remote_manifest(&self.paths.remote_index)?;
            match self.configured_store() {
                Some(store) if !remote.entries.is_empty() => {
                    let operations: Vec<RemoteOperation> = remote
                        .entries
                        .iter()
                        .map(|(path, entry)| RemoteOperation::Delete {
                            path: Some(path.clone()),
                            file_source: entry.file_source.clone(),
                            remote_id: entry.remote_id.clone(),
                        })
                        .collect();
                    info!(count = operations.len(), "deleting remote documents");
                    let remote_index = self.paths.remote_index.clone();
                    let mut report = reconcile::apply(
                        operations,
                        store.as_ref(),
                        &mut remote,
                        &self.cancel,
                        self.progress.as_ref(),
                        |r| write_json(&remote_index, r),
                    )
                    .await?;
                    for failure in report.failures.iter_mut() {
                        failure.stage = Stage::Clear;
                        warn!(path = %failure.path, reason = %failure.reason, "remote delete failed");
                    }
                    summary.record_sync(report);
                    if !remote.entries.is_empty() {
                        // Remaining entries are the only record of what is still remote.
                        keep.push(self.paths.remote_index.clone());
                    }
                }
                None if !remote.entries.is_empty() => {
                    warn!(
                        count = remote.entries.len(),
                        "remote store not configured; remote documents are left in place"
                    );
                }
                _ => {}
            }
        }

        let mut removed = clear_dir(&self.paths.dir, &keep);
        if all {
            removed.extend(clear_dir(&self.config.output.root_dir, &[]));
            removed.extend(remove_file(&self.config.manifest.full_path));
            removed.extend(remove_file(&self.config.manifest.rag_path));
        }
        summary.cleared = removed.len();
        info!(removed = removed.len(), all, "state cleared");
        Ok(summary)
    }

    fn scan_and_persist(&self, summary: &mut RunSummary) -> Result<Manifest> {
        let root = scanner::resolve_root(&self.config)?;
        let previous = load_manifest(&self.paths.scan_index, &root)?;
        let out = scanner::scan(&self.config, previous.as_ref(), self.progress.as_ref())?;

        let mut manifest = out.manifest;
        manifest.generated_at = Some(Utc::now());
        mark_markdown_duplicates(&mut manifest);
        let pruned = prune_stale_artifacts(previous.as_ref(), &manifest);
        if pruned > 0 {
            info!(pruned, "removed stale artifacts");
        }

        write_json(&self.paths.scan_index, &manifest)?;
        write_json(&self.paths.changes, &out.changeset)?;

        summary.record_changes(&out.changeset);
        summary.skipped = manifest.count_status(ConversionStatus::Skipped);
        summary.failures.extend(out.errors);
        Ok(manifest)
    }

    /// Write the published full and RAG manifests.
    fn publish(&self, manifest: &Manifest) -> Result<()> {
        if self.config.manifest.include_image_index {
            write_json(&self.config.manifest.full_path, manifest)?;
        } else {
            let mut stripped = manifest.clone();
            for entry in stripped.entries.values_mut() {
                entry.artifacts.images.clear();
            }
            write_json(&self.config.manifest.full_path, &stripped)?;
        }
        write_json(&self.config.manifest.rag_path, &rag_view(manifest))?;
        Ok(())
    }

    async fn sync_manifest(
        &self,
        store: &dyn RemoteStore,
        local: &Manifest,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let lightrag = &self.config.lightrag;
        let mut remote = load_remote_manifest(&self.paths.remote_index)?;
        if lightrag.wait_inflight {
            self.wait_for_idle(store).await;
        }

        let listing = match store.list(&lightrag.file_source_prefix).await {
            Ok(docs) => Some(docs),
            Err(e) => {
                warn!(error = %e, "remote listing failed; planning from the remote-sync manifest only");
                None
            }
        };
        let delete_orphans =
            lightrag.delete_missing && !lightrag.file_source_prefix.trim_matches('/').is_empty();
        let plan = reconcile::plan(local, &remote, listing.as_deref(), delete_orphans);
        summary.record_plan(&plan);
        info!(
            uploads = plan.upserts(),
            deletes = plan.deletes(),
            skipped_inflight = plan.skipped_inflight.len(),
            held_back = plan.held_back.len(),
            "sync plan"
        );

        if self.config.runtime.dry_run {
            for op in &plan.operations {
                let kind = if op.is_delete() { "delete" } else { "upsert" };
                info!(op = kind, path = op.label(), "dry run");
            }
            return Ok(());
        }

        let remote_index = self.paths.remote_index.clone();
        let report = reconcile::apply(
            plan.operations,
            store,
            &mut remote,
            &self.cancel,
            self.progress.as_ref(),
            |r| write_json(&remote_index, r),
        )
        .await?;
        summary.record_sync(report);
        Ok(())
    }

    /// Poll the store until nothing is in flight, the timeout passes or the
    /// run is cancelled. Whatever is still in flight afterwards is skipped
    /// by the plan.
    async fn wait_for_idle(&self, store: &dyn RemoteStore) {
        let lightrag = &self.config.lightrag;
        let poll = Duration::from_secs(lightrag.inflight_poll_sec);
        let deadline = Instant::now() + Duration::from_secs(lightrag.inflight_timeout_sec);
        loop {
            let inflight = match store.inflight().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "pipeline status unavailable; not waiting");
                    return;
                }
            };
            if inflight == 0 {
                return;
            }
            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                warn!(inflight, "remote pipeline still busy; syncing around in-flight documents");
                return;
            }
            info!(inflight, "waiting for remote pipeline");
            tokio::time::sleep(poll).await;
        }
    }

    fn converter(&self) -> Arc<Converter> {
        let cache = match &self.backends.captioner {
            Some(captioner) => {
                CaptionCache::load(&self.paths.caption_cache, captioner.model(), captioner.prompt())
                    .unwrap_or_else(|e| {
                        warn!(error = %format!("{:#}", e), "caption cache unreadable; starting empty");
                        CaptionCache::default()
                    })
            }
            None => CaptionCache::default(),
        };
        Arc::new(Converter::new(
            &self.config,
            self.backends.converter.clone(),
            self.backends.captioner.clone(),
            cache,
        ))
    }

    fn configured_store(&self) -> Option<Arc<dyn RemoteStore>> {
        if !self.config.lightrag.is_configured() {
            return None;
        }
        self.backends.remote.clone()
    }

    fn require_store(&self) -> Result<Arc<dyn RemoteStore>> {
        self.config.require_remote()?;
        match self.backends.remote.clone() {
            Some(store) => Ok(store),
            None => bail_config!("remote store is not configured"),
        }
    }
}

fn read_override(path: &Path) -> Result<Manifest> {
    match read_json::<Manifest>(path)? {
        Some(mut manifest) => {
            mark_markdown_duplicates(&mut manifest);
            Ok(manifest)
        }
        None => bail_config!("manifest not found: {}", path.display()),
    }
}
