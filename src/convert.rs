//! Conversion driver.
//!
//! Turns pending manifest entries into markdown artifacts. Passthrough files
//! are copied; everything else goes through the [`ConversionBackend`], whose
//! result (inline markdown or a ZIP bundle) is unpacked, captioned and
//! rewritten here.
//!
//! Conversions run on a bounded [`JoinSet`]. Outcomes are handed one at a
//! time to a caller-supplied callback, which is the only place the manifest
//! is mutated.

use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backends::{CaptionBackend, ConversionBackend, ConversionOutput, ConversionPayload};
use crate::caption::{fallback_title, is_bad_caption, mime_for_ext, normalize_caption, CaptionCache};
use crate::cancel::CancelFlag;
use crate::config::{Config, OutputConfig};
use crate::error::ItemError;
use crate::fingerprint::{fingerprint_bytes, fingerprint_file, Fingerprint};
use crate::manifest::atomic_write;
use crate::markdown::{self, ImageLink};
use crate::models::{Artifacts, ConversionStatus, FileKind, ImageRecord, Manifest, ManifestEntry};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::scanner::normalize_rel_path;

const IMAGE_EXTS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "gif", "bmp", "webp"];

/// OCR complaints that do not make a conversion unusable.
const NONFATAL_ERRORS: &[&str] = &["osd failed", "too few characters", "invalid resolution"];

/// Where artifacts for a source path land, and how they are addressed publicly.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub root: PathBuf,
    pub markdown_dir: PathBuf,
    pub json_dir: PathBuf,
    pub zip_dir: PathBuf,
    pub images_dir: PathBuf,
    pub keep_zip: bool,
    pub public_base_url: String,
    pub public_path_prefix: String,
    pub rewrite_docling_image_links: bool,
    pub rewrite_passthrough_md: bool,
    pub normalize_markdown: bool,
}

impl OutputLayout {
    pub fn from_config(output: &OutputConfig) -> Self {
        Self {
            root: output.root_dir.clone(),
            markdown_dir: output.markdown_dir(),
            json_dir: output.docling_json_dir(),
            zip_dir: output.docling_zip_dir(),
            images_dir: output.images_dir(),
            keep_zip: output.keep_zip,
            public_base_url: output.public_base_url.clone(),
            public_path_prefix: output.public_path_prefix.clone(),
            rewrite_docling_image_links: output.rewrite_docling_image_links,
            rewrite_passthrough_md: output.rewrite_passthrough_md,
            normalize_markdown: output.normalize_markdown,
        }
    }

    pub fn markdown_path(&self, rel: &str, ext: &str) -> PathBuf {
        self.markdown_dir.join(markdown_rel_path(rel, ext))
    }

    pub fn json_path(&self, rel: &str) -> PathBuf {
        self.json_dir.join(format!("{}.json", rel))
    }

    pub fn zip_path(&self, rel: &str) -> PathBuf {
        self.zip_dir.join(format!("{}.zip", rel))
    }

    /// Directory holding every image extracted for one source path.
    pub fn images_root(&self, rel: &str) -> PathBuf {
        self.images_dir.join(rel)
    }

    pub fn public_url(&self, path: &Path) -> String {
        markdown::public_url_for(
            path,
            &self.root,
            &self.public_base_url,
            &self.public_path_prefix,
        )
    }
}

/// `<rel>.md`, or `<rel>` itself for markdown sources, so that `a.pdf` and
/// `a.docx` never share an output file. `a.pdf` and a markdown source named
/// `a.pdf.md` still do; the scanner skips one of them.
pub fn markdown_rel_path(rel: &str, ext: &str) -> String {
    if ext == ".md" {
        rel.to_string()
    } else {
        format!("{}.md", rel)
    }
}

/// Whether an entry should be (re)converted this run. A converted entry
/// whose markdown was deleted or edited on disk is redone.
pub fn needs_conversion(entry: &ManifestEntry, force: bool) -> bool {
    match entry.status {
        ConversionStatus::Pending | ConversionStatus::Failed => true,
        ConversionStatus::Skipped => false,
        ConversionStatus::Converted => force || !markdown_intact(entry),
    }
}

fn markdown_intact(entry: &ManifestEntry) -> bool {
    let (Some(path), Some(expected)) = (
        entry.artifacts.markdown.as_deref(),
        entry.artifacts.markdown_sha256.as_deref(),
    ) else {
        return false;
    };
    match fingerprint_file(path) {
        Ok(actual) => actual.as_str() == expected,
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct Converted {
    pub artifacts: Artifacts,
    pub warnings: Vec<String>,
}

/// Result of converting one entry, tagged with the fingerprint it was
/// computed for.
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub path: String,
    pub fingerprint: Fingerprint,
    pub result: Result<Converted, ItemError>,
}

/// Fold one outcome into the manifest. Returns `false` when the entry has
/// since disappeared or changed content.
pub fn apply_outcome(manifest: &mut Manifest, outcome: ConversionOutcome) -> bool {
    let Some(entry) = manifest.entries.get_mut(&outcome.path) else {
        return false;
    };
    if entry.fingerprint != outcome.fingerprint {
        return false;
    }
    match outcome.result {
        Ok(converted) => {
            entry.status = ConversionStatus::Converted;
            entry.error = None;
            entry.warnings = converted.warnings;
            entry.artifacts = converted.artifacts;
        }
        Err(err) => {
            entry.status = ConversionStatus::Failed;
            entry.error = Some(err.to_string());
            entry.warnings.clear();
            entry.artifacts = Artifacts::default();
        }
    }
    true
}

/// Delete artifact files referenced by `previous` that no entry of
/// `current` references any more.
pub fn prune_stale_artifacts(previous: Option<&Manifest>, current: &Manifest) -> usize {
    let Some(previous) = previous else {
        return 0;
    };
    let live: BTreeSet<PathBuf> = current
        .entries
        .values()
        .flat_map(|e| e.artifacts.files())
        .collect();
    let mut removed = 0;
    for path in previous.entries.values().flat_map(|e| e.artifacts.files()) {
        if live.contains(&path) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed stale artifact");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale artifact"),
        }
    }
    removed
}

pub struct Converter {
    layout: OutputLayout,
    backend: Option<Arc<dyn ConversionBackend>>,
    captioner: Option<Arc<dyn CaptionBackend>>,
    cache: Mutex<CaptionCache>,
    budget: Duration,
}

impl Converter {
    pub fn new(
        config: &Config,
        backend: Option<Arc<dyn ConversionBackend>>,
        captioner: Option<Arc<dyn CaptionBackend>>,
        cache: CaptionCache,
    ) -> Self {
        Self {
            layout: OutputLayout::from_config(&config.output),
            backend,
            captioner,
            cache: Mutex::new(cache),
            budget: Duration::from_secs(config.docling.conversion_budget_secs()),
        }
    }

    pub fn has_captioner(&self) -> bool {
        self.captioner.is_some()
    }

    pub fn save_cache(&self, path: &Path) -> Result<()> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.save(path)
    }

    /// Convert `targets` with at most `max_workers` in flight. Stops
    /// dispatching once `cancel` is set; in-flight conversions still report.
    pub async fn convert_all<F>(
        self: &Arc<Self>,
        targets: Vec<ManifestEntry>,
        max_workers: usize,
        cancel: &CancelFlag,
        progress: &dyn ProgressReporter,
        mut on_outcome: F,
    ) -> Result<()>
    where
        F: FnMut(ConversionOutcome) -> Result<()>,
    {
        let total = targets.len() as u64;
        let mut queue = targets.into_iter();
        let mut in_flight = JoinSet::new();
        let mut done = 0u64;

        loop {
            while in_flight.len() < max_workers.max(1) && !cancel.is_cancelled() {
                let Some(entry) = queue.next() else {
                    break;
                };
                let this = Arc::clone(self);
                in_flight.spawn(async move { this.convert_one(entry).await });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            done += 1;
            match joined {
                Ok(outcome) => {
                    progress.report(ProgressEvent::Converting {
                        n: done,
                        total,
                        path: outcome.path.clone(),
                    });
                    on_outcome(outcome)?;
                }
                Err(e) => error!(error = %e, "conversion task aborted"),
            }
        }

        if cancel.is_cancelled() {
            let skipped = queue.count();
            if skipped > 0 {
                warn!(skipped, "cancelled; remaining conversions left pending");
            }
        }
        Ok(())
    }

    pub async fn convert_one(&self, entry: ManifestEntry) -> ConversionOutcome {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.budget, self.convert_entry(&entry)).await {
            Ok(result) => result,
            Err(_) => Err(ItemError::timeout("conversion", self.budget)),
        };
        match &result {
            Ok(converted) => info!(
                path = %entry.rel_path,
                images = converted.artifacts.images.len(),
                warnings = converted.warnings.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "converted"
            ),
            Err(e) => warn!(path = %entry.rel_path, error = %e, "conversion failed"),
        }
        ConversionOutcome {
            path: entry.rel_path,
            fingerprint: entry.fingerprint,
            result,
        }
    }

    async fn convert_entry(&self, entry: &ManifestEntry) -> Result<Converted, ItemError> {
        match entry.kind {
            FileKind::Passthrough => self.convert_passthrough(entry).await,
            FileKind::Convert => {
                let backend = self.backend.as_ref().ok_or_else(|| {
                    ItemError::backend("conversion", "no conversion backend configured")
                })?;
                let output = backend.convert(&entry.abs_path).await?;
                debug!(
                    path = %entry.rel_path,
                    backend = backend.name(),
                    processing_time = output.processing_time,
                    "backend conversion done"
                );
                self.finish_backend_output(entry, output).await
            }
        }
    }

    async fn convert_passthrough(&self, entry: &ManifestEntry) -> Result<Converted, ItemError> {
        let bytes = tokio::fs::read(&entry.abs_path)
            .await
            .map_err(|e| ItemError::io(entry.abs_path.display(), e))?;
        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        let mut images = Vec::new();

        if self.layout.rewrite_passthrough_md {
            let source_dir = entry.abs_path.parent().unwrap_or(Path::new(""));
            let images_root = self.layout.images_root(&entry.rel_path);
            let mut links = HashMap::new();
            for link in markdown::relative_image_links(&text) {
                let is_image = Path::new(&link)
                    .extension()
                    .map(|e| IMAGE_EXTS.contains(&e.to_string_lossy().to_lowercase().as_str()))
                    .unwrap_or(false);
                if !is_image || link.split('/').any(|part| part == "..") {
                    continue;
                }
                let Ok(image_bytes) = std::fs::read(source_dir.join(&link)) else {
                    debug!(path = %entry.rel_path, link = %link, "referenced image not found");
                    continue;
                };
                let dest = images_root.join(&link);
                write_artifact(&dest, &image_bytes)?;
                let public_url = self.layout.public_url(&dest);
                links.insert(link.clone(), public_url.clone());
                images.push(ImageRecord {
                    figure_id: None,
                    path: dest,
                    public_url,
                    sha256: fingerprint_bytes(&image_bytes).to_string(),
                    caption: None,
                    title: None,
                });
            }
            text = markdown::rewrite_links(&text, &links);
        }

        let md_path = self.layout.markdown_path(&entry.rel_path, &entry.ext);
        let artifacts = self.write_markdown(&md_path, &markdown::cleanup(&text), images)?;
        Ok(Converted {
            artifacts,
            warnings: Vec::new(),
        })
    }

    async fn finish_backend_output(
        &self,
        entry: &ManifestEntry,
        output: ConversionOutput,
    ) -> Result<Converted, ItemError> {
        let mut warnings = check_conversion_status(&output)?;
        let rel = entry.rel_path.clone();

        let (markdown_text, json_text, bundle_images, zip_path) = match output.payload {
            ConversionPayload::Inline { markdown, json } => (markdown, json, Vec::new(), None),
            ConversionPayload::Zip(bytes) => {
                let layout = self.layout.clone();
                let rel_for_task = rel.clone();
                let bundle =
                    tokio::task::spawn_blocking(move || unpack_bundle(&bytes, &layout, &rel_for_task))
                        .await
                        .map_err(|e| ItemError::backend("conversion", e))??;
                (bundle.markdown, bundle.json, bundle.images, bundle.zip_path)
            }
        };

        let markdown_text = markdown_text
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| ItemError::malformed("conversion", "missing markdown content"))?;

        let json_path = match &json_text {
            Some(json) => {
                let path = self.layout.json_path(&rel);
                write_artifact(&path, json.as_bytes())?;
                Some(path)
            }
            None => None,
        };

        let (body, images) = if bundle_images.is_empty() {
            (markdown_text, Vec::new())
        } else if self.layout.rewrite_docling_image_links {
            let captions = self
                .caption_images(&bundle_images, json_text.as_deref(), &mut warnings)
                .await;
            let mut links = HashMap::new();
            for (idx, image) in bundle_images.iter().enumerate() {
                let found = captions.get(&idx).cloned().unwrap_or_default();
                for alias in &image.aliases {
                    links.insert(
                        alias.clone(),
                        ImageLink {
                            public_url: image.public_url.clone(),
                            caption: found.0.clone(),
                            title: found.1.clone(),
                        },
                    );
                }
            }
            let (body, figures) =
                markdown::rewrite_with_placeholders(&markdown_text, &links, &markdown::figure_prefix(&rel));
            let images = bundle_images
                .iter()
                .enumerate()
                .map(|(idx, image)| {
                    let (caption, title) = captions.get(&idx).cloned().unwrap_or_default();
                    ImageRecord {
                        figure_id: figures
                            .iter()
                            .find(|f| image.aliases.contains(&f.link))
                            .map(|f| f.figure_id.clone()),
                        path: image.path.clone(),
                        public_url: image.public_url.clone(),
                        sha256: image.sha256.clone(),
                        caption,
                        title,
                    }
                })
                .collect();
            (body, images)
        } else {
            let links: HashMap<String, String> = bundle_images
                .iter()
                .flat_map(|img| img.aliases.iter().map(|a| (a.clone(), img.public_url.clone())))
                .collect();
            let images = bundle_images
                .iter()
                .map(|image| ImageRecord {
                    figure_id: None,
                    path: image.path.clone(),
                    public_url: image.public_url.clone(),
                    sha256: image.sha256.clone(),
                    caption: None,
                    title: None,
                })
                .collect();
            (markdown::rewrite_links(&markdown_text, &links), images)
        };

        let body = if self.layout.normalize_markdown {
            markdown::normalize(&body)
        } else {
            markdown::cleanup(&body)
        };
        let md_path = self.layout.markdown_path(&rel, &entry.ext);
        let mut artifacts = self.write_markdown(&md_path, &body, images)?;
        artifacts.docling_json = json_path;
        artifacts.docling_zip = zip_path;
        Ok(Converted {
            artifacts,
            warnings,
        })
    }

    fn write_markdown(
        &self,
        md_path: &Path,
        text: &str,
        images: Vec<ImageRecord>,
    ) -> Result<Artifacts, ItemError> {
        write_artifact(md_path, text.as_bytes())?;
        Ok(Artifacts {
            markdown: Some(md_path.to_path_buf()),
            markdown_sha256: Some(fingerprint_bytes(text.as_bytes()).to_string()),
            markdown_public_url: Some(self.layout.public_url(md_path)),
            docling_json: None,
            docling_zip: None,
            images,
        })
    }

    /// Caption every extracted image: conversion JSON first, then the cache,
    /// then the caption backend. Keyed by index into `images`; values are
    /// `(caption, title)`. Failures only add warnings.
    async fn caption_images(
        &self,
        images: &[StoredImage],
        json: Option<&str>,
        warnings: &mut Vec<String>,
    ) -> HashMap<usize, (Option<String>, Option<String>)> {
        let from_json = json.map(captions_from_json).unwrap_or_default();
        let mut by_sha: HashMap<&str, (Option<String>, Option<String>)> = HashMap::new();
        let mut out = HashMap::new();

        for (idx, image) in images.iter().enumerate() {
            if let Some(known) = by_sha.get(image.sha256.as_str()) {
                out.insert(idx, known.clone());
                continue;
            }

            let resolved = match image.aliases.iter().find_map(|a| from_json.get(a)) {
                Some(caption) => (Some(caption.clone()), Some(fallback_title(caption))),
                None => self.caption_from_cache_or_backend(image, warnings).await,
            };
            by_sha.insert(image.sha256.as_str(), resolved.clone());
            out.insert(idx, resolved);
        }
        out
    }

    async fn caption_from_cache_or_backend(
        &self,
        image: &StoredImage,
        warnings: &mut Vec<String>,
    ) -> (Option<String>, Option<String>) {
        let cached = {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(&image.sha256).cloned()
        };
        if let Some(cached) = cached {
            let caption = normalize_caption(&cached.caption);
            if !is_bad_caption(&caption) {
                let title = cached.title.unwrap_or_else(|| fallback_title(&caption));
                return (Some(caption), Some(title));
            }
        }

        let Some(captioner) = &self.captioner else {
            return (None, None);
        };
        let name = image.aliases.first().cloned().unwrap_or_default();
        let bytes = match tokio::fs::read(&image.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warnings.push(ItemError::Captioning(format!("{}: {}", name, e)).to_string());
                return (None, None);
            }
        };

        match captioner.caption(&bytes, mime_for_ext(&image.ext)).await {
            Ok(result) => {
                let caption = normalize_caption(&result.text);
                if is_bad_caption(&caption) {
                    warnings.push(
                        ItemError::Captioning(format!("{}: unusable caption", name)).to_string(),
                    );
                    return (None, None);
                }
                let title = result
                    .title
                    .map(|t| normalize_caption(&t))
                    .filter(|t| !is_bad_caption(t))
                    .unwrap_or_else(|| fallback_title(&caption));
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.insert(image.sha256.clone(), caption.clone(), Some(title.clone()));
                (Some(caption), Some(title))
            }
            Err(e) => {
                warn!(image = %name, error = %e, "captioning failed");
                warnings.push(ItemError::Captioning(format!("{}: {}", name, e)).to_string());
                (None, None)
            }
        }
    }
}

/// Reject failed conversions; return ignorable service complaints as warnings.
fn check_conversion_status(output: &ConversionOutput) -> Result<Vec<String>, ItemError> {
    if let Some(status) = output.status.as_deref() {
        let status = status.to_ascii_lowercase();
        if status != "success" && status != "partial_success" {
            return Err(ItemError::backend(
                "conversion",
                format!("status={}", status),
            ));
        }
    }

    let (nonfatal, fatal): (Vec<&String>, Vec<&String>) = output
        .errors
        .iter()
        .filter(|e| !e.trim().is_empty())
        .partition(|e| {
            let lowered = e.to_lowercase();
            NONFATAL_ERRORS.iter().any(|n| lowered.contains(n))
        });
    if !fatal.is_empty() {
        let joined: Vec<&str> = fatal.iter().map(|s| s.as_str()).collect();
        return Err(ItemError::backend("conversion", joined.join("; ")));
    }
    if !nonfatal.is_empty() {
        debug!(warnings = nonfatal.len(), "ignoring non-fatal OCR warnings");
    }
    Ok(nonfatal.into_iter().cloned().collect())
}

/// An image written out of a ZIP bundle.
#[derive(Debug, Clone)]
struct StoredImage {
    /// Link spellings that refer to this image: path inside the bundle and,
    /// when the markdown lives in a subfolder, the path relative to it.
    aliases: Vec<String>,
    path: PathBuf,
    public_url: String,
    sha256: String,
    ext: String,
}

struct Bundle {
    markdown: Option<String>,
    json: Option<String>,
    images: Vec<StoredImage>,
    zip_path: Option<PathBuf>,
}

fn unpack_bundle(bytes: &[u8], layout: &OutputLayout, rel: &str) -> Result<Bundle, ItemError> {
    let zip_path = if layout.keep_zip {
        let path = layout.zip_path(rel);
        write_artifact(&path, bytes)?;
        Some(path)
    } else {
        None
    };

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ItemError::malformed("conversion", format!("bad zip bundle: {}", e)))?;

    let mut names = Vec::new();
    for idx in 0..archive.len() {
        let file = archive
            .by_index(idx)
            .map_err(|e| ItemError::malformed("conversion", e))?;
        if file.is_dir() || file.enclosed_name().is_none() {
            continue;
        }
        names.push(normalize_rel_path(file.name()));
    }

    let md_name = pick_shortest(&names, ".md");
    let json_name = pick_shortest(&names, ".json");
    let md_dir = md_name
        .as_deref()
        .and_then(|n| n.rsplit_once('/'))
        .map(|(dir, _)| dir.to_string());

    let markdown = md_name
        .as_deref()
        .map(|n| read_zip_text(&mut archive, n))
        .transpose()?;
    let json = json_name
        .as_deref()
        .map(|n| read_zip_text(&mut archive, n))
        .transpose()?;

    let images_root = layout.images_root(rel);
    if images_root.exists() {
        std::fs::remove_dir_all(&images_root)
            .map_err(|e| ItemError::io(images_root.display(), e))?;
    }

    let mut images = Vec::new();
    for name in &names {
        let Some(ext) = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase()) else {
            continue;
        };
        if !IMAGE_EXTS.contains(&ext.as_str()) {
            continue;
        }
        let data = read_zip_bytes(&mut archive, name)?;
        let dest = images_root.join(name);
        write_artifact(&dest, &data)?;

        let mut aliases = vec![name.clone()];
        if let Some(dir) = &md_dir {
            if let Some(relative) = name.strip_prefix(&format!("{}/", dir)) {
                aliases.push(relative.to_string());
            }
        }
        images.push(StoredImage {
            aliases,
            public_url: layout.public_url(&dest),
            path: dest,
            sha256: fingerprint_bytes(&data).to_string(),
            ext: format!(".{}", ext),
        });
    }

    Ok(Bundle {
        markdown,
        json,
        images,
        zip_path,
    })
}

fn pick_shortest(names: &[String], suffix: &str) -> Option<String> {
    names
        .iter()
        .filter(|n| n.to_ascii_lowercase().ends_with(suffix))
        .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .cloned()
}

fn read_zip_bytes(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ItemError> {
    let mut file = archive
        .by_name(name)
        .map_err(|e| ItemError::malformed("conversion", format!("{}: {}", name, e)))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| ItemError::malformed("conversion", format!("{}: {}", name, e)))?;
    Ok(data)
}

fn read_zip_text(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<String, ItemError> {
    let data = read_zip_bytes(archive, name)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), ItemError> {
    atomic_write(path, bytes).map_err(|e| ItemError::io(path.display(), format!("{:#}", e)))
}

/// Captions the conversion service attached to pictures, keyed by the
/// normalized image URI. Picture description annotations win over caption
/// text references.
fn captions_from_json(json: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Ok(payload) = serde_json::from_str::<serde_json::Value>(json) else {
        return out;
    };

    let mut texts: HashMap<String, String> = HashMap::new();
    if let Some(items) = payload.get("texts").and_then(|t| t.as_array()) {
        for (idx, item) in items.iter().enumerate() {
            let reference = item
                .get("self_ref")
                .and_then(|r| r.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("#/texts/{}", idx));
            let text = item
                .get("text")
                .or_else(|| item.get("orig"))
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .trim();
            if !text.is_empty() {
                texts.insert(reference, normalize_caption(text));
            }
        }
    }

    let Some(pictures) = payload.get("pictures").and_then(|p| p.as_array()) else {
        return out;
    };
    for picture in pictures {
        let Some(uri) = picture
            .get("image")
            .and_then(|i| i.get("uri"))
            .and_then(|u| u.as_str())
        else {
            continue;
        };

        let from_annotation = picture
            .get("annotations")
            .and_then(|a| a.as_array())
            .into_iter()
            .flatten()
            .filter(|a| a.get("kind").and_then(|k| k.as_str()) == Some("description"))
            .filter_map(|a| a.get("text").and_then(|t| t.as_str()))
            .map(str::trim)
            .find(|t| !t.is_empty())
            .map(str::to_string);

        let caption = from_annotation.or_else(|| {
            let pieces: Vec<&str> = picture
                .get("captions")
                .and_then(|c| c.as_array())
                .into_iter()
                .flatten()
                .filter_map(|r| match r {
                    serde_json::Value::String(s) => Some(s.as_str()),
                    other => other.get("$ref").and_then(|v| v.as_str()),
                })
                .filter_map(|r| texts.get(r).map(String::as_str))
                .filter(|t| !t.is_empty())
                .collect();
            (!pieces.is_empty()).then(|| pieces.join(" "))
        });

        let Some(caption) = caption.map(|c| normalize_caption(&c)) else {
            continue;
        };
        if is_bad_caption(&caption) {
            continue;
        }
        out.insert(normalize_rel_path(uri), caption);
    }
    out
}
