//! Input tree scanner.
//!
//! Walks `input.root_dir`, fingerprints every eligible file and produces the
//! next local manifest together with the changeset against the previous one.
//! Conversion state of unchanged files is carried over; anything whose
//! fingerprint moved starts again from `Pending`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::bail_config;
use crate::convert::markdown_rel_path;
use crate::fingerprint::{fingerprint_file, key_of};
use crate::manifest::diff;
use crate::models::{
    Changeset, ConversionStatus, FileKind, Failure, Manifest, ManifestEntry, SourceFile, Stage,
};
use crate::progress::{ProgressEvent, ProgressReporter};

pub struct ScanOutput {
    pub manifest: Manifest,
    pub changeset: Changeset,
    /// Paths that could not be read this time. Their previous entries, if
    /// any, were carried over unchanged.
    pub errors: Vec<Failure>,
}

/// Canonical input root. Missing or unreadable roots are fatal.
pub fn resolve_root(config: &Config) -> Result<PathBuf> {
    let root = &config.input.root_dir;
    let canonical = match root.canonicalize() {
        Ok(path) => path,
        Err(e) => bail_config!("input.root_dir is not accessible: {}: {}", root.display(), e),
    };
    if !canonical.is_dir() {
        bail_config!("input.root_dir is not a directory: {}", canonical.display());
    }
    if let Err(e) = std::fs::read_dir(&canonical) {
        bail_config!("input.root_dir is not readable: {}: {}", canonical.display(), e);
    }
    Ok(canonical)
}

/// Remote key for a source path: `<prefix>/<rel_path>`.
pub fn file_source_for(prefix: &str, rel_path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rel_path = normalize_rel_path(rel_path);
    if prefix.is_empty() {
        rel_path
    } else {
        format!("{}/{}", prefix, rel_path)
    }
}

/// Forward slashes, no leading `./`.
pub fn normalize_rel_path(value: &str) -> String {
    let mut value = value.replace('\\', "/");
    while let Some(rest) = value.strip_prefix("./") {
        value = rest.to_string();
    }
    value
}

pub fn scan(
    config: &Config,
    previous: Option<&Manifest>,
    progress: &dyn ProgressReporter,
) -> Result<ScanOutput> {
    let root = resolve_root(config)?;
    progress.report(ProgressEvent::Scanning {
        root: root.display().to_string(),
    });

    let exclude_set = build_globset(&config.input.exclude_globs)?;
    let prefix = &config.lightrag.file_source_prefix;
    let now = Utc::now();

    let mut entries: BTreeMap<String, ManifestEntry> = BTreeMap::new();
    let mut errors = Vec::new();
    let mut unreadable: Vec<String> = Vec::new();

    let walker = WalkDir::new(&root)
        .follow_links(config.input.follow_symlinks)
        .sort_by_file_name();
    for item in walker {
        let dir_entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                let rel = err
                    .path()
                    .map(|p| rel_path_of(&root, p))
                    .unwrap_or_default();
                if rel.is_empty() {
                    bail_config!("input.root_dir is not readable: {}: {}", root.display(), err);
                }
                warn!(path = %rel, error = %err, "skipping unreadable path");
                errors.push(Failure::new(Stage::Scan, rel.clone(), &err));
                unreadable.push(rel);
                continue;
            }
        };
        if !dir_entry.file_type().is_file() {
            continue;
        }

        let path = dir_entry.path();
        let Some(ext) = extension_of(path) else {
            continue;
        };
        if !config.input.accepts(&ext) {
            continue;
        }
        let rel = rel_path_of(&root, path);
        if exclude_set.is_match(&rel) {
            continue;
        }

        let prev = previous.and_then(|m| m.get(&rel));
        let source = match read_source(path, &rel, &ext, config) {
            Ok(source) => source,
            Err(reason) => {
                warn!(path = %rel, error = %reason, "failed to fingerprint file");
                errors.push(Failure::new(Stage::Scan, rel.clone(), &reason));
                if let Some(prev) = prev {
                    entries.insert(rel, prev.clone());
                }
                continue;
            }
        };

        let entry = next_entry(&source, prev, file_source_for(prefix, &rel), now);
        entries.insert(rel, entry);
    }

    // Entries under a subtree we could not read are kept as they were;
    // dropping them would turn a permission glitch into remote deletes.
    if let Some(prev) = previous {
        for dir in &unreadable {
            let nested = format!("{}/", dir);
            for (path, entry) in &prev.entries {
                if (path == dir || path.starts_with(&nested)) && !entries.contains_key(path) {
                    entries.insert(path.clone(), entry.clone());
                }
            }
        }
    }

    let limit = config.input.max_file_size_bytes();
    for entry in entries.values_mut() {
        if entry.size_bytes > limit {
            entry.mark_skipped(format!(
                "too_large: {} bytes exceeds input.max_file_size_mb = {}",
                entry.size_bytes, config.input.max_file_size_mb
            ));
        }
    }
    if config.manifest.dedupe_sources {
        mark_duplicates(&mut entries);
    }
    mark_output_collisions(&mut entries);

    let mut manifest = Manifest::new(root);
    manifest.generated_at = Some(now);
    manifest.entries = entries;

    let changeset = diff(previous, &manifest);
    progress.report(ProgressEvent::Scanned {
        files: manifest.entries.len() as u64,
    });
    info!(
        files = manifest.entries.len(),
        added = changeset.added.len(),
        modified = changeset.modified.len(),
        removed = changeset.removed.len(),
        unchanged = changeset.unchanged.len(),
        errors = errors.len(),
        "scan complete"
    );

    Ok(ScanOutput {
        manifest,
        changeset,
        errors,
    })
}

fn read_source(
    path: &Path,
    rel: &str,
    ext: &str,
    config: &Config,
) -> Result<SourceFile, crate::error::ItemError> {
    let metadata =
        std::fs::metadata(path).map_err(|e| crate::error::ItemError::io(path.display(), e))?;
    let size_bytes = metadata.len();
    let mtime = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();

    // Identity is content only; size and mtime are never trusted.
    let fingerprint = fingerprint_file(path)?;
    debug!(path = %rel, size_bytes, "fingerprinted");

    let kind = if config.input.is_passthrough(ext) {
        FileKind::Passthrough
    } else {
        FileKind::Convert
    };

    Ok(SourceFile {
        rel_path: rel.to_string(),
        abs_path: path.to_path_buf(),
        ext: ext.to_string(),
        size_bytes,
        mtime,
        fingerprint,
        kind,
    })
}

/// Carry conversion state forward when content and handling are unchanged.
fn next_entry(
    source: &SourceFile,
    prev: Option<&ManifestEntry>,
    file_source: String,
    now: DateTime<Utc>,
) -> ManifestEntry {
    match prev {
        Some(prev) if prev.fingerprint == source.fingerprint && prev.kind == source.kind => {
            let mut entry = prev.clone();
            entry.abs_path = source.abs_path.clone();
            entry.size_bytes = source.size_bytes;
            entry.mtime = source.mtime;
            entry.last_seen = now;
            entry.file_source = file_source;
            // Skips are recomputed on every scan.
            if entry.status == ConversionStatus::Skipped {
                entry.reset_conversion();
            }
            entry
        }
        _ => ManifestEntry::from_source(source, file_source, now),
    }
}

/// Keep one path per fingerprint: the shortest, then lexicographically first.
fn mark_duplicates(entries: &mut BTreeMap<String, ManifestEntry>) {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for entry in entries.values() {
        if entry.status == ConversionStatus::Skipped {
            continue;
        }
        groups
            .entry(entry.fingerprint.as_str().to_string())
            .or_default()
            .push(key_of(entry).to_string());
    }

    for paths in groups.into_values().filter(|g| g.len() > 1) {
        let Some(canonical) = choose_canonical(&paths).map(str::to_string) else {
            continue;
        };
        for path in paths.iter().filter(|p| **p != canonical) {
            if let Some(entry) = entries.get_mut(path) {
                entry.mark_skipped(format!("duplicate_source: same content as {}", canonical));
                entry.duplicate_of = Some(canonical.clone());
            }
        }
    }
}

/// Two sources whose markdown would land on the same output file (`a.pdf`
/// and `a.pdf.md`): the shortest path keeps it, the other is skipped.
fn mark_output_collisions(entries: &mut BTreeMap<String, ManifestEntry>) {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for (path, entry) in entries.iter() {
        if entry.status == ConversionStatus::Skipped {
            continue;
        }
        groups
            .entry(markdown_rel_path(&entry.rel_path, &entry.ext))
            .or_default()
            .push(path.clone());
    }

    for (output, paths) in groups.into_iter().filter(|(_, g)| g.len() > 1) {
        let Some(canonical) = choose_canonical(&paths).map(str::to_string) else {
            continue;
        };
        for path in paths.iter().filter(|p| **p != canonical) {
            if let Some(entry) = entries.get_mut(path) {
                warn!(path = %path, output = %output, "markdown output already claimed by {}", canonical);
                entry.mark_skipped(format!(
                    "output_collision: {} also converts to {}",
                    canonical, output
                ));
            }
        }
    }
}

pub fn choose_canonical(paths: &[String]) -> Option<&str> {
    paths
        .iter()
        .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .map(String::as_str)
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
}

fn rel_path_of(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    normalize_rel_path(&parts.join("/"))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::progress::NoProgress;
    use std::fs;
    use tempfile::TempDir;

    fn setup(extra: &str) -> (TempDir, Config) {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("input");
        fs::create_dir_all(&input).unwrap();
        let content = format!(
            r#"[input]
root_dir = "{}"
exclude_globs = ["drafts/**"]
{}

[docling]
base_url = "http://localhost:5001"

[output]
root_dir = "{}"
"#,
            input.display(),
            extra,
            tmp.path().join("data").display()
        );
        let config = parse_config(&content).unwrap();
        (tmp, config)
    }

    fn write(tmp: &TempDir, rel: &str, body: &[u8]) {
        let path = tmp.path().join("input").join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn filters_by_extension_and_exclude_globs() {
        let (tmp, config) = setup("");
        write(&tmp, "a.pdf", b"pdf");
        write(&tmp, "nested/B.DOCX", b"docx");
        write(&tmp, "notes.md", b"# hi");
        write(&tmp, "image.png", b"png");
        write(&tmp, "drafts/c.pdf", b"draft");

        let out = scan(&config, None, &NoProgress).unwrap();
        let keys: Vec<&String> = out.manifest.entries.keys().collect();
        assert_eq!(keys, vec!["a.pdf", "nested/B.DOCX", "notes.md"]);
        assert_eq!(out.manifest.entries["notes.md"].kind, FileKind::Passthrough);
        assert_eq!(out.manifest.entries["a.pdf"].kind, FileKind::Convert);
        assert_eq!(out.manifest.entries["nested/B.DOCX"].ext, ".docx");
        assert_eq!(
            out.manifest.entries["nested/B.DOCX"].file_source,
            "sync2rag/nested/B.DOCX"
        );
        assert_eq!(out.changeset.added.len(), 3);
        assert!(!out.changeset.has_state);
    }

    #[test]
    fn rescan_keeps_conversion_state_of_unchanged_files() {
        let (tmp, config) = setup("");
        write(&tmp, "a.pdf", b"v1");
        write(&tmp, "b.pdf", b"other");
        let first = scan(&config, None, &NoProgress).unwrap();

        let mut prev = first.manifest.clone();
        for entry in prev.entries.values_mut() {
            entry.status = ConversionStatus::Converted;
            entry.artifacts.markdown = Some(PathBuf::from("/out/x.md"));
        }

        write(&tmp, "b.pdf", b"changed content");
        let second = scan(&config, Some(&prev), &NoProgress).unwrap();
        assert_eq!(second.changeset.unchanged, vec!["a.pdf"]);
        assert_eq!(second.changeset.modified, vec!["b.pdf"]);
        assert_eq!(
            second.manifest.entries["a.pdf"].status,
            ConversionStatus::Converted
        );
        let b = &second.manifest.entries["b.pdf"];
        assert_eq!(b.status, ConversionStatus::Pending);
        assert!(b.artifacts.markdown.is_none());
    }

    #[test]
    fn same_size_rewrite_with_restored_mtime_is_modified() {
        let (tmp, config) = setup("");
        let path = tmp.path().join("input/a.pdf");
        write(&tmp, "a.pdf", b"version-one");
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();
        let first = scan(&config, None, &NoProgress).unwrap();

        write(&tmp, "a.pdf", b"version-two");
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        let second = scan(&config, Some(&first.manifest), &NoProgress).unwrap();

        assert_eq!(second.changeset.modified, vec!["a.pdf"]);
        assert!(second.changeset.unchanged.is_empty());
        assert_eq!(
            second.manifest.entries["a.pdf"].mtime,
            first.manifest.entries["a.pdf"].mtime
        );
    }

    #[test]
    fn scan_is_idempotent() {
        let (tmp, config) = setup("");
        write(&tmp, "a.pdf", b"one");
        write(&tmp, "dir/b.docx", b"two");
        let first = scan(&config, None, &NoProgress).unwrap();
        let second = scan(&config, Some(&first.manifest), &NoProgress).unwrap();
        assert!(second.changeset.is_empty());
        assert_eq!(second.changeset.unchanged.len(), 2);
        let fingerprints = |m: &Manifest| {
            m.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.fingerprint.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(fingerprints(&first.manifest), fingerprints(&second.manifest));
    }

    #[test]
    fn duplicates_keep_shortest_path() {
        let (tmp, config) = setup("");
        write(&tmp, "deep/copy/a.pdf", b"same");
        write(&tmp, "b.pdf", b"same");
        write(&tmp, "c.pdf", b"same");
        let out = scan(&config, None, &NoProgress).unwrap();
        let entries = &out.manifest.entries;
        assert_eq!(entries["b.pdf"].status, ConversionStatus::Pending);
        assert_eq!(entries["c.pdf"].status, ConversionStatus::Skipped);
        assert_eq!(entries["c.pdf"].duplicate_of.as_deref(), Some("b.pdf"));
        assert_eq!(
            entries["deep/copy/a.pdf"].duplicate_of.as_deref(),
            Some("b.pdf")
        );
    }

    #[test]
    fn duplicate_becomes_pending_when_canonical_disappears() {
        let (tmp, config) = setup("");
        write(&tmp, "a.pdf", b"same");
        write(&tmp, "bb.pdf", b"same");
        let first = scan(&config, None, &NoProgress).unwrap();
        assert_eq!(
            first.manifest.entries["bb.pdf"].status,
            ConversionStatus::Skipped
        );

        fs::remove_file(tmp.path().join("input/a.pdf")).unwrap();
        let second = scan(&config, Some(&first.manifest), &NoProgress).unwrap();
        let bb = &second.manifest.entries["bb.pdf"];
        assert_eq!(bb.status, ConversionStatus::Pending);
        assert!(bb.duplicate_of.is_none());
        assert_eq!(second.changeset.removed, vec!["a.pdf"]);
    }

    #[test]
    fn colliding_markdown_outputs_keep_shortest_path() {
        let (tmp, config) = setup("");
        write(&tmp, "x.pdf", b"a pdf");
        write(&tmp, "x.pdf.md", b"# notes about x\n");
        let out = scan(&config, None, &NoProgress).unwrap();
        assert_eq!(out.manifest.entries["x.pdf"].status, ConversionStatus::Pending);
        let md = &out.manifest.entries["x.pdf.md"];
        assert_eq!(md.status, ConversionStatus::Skipped);
        assert!(md.error.as_deref().unwrap().starts_with("output_collision: x.pdf"));

        // Collisions are recomputed: removing the pdf frees the name.
        fs::remove_file(tmp.path().join("input/x.pdf")).unwrap();
        let second = scan(&config, Some(&out.manifest), &NoProgress).unwrap();
        assert_eq!(second.manifest.entries["x.pdf.md"].status, ConversionStatus::Pending);
    }

    #[test]
    fn oversize_files_are_skipped() {
        let (tmp, config) = setup("max_file_size_mb = 1");
        write(&tmp, "big.pdf", &vec![0u8; 1024 * 1024 + 1]);
        write(&tmp, "small.pdf", b"ok");
        let out = scan(&config, None, &NoProgress).unwrap();
        let big = &out.manifest.entries["big.pdf"];
        assert_eq!(big.status, ConversionStatus::Skipped);
        assert!(big.error.as_deref().unwrap().starts_with("too_large"));
        assert_eq!(
            out.manifest.entries["small.pdf"].status,
            ConversionStatus::Pending
        );
    }

    #[test]
    fn missing_root_is_fatal() {
        let (tmp, config) = setup("");
        fs::remove_dir_all(tmp.path().join("input")).unwrap();
        let err = scan(&config, None, &NoProgress).err().unwrap();
        assert!(crate::error::is_fatal_config(&err));
    }

    #[test]
    fn file_source_joins_prefix() {
        assert_eq!(file_source_for("kb/", "./a/b.pdf"), "kb/a/b.pdf");
        assert_eq!(file_source_for("", "a.pdf"), "a.pdf");
        assert_eq!(normalize_rel_path(".\\x\\y.md"), "x/y.md");
    }

    #[test]
    fn canonical_is_shortest_then_lexicographic() {
        let paths = vec!["bb".to_string(), "ab".to_string(), "abc".to_string()];
        assert_eq!(choose_canonical(&paths), Some("ab"));
    }
}
