//! Manifest persistence and diffing.
//!
//! All writes go through [`atomic_write`]: temp file in the same directory,
//! fsync, rename. A reader therefore sees either the previous or the next
//! complete manifest, never a torn one.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{Changeset, ConversionStatus, Manifest, RemoteManifest, MANIFEST_VERSION};
use crate::scanner::choose_canonical;

/// Write `content` to `path` atomically, creating parent directories.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    let temp_path = temp_path_for(path);
    {
        let file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(content)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to move {} into place at {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "manifest".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &body)
}

/// Read a JSON document, `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Load the local manifest. A manifest from another schema version or for a
/// different input root is ignored, so the next scan treats every file as added.
pub fn load_manifest(path: &Path, root_dir: &Path) -> Result<Option<Manifest>> {
    let Some(manifest) = read_json::<Manifest>(path)? else {
        return Ok(None);
    };
    if manifest.version != MANIFEST_VERSION {
        warn!(
            path = %path.display(),
            version = manifest.version,
            "manifest schema version mismatch; ignoring previous scan state"
        );
        return Ok(None);
    }
    if manifest.root_dir != root_dir {
        warn!(
            previous = %manifest.root_dir.display(),
            current = %root_dir.display(),
            "manifest root_dir mismatch; ignoring previous scan state"
        );
        return Ok(None);
    }
    Ok(Some(manifest))
}

pub fn load_remote_manifest(path: &Path) -> Result<RemoteManifest> {
    match read_json::<RemoteManifest>(path)? {
        Some(remote) if remote.version == MANIFEST_VERSION => Ok(remote),
        Some(remote) => anyhow::bail!(
            "remote-sync manifest {} has unsupported version {}; run `sync2rag clear` to reset it",
            path.display(),
            remote.version
        ),
        None => Ok(RemoteManifest::default()),
    }
}

/// Classify every path of `previous ∪ current`.
///
/// Set semantics over paths: a rename shows up as one removed and one added
/// path, even when both carry the same fingerprint.
pub fn diff(previous: Option<&Manifest>, current: &Manifest) -> Changeset {
    let mut changes = Changeset {
        has_state: previous.is_some(),
        ..Changeset::default()
    };

    for (path, entry) in &current.entries {
        match previous.and_then(|prev| prev.entries.get(path)) {
            None => changes.added.push(path.clone()),
            Some(prev) if prev.fingerprint != entry.fingerprint => {
                changes.modified.push(path.clone())
            }
            Some(_) => changes.unchanged.push(path.clone()),
        }
    }

    if let Some(prev) = previous {
        changes.removed = prev
            .entries
            .keys()
            .filter(|path| !current.entries.contains_key(*path))
            .cloned()
            .collect();
    }

    changes
}

/// Entry shape of the published RAG manifest.
#[derive(Debug, Clone, Serialize)]
pub struct RagItem {
    pub file_source: String,
    pub source_rel_path: String,
    pub md_path: PathBuf,
    pub md_sha256: String,
    pub md_public_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagManifest {
    pub version: u32,
    pub generated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub root_dir: PathBuf,
    pub items: Vec<RagItem>,
}

/// Keep one converted path per markdown digest. The others point at the
/// canonical path through `duplicate_of` and are never pushed, since the
/// remote store refuses a second document with the same text. Marks from a
/// previous pass are recomputed. Returns how many entries were marked.
pub fn mark_markdown_duplicates(manifest: &mut Manifest) -> usize {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for (path, entry) in manifest.entries.iter_mut() {
        if entry.status != ConversionStatus::Converted {
            continue;
        }
        entry.duplicate_of = None;
        if let Some(sha) = &entry.artifacts.markdown_sha256 {
            groups.entry(sha.clone()).or_default().push(path.clone());
        }
    }

    let mut marked = 0;
    for paths in groups.into_values().filter(|g| g.len() > 1) {
        let Some(canonical) = choose_canonical(&paths).map(str::to_string) else {
            continue;
        };
        for path in paths.iter().filter(|p| **p != canonical) {
            if let Some(entry) = manifest.entries.get_mut(path) {
                debug!(path = %path, canonical = %canonical, "duplicate markdown");
                entry.duplicate_of = Some(canonical.clone());
                marked += 1;
            }
        }
    }
    marked
}

/// The subset of the local manifest that the remote store should contain.
pub fn rag_view(manifest: &Manifest) -> RagManifest {
    let items = manifest
        .entries
        .values()
        .filter(|e| e.is_syncable())
        .filter_map(|e| {
            Some(RagItem {
                file_source: e.file_source.clone(),
                source_rel_path: e.rel_path.clone(),
                md_path: e.artifacts.markdown.clone()?,
                md_sha256: e.artifacts.markdown_sha256.clone()?,
                md_public_url: e.artifacts.markdown_public_url.clone(),
            })
        })
        .collect();
    RagManifest {
        version: manifest.version,
        generated_at: manifest.generated_at,
        root_dir: manifest.root_dir.clone(),
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::models::{ConversionStatus, FileKind, ManifestEntry};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn entry(path: &str, fp: &str) -> ManifestEntry {
        ManifestEntry {
            rel_path: path.to_string(),
            abs_path: PathBuf::from("/src").join(path),
            ext: ".pdf".to_string(),
            kind: FileKind::Convert,
            size_bytes: 1,
            mtime: 0,
            fingerprint: Fingerprint::from_hex(fp),
            last_seen: Utc::now(),
            status: ConversionStatus::Pending,
            error: None,
            warnings: Vec::new(),
            duplicate_of: None,
            artifacts: Default::default(),
            file_source: format!("sync2rag/{}", path),
        }
    }

    fn manifest(entries: &[(&str, &str)]) -> Manifest {
        let mut m = Manifest::new(PathBuf::from("/src"));
        for (path, fp) in entries {
            m.entries.insert(path.to_string(), entry(path, fp));
        }
        m
    }

    #[test]
    fn diff_classifies_paths() {
        let prev = manifest(&[("a.pdf", "1"), ("b.docx", "2"), ("c.pdf", "3")]);
        let cur = manifest(&[("a.pdf", "1"), ("b.docx", "9"), ("d.pdf", "4")]);
        let changes = diff(Some(&prev), &cur);
        assert_eq!(changes.added, vec!["d.pdf"]);
        assert_eq!(changes.modified, vec!["b.docx"]);
        assert_eq!(changes.removed, vec!["c.pdf"]);
        assert_eq!(changes.unchanged, vec!["a.pdf"]);
        assert!(changes.has_state);
    }

    #[test]
    fn rename_is_remove_plus_add() {
        let prev = manifest(&[("old/a.pdf", "1")]);
        let cur = manifest(&[("new/a.pdf", "1")]);
        let changes = diff(Some(&prev), &cur);
        assert_eq!(changes.added, vec!["new/a.pdf"]);
        assert_eq!(changes.removed, vec!["old/a.pdf"]);
        assert!(changes.modified.is_empty());
    }

    #[test]
    fn no_previous_state_means_everything_added() {
        let cur = manifest(&[("a.pdf", "1"), ("b.pdf", "2")]);
        let changes = diff(None, &cur);
        assert_eq!(changes.added.len(), 2);
        assert!(!changes.has_state);
    }

    /// Every path in M1 ∪ M2 lands in exactly one partition, over all
    /// combinations of four paths each absent / fingerprint "x" / fingerprint "y".
    #[test]
    fn diff_partitions_union_exhaustively_and_disjointly() {
        let paths = ["a", "b", "c", "d"];
        let states = [None, Some("x"), Some("y")];
        let combos = states.len().pow(paths.len() as u32);

        for left in 0..combos {
            for right in 0..combos {
                let build = |mut code: usize| {
                    let mut m = Manifest::new(PathBuf::from("/src"));
                    for path in paths {
                        if let Some(fp) = states[code % 3] {
                            m.entries.insert(path.to_string(), entry(path, fp));
                        }
                        code /= 3;
                    }
                    m
                };
                let m1 = build(left);
                let m2 = build(right);
                let changes = diff(Some(&m1), &m2);

                let union: BTreeSet<&String> =
                    m1.entries.keys().chain(m2.entries.keys()).collect();
                let mut seen = BTreeSet::new();
                for path in changes
                    .added
                    .iter()
                    .chain(&changes.modified)
                    .chain(&changes.removed)
                    .chain(&changes.unchanged)
                {
                    assert!(seen.insert(path), "{} classified twice", path);
                }
                assert_eq!(seen, union);
                assert_eq!(changes.total(), union.len());
            }
        }
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("scan_index.json");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn manifest_round_trips_and_checks_root() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scan_index.json");
        let m = manifest(&[("a.pdf", "1")]);
        write_json(&path, &m).unwrap();

        let loaded = load_manifest(&path, Path::new("/src")).unwrap().unwrap();
        assert_eq!(loaded, m);
        assert!(load_manifest(&path, Path::new("/elsewhere"))
            .unwrap()
            .is_none());
        assert!(load_manifest(&tmp.path().join("missing.json"), Path::new("/src"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_remote_manifest_is_empty() {
        let tmp = TempDir::new().unwrap();
        let remote = load_remote_manifest(&tmp.path().join("remote_index.json")).unwrap();
        assert!(remote.entries.is_empty());
    }

    fn converted(m: &mut Manifest, path: &str, md_sha: &str) {
        let e = m.entries.get_mut(path).unwrap();
        e.status = ConversionStatus::Converted;
        e.artifacts.markdown = Some(PathBuf::from("/out").join(path).with_extension("md"));
        e.artifacts.markdown_sha256 = Some(md_sha.into());
    }

    #[test]
    fn identical_markdown_keeps_shortest_path() {
        let mut m = manifest(&[("deep/a.pdf", "1"), ("b.docx", "2"), ("c.pdf", "3")]);
        converted(&mut m, "deep/a.pdf", "same");
        converted(&mut m, "b.docx", "same");
        converted(&mut m, "c.pdf", "other");
        assert_eq!(mark_markdown_duplicates(&mut m), 1);
        assert_eq!(m.entries["deep/a.pdf"].duplicate_of.as_deref(), Some("b.docx"));
        assert!(m.entries["b.docx"].duplicate_of.is_none());

        let view = rag_view(&m);
        let sources: Vec<_> = view.items.iter().map(|i| i.file_source.as_str()).collect();
        assert_eq!(sources, vec!["sync2rag/b.docx", "sync2rag/c.pdf"]);

        // Canonical gone: the survivor is pushed again.
        m.entries.remove("b.docx");
        assert_eq!(mark_markdown_duplicates(&mut m), 0);
        assert!(m.entries["deep/a.pdf"].duplicate_of.is_none());
    }

    #[test]
    fn rag_view_only_lists_converted_entries() {
        let mut m = manifest(&[("a.pdf", "1"), ("b.pdf", "2")]);
        let a = m.entries.get_mut("a.pdf").unwrap();
        a.status = ConversionStatus::Converted;
        a.artifacts.markdown = Some(PathBuf::from("/out/a.md"));
        a.artifacts.markdown_sha256 = Some("abc".into());
        let view = rag_view(&m);
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].file_source, "sync2rag/a.pdf");
    }
}
