//! Shared fixtures: a temporary workspace and in-memory backends.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use sync2rag::backends::{
    Backends, ConversionBackend, ConversionOutput, RemoteDoc, RemoteStore,
};
use sync2rag::config::{parse_config, Config};
use sync2rag::error::ItemError;
use sync2rag::state::Coordinator;

pub struct Workspace {
    pub tmp: TempDir,
    pub converter: Arc<FakeConverter>,
    pub store: Arc<FakeStore>,
}

impl Workspace {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("input")).unwrap();
        Self {
            tmp,
            converter: Arc::new(FakeConverter::default()),
            store: Arc::new(FakeStore::default()),
        }
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }

    pub fn input(&self) -> PathBuf {
        self.root().join("input")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root().join("state")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root().join("data")
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.input().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        fs::remove_file(self.input().join(rel)).unwrap();
    }

    /// Config text with `extra` appended verbatim.
    pub fn config_text(&self, extra: &str) -> String {
        let root = self.root().display();
        format!(
            r#"[input]
root_dir = "{root}/input"
include_ext = ["pdf", "docx"]
passthrough_ext = ["md", "txt"]

[docling]
base_url = "http://127.0.0.1:9"

[output]
root_dir = "{root}/data"

[manifest]
full_path = "{root}/manifests/manifest.json"
rag_path = "{root}/manifests/manifest.rag.json"

[lightrag]
base_url = "http://127.0.0.1:9"
api_key = "test-key"
file_source_prefix = "kb"

[runtime]
state_dir = "{root}/state"
max_workers = 2
{extra}"#
        )
    }

    pub fn config(&self) -> Config {
        parse_config(&self.config_text("")).unwrap()
    }

    pub fn write_config(&self, extra: &str) -> PathBuf {
        let path = self.root().join("config.toml");
        fs::write(&path, self.config_text(extra)).unwrap();
        path
    }

    pub fn coordinator(&self) -> Coordinator {
        self.coordinator_with(self.config())
    }

    pub fn coordinator_with(&self, config: Config) -> Coordinator {
        let backends = Backends {
            converter: Some(self.converter.clone()),
            captioner: None,
            remote: Some(self.store.clone()),
        };
        Coordinator::new(config, backends)
    }
}

/// Emits `# <file name>` followed by the file's text. Paths whose file name
/// is in `failing` return a backend error.
#[derive(Default)]
pub struct FakeConverter {
    pub failing: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl FakeConverter {
    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionBackend for FakeConverter {
    fn name(&self) -> &str {
        "fake-converter"
    }

    async fn convert(&self, path: &Path) -> Result<ConversionOutput, ItemError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        if self.failing.lock().unwrap().contains(&name) {
            return Err(ItemError::backend("conversion", "service unavailable"));
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ItemError::io(path.display(), e))?;
        Ok(ConversionOutput::inline(format!("# {}\n\n{}\n", name, text)))
    }
}

/// In-memory ingestion service keyed by `file_source`.
#[derive(Default)]
pub struct FakeStore {
    pub docs: Mutex<BTreeMap<String, String>>,
    pub upserts: AtomicUsize,
    pub deletes: AtomicUsize,
    /// Upserts allowed before every further upsert fails.
    pub upsert_budget: Mutex<Option<usize>>,
    pub failing: Mutex<HashSet<String>>,
    /// Silently drop inserts whose trimmed text another key already holds.
    pub dedupe_text: AtomicBool,
    /// Pipeline status polls answered "busy" before the store goes idle.
    pub busy_polls: AtomicUsize,
    pub status_calls: AtomicUsize,
}

impl FakeStore {
    pub fn keys(&self) -> Vec<String> {
        self.docs.lock().unwrap().keys().cloned().collect()
    }

    pub fn text(&self, file_source: &str) -> Option<String> {
        self.docs.lock().unwrap().get(file_source).cloned()
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn set_budget(&self, budget: Option<usize>) {
        *self.upsert_budget.lock().unwrap() = budget;
    }
}

#[async_trait]
impl RemoteStore for FakeStore {
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteDoc>, ItemError> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(|k| RemoteDoc {
                id: format!("doc-{}", k),
                file_source: k.clone(),
                status: "processed".to_string(),
            })
            .collect())
    }

    async fn upsert(&self, file_source: &str, text: &str) -> Result<String, ItemError> {
        if self.failing.lock().unwrap().contains(file_source) {
            return Err(ItemError::backend("lightrag", "HTTP 500"));
        }
        {
            let mut budget = self.upsert_budget.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(ItemError::backend("lightrag", "connection reset"));
                }
                *left -= 1;
            }
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let mut docs = self.docs.lock().unwrap();
        if self.dedupe_text.load(Ordering::SeqCst)
            && docs
                .iter()
                .any(|(k, v)| k != file_source && v.trim() == text.trim())
        {
            return Ok(format!("dup-{}", file_source));
        }
        docs.insert(file_source.to_string(), text.to_string());
        Ok(format!("doc-{}", file_source))
    }

    async fn delete(&self, file_source: &str, _remote_id: Option<&str>) -> Result<(), ItemError> {
        if self.failing.lock().unwrap().contains(file_source) {
            return Err(ItemError::backend("lightrag", "HTTP 500"));
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.docs.lock().unwrap().remove(file_source);
        Ok(())
    }

    async fn inflight(&self) -> Result<u64, ItemError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.busy_polls.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(0);
        }
        self.busy_polls.store(left - 1, Ordering::SeqCst);
        Ok(2)
    }
}
