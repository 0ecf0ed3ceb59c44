//! HTTP client for a LightRAG-style ingestion service.
//!
//! Endpoints used:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list | `POST /documents/paginated` `{page, page_size, sort_field, sort_direction}` |
//! | insert | `POST /documents/texts` `{texts, file_sources}` |
//! | delete | `DELETE /documents/delete_document` `{doc_ids, delete_file, delete_llm_cache}` |
//! | inflight | `GET /documents/pipeline_status` |
//!
//! The service has no replace operation and addresses deletes by document
//! id, so the client keeps a `file_source → [doc id]` index built from the
//! last listing. `upsert` deletes whatever the index holds for the key
//! before inserting.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry with backoff
//! - HTTP 4xx (client error, not 429) → fail immediately as `Rejected`
//! - Network errors → retry

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backends::{RemoteDoc, RemoteStore};
use crate::config::LightRagConfig;
use crate::error::ItemError;

const BACKEND: &str = "lightrag";
const MAX_RETRIES: u32 = 3;

pub struct LightRagClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    page_size: u32,
    delete_file: bool,
    delete_llm_cache: bool,
    timeout: Duration,
    backoff: Duration,
    /// `file_source → doc ids`, filled lazily from a full listing.
    index: Mutex<Option<HashMap<String, Vec<String>>>>,
}

impl LightRagClient {
    pub fn new(config: &LightRagConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_sec);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.resolve_api_key(),
            page_size: config.list_page_size,
            delete_file: config.delete_file,
            delete_llm_cache: config.delete_llm_cache,
            timeout,
            backoff: Duration::from_secs(1),
            index: Mutex::new(None),
        })
    }

    /// Base delay between retries; doubles on every attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ItemError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                req = req.json(body);
            }
            if let Some(key) = &self.api_key {
                req = req.header("X-API-Key", key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response
                        .text()
                        .await
                        .map_err(|e| ItemError::from_http(BACKEND, e, self.timeout))?;

                    if status.is_success() {
                        if text.trim().is_empty() {
                            return Ok(Value::Null);
                        }
                        return serde_json::from_str(&text)
                            .map_err(|e| ItemError::malformed(BACKEND, e));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        debug!(%url, %status, attempt, "retryable response");
                        last_err = Some(ItemError::backend(
                            BACKEND,
                            format!("HTTP {}: {}", status, truncate(&text, 300)),
                        ));
                        continue;
                    }

                    return Err(ItemError::Rejected {
                        status: status.as_u16(),
                        reason: truncate(&text, 300).to_string(),
                    });
                }
                Err(e) => {
                    debug!(%url, error = %e, attempt, "request failed");
                    last_err = Some(ItemError::from_http(BACKEND, e, self.timeout));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ItemError::backend(BACKEND, "request failed after retries")))
    }

    async fn list_all(&self) -> Result<Vec<RemoteDoc>, ItemError> {
        let mut docs = Vec::new();
        let mut page = 1u32;
        loop {
            let body = json!({
                "page": page,
                "page_size": self.page_size,
                "sort_field": "updated_at",
                "sort_direction": "desc",
            });
            let data = self.request(Method::POST, "/documents/paginated", Some(&body)).await?;
            let batch = data
                .get("documents")
                .and_then(Value::as_array)
                .ok_or_else(|| ItemError::malformed(BACKEND, "missing documents array"))?;
            docs.extend(batch.iter().filter_map(parse_doc));

            let has_next = data
                .get("pagination")
                .and_then(|p| p.get("has_next"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !has_next || batch.is_empty() {
                break;
            }
            page += 1;
        }
        Ok(docs)
    }

    /// Doc ids currently stored under `file_source`, listing the store once
    /// if no index has been built yet.
    async fn ids_for(&self, file_source: &str) -> Result<Vec<String>, ItemError> {
        let mut index = self.index.lock().await;
        if index.is_none() {
            *index = Some(build_index(&self.list_all().await?));
        }
        Ok(index
            .as_ref()
            .and_then(|idx| idx.get(file_source).cloned())
            .unwrap_or_default())
    }

    async fn forget(&self, file_source: &str) {
        if let Some(idx) = self.index.lock().await.as_mut() {
            idx.remove(file_source);
        }
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<(), ItemError> {
        let body = json!({
            "doc_ids": ids,
            "delete_file": self.delete_file,
            "delete_llm_cache": self.delete_llm_cache,
        });
        let data = self
            .request(Method::DELETE, "/documents/delete_document", Some(&body))
            .await?;
        let status = response_status(&data);
        if status == "busy" || status == "fail" || status == "failure" {
            return Err(ItemError::backend(
                BACKEND,
                format!("delete {}: {}", status, response_message(&data)),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for LightRagClient {
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteDoc>, ItemError> {
        let docs = self.list_all().await?;
        *self.index.lock().await = Some(build_index(&docs));
        let docs: Vec<RemoteDoc> = docs
            .into_iter()
            .filter(|d| has_prefix(&d.file_source, prefix))
            .collect();
        info!(count = docs.len(), prefix, "listed remote documents");
        Ok(docs)
    }

    async fn upsert(&self, file_source: &str, text: &str) -> Result<String, ItemError> {
        let existing = self.ids_for(file_source).await?;
        if !existing.is_empty() {
            self.delete_ids(&existing).await?;
            self.forget(file_source).await;
        }

        let body = json!({
            "texts": [text],
            "file_sources": [file_source],
        });
        let data = self.request(Method::POST, "/documents/texts", Some(&body)).await?;
        let status = response_status(&data);
        if status == "failure" || status == "fail" {
            return Err(ItemError::backend(
                BACKEND,
                format!("insert failed: {}", response_message(&data)),
            ));
        }
        if status == "duplicated" {
            warn!(file_source, "remote kept an existing document with the same text");
        }

        Ok(data
            .get("track_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| file_source.to_string()))
    }

    async fn delete(&self, file_source: &str, remote_id: Option<&str>) -> Result<(), ItemError> {
        let mut ids = self.ids_for(file_source).await?;
        if let Some(id) = remote_id.filter(|id| id.starts_with("doc-")) {
            if !ids.iter().any(|known| known == id) {
                ids.push(id.to_string());
            }
        }
        if ids.is_empty() {
            debug!(file_source, "nothing stored remotely; delete is a no-op");
            return Ok(());
        }
        self.delete_ids(&ids).await?;
        self.forget(file_source).await;
        Ok(())
    }

    async fn inflight(&self) -> Result<u64, ItemError> {
        let data = self
            .request(Method::GET, "/documents/pipeline_status", None)
            .await?;
        Ok(count_inflight(&data))
    }
}

/// Sum the pending work a pipeline status reports: numeric fields whose
/// name mentions pending, processing, running, queue or inflight, at any
/// depth, plus one for a `busy: true` flag that carries no count.
fn count_inflight(data: &Value) -> u64 {
    fn walk(value: &Value) -> u64 {
        match value {
            Value::Object(map) => map
                .iter()
                .map(|(key, v)| {
                    let own = match v.as_u64() {
                        Some(n) if is_inflight_key(key) => n,
                        _ => 0,
                    };
                    own + walk(v)
                })
                .sum(),
            Value::Array(items) => items.iter().map(walk).sum(),
            _ => 0,
        }
    }

    let counted = walk(data);
    let busy = data.get("busy").and_then(Value::as_bool).unwrap_or(false);
    if counted == 0 && busy {
        1
    } else {
        counted
    }
}

fn is_inflight_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["pending", "processing", "running", "queue", "inflight"]
        .iter()
        .any(|token| key.contains(token))
}

fn parse_doc(item: &Value) -> Option<RemoteDoc> {
    Some(RemoteDoc {
        id: item.get("id")?.as_str()?.to_string(),
        file_source: item.get("file_path")?.as_str()?.to_string(),
        status: item
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn build_index(docs: &[RemoteDoc]) -> HashMap<String, Vec<String>> {
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    for doc in docs {
        index
            .entry(doc.file_source.clone())
            .or_default()
            .push(doc.id.clone());
    }
    index
}

/// Prefix match on whole path segments: `kb` covers `kb/a.pdf`, not `kb2/a.pdf`.
fn has_prefix(value: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || value
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

fn response_status(data: &Value) -> String {
    data.get("status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn response_message(data: &Value) -> &str {
    data.get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listing_items() {
        let item = json!({"id": "doc-1", "file_path": "sync2rag/a.pdf", "status": "PROCESSED"});
        let doc = parse_doc(&item).unwrap();
        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.file_source, "sync2rag/a.pdf");
        assert!(parse_doc(&json!({"id": "doc-2"})).is_none());
    }

    #[test]
    fn prefix_matching() {
        assert!(has_prefix("sync2rag/a.pdf", "sync2rag/"));
        assert!(has_prefix("anything", ""));
        assert!(!has_prefix("other/a.pdf", "sync2rag"));
        assert!(has_prefix("kb/a.pdf", "kb"));
        assert!(!has_prefix("kb2/a.pdf", "kb"));
        assert!(!has_prefix("kb2/a.pdf", "kb/"));
    }

    #[test]
    fn counts_inflight_work_in_pipeline_status() {
        let idle = json!({"busy": false, "job_name": "-", "docs": 0, "batchs": 0});
        assert_eq!(count_inflight(&idle), 0);
        let busy = json!({"busy": true, "job_name": "indexing", "cur_batch": 1});
        assert_eq!(count_inflight(&busy), 1);
        let nested = json!({"queues": [{"pending_tasks": 2}, {"running": 1}], "processed": 9});
        assert_eq!(count_inflight(&nested), 3);
    }

    #[test]
    fn index_groups_ids_by_file_source() {
        let docs = vec![
            RemoteDoc {
                id: "doc-1".into(),
                file_source: "p/a".into(),
                status: "processed".into(),
            },
            RemoteDoc {
                id: "doc-2".into(),
                file_source: "p/a".into(),
                status: "failed".into(),
            },
        ];
        let index = build_index(&docs);
        assert_eq!(index["p/a"], vec!["doc-1", "doc-2"]);
    }
}
