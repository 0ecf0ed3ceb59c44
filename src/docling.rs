//! HTTP client for a Docling-style conversion service.
//!
//! Two modes, selected by `docling.use_async`:
//!
//! - **sync**: `POST {base}/v1/convert/{endpoint}` with the file as multipart
//!   and wait for the result in the response.
//! - **async**: `POST {base}/v1/convert/{endpoint}/async`, then poll
//!   `GET {base}/v1/status/poll/{task_id}` every `async_poll_interval_sec`
//!   until the task reports `success` or `failure`, then fetch
//!   `GET {base}/v1/result/{task_id}`.
//!
//! A JSON response carries `document.md_content` / `document.json_content`;
//! anything else is treated as a ZIP bundle.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tracing::debug;

use crate::backends::{ConversionBackend, ConversionOutput, ConversionPayload};
use crate::config::{DoclingConfig, DoclingOptions};
use crate::error::ItemError;

const BACKEND: &str = "docling";

pub struct DoclingClient {
    client: reqwest::Client,
    base_url: String,
    endpoint: String,
    options: DoclingOptions,
    use_async: bool,
    request_timeout: Duration,
    poll_interval: Duration,
    async_timeout: Duration,
}

impl DoclingClient {
    pub fn new(config: &DoclingConfig) -> anyhow::Result<Self> {
        let request_timeout = Duration::from_secs(config.timeout_sec);
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            endpoint: config.endpoint.trim_matches('/').to_string(),
            options: config.options.clone(),
            use_async: config.use_async,
            request_timeout,
            poll_interval: Duration::from_secs(config.async_poll_interval_sec),
            async_timeout: Duration::from_secs(config.async_timeout_sec),
        })
    }

    async fn build_form(&self, path: &Path) -> Result<Form, ItemError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ItemError::io(path.display(), e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| ItemError::backend(BACKEND, e))?;

        let mut form = Form::new().part("files", part);
        for (key, value) in form_fields(&self.options) {
            form = form.text(key, value);
        }
        Ok(form)
    }

    async fn convert_sync(&self, path: &Path) -> Result<ConversionOutput, ItemError> {
        let url = format!("{}/v1/convert/{}", self.base_url, self.endpoint);
        let form = self.build_form(path).await?;
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ItemError::from_http(BACKEND, e, self.request_timeout))?;
        let response = check_status(response).await?;
        parse_result(response, self.request_timeout).await
    }

    async fn convert_async(&self, path: &Path) -> Result<ConversionOutput, ItemError> {
        let url = format!("{}/v1/convert/{}/async", self.base_url, self.endpoint);
        let form = self.build_form(path).await?;
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ItemError::from_http(BACKEND, e, self.request_timeout))?;
        let task: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ItemError::from_http(BACKEND, e, self.request_timeout))?;

        let task_id = task
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ItemError::malformed(BACKEND, "missing task_id"))?;
        let mut status = task_status(&task);
        debug!(task_id = %task_id, status = %status, "conversion task submitted");

        let deadline = tokio::time::Instant::now() + self.async_timeout;
        while status != "success" && status != "failure" {
            if tokio::time::Instant::now() >= deadline {
                return Err(ItemError::timeout(BACKEND, self.async_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;

            let poll_url = format!("{}/v1/status/poll/{}", self.base_url, task_id);
            let poll: Value = check_status(
                self.client
                    .get(&poll_url)
                    .send()
                    .await
                    .map_err(|e| ItemError::from_http(BACKEND, e, self.request_timeout))?,
            )
            .await?
            .json()
            .await
            .map_err(|e| ItemError::from_http(BACKEND, e, self.request_timeout))?;
            status = task_status(&poll);
        }

        if status != "success" {
            return Err(ItemError::backend(
                BACKEND,
                format!("async task {} failed", task_id),
            ));
        }

        let result_url = format!("{}/v1/result/{}", self.base_url, task_id);
        let response = self
            .client
            .get(&result_url)
            .send()
            .await
            .map_err(|e| ItemError::from_http(BACKEND, e, self.request_timeout))?;
        let response = check_status(response).await?;
        parse_result(response, self.request_timeout).await
    }
}

#[async_trait]
impl ConversionBackend for DoclingClient {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn convert(&self, path: &Path) -> Result<ConversionOutput, ItemError> {
        if self.use_async {
            self.convert_async(path).await
        } else {
            self.convert_sync(path).await
        }
    }
}

fn task_status(task: &Value) -> String {
    task.get("task_status")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_ascii_lowercase()
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ItemError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ItemError::backend(
        BACKEND,
        format!("HTTP {}: {}", status, truncate(&body, 300)),
    ))
}

async fn parse_result(
    response: reqwest::Response,
    budget: Duration,
) -> Result<ConversionOutput, ItemError> {
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false);

    if !is_json {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ItemError::from_http(BACKEND, e, budget))?;
        return Ok(ConversionOutput::zip(bytes.to_vec()));
    }

    let data: Value = response
        .json()
        .await
        .map_err(|e| ItemError::from_http(BACKEND, e, budget))?;
    Ok(parse_json_result(&data))
}

pub(crate) fn parse_json_result(data: &Value) -> ConversionOutput {
    let document = data.get("document").cloned().unwrap_or(Value::Null);
    let markdown = document
        .get("md_content")
        .and_then(Value::as_str)
        .map(str::to_string);
    let json = match document.get("json_content") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => None,
        Some(other) => serde_json::to_string_pretty(other).ok(),
    };
    let errors = data
        .get("errors")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .map(|e| match e {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    ConversionOutput {
        payload: ConversionPayload::Inline { markdown, json },
        status: Some(
            data.get("status")
                .and_then(Value::as_str)
                .unwrap_or("success")
                .to_string(),
        ),
        errors,
        processing_time: data.get("processing_time").and_then(Value::as_f64),
    }
}

/// Form fields for the conversion request. Lists become repeated keys,
/// booleans `true`/`false`, empty lists and unset values are omitted.
pub(crate) fn form_fields(options: &DoclingOptions) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    let mut push_list = |key: &str, values: &[String]| {
        for value in values {
            fields.push((key.to_string(), value.clone()));
        }
    };
    push_list("from_formats", &options.from_formats);
    push_list("to_formats", &options.to_formats);
    push_list("ocr_lang", &options.ocr_lang);

    let bool_str = |b: bool| (if b { "true" } else { "false" }).to_string();
    fields.push(("target_type".into(), options.target_type.clone()));
    fields.push(("image_export_mode".into(), options.image_export_mode.clone()));
    fields.push(("include_images".into(), bool_str(options.include_images)));
    fields.push(("images_scale".into(), options.images_scale.to_string()));
    fields.push(("do_ocr".into(), bool_str(options.do_ocr)));
    fields.push(("force_ocr".into(), bool_str(options.force_ocr)));
    fields.push(("ocr_engine".into(), options.ocr_engine.clone()));
    fields.push(("pdf_backend".into(), options.pdf_backend.clone()));
    fields.push(("pipeline".into(), options.pipeline.clone()));
    if let Some(timeout) = options.document_timeout {
        fields.push(("document_timeout".into(), timeout.to_string()));
    }
    fields
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
