//! TOML configuration.
//!
//! Every section rejects unknown keys so that a typo never silently falls
//! back to a default. Relative paths are resolved against the working
//! directory, like the rest of the CLI.
//!
//! ```toml
//! [input]
//! root_dir = "./docs"
//! include_ext = ["pdf", "docx"]
//! passthrough_ext = ["md"]
//!
//! [docling]
//! base_url = "http://localhost:5001"
//!
//! [lightrag]
//! base_url = "http://localhost:9621"
//! api_key_env = "LIGHTRAG_API_KEY"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::bail_config;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub input: InputConfig,
    pub docling: DoclingConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub lightrag: LightRagConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub captioning: Option<CaptioningConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub root_dir: PathBuf,
    #[serde(default = "default_include_ext")]
    pub include_ext: Vec<String>,
    #[serde(default = "default_passthrough_ext")]
    pub passthrough_ext: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

fn default_include_ext() -> Vec<String> {
    [".pdf", ".docx", ".pptx", ".xlsx", ".html", ".htm"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_passthrough_ext() -> Vec<String> {
    vec![".md".to_string(), ".txt".to_string()]
}
fn default_max_file_size_mb() -> u64 {
    500
}

impl InputConfig {
    /// Whether files with this (normalized) extension are copied as markdown
    /// instead of being sent to the conversion backend.
    pub fn is_passthrough(&self, ext: &str) -> bool {
        self.passthrough_ext.iter().any(|e| e == ext)
    }

    pub fn accepts(&self, ext: &str) -> bool {
        self.is_passthrough(ext) || self.include_ext.iter().any(|e| e == ext)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DoclingConfig {
    pub base_url: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub use_async: bool,
    #[serde(default = "default_poll_interval")]
    pub async_poll_interval_sec: u64,
    #[serde(default = "default_async_timeout")]
    pub async_timeout_sec: u64,
    #[serde(default = "default_docling_timeout")]
    pub timeout_sec: u64,
    #[serde(default)]
    pub options: DoclingOptions,
}

fn default_endpoint() -> String {
    "file".to_string()
}
fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    5
}
fn default_async_timeout() -> u64 {
    3600
}
fn default_docling_timeout() -> u64 {
    600
}

impl DoclingConfig {
    /// Upper bound for one complete conversion, polling included.
    pub fn conversion_budget_secs(&self) -> u64 {
        if self.use_async {
            self.timeout_sec.saturating_add(self.async_timeout_sec)
        } else {
            self.timeout_sec
        }
    }
}

/// Form options forwarded verbatim to the conversion service.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct DoclingOptions {
    pub from_formats: Vec<String>,
    pub to_formats: Vec<String>,
    pub target_type: String,
    pub image_export_mode: String,
    pub include_images: bool,
    pub images_scale: f64,
    pub do_ocr: bool,
    pub force_ocr: bool,
    pub ocr_engine: String,
    pub ocr_lang: Vec<String>,
    pub pdf_backend: String,
    pub pipeline: String,
    pub document_timeout: Option<f64>,
}

impl Default for DoclingOptions {
    fn default() -> Self {
        Self {
            from_formats: Vec::new(),
            to_formats: vec!["md".to_string(), "json".to_string()],
            target_type: "zip".to_string(),
            image_export_mode: "referenced".to_string(),
            include_images: true,
            images_scale: 2.0,
            do_ocr: true,
            force_ocr: false,
            ocr_engine: "tesseract".to_string(),
            ocr_lang: Vec::new(),
            pdf_backend: "dlparse_v4".to_string(),
            pipeline: "standard".to_string(),
            document_timeout: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct OutputConfig {
    pub root_dir: PathBuf,
    pub markdown_dir: Option<PathBuf>,
    pub docling_json_dir: Option<PathBuf>,
    pub docling_zip_dir: Option<PathBuf>,
    pub images_dir: Option<PathBuf>,
    pub keep_zip: bool,
    pub public_base_url: String,
    pub public_path_prefix: String,
    pub rewrite_docling_image_links: bool,
    pub rewrite_passthrough_md: bool,
    /// Tidy converter markdown (noise lines, page furniture, split paragraphs).
    pub normalize_markdown: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data"),
            markdown_dir: None,
            docling_json_dir: None,
            docling_zip_dir: None,
            images_dir: None,
            keep_zip: true,
            public_base_url: String::new(),
            public_path_prefix: String::new(),
            rewrite_docling_image_links: true,
            rewrite_passthrough_md: false,
            normalize_markdown: true,
        }
    }
}

impl OutputConfig {
    pub fn markdown_dir(&self) -> PathBuf {
        self.markdown_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("markdown"))
    }

    pub fn docling_json_dir(&self) -> PathBuf {
        self.docling_json_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("docling").join("json"))
    }

    pub fn docling_zip_dir(&self) -> PathBuf {
        self.docling_zip_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("docling").join("zip"))
    }

    pub fn images_dir(&self) -> PathBuf {
        self.images_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("docling").join("images"))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ManifestConfig {
    /// Published copy of the full local manifest.
    pub full_path: PathBuf,
    /// Published list of documents eligible for the remote store.
    pub rag_path: PathBuf,
    pub include_image_index: bool,
    /// Convert only one path per distinct source fingerprint.
    pub dedupe_sources: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            full_path: PathBuf::from("manifests/manifest.json"),
            rag_path: PathBuf::from("manifests/manifest.rag.json"),
            include_image_index: true,
            dedupe_sources: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct LightRagConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Name of an environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub timeout_sec: u64,
    pub list_page_size: u32,
    pub file_source_prefix: String,
    /// Delete remote documents under the prefix that are unknown locally.
    pub delete_missing: bool,
    pub delete_file: bool,
    pub delete_llm_cache: bool,
    /// Before syncing, wait for the ingestion pipeline to go idle.
    pub wait_inflight: bool,
    pub inflight_poll_sec: u64,
    /// Give up waiting after this long and sync around in-flight documents.
    pub inflight_timeout_sec: u64,
}

impl Default for LightRagConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            api_key_env: None,
            timeout_sec: 60,
            list_page_size: 200,
            file_source_prefix: "sync2rag".to_string(),
            delete_missing: true,
            delete_file: false,
            delete_llm_cache: false,
            wait_inflight: false,
            inflight_poll_sec: 5,
            inflight_timeout_sec: 1800,
        }
    }
}

impl LightRagConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    /// Resolve the credential, preferring the inline key over the env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    pub dry_run: bool,
    pub log_level: String,
    pub max_workers: usize,
    pub state_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            log_level: "info".to_string(),
            max_workers: 4,
            state_dir: PathBuf::from(".state"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CaptioningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Chat-completions endpoint of an OpenAI-compatible vision model.
    pub url: String,
    pub model: String,
    #[serde(default = "default_caption_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub title_prompt: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Extra request fields (temperature, max_tokens, ...).
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_caption_timeout")]
    pub timeout_sec: u64,
}

fn default_caption_prompt() -> String {
    "Describe this image in a few sentences.".to_string()
}
fn default_caption_timeout() -> u64 {
    30
}

impl Config {
    /// The captioning section, if present and switched on.
    pub fn active_captioning(&self) -> Option<&CaptioningConfig> {
        self.captioning.as_ref().filter(|c| c.enabled)
    }

    /// Fail unless the remote backend can be reached with a credential.
    pub fn require_remote(&self) -> Result<()> {
        if !self.lightrag.is_configured() {
            bail_config!("missing required key: lightrag.base_url");
        }
        if self.lightrag.resolve_api_key().is_none() {
            match &self.lightrag.api_key_env {
                Some(var) => bail_config!(
                    "lightrag.api_key not set and environment variable {} is empty",
                    var
                ),
                None => bail_config!("missing required key: lightrag.api_key"),
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        bail_config!("config file not found: {}", path.display());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = match toml::from_str(content) {
        Ok(config) => config,
        Err(e) => bail_config!("failed to parse config: {}", e),
    };

    config.input.include_ext = normalize_exts(&config.input.include_ext);
    config.input.passthrough_ext = normalize_exts(&config.input.passthrough_ext);

    // Validate input
    if config.input.include_ext.is_empty() && config.input.passthrough_ext.is_empty() {
        bail_config!("input.include_ext and input.passthrough_ext are both empty");
    }
    if !config.input.root_dir.is_dir() {
        bail_config!(
            "input.root_dir does not exist: {}",
            config.input.root_dir.display()
        );
    }
    for pattern in &config.input.exclude_globs {
        if let Err(e) = globset::Glob::new(pattern) {
            bail_config!("invalid input.exclude_globs pattern '{}': {}", pattern, e);
        }
    }

    // Validate docling
    if config.docling.base_url.trim().is_empty() {
        bail_config!("missing required key: docling.base_url");
    }
    if config.docling.timeout_sec == 0 {
        bail_config!("docling.timeout_sec must be > 0");
    }
    if config.docling.use_async
        && (config.docling.async_timeout_sec == 0 || config.docling.async_poll_interval_sec == 0)
    {
        bail_config!("docling.async_timeout_sec and docling.async_poll_interval_sec must be > 0");
    }

    // Validate runtime
    if config.runtime.max_workers == 0 {
        bail_config!("runtime.max_workers must be >= 1");
    }
    if config.lightrag.timeout_sec == 0 {
        bail_config!("lightrag.timeout_sec must be > 0");
    }
    if config.lightrag.list_page_size == 0 {
        bail_config!("lightrag.list_page_size must be >= 1");
    }

    if let Some(captioning) = config.active_captioning() {
        if captioning.url.trim().is_empty() {
            bail_config!("captioning.url must be set when captioning is enabled");
        }
        if captioning.model.trim().is_empty() {
            bail_config!("captioning.model must be set when captioning is enabled");
        }
        if captioning.timeout_sec == 0 {
            bail_config!("captioning.timeout_sec must be > 0");
        }
    }

    validate_paths(&config)?;

    Ok(config)
}

/// Input and output trees must be disjoint, otherwise generated markdown
/// would be picked up by the next scan.
fn validate_paths(config: &Config) -> Result<()> {
    let input = absolutize(&config.input.root_dir);
    let output = absolutize(&config.output.root_dir);
    if input.starts_with(&output) || output.starts_with(&input) {
        bail_config!(
            "input.root_dir and output.root_dir must not be nested; \
             choose separate directories to avoid scanning generated outputs"
        );
    }
    let state = absolutize(&config.runtime.state_dir);
    if state.starts_with(&input) {
        bail_config!("runtime.state_dir must not live inside input.root_dir");
    }
    if state.starts_with(&output) || output.starts_with(&state) {
        bail_config!(
            "runtime.state_dir and output.root_dir must not be nested; \
             `clear --all` empties the output directory"
        );
    }
    Ok(())
}

fn absolutize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Lowercase, dot-prefixed, blank entries dropped.
pub fn normalize_exts(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| {
            let lowered = item.to_lowercase();
            if lowered.starts_with('.') {
                lowered
            } else {
                format!(".{}", lowered)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_fatal_config;
    use tempfile::TempDir;

    fn minimal(root: &Path, extra: &str) -> String {
        format!(
            r#"[input]
root_dir = "{}"

[docling]
base_url = "http://localhost:5001"

[output]
root_dir = "{}"
{}
"#,
            root.join("input").display(),
            root.join("data").display(),
            extra
        )
    }

    fn setup() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("input")).unwrap();
        tmp
    }

    #[test]
    fn normalizes_extensions() {
        let raw = vec![
            "PDF".to_string(),
            ".Docx".to_string(),
            " ".to_string(),
            String::new(),
        ];
        assert_eq!(normalize_exts(&raw), vec![".pdf", ".docx"]);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let tmp = setup();
        let cfg = parse_config(&minimal(tmp.path(), "")).unwrap();
        assert_eq!(cfg.docling.base_url, "http://localhost:5001");
        assert_eq!(cfg.docling.endpoint, "file");
        assert!(cfg.input.accepts(".pdf"));
        assert!(cfg.input.is_passthrough(".md"));
        assert_eq!(cfg.runtime.max_workers, 4);
        assert_eq!(cfg.lightrag.file_source_prefix, "sync2rag");
        assert_eq!(
            cfg.output.markdown_dir(),
            tmp.path().join("data").join("markdown")
        );
        assert!(cfg.active_captioning().is_none());
    }

    #[test]
    fn missing_config_file_is_fatal() {
        let tmp = setup();
        let err = load_config(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(is_fatal_config(&err));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = setup();
        let content = minimal(tmp.path(), "bogus_key = true");
        let err = parse_config(&content).unwrap_err();
        assert!(is_fatal_config(&err));
        assert!(format!("{:#}", err).contains("bogus_key"));
    }

    #[test]
    fn missing_root_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let err = parse_config(&minimal(tmp.path(), "")).unwrap_err();
        assert!(is_fatal_config(&err));
        assert!(format!("{:#}", err).contains("input.root_dir does not exist"));
    }

    #[test]
    fn nested_output_is_rejected() {
        let tmp = setup();
        let content = format!(
            r#"[input]
root_dir = "{root}"

[docling]
base_url = "http://localhost:5001"

[output]
root_dir = "{root}/generated"
"#,
            root = tmp.path().join("input").display()
        );
        let err = parse_config(&content).unwrap_err();
        assert!(format!("{:#}", err).contains("must not be nested"));
    }

    #[test]
    fn state_inside_output_is_rejected() {
        let tmp = setup();
        let content = format!(
            r#"[input]
root_dir = "{root}/input"

[docling]
base_url = "http://localhost:5001"

[output]
root_dir = "{root}/data"

[runtime]
state_dir = "{root}/data/.state"
"#,
            root = tmp.path().display()
        );
        let err = parse_config(&content).unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("runtime.state_dir"), "{}", msg);
        assert!(msg.contains("output.root_dir"), "{}", msg);
    }

    #[test]
    fn remote_requires_credential() {
        let tmp = setup();
        let cfg = parse_config(&minimal(
            tmp.path(),
            "\n[lightrag]\nbase_url = \"http://localhost:9621\"\napi_key_env = \"SYNC2RAG_TEST_UNSET_KEY\"\n",
        ))
        .unwrap();
        let err = cfg.require_remote().unwrap_err();
        assert!(is_fatal_config(&err));

        let cfg = parse_config(&minimal(
            tmp.path(),
            "\n[lightrag]\nbase_url = \"http://localhost:9621\"\napi_key = \"secret\"\n",
        ))
        .unwrap();
        cfg.require_remote().unwrap();
        assert_eq!(cfg.lightrag.resolve_api_key().as_deref(), Some("secret"));
    }

    #[test]
    fn enabled_captioning_needs_model() {
        let tmp = setup();
        let content = minimal(
            tmp.path(),
            "\n[captioning]\nurl = \"http://localhost:8000/v1/chat/completions\"\nmodel = \"\"\n",
        );
        let err = parse_config(&content).unwrap_err();
        assert!(format!("{:#}", err).contains("captioning.model"));
    }

    #[test]
    fn zero_workers_rejected() {
        let tmp = setup();
        let content = minimal(tmp.path(), "\n[runtime]\nmax_workers = 0\n");
        assert!(parse_config(&content).is_err());
    }
}
