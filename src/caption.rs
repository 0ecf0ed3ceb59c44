//! Image captioning: the vision-model client, caption clean-up rules and
//! the on-disk caption cache.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::backends::{Caption, CaptionBackend};
use crate::config::CaptioningConfig;
use crate::error::ItemError;
use crate::manifest::{read_json, write_json};

const BACKEND: &str = "captioning";

/// OpenAI-compatible chat-completions client for a vision model.
pub struct VlmCaptioner {
    client: reqwest::Client,
    url: String,
    model: String,
    prompt: String,
    title_prompt: Option<String>,
    headers: BTreeMap<String, String>,
    params: BTreeMap<String, Value>,
    timeout: Duration,
}

impl VlmCaptioner {
    pub fn new(config: &CaptioningConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_sec);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            prompt: config.prompt.clone(),
            title_prompt: config
                .title_prompt
                .as_ref()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty()),
            headers: config.headers.clone(),
            params: config.params.clone(),
            timeout,
        })
    }

    fn payload(&self, data_url: &str, prompt: &str) -> Value {
        let mut payload = Map::new();
        payload.insert("model".into(), Value::String(self.model.clone()));
        payload.insert(
            "messages".into(),
            serde_json::json!([{
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": data_url}},
                    {"type": "text", "text": prompt}
                ]
            }]),
        );
        for (key, value) in &self.params {
            if key == "model" {
                continue;
            }
            payload.insert(key.clone(), value.clone());
        }
        if !payload.contains_key("max_tokens") {
            if let Some(value) = payload.remove("max_completion_tokens") {
                payload.insert("max_tokens".into(), value);
            }
        }
        Value::Object(payload)
    }

    async fn call(&self, data_url: &str, prompt: &str) -> Result<String, ItemError> {
        let mut request = self.client.post(&self.url).json(&self.payload(data_url, prompt));
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| ItemError::from_http(BACKEND, e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ItemError::Captioning(format!("HTTP {}: {}", status, body)));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| ItemError::from_http(BACKEND, e, self.timeout))?;
        extract_content(&data)
            .ok_or_else(|| ItemError::malformed(BACKEND, "no choices[0].message.content"))
    }
}

#[async_trait]
impl CaptionBackend for VlmCaptioner {
    fn model(&self) -> &str {
        &self.model
    }

    fn prompt(&self) -> &str {
        &self.prompt
    }

    async fn caption(&self, image: &[u8], mime: &str) -> Result<Caption, ItemError> {
        let data_url = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(image)
        );
        let text = self.call(&data_url, &self.prompt).await?;
        let title = match &self.title_prompt {
            Some(title_prompt) => match self.call(&data_url, title_prompt).await {
                Ok(title) => Some(title),
                Err(e) => {
                    debug!(error = %e, "title generation failed; falling back to caption");
                    None
                }
            },
            None => None,
        };
        Ok(Caption { text, title })
    }
}

fn extract_content(data: &Value) -> Option<String> {
    data.get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.trim().to_string())
}

// ============ Caption text rules ============

const LEADING_STRIP: &[char] = &[' ', '\t', '\r', '\n', '-', '–', '—', ':', '：', ',', '，', '。'];

static FILLERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^[A-Za-z\x{4e00}-\x{9fff}]{1,10}[,，]\s*",
        r"(?i)^(here|below|the\s+following)\s+(is|are)\s*[:：]?\s*",
        r"^(好的|当然|可以|没问题|以下是|下面是)[，,：:]?\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static REFUSALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(sorry|apolog|cannot|unable|can't)",
        r"|(抱歉|对不起|无法|不能|请上传)",
        r"|(no image|not available|not provided|cannot see)",
        r"|as an ai",
        r"|(lo siento|no puedo)",
    ))
    .unwrap()
});

const GENERIC_CAPTIONS: &[&str] = &[
    "image", "figure", "picture", "photo", "图片", "图像", "照片", "imagen", "foto", "bild",
];

/// Collapse whitespace and drop conversational lead-ins ("Sure, here is ...").
pub fn normalize_caption(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let stripped = strip_leading_fillers(&collapsed);
    stripped.trim_matches(LEADING_STRIP).to_string()
}

fn strip_leading_fillers(text: &str) -> String {
    let mut cleaned = text.trim().to_string();
    for _ in 0..3 {
        let original = cleaned.clone();
        for pattern in FILLERS.iter() {
            cleaned = pattern.replace(&cleaned, "").into_owned();
            cleaned = cleaned.trim_start_matches(LEADING_STRIP).to_string();
        }
        if cleaned == original {
            break;
        }
    }
    cleaned.trim().to_string()
}

/// Too short, a bare generic noun, or a model refusal.
pub fn is_bad_caption(text: &str) -> bool {
    if text.trim().chars().count() < 3 {
        return true;
    }
    let lowered = text.to_lowercase();
    let lowered = lowered.trim_matches(LEADING_STRIP);
    if GENERIC_CAPTIONS.contains(&lowered) {
        return true;
    }
    REFUSALS.is_match(lowered)
}

/// Short label derived from a caption, used when no title was generated.
pub fn fallback_title(caption: &str) -> String {
    let caption = caption.trim();
    if caption.is_empty() {
        return "Image".to_string();
    }
    if caption.chars().count() <= 15 {
        return caption.to_string();
    }
    let fits = |piece: &str| (3..=30).contains(&piece.chars().count());
    for sep in [". ", "。", "! ", "！", "? ", "？", ", ", "，", "; ", "；"] {
        if let Some((first, _)) = caption.split_once(sep) {
            if fits(first) {
                return first.to_string();
            }
        }
    }
    caption.chars().take(20).collect()
}

pub fn mime_for_ext(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

// ============ Caption cache ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCaption {
    pub caption: String,
    pub title: Option<String>,
}

/// Captions keyed by image SHA-256. Only valid for the model and prompt
/// recorded in `meta`; a mismatch on load empties it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptionCache {
    pub meta: Option<CacheMeta>,
    pub updated_at: Option<DateTime<Utc>>,
    pub items: BTreeMap<String, CachedCaption>,
}

impl CaptionCache {
    pub fn load(path: &Path, model: &str, prompt: &str) -> Result<Self> {
        let mut cache: CaptionCache = read_json(path)?.unwrap_or_default();
        let meta = CacheMeta {
            model: model.to_string(),
            prompt: prompt.to_string(),
        };
        if cache.meta.as_ref() != Some(&meta) {
            if !cache.items.is_empty() {
                debug!(path = %path.display(), "caption model or prompt changed; dropping cache");
            }
            cache.items.clear();
            cache.meta = Some(meta);
        }
        Ok(cache)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Some(Utc::now());
        write_json(path, self)
    }

    pub fn get(&self, image_sha: &str) -> Option<&CachedCaption> {
        self.items.get(image_sha)
    }

    pub fn insert(&mut self, image_sha: String, caption: String, title: Option<String>) {
        self.items.insert(image_sha, CachedCaption { caption, title });
    }
}
