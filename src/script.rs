use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const DEFAULT_IMAGE_MIME: &str = "image/png";

/// A still image, kept base64-encoded the way the API exchanges it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    pub mime_type: String,
    pub base64: String,
}

impl ImageAsset {
    pub fn new(mime_type: impl Into<String>, base64: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            base64: base64.into(),
        }
    }

    /// Parses `data:image/<type>;base64,<payload>`. A missing or unknown
    /// media type falls back to PNG.
    pub fn from_data_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (header, payload) = rest.split_once(',')?;
        if payload.is_empty() {
            return None;
        }
        let mime = header
            .strip_suffix(";base64")
            .filter(|m| m.starts_with("image/") && m.len() > "image/".len())
            .unwrap_or(DEFAULT_IMAGE_MIME);
        Some(Self::new(mime, payload))
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(self.base64.trim())
            .context("image payload is not valid base64")
    }
}

/// Where a rendered clip lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoAsset {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// One timed unit of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time_range: String,
    pub visual_prompt: String,
    #[serde(default)]
    pub audio_sfx: String,
    #[serde(rename = "voicemail")]
    pub narration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<ImageAsset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoAsset>,
}

impl Segment {
    pub fn new(id: impl Into<String>, visual_prompt: impl Into<String>, narration: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            time_range: String::new(),
            visual_prompt: visual_prompt.into(),
            audio_sfx: String::new(),
            narration: narration.into(),
            thumbnail: None,
            video: None,
        }
    }

    /// A segment with a video is finished; the master run skips it.
    pub fn is_produced(&self) -> bool {
        self.video.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptData {
    pub topic: String,
    pub segments: Vec<Segment>,
}

impl ScriptData {
    /// Parses the script document returned by the language model.
    pub fn from_json(text: &str) -> Result<Self> {
        let script: ScriptData = serde_json::from_str(strip_code_fences(text))
            .with_context(|| "Failed to parse script JSON")?;

        let mut seen = HashSet::new();
        for segment in &script.segments {
            if !seen.insert(segment.id.as_str()) {
                anyhow::bail!("script has duplicate segment id {}", segment.id);
            }
        }
        Ok(script)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize script")
    }

    pub fn segment(&self, id: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// Applies `edit` to segment `id`; false when there is no such segment.
    pub fn update_segment(&mut self, id: &str, edit: impl FnOnce(&mut Segment)) -> bool {
        match self.segments.iter_mut().find(|s| s.id == id) {
            Some(segment) => {
                edit(segment);
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.id.clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.segments.iter().filter(|s| !s.is_produced()).count()
    }
}

/// The script being edited, shared between the session and the pipeline.
///
/// The lock is never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct SharedScript(Arc<Mutex<ScriptData>>);

impl SharedScript {
    pub fn new(script: ScriptData) -> Self {
        Self(Arc::new(Mutex::new(script)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptData> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> ScriptData {
        self.lock().clone()
    }

    pub fn replace(&self, script: ScriptData) {
        *self.lock() = script;
    }

    pub fn segment(&self, id: &str) -> Option<Segment> {
        self.lock().segment(id).cloned()
    }

    pub fn update_segment(&self, id: &str, edit: impl FnOnce(&mut Segment)) -> bool {
        self.lock().update_segment(id, edit)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().ids()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendingTopic {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub relevance: String,
}

pub fn parse_topics(text: &str) -> Result<Vec<TrendingTopic>> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).with_context(|| "Failed to parse topic list JSON")
}

/// Removes a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
