use crate::api::{AudioClip, GenerationBackend, VideoRequest};
use crate::config::Config;
use crate::error::{ApiError, BackendError};
use crate::retry::RetryingCaller;
use crate::script::{ImageAsset, ScriptData, TrendingTopic, VideoAsset, parse_topics};
use crate::{logi, logw};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(600);
const MEDIA_TIMEOUT: Duration = Duration::from_secs(300);
const VIDEO_START_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const SNIPPET_CHARS: usize = 800;

const TOPIC_SCAN_PROMPT: &str = "Identify 4 trending cybersecurity threats or digital privacy topics \
that people are talking about right now. Return a JSON array where each object has: \
title (short and punchy), description (brief context), relevance (why it matters to an everyday user).";

/// [`GenerationBackend`] over the Generative Language REST API.
pub struct GeminiBackend {
    client: Client,
    caller: RetryingCaller,
    base_url: String,
    api_key: String,
    script_model: String,
    image_model: String,
    speech_model: String,
    voice_name: String,
    aspect_ratio: String,
    style_prompt: String,
    output_dir: PathBuf,
    poll_interval: Duration,
}

impl GeminiBackend {
    pub fn new(cfg: &Config, caller: RetryingCaller) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            caller,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            script_model: cfg.script_model.clone(),
            image_model: cfg.image_model.clone(),
            speech_model: cfg.speech_model.clone(),
            voice_name: cfg.voice_name.clone(),
            aspect_ratio: cfg.aspect_ratio.clone(),
            style_prompt: cfg.style_prompt.trim().to_string(),
            output_dir: cfg.output_dir.clone(),
            poll_interval: cfg.pipeline.poll_interval(),
        })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    fn styled(&self, prompt: &str) -> String {
        let prompt = prompt.trim();
        if self.style_prompt.is_empty() {
            prompt.to_string()
        } else {
            format!("{}. {}", prompt.trim_end_matches('.'), self.style_prompt)
        }
    }

    async fn read_json(resp: reqwest::Response) -> Result<Value, BackendError> {
        let status = resp.status();
        let raw = resp.text().await?;

        if !status.is_success() {
            if !raw.is_empty() {
                let snippet = raw.chars().take(SNIPPET_CHARS).collect::<String>();
                tracing::debug!(status = status.as_u16(), body = %snippet, "API error body");
            }
            return Err(ApiError::from_http(status.as_u16(), &raw).into());
        }

        Ok(serde_json::from_str(&raw)?)
    }

    async fn post_json(&self, url: &str, body: &Value, timeout: Duration) -> Result<Value, BackendError> {
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    async fn get_json(&self, url: &str, timeout: Duration) -> Result<Value, BackendError> {
        let resp = self
            .client
            .get(url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(timeout)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    async fn script_once(&self, topic: &str, model: &str) -> Result<ScriptData, BackendError> {
        let prompt = format!(
            "Write an educational short-form video script on the topic: \"{topic}\".\n\
             Split it into 4-6 chapters. For each chapter give an id (\"1\", \"2\", ...), a title, \
             a timeRange (\"00:00 - 00:15\"), a visualPrompt describing the scene for an image/video model, \
             an audioSfx cue, and a voicemail field holding the narration to be spoken.\n\
             Return JSON: {{\"topic\": \"{topic}\", \"segments\": [...]}}"
        );

        let segment_schema = json!({
            "type": "OBJECT",
            "properties": {
                "id": {"type": "STRING"},
                "title": {"type": "STRING"},
                "timeRange": {"type": "STRING"},
                "visualPrompt": {"type": "STRING"},
                "audioSfx": {"type": "STRING"},
                "voicemail": {"type": "STRING"},
            },
            "required": ["id", "title", "timeRange", "visualPrompt", "audioSfx", "voicemail"],
        });

        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "properties": {
                        "topic": {"type": "STRING"},
                        "segments": {"type": "ARRAY", "items": segment_schema},
                    },
                    "required": ["topic", "segments"],
                },
            },
        });

        let resp = self
            .post_json(&self.model_url(model, "generateContent"), &body, SCRIPT_TIMEOUT)
            .await?;
        let text = extract_text(&resp).ok_or(BackendError::MissingOutput("script"))?;
        ScriptData::from_json(&text).map_err(|e| BackendError::Decode(format!("{:#}", e)))
    }

    async fn topics_once(&self) -> Result<Vec<TrendingTopic>, BackendError> {
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": TOPIC_SCAN_PROMPT}]}],
            "tools": [{"google_search": {}}],
        });

        let resp = self
            .post_json(&self.model_url(&self.script_model, "generateContent"), &body, SCRIPT_TIMEOUT)
            .await?;
        let text = extract_text(&resp).unwrap_or_else(|| "[]".to_string());
        parse_topics(&text).map_err(|e| BackendError::Decode(format!("{:#}", e)))
    }

    async fn speech_once(&self, text: &str) -> Result<AudioClip, BackendError> {
        let body = json!({
            "contents": [{"parts": [{"text": format!(
                "Read the following narration slowly and deliberately, treating ellipses as pauses:\n{}",
                text
            )}]}],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": self.voice_name}},
                },
            },
        });

        let resp = self
            .post_json(&self.model_url(&self.speech_model, "generateContent"), &body, MEDIA_TIMEOUT)
            .await?;
        let (_, data) = extract_inline_data(&resp).ok_or(BackendError::MissingOutput("audio"))?;
        let pcm = BASE64
            .decode(data.trim())
            .map_err(|e| BackendError::Decode(format!("audio payload: {}", e)))?;
        Ok(AudioClip::mono_24k(pcm))
    }

    async fn thumbnail_once(&self, prompt: &str) -> Result<ImageAsset, BackendError> {
        let body = json!({
            "contents": [{"parts": [{"text": self.styled(prompt)}]}],
            "generationConfig": {"imageConfig": {"aspectRatio": self.aspect_ratio}},
        });

        let resp = self
            .post_json(&self.model_url(&self.image_model, "generateContent"), &body, MEDIA_TIMEOUT)
            .await?;
        let (mime, data) = extract_inline_data(&resp).ok_or(BackendError::MissingOutput("thumbnail"))?;
        Ok(ImageAsset::new(mime.unwrap_or_else(|| "image/png".to_string()), data))
    }

    async fn start_video_once(&self, request: &VideoRequest) -> Result<Value, BackendError> {
        let mut instance = json!({"prompt": self.styled(&request.prompt)});
        if let Some(image) = &request.image {
            instance["image"] = json!({
                "bytesBase64Encoded": image.base64,
                "mimeType": image.mime_type,
            });
        }

        let body = json!({
            "instances": [instance],
            "parameters": {
                "aspectRatio": request.settings.aspect_ratio,
                "resolution": request.settings.resolution,
                "sampleCount": 1,
            },
        });

        self.post_json(
            &self.model_url(&request.settings.model, "predictLongRunning"),
            &body,
            VIDEO_START_TIMEOUT,
        )
        .await
    }

    async fn poll_video(&self, mut operation: Value, segment_id: &str) -> Result<Value, BackendError> {
        let url = operation
            .get("name")
            .and_then(Value::as_str)
            .map(|name| format!("{}/{}", self.base_url, name));

        let mut polls = 0u32;
        loop {
            // a finished operation may carry its failure in-band
            if let Some(err) = ApiError::from_value(&operation) {
                return Err(err.into());
            }
            if operation.get("done").and_then(Value::as_bool).unwrap_or(false) {
                return Ok(operation);
            }

            let url = url
                .as_deref()
                .ok_or_else(|| BackendError::Decode("video operation has no name".to_string()))?;

            tokio::time::sleep(self.poll_interval).await;
            polls += 1;
            match self.get_json(url, POLL_TIMEOUT).await {
                Ok(next) => operation = next,
                Err(err) => logw(format!("Polling warning for video-{}: {}", segment_id, err)),
            }
            tracing::debug!(segment_id, polls, "video operation polled");
        }
    }

    async fn download_video(&self, uri: &str, segment_id: &str) -> Result<PathBuf, BackendError> {
        let resp = self
            .client
            .get(uri)
            .header("x-goog-api-key", &self.api_key)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            return Err(ApiError::from_http(status.as_u16(), &raw).into());
        }
        let bytes = resp.bytes().await?;

        let out = video_path(&self.output_dir, segment_id);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&out, &bytes).await?;
        Ok(out)
    }
}

#[async_trait]
impl GenerationBackend for GeminiBackend {
    async fn generate_script(&self, topic: &str, model: &str) -> Result<ScriptData, BackendError> {
        self.caller
            .execute("script-gen", || self.script_once(topic, model))
            .await
    }

    async fn generate_speech(&self, text: &str, segment_id: &str) -> Result<AudioClip, BackendError> {
        self.caller
            .execute(&format!("voice-{}", segment_id), || self.speech_once(text))
            .await
    }

    async fn generate_thumbnail(&self, prompt: &str, segment_id: &str) -> Result<ImageAsset, BackendError> {
        self.caller
            .execute(&format!("keyframe-{}", segment_id), || self.thumbnail_once(prompt))
            .await
    }

    async fn generate_video(&self, request: &VideoRequest) -> Result<VideoAsset, BackendError> {
        let segment_id = request.segment_id.as_str();
        logi(format!(
            "Starting {} for segment {} ({}, {}, {} fps{})",
            request.settings.model,
            segment_id,
            request.settings.resolution,
            request.settings.aspect_ratio,
            request.settings.fps,
            if request.image.is_some() { ", keyframe-conditioned" } else { "" }
        ));

        let operation = self
            .caller
            .execute(&format!("video-{}", segment_id), || self.start_video_once(request))
            .await?;
        let operation = self.poll_video(operation, segment_id).await?;

        let uri = extract_video_uri(&operation).ok_or(BackendError::MissingOutput("video"))?;
        let path = self.download_video(&uri, segment_id).await?;
        Ok(VideoAsset {
            uri,
            path: Some(path),
        })
    }

    async fn scan_topics(&self) -> Result<Vec<TrendingTopic>, BackendError> {
        self.caller.execute("topic-scan", || self.topics_once()).await
    }
}

fn candidate_parts(resp: &Value) -> Option<&Vec<Value>> {
    resp.get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()
}

fn extract_text(resp: &Value) -> Option<String> {
    let text = candidate_parts(resp)?
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() { None } else { Some(text) }
}

/// First inline payload as (mime type, base64 data).
fn extract_inline_data(resp: &Value) -> Option<(Option<String>, String)> {
    candidate_parts(resp)?.iter().find_map(|part| {
        let inline = part.get("inlineData").or_else(|| part.get("inline_data"))?;
        let data = inline.get("data")?.as_str()?;
        let mime = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Some((mime, data.to_string()))
    })
}

fn extract_video_uri(operation: &Value) -> Option<String> {
    let response = operation.get("response")?;
    let sample = response
        .get("generateVideoResponse")
        .and_then(|r| r.get("generatedSamples"))
        .or_else(|| response.get("generatedVideos"))?
        .as_array()?
        .first()?;
    sample
        .get("video")?
        .get("uri")?
        .as_str()
        .map(str::to_string)
}

fn video_path(output_dir: &Path, segment_id: &str) -> PathBuf {
    let safe: String = segment_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    output_dir.join(format!("segment_{}.mp4", safe))
}
