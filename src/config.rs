use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_script_model")]
    pub script_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
    #[serde(default = "default_voice_name")]
    pub voice_name: String,
    #[serde(default = "default_video_model")]
    pub video_model: String,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_fps")]
    pub fps: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Appended to every visual prompt sent to the image and video models.
    #[serde(default)]
    pub style_prompt: String,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_safety_margin_ms")]
    pub safety_margin_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_failure_cooldown_ms")]
    pub failure_cooldown_ms: u64,
    #[serde(default = "default_success_cooldown_ms")]
    pub success_cooldown_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_script_model() -> String {
    "gemini-3-pro-preview".to_string()
}

fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

fn default_speech_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}

fn default_voice_name() -> String {
    "Fenrir".to_string()
}

fn default_video_model() -> String {
    "veo-3.1-fast-generate-preview".to_string()
}

fn default_resolution() -> String {
    "1080p".to_string()
}

fn default_aspect_ratio() -> String {
    "16:9".to_string()
}

fn default_fps() -> String {
    "24".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_safety_margin_ms() -> u64 {
    2_000
}

fn default_failure_cooldown_ms() -> u64 {
    5_000
}

fn default_success_cooldown_ms() -> u64 {
    2_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            safety_margin_ms: default_safety_margin_ms(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            failure_cooldown_ms: default_failure_cooldown_ms(),
            success_cooldown_ms: default_success_cooldown_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl PipelineSettings {
    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_cooldown_ms)
    }

    pub fn success_cooldown(&self) -> Duration {
        Duration::from_millis(self.success_cooldown_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Invalid config: {}", path.as_ref().display()))?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(content)?;

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                config.api_key = key.trim().to_string();
            }
        }

        if config.api_key.is_empty() {
            anyhow::bail!("config.json: api_key missing (or set {})", API_KEY_ENV);
        }
        if config.retry.max_attempts == 0 {
            anyhow::bail!("config.json: retry.max_attempts must be at least 1");
        }
        if !matches!(config.resolution.as_str(), "720p" | "1080p") {
            anyhow::bail!("config.json: resolution must be 720p or 1080p");
        }
        if !matches!(config.aspect_ratio.as_str(), "16:9" | "9:16") {
            anyhow::bail!("config.json: aspect_ratio must be 16:9 or 9:16");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_takes_defaults() {
        let config = Config::from_json(r#"{"api_key":"k"}"#).unwrap();
        assert!(!config.api_key.is_empty());
        assert_eq!(config.video_model, "veo-3.1-fast-generate-preview");
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.base_delay_ms, 5_000);
        assert_eq!(config.retry.max_delay_ms, 60_000);
        assert_eq!(config.retry.safety_margin_ms, 2_000);
        assert_eq!(config.pipeline.failure_cooldown(), Duration::from_secs(5));
        assert_eq!(config.pipeline.success_cooldown(), Duration::from_secs(2));
        assert_eq!(config.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn nested_sections_override_defaults() {
        let config = Config::from_json(
            r#"{"api_key":"k","retry":{"max_attempts":3},"pipeline":{"success_cooldown_ms":0}}"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 5_000);
        assert_eq!(config.pipeline.success_cooldown(), Duration::ZERO);
        assert_eq!(config.pipeline.failure_cooldown(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_unknown_aspect_ratio() {
        let err = Config::from_json(r#"{"api_key":"k","aspect_ratio":"4:3"}"#).unwrap_err();
        assert!(err.to_string().contains("aspect_ratio"));
    }

    #[test]
    fn rejects_zero_attempts() {
        assert!(Config::from_json(r#"{"api_key":"k","retry":{"max_attempts":0}}"#).is_err());
    }

    #[tokio::test]
    async fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"api_key":"disk-key","fps":"30"}}"#).unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.fps, "30");
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let err = Config::load("/definitely/not/here.json").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
