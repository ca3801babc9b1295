//! The generation backend: the four remote generations the studio drives,
//! plus topic scanning.

use crate::config::Config;
use crate::error::BackendError;
use crate::script::{ImageAsset, ScriptData, TrendingTopic, VideoAsset};
use async_trait::async_trait;
use std::time::Duration;

pub mod gemini;

/// Raw 16-bit little-endian PCM narration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioClip {
    pub const TTS_SAMPLE_RATE: u32 = 24_000;

    pub fn mono_24k(pcm: Vec<u8>) -> Self {
        Self {
            pcm,
            sample_rate: Self::TTS_SAMPLE_RATE,
            channels: 1,
        }
    }

    pub fn duration(&self) -> Duration {
        let frame_bytes = 2 * u64::from(self.channels.max(1));
        let frames = self.pcm.len() as u64 / frame_bytes;
        Duration::from_millis(frames * 1000 / u64::from(self.sample_rate.max(1)))
    }
}

/// Rendering parameters shared by every video request of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSettings {
    pub model: String,
    pub resolution: String,
    pub aspect_ratio: String,
    pub fps: String,
}

impl VideoSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.video_model.clone(),
            resolution: config.resolution.clone(),
            aspect_ratio: config.aspect_ratio.clone(),
            fps: config.fps.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRequest {
    pub prompt: String,
    pub segment_id: String,
    pub settings: VideoSettings,
    /// Conditioning keyframe.
    pub image: Option<ImageAsset>,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate_script(&self, topic: &str, model: &str) -> Result<ScriptData, BackendError>;

    async fn generate_speech(&self, text: &str, segment_id: &str) -> Result<AudioClip, BackendError>;

    async fn generate_thumbnail(
        &self,
        prompt: &str,
        segment_id: &str,
    ) -> Result<ImageAsset, BackendError>;

    async fn generate_video(&self, request: &VideoRequest) -> Result<VideoAsset, BackendError>;

    async fn scan_topics(&self) -> Result<Vec<TrendingTopic>, BackendError>;
}
