//! Segment production.
//!
//! A single-segment pipeline runs VOICE -> KEYFRAME -> VIDEO for one segment;
//! the master run walks every segment of the script through that pipeline in
//! order. Each generation kind, the pipeline and the master run are all
//! single-flight: a conflicting start is refused, never queued.

use crate::api::{AudioClip, GenerationBackend, VideoRequest, VideoSettings};
use crate::config::PipelineSettings;
use crate::error::BackendError;
use crate::script::{ImageAsset, Segment, SharedScript, VideoAsset};
use crate::session::PhaseHandle;
use crate::slot::{Slot, SlotGuard};
use crate::{logi, logok, logw};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const MASTER_SLOT_ID: &str = "master";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Voice,
    Keyframe,
    Video,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::Voice, Stage::Keyframe, Stage::Video];

    /// 1-based position in the pipeline.
    pub fn step(self) -> usize {
        match self {
            Stage::Voice => 1,
            Stage::Keyframe => 2,
            Stage::Video => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Voice => "VOICE",
            Stage::Keyframe => "KEYFRAME",
            Stage::Video => "VIDEO",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already running for segment {holder}")]
    PipelineBusy { holder: String },
    #[error("{stage} generation already running for segment {holder}")]
    StageBusy { stage: Stage, holder: String },
    #[error("segment {0} not found")]
    SegmentNotFound(String),
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: BackendError,
    },
}

impl PipelineError {
    pub fn backend(&self) -> Option<&BackendError> {
        match self {
            PipelineError::Stage { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Plays synthesized narration. Playback itself lives outside the pipeline.
pub trait VoicePlayer: Send + Sync {
    fn play(&self, segment_id: &str, clip: &AudioClip);
}

pub struct SilentPlayer;

impl VoicePlayer for SilentPlayer {
    fn play(&self, _segment_id: &str, _clip: &AudioClip) {}
}

/// Pauses the master run takes between segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldowns {
    pub after_failure: Duration,
    pub after_success: Duration,
}

impl Default for Cooldowns {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for Cooldowns {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            after_failure: settings.failure_cooldown(),
            after_success: settings.success_cooldown(),
        }
    }
}

/// Outcome of one master run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Already had a video when reached.
    pub skipped: Vec<String>,
    /// Stopped early by [`Orchestrator::request_abort`].
    pub aborted: bool,
}

pub struct Orchestrator {
    backend: Arc<dyn GenerationBackend>,
    script: SharedScript,
    phase: PhaseHandle,
    player: Arc<dyn VoicePlayer>,
    video: VideoSettings,
    cooldowns: Cooldowns,
    pipeline: Slot,
    master: Slot,
    generating: HashMap<Stage, Slot>,
    stage: Mutex<Option<Stage>>,
    highlighted: Mutex<Option<String>>,
    abort: Mutex<Option<CancellationToken>>,
    voices: Mutex<HashMap<String, AudioClip>>,
}

/// Clears the stage indicator however the pipeline exits.
struct StageReset<'a>(&'a Mutex<Option<Stage>>);

impl Drop for StageReset<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Forgets the master run's abort token however the run exits.
struct AbortReset<'a>(&'a Mutex<Option<CancellationToken>>);

impl Drop for AbortReset<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        script: SharedScript,
        video: VideoSettings,
        cooldowns: Cooldowns,
    ) -> Self {
        Self {
            backend,
            script,
            phase: PhaseHandle::default(),
            player: Arc::new(SilentPlayer),
            video,
            cooldowns,
            pipeline: Slot::new(),
            master: Slot::new(),
            generating: Stage::ORDER.iter().map(|s| (*s, Slot::new())).collect(),
            stage: Mutex::new(None),
            highlighted: Mutex::new(None),
            abort: Mutex::new(None),
            voices: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_phase(mut self, phase: PhaseHandle) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_player(mut self, player: Arc<dyn VoicePlayer>) -> Self {
        self.player = player;
        self
    }

    pub fn script(&self) -> &SharedScript {
        &self.script
    }

    /// Stage of the active single-segment pipeline, if any.
    pub fn stage(&self) -> Option<Stage> {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Segment the single-segment pipeline is working on.
    pub fn pipeline_segment(&self) -> Option<String> {
        self.pipeline.holder()
    }

    pub fn is_pipeline_active(&self) -> bool {
        self.pipeline.is_busy()
    }

    pub fn is_master_active(&self) -> bool {
        self.master.is_busy()
    }

    /// Segment the master run last moved to.
    pub fn highlighted(&self) -> Option<String> {
        self.highlighted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Segment currently being generated for `kind`, if any.
    pub fn generating(&self, kind: Stage) -> Option<String> {
        self.generating.get(&kind).and_then(Slot::holder)
    }

    /// Cached narration for `segment_id`.
    pub fn voice(&self, segment_id: &str) -> Option<AudioClip> {
        self.voices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(segment_id)
            .cloned()
    }

    /// Applies an operator edit (e.g. an uploaded thumbnail) to a segment.
    pub fn update_segment(&self, segment_id: &str, edit: impl FnOnce(&mut Segment)) -> bool {
        self.script.update_segment(segment_id, edit)
    }

    fn segment(&self, segment_id: &str) -> Result<Segment, PipelineError> {
        self.script
            .segment(segment_id)
            .ok_or_else(|| PipelineError::SegmentNotFound(segment_id.to_string()))
    }

    fn acquire(&self, stage: Stage, segment_id: &str) -> Result<SlotGuard, PipelineError> {
        let slot = &self.generating[&stage];
        slot.try_acquire(segment_id)
            .map_err(|busy| PipelineError::StageBusy {
                stage,
                holder: busy.holder,
            })
    }

    fn enter(&self, segment_id: &str, stage: Stage) {
        *self.stage.lock().unwrap_or_else(|e| e.into_inner()) = Some(stage);
        logi(format!(
            "Pipeline [{}]: step {}/{} -> {}",
            segment_id,
            stage.step(),
            Stage::ORDER.len(),
            stage
        ));
    }

    fn fail(&self, label: &str, stage: Stage, source: BackendError) -> PipelineError {
        self.phase.report_error(label, &source);
        PipelineError::Stage { stage, source }
    }

    /// Synthesizes narration for a segment and caches it.
    ///
    /// Plays it right away unless a master run is driving production.
    pub async fn synthesize_voice(&self, segment_id: &str) -> Result<AudioClip, PipelineError> {
        let _busy = self.acquire(Stage::Voice, segment_id)?;
        let segment = self.segment(segment_id)?;

        let clip = self
            .backend
            .generate_speech(&segment.narration, segment_id)
            .await
            .map_err(|e| self.fail(&format!("Voice failed for {}", segment_id), Stage::Voice, e))?;

        self.voices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(segment_id.to_string(), clip.clone());
        logok(format!(
            "Voice ready for {} ({:.1}s)",
            segment_id,
            clip.duration().as_secs_f32()
        ));

        if !self.master.is_busy() {
            self.player.play(segment_id, &clip);
        }
        Ok(clip)
    }

    /// Generates the reference keyframe and stores it as the thumbnail.
    pub async fn generate_keyframe(&self, segment_id: &str) -> Result<ImageAsset, PipelineError> {
        let _busy = self.acquire(Stage::Keyframe, segment_id)?;
        let segment = self.segment(segment_id)?;
        logi(format!("Generating keyframe for {}", segment_id));

        let image = self
            .backend
            .generate_thumbnail(&segment.visual_prompt, segment_id)
            .await
            .map_err(|e| {
                self.fail(&format!("Keyframe failed for {}", segment_id), Stage::Keyframe, e)
            })?;

        self.script
            .update_segment(segment_id, |s| s.thumbnail = Some(image.clone()));
        logok(format!("Keyframe locked for {}", segment_id));
        Ok(image)
    }

    /// Renders the segment's video, conditioned on `keyframe` or else the
    /// segment's current thumbnail.
    pub async fn generate_video(
        &self,
        segment_id: &str,
        keyframe: Option<ImageAsset>,
    ) -> Result<VideoAsset, PipelineError> {
        let _busy = self.acquire(Stage::Video, segment_id)?;
        let segment = self.segment(segment_id)?;
        logi(format!("Rendering {} for segment {}", self.video.model, segment_id));

        let request = VideoRequest {
            prompt: segment.visual_prompt.clone(),
            segment_id: segment_id.to_string(),
            settings: self.video.clone(),
            image: keyframe.or(segment.thumbnail),
        };
        let video = self
            .backend
            .generate_video(&request)
            .await
            .map_err(|e| self.fail(&format!("Render failed for {}", segment_id), Stage::Video, e))?;

        self.script
            .update_segment(segment_id, |s| s.video = Some(video.clone()));
        logok(format!("Render complete: segment {} linked.", segment_id));
        Ok(video)
    }

    /// Runs VOICE -> KEYFRAME -> VIDEO for one segment.
    ///
    /// Returns false if another pipeline is active or any stage fails.
    /// Artifacts of completed stages are kept either way.
    pub async fn run_pipeline(&self, segment_id: &str) -> bool {
        match self.try_run_pipeline(segment_id).await {
            Ok(()) => true,
            Err(PipelineError::PipelineBusy { holder }) => {
                logw(format!(
                    "Pipeline already running for {}; {} not started.",
                    holder, segment_id
                ));
                false
            }
            Err(err) => {
                logw(format!("Pipeline [{}] aborted: {}", segment_id, err));
                false
            }
        }
    }

    /// [`run_pipeline`](Self::run_pipeline) with the failure kept.
    pub async fn try_run_pipeline(&self, segment_id: &str) -> Result<(), PipelineError> {
        let _run = self
            .pipeline
            .try_acquire(segment_id)
            .map_err(|busy| PipelineError::PipelineBusy { holder: busy.holder })?;
        let _stage = StageReset(&self.stage);

        self.enter(segment_id, Stage::Voice);
        self.synthesize_voice(segment_id).await?;

        self.enter(segment_id, Stage::Keyframe);
        let keyframe = self.generate_keyframe(segment_id).await?;

        self.enter(segment_id, Stage::Video);
        self.generate_video(segment_id, Some(keyframe)).await?;

        logok(format!("Pipeline [{}]: fully synthesized.", segment_id));
        Ok(())
    }

    /// Walks every segment of the script through the pipeline, in order.
    ///
    /// Returns `None` if a master run is already active. `cancel` is only
    /// consulted between segments; a segment in flight always finishes.
    pub async fn run_master(&self, cancel: CancellationToken) -> Option<MasterReport> {
        let Ok(_run) = self.master.try_acquire(MASTER_SLOT_ID) else {
            logw("Master run already active; request ignored.");
            return None;
        };
        *self.abort.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());
        let _abort = AbortReset(&self.abort);

        let ids = self.script.ids();
        logi(format!("Master run: serial sequence over {} segments...", ids.len()));

        let mut report = MasterReport::default();
        for id in ids {
            if cancel.is_cancelled() {
                logw("Master run aborted by operator.");
                report.aborted = true;
                break;
            }

            match self.script.segment(&id) {
                Some(segment) if segment.is_produced() => {
                    report.skipped.push(id);
                    continue;
                }
                Some(_) => {}
                None => continue,
            }

            *self.highlighted.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.clone());

            if self.run_pipeline(&id).await {
                report.completed.push(id);
                tokio::time::sleep(self.cooldowns.after_success).await;
            } else {
                logw(format!(
                    "Segment {} failed. Pausing for {}s before next...",
                    id,
                    self.cooldowns.after_failure.as_secs()
                ));
                report.failed.push(id);
                tokio::time::sleep(self.cooldowns.after_failure).await;
            }
        }

        logok(format!(
            "Master run finished: {} rendered, {} failed, {} skipped{}",
            report.completed.len(),
            report.failed.len(),
            report.skipped.len(),
            if report.aborted { " (aborted)" } else { "" }
        ));
        Some(report)
    }

    /// Asks the active master run to stop before its next segment.
    ///
    /// Returns false when no master run is active.
    pub fn request_abort(&self) -> bool {
        match self.abort.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(token) => {
                token.cancel();
                logw("Abort signal received. Stopping after current segment...");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_run_in_fixed_order() {
        let steps: Vec<(usize, String)> = Stage::ORDER
            .iter()
            .map(|s| (s.step(), s.to_string()))
            .collect();
        assert_eq!(
            steps,
            vec![
                (1, "VOICE".to_string()),
                (2, "KEYFRAME".to_string()),
                (3, "VIDEO".to_string())
            ]
        );
    }

    #[test]
    fn cooldowns_follow_settings() {
        let settings = PipelineSettings {
            failure_cooldown_ms: 750,
            success_cooldown_ms: 250,
            poll_interval_ms: 1,
        };
        let cooldowns = Cooldowns::from(&settings);
        assert_eq!(cooldowns.after_failure, Duration::from_millis(750));
        assert_eq!(cooldowns.after_success, Duration::from_millis(250));
        assert_eq!(Cooldowns::default().after_failure, Duration::from_secs(5));
    }

    #[test]
    fn stage_error_exposes_backend_cause() {
        let err = PipelineError::Stage {
            stage: Stage::Keyframe,
            source: BackendError::MissingOutput("thumbnail"),
        };
        assert_eq!(err.to_string(), "KEYFRAME failed: thumbnail generation failed");
        assert!(err.backend().is_some());
        assert!(PipelineError::SegmentNotFound("x".into()).backend().is_none());
    }
}
