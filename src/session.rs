//! Operator session: which screen the application is on, script composition
//! from a topic, and topic scanning.

use crate::api::GenerationBackend;
use crate::error::BackendError;
use crate::script::{ScriptData, SharedScript, TrendingTopic};
use crate::slot::Slot;
use crate::{loge, logi, logok, logw};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Start,
    /// The credential was rejected; a new one must be chosen.
    KeySelection,
    Editor,
}

/// Shared view of the current [`Phase`].
#[derive(Debug, Clone, Default)]
pub struct PhaseHandle(Arc<Mutex<Phase>>);

impl PhaseHandle {
    pub fn get(&self) -> Phase {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, phase: Phase) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Logs `err` under `label` and returns the rendered message.
    ///
    /// A revoked credential also moves the session to
    /// [`Phase::KeySelection`].
    pub fn report_error(&self, label: &str, err: &BackendError) -> String {
        let message = err.user_message();
        loge(format!("{}: {}", label, message));
        if err.is_credential_revoked() {
            self.set(Phase::KeySelection);
            logw("Credential rejected by the API; select a new key to continue.");
        }
        message
    }
}

pub struct Session {
    backend: Arc<dyn GenerationBackend>,
    script: SharedScript,
    phase: PhaseHandle,
    script_model: String,
    composing: Slot,
    scanning: Slot,
    topics: Mutex<Vec<TrendingTopic>>,
}

impl Session {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        script: SharedScript,
        phase: PhaseHandle,
        script_model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            script,
            phase,
            script_model: script_model.into(),
            composing: Slot::new(),
            scanning: Slot::new(),
            topics: Mutex::new(Vec::new()),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub fn script(&self) -> &SharedScript {
        &self.script
    }

    pub fn is_composing(&self) -> bool {
        self.composing.is_busy()
    }

    /// Drafts a script for `topic` and installs it as the current script.
    ///
    /// Returns false when the topic is blank, another composition is
    /// running, or generation failed.
    pub async fn compose_script(&self, topic: &str) -> bool {
        let topic = topic.trim();
        if topic.is_empty() {
            return false;
        }
        let Ok(_guard) = self.composing.try_acquire(topic) else {
            logw("Script composition already running; request ignored.");
            return false;
        };

        logi(format!(
            "Composing script: {} [{}]",
            topic.to_uppercase(),
            self.script_model
        ));
        match self.backend.generate_script(topic, &self.script_model).await {
            Ok(script) => {
                self.install(script);
                true
            }
            Err(err) => {
                self.phase.report_error("Script generation failed", &err);
                false
            }
        }
    }

    /// Composes a script from a scanned topic, passing its description as
    /// extra context.
    pub async fn deploy_topic(&self, topic: &TrendingTopic) -> bool {
        let prompt = if topic.description.is_empty() {
            topic.title.clone()
        } else {
            format!("{} - Context: {}", topic.title, topic.description)
        };
        self.compose_script(&prompt).await
    }

    fn install(&self, script: ScriptData) {
        logok(format!(
            "Script compiled: \"{}\" with {} segments",
            script.topic,
            script.segments.len()
        ));
        self.script.replace(script);
        self.phase.set(Phase::Editor);
    }

    /// Asks the backend for trending topics and caches them.
    ///
    /// A scan already in flight, or a failed scan, leaves the cache as is.
    pub async fn scan_topics(&self) -> Vec<TrendingTopic> {
        let Ok(_guard) = self.scanning.try_acquire("topic-scan") else {
            return self.topics();
        };

        logi("Scanning for trending topics...");
        match self.backend.scan_topics().await {
            Ok(found) => {
                logok(format!("{} topics identified.", found.len()));
                *self.topics.lock().unwrap_or_else(|e| e.into_inner()) = found.clone();
                found
            }
            Err(err) => {
                self.phase.report_error("Topic scan failed", &err);
                self.topics()
            }
        }
    }

    pub fn topics(&self) -> Vec<TrendingTopic> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Called once the operator has supplied a new credential.
    pub fn credentials_updated(&self) {
        self.phase.set(Phase::Start);
        logok("Credentials updated; system ready.");
    }
}
