use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mission_studio::api::gemini::GeminiBackend;
use mission_studio::api::{AudioClip, GenerationBackend, VideoSettings};
use mission_studio::config::Config;
use mission_studio::events::{RetryBoard, RetryBus};
use mission_studio::init;
use mission_studio::pipeline::{Cooldowns, Orchestrator, VoicePlayer};
use mission_studio::retry::{RetryPolicy, RetryingCaller};
use mission_studio::script::SharedScript;
use mission_studio::session::{Phase, PhaseHandle, Session};
use mission_studio::set_log_hook;

const LOG_MAX_LINES: usize = 300;
const SCRIPT_FILE: &str = "script.json";
const INTERRUPTED_EXIT: i32 = 130;

/// Writes each narration clip as raw PCM next to the renders.
///
/// `play` is called from inside the pipeline, so the write is handed to the
/// runtime instead of blocking it.
struct PcmFilePlayer {
    dir: PathBuf,
}

impl PcmFilePlayer {
    fn path_for(&self, segment_id: &str, clip: &AudioClip) -> PathBuf {
        let safe: String = segment_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("segment_{}_{}hz.pcm", safe, clip.sample_rate))
    }
}

impl VoicePlayer for PcmFilePlayer {
    fn play(&self, segment_id: &str, clip: &AudioClip) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime to write narration for {}", segment_id);
            return;
        };
        let path = self.path_for(segment_id, clip);
        let pcm = clip.pcm.clone();
        let segment_id = segment_id.to_string();
        runtime.spawn(async move {
            match tokio::fs::write(&path, pcm).await {
                Ok(()) => tracing::info!("Narration for {} written to {}", segment_id, path.display()),
                Err(err) => tracing::warn!("Could not write {}: {}", path.display(), err),
            }
        });
    }
}

/// Compose a script for a topic and render every segment.
#[derive(Parser, Debug)]
#[command(name = "mission-studio", version)]
struct Args {
    /// Path to the JSON config file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Topic to script; when omitted, the first trending topic is used.
    topic: Vec<String>,
}

impl Args {
    fn topic(&self) -> Option<String> {
        let topic = self.topic.join(" ");
        (!topic.trim().is_empty()).then_some(topic)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Interrupt {
    /// The master run will stop after its current segment.
    Abort,
    Exit,
}

/// First Ctrl-C asks an active master run to stop; any other press exits.
fn on_interrupt(press: u32, request_abort: impl FnOnce() -> bool) -> Interrupt {
    if press == 1 && request_abort() {
        Interrupt::Abort
    } else {
        Interrupt::Exit
    }
}

async fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path).await
    } else {
        tracing::info!("{} not found, using defaults", path.display());
        Config::from_json("{}")
    }
}

async fn run(args: Args) -> Result<bool> {
    let config = load_config(&args.config).await?;
    init::ensure_directories(&config.output_dir).await?;

    let bus = RetryBus::new();
    let board = RetryBoard::new();
    let _board_feed = board.attach(&bus);

    let caller = RetryingCaller::new(RetryPolicy::from(&config.retry), bus);
    let backend: Arc<dyn GenerationBackend> = Arc::new(
        GeminiBackend::new(&config, caller).context("Failed to build Gemini client")?,
    );

    let script = SharedScript::default();
    let phase = PhaseHandle::default();
    let session = Session::new(
        Arc::clone(&backend),
        script.clone(),
        phase.clone(),
        config.script_model.clone(),
    );
    let orchestrator = Arc::new(
        Orchestrator::new(
            backend,
            script,
            VideoSettings::from_config(&config),
            Cooldowns::from(&config.pipeline),
        )
        .with_phase(phase.clone())
        .with_player(Arc::new(PcmFilePlayer {
            dir: init::audio_dir(&config.output_dir),
        })),
    );

    let composed = match args.topic() {
        Some(topic) => session.compose_script(&topic).await,
        None => match session.scan_topics().await.first() {
            Some(topic) => session.deploy_topic(topic).await,
            None => false,
        },
    };
    if !composed {
        if phase.get() == Phase::KeySelection {
            anyhow::bail!("the API key was rejected; set {} and retry", mission_studio::config::API_KEY_ENV);
        }
        anyhow::bail!("no script was produced");
    }

    let script_path = config.output_dir.join(SCRIPT_FILE);
    let script_json = orchestrator.script().snapshot().to_json()?;
    tokio::fs::write(&script_path, script_json)
        .await
        .with_context(|| format!("Failed to save {}", script_path.display()))?;
    tracing::info!("Script saved to {}", script_path.display());

    let abort = Arc::clone(&orchestrator);
    let interrupt = tokio::spawn(async move {
        let mut presses = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            presses += 1;
            match on_interrupt(presses, || abort.request_abort()) {
                Interrupt::Abort => {
                    eprintln!("Stopping after the current segment; press Ctrl-C again to quit now.");
                }
                Interrupt::Exit => std::process::exit(INTERRUPTED_EXIT),
            }
        }
    });

    let report = orchestrator.run_master(CancellationToken::new()).await;
    interrupt.abort();

    let Some(report) = report else {
        return Ok(false);
    };
    for (call_id, left) in board.snapshot(chrono::Utc::now()) {
        tracing::warn!("{} still backing off ({}s left)", call_id, left.as_secs());
    }
    println!(
        "rendered: {:?}\nfailed: {:?}\nskipped: {:?}{}",
        report.completed,
        report.failed,
        report.skipped,
        if report.aborted { "\naborted by operator" } else { "" }
    );
    Ok(report.failed.is_empty() && !report.aborted)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let history: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::with_capacity(LOG_MAX_LINES)));
    let buffer = Arc::clone(&history);
    set_log_hook(Some(Arc::new(Mutex::new(move |line: &str| {
        let mut guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= LOG_MAX_LINES {
            guard.remove(0);
        }
        guard.push(line.to_string());
    }))));

    let result = run(Args::parse()).await;
    set_log_hook(None);

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            let lines = history.lock().unwrap_or_else(|e| e.into_inner()).len();
            eprintln!("[ERROR] {:#} ({} log lines recorded)", err, lines);
            ExitCode::FAILURE
        }
    }
}
