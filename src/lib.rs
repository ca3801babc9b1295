use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod init;
pub mod pipeline;
pub mod retry;
pub mod script;
pub mod session;
pub mod slot;

/// Receives every operator log line, already tagged (`[INFO] ...`).
///
/// The terminal copy of each line goes through `tracing`; the hook is the
/// only other sink.
pub type GeneratorLogHook = Arc<Mutex<dyn Fn(&str) + Send + Sync + 'static>>;

static LOG_HOOK: Lazy<Mutex<Option<GeneratorLogHook>>> = Lazy::new(|| Mutex::new(None));

pub fn set_log_hook(hook: Option<GeneratorLogHook>) {
    let mut guard = LOG_HOOK.lock().unwrap_or_else(|e| e.into_inner());
    *guard = hook;
}

pub(crate) fn logv(tag: &str, message: &str) {
    let line = format!("[{}] {}", tag, message);
    match tag {
        "WARN" | "RETRY" => tracing::warn!(target: "mission_studio::log", "{}", message),
        "ERROR" => tracing::error!(target: "mission_studio::log", "{}", message),
        _ => tracing::info!(target: "mission_studio::log", "{}", message),
    }

    let hook = LOG_HOOK
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .map(Arc::clone);
    if let Some(hook) = hook {
        if let Ok(callback) = hook.lock() {
            callback(&line);
        }
    }
}

pub(crate) fn logi(message: impl AsRef<str>) {
    logv("INFO", message.as_ref());
}

pub(crate) fn logok(message: impl AsRef<str>) {
    logv("OK", message.as_ref());
}

pub(crate) fn logw(message: impl AsRef<str>) {
    logv("WARN", message.as_ref());
}

pub(crate) fn loge(message: impl AsRef<str>) {
    logv("ERROR", message.as_ref());
}

pub(crate) fn logr(message: impl AsRef<str>) {
    logv("RETRY", message.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_log_call_reaches_the_hook_once() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        set_log_hook(Some(Arc::new(Mutex::new(move |line: &str| {
            if line.contains("hook-marker") {
                sink.lock().unwrap().push(line.to_string());
            }
        }))));

        logw("hook-marker quota");
        logok("hook-marker done");
        set_log_hook(None);
        logi("hook-marker after removal");

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["[WARN] hook-marker quota", "[OK] hook-marker done"]
        );
    }
}
