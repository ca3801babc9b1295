//! Failure types shared by the generation backend, the retrying caller and
//! the pipeline.
//!
//! Remote failures arrive in several shapes (an HTTP status with a JSON body,
//! a JSON document embedded in a plain message, or free text). They are all
//! folded into [`ApiError`] at the backend boundary so nothing downstream has
//! to re-parse error text.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HTTP "Too Many Requests".
pub const QUOTA_HTTP_CODE: u16 = 429;
/// Textual status used by the API for quota exhaustion.
pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";

const QUOTA_MESSAGE_MARKERS: &[&str] = &["429", "Quota exceeded", RESOURCE_EXHAUSTED];
const CREDENTIAL_REVOKED_MARKER: &str = "Requested entity was not found";

/// A remote failure normalized into one shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: Option<u16>,
    pub status: Option<String>,
    pub message: String,
    /// Server-suggested wait before retrying, when the failure carried one.
    pub retry_delay: Option<Duration>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
            retry_delay: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Builds an error from a non-success HTTP response.
    ///
    /// The HTTP status fills in `code` when the body does not carry one.
    pub fn from_http(status: u16, body: &str) -> Self {
        let mut err = if body.trim().is_empty() {
            Self::new(format!("HTTP {}", status))
        } else {
            Self::from_message(body)
        };
        if err.code.is_none() {
            err.code = Some(status);
        }
        err
    }

    /// Builds an error from a message that may itself be a JSON error
    /// document (`{"error": {...}}`).
    pub fn from_message(message: &str) -> Self {
        let trimmed = message.trim();
        if trimmed.starts_with('{') {
            if let Ok(root) = serde_json::from_str::<Value>(trimmed) {
                if let Some(mut err) = Self::from_value(&root) {
                    if err.retry_delay.is_none() {
                        err.retry_delay = retry_hint_from_text(trimmed);
                    }
                    return err;
                }
            }
        }

        let mut err = Self::new(message);
        err.retry_delay = retry_hint_from_text(message);
        err
    }

    /// Reads a `{"error": {code, status, message, details}}` document.
    pub fn from_value(root: &Value) -> Option<Self> {
        let body = root.get("error")?;
        if !body.is_object() {
            return None;
        }

        let code = match body.get("code") {
            Some(Value::Number(n)) => n.as_u64().and_then(|c| u16::try_from(c).ok()),
            Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
            _ => None,
        };
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());

        let retry_delay = body
            .get("details")
            .or_else(|| root.get("details"))
            .and_then(Value::as_array)
            .and_then(|details| {
                details.iter().find(|d| {
                    d.get("@type")
                        .and_then(Value::as_str)
                        .is_some_and(|t| t.contains("RetryInfo"))
                })
            })
            .and_then(|info| info.get("retryDelay"))
            .and_then(parse_retry_delay_value)
            .or_else(|| retry_hint_from_text(&message));

        Some(Self {
            code,
            status,
            message,
            retry_delay,
        })
    }

    /// Quota exhaustion: structured code/status first, message text second.
    pub fn is_quota_exhausted(&self) -> bool {
        if self.code == Some(QUOTA_HTTP_CODE) {
            return true;
        }
        if self.status.as_deref() == Some(RESOURCE_EXHAUSTED) {
            return true;
        }
        QUOTA_MESSAGE_MARKERS
            .iter()
            .any(|marker| self.message.contains(marker))
    }

    pub fn is_credential_revoked(&self) -> bool {
        self.message.contains(CREDENTIAL_REVOKED_MARKER)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.status.as_deref()) {
            (Some(code), Some(status)) => write!(f, "{} {}: {}", code, status, self.message),
            (Some(code), None) => write!(f, "{}: {}", code, self.message),
            (None, Some(status)) => write!(f, "{}: {}", status, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Parses a duration string with a seconds suffix, e.g. `"57.12s"`.
///
/// Rounds up to whole milliseconds.
pub fn parse_retry_delay(text: &str) -> Option<Duration> {
    let secs = text.trim().strip_suffix('s')?.trim().parse::<f64>().ok()?;
    seconds_to_duration(secs)
}

fn parse_retry_delay_value(value: &Value) -> Option<Duration> {
    match value {
        Value::String(s) => parse_retry_delay(s),
        // protobuf JSON can also render a Duration as {seconds, nanos}
        Value::Object(obj) => {
            let seconds = match obj.get("seconds") {
                Some(Value::Number(n)) => n.as_f64()?,
                Some(Value::String(s)) => s.parse::<f64>().ok()?,
                _ => 0.0,
            };
            let nanos = obj.get("nanos").and_then(Value::as_f64).unwrap_or(0.0);
            seconds_to_duration(seconds + nanos / 1e9)
        }
        _ => None,
    }
}

/// Looks for "retry in 57.12s" in free text.
pub fn retry_hint_from_text(text: &str) -> Option<Duration> {
    let re = retry_in_regex().ok()?;
    let caps = re.captures(text)?;
    let secs = caps.get(1)?.as_str().parse::<f64>().ok()?;
    seconds_to_duration(secs)
}

fn seconds_to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    Some(Duration::from_millis((secs * 1000.0).ceil() as u64))
}

fn retry_in_regex() -> Result<&'static Regex, regex::Error> {
    static RETRY_IN_RE: OnceCell<Regex> = OnceCell::new();
    RETRY_IN_RE.get_or_try_init(|| Regex::new(r"(?i)retry in ([0-9]+(?:\.[0-9]+)?)s"))
}

/// Everything a generation backend call can fail with.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("{0} generation failed")]
    MissingOutput(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("max retries exceeded for {call_id} after {attempts} attempts")]
    RetriesExhausted {
        call_id: String,
        attempts: u32,
        #[source]
        source: Box<BackendError>,
    },
}

impl BackendError {
    /// The innermost normalized API failure, looking through retry exhaustion.
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            BackendError::Api(err) => Some(err),
            BackendError::RetriesExhausted { source, .. } => source.api(),
            _ => None,
        }
    }

    pub fn is_quota_exhausted(&self) -> bool {
        match self {
            BackendError::Api(err) => err.is_quota_exhausted(),
            BackendError::Transport(err) => {
                err.status().map(|s| s.as_u16()) == Some(QUOTA_HTTP_CODE)
            }
            _ => false,
        }
    }

    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            BackendError::Api(err) => err.retry_delay,
            _ => None,
        }
    }

    pub fn is_credential_revoked(&self) -> bool {
        match self.api() {
            Some(err) => err.is_credential_revoked(),
            None => self.to_string().contains(CREDENTIAL_REVOKED_MARKER),
        }
    }

    /// One-line, human-readable description for the operator log.
    pub fn user_message(&self) -> String {
        match self {
            BackendError::Api(err) => err.message.clone(),
            BackendError::RetriesExhausted { source, .. } => {
                format!("{} ({})", self, source.user_message())
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUOTA_BODY: &str = r#"{
        "error": {
            "code": 429,
            "message": "You exceeded your current quota. Please retry in 57.12s.",
            "status": "RESOURCE_EXHAUSTED",
            "details": [
                {"@type": "type.googleapis.com/google.rpc.QuotaFailure"},
                {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "41s"}
            ]
        }
    }"#;

    #[test]
    fn http_body_is_normalized() {
        let err = ApiError::from_http(429, QUOTA_BODY);
        assert_eq!(err.code, Some(429));
        assert_eq!(err.status.as_deref(), Some(RESOURCE_EXHAUSTED));
        assert!(err.message.starts_with("You exceeded"));
        // the structured hint wins over the text pattern
        assert_eq!(err.retry_delay, Some(Duration::from_secs(41)));
        assert!(err.is_quota_exhausted());
    }

    #[test]
    fn json_embedded_in_message_is_unwrapped() {
        let err = ApiError::from_message(QUOTA_BODY);
        assert_eq!(err.code, Some(429));
        assert_eq!(err.retry_delay, Some(Duration::from_secs(41)));
    }

    #[test]
    fn text_pattern_is_the_fallback_hint() {
        let err = ApiError::from_message("Quota exceeded for metric. Please retry in 12.5s.");
        assert_eq!(err.code, None);
        assert_eq!(err.retry_delay, Some(Duration::from_millis(12_500)));
        assert!(err.is_quota_exhausted());
    }

    #[test]
    fn fractional_hints_round_up_to_whole_millis() {
        assert_eq!(parse_retry_delay("0.0001s"), Some(Duration::from_millis(1)));
        assert_eq!(parse_retry_delay("57.12s"), Some(Duration::from_millis(57_120)));
        assert_eq!(parse_retry_delay("57.12"), None);
        assert_eq!(parse_retry_delay("-3s"), None);
    }

    #[test]
    fn protobuf_object_delay_is_accepted() {
        let root = serde_json::json!({
            "error": {
                "code": 429,
                "message": "slow down",
                "details": [{
                    "@type": "type.googleapis.com/google.rpc.RetryInfo",
                    "retryDelay": {"seconds": 3, "nanos": 500000000}
                }]
            }
        });
        let err = ApiError::from_value(&root).unwrap();
        assert_eq!(err.retry_delay, Some(Duration::from_millis(3_500)));
    }

    #[test]
    fn classification_rules() {
        assert!(ApiError::new("boom").with_code(429).is_quota_exhausted());
        assert!(ApiError::new("boom").with_status(RESOURCE_EXHAUSTED).is_quota_exhausted());
        assert!(ApiError::new("Quota exceeded for requests").is_quota_exhausted());
        assert!(ApiError::new("got status 429 from upstream").is_quota_exhausted());
        assert!(!ApiError::new("Internal error").with_code(500).is_quota_exhausted());
        assert!(!ApiError::new("invalid argument").with_status("INVALID_ARGUMENT").is_quota_exhausted());
    }

    #[test]
    fn fatal_errors_carry_no_hint() {
        let err = ApiError::from_http(400, r#"{"error":{"code":400,"message":"bad prompt","status":"INVALID_ARGUMENT"}}"#);
        assert!(!err.is_quota_exhausted());
        assert_eq!(err.retry_delay, None);
    }

    #[test]
    fn empty_body_uses_status_line() {
        let err = ApiError::from_http(503, "  ");
        assert_eq!(err.code, Some(503));
        assert_eq!(err.message, "HTTP 503");
    }

    #[test]
    fn credential_revocation_is_seen_through_exhaustion() {
        let inner = BackendError::Api(ApiError::new("Requested entity was not found.").with_code(404));
        let wrapped = BackendError::RetriesExhausted {
            call_id: "video-1".to_string(),
            attempts: 3,
            source: Box::new(inner),
        };
        assert!(wrapped.is_credential_revoked());
        assert!(wrapped.user_message().contains("Requested entity was not found"));
        assert!(wrapped.user_message().starts_with("max retries exceeded for video-1"));
    }
}
