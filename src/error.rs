//! Error taxonomy shared by every provider adapter.
//!
//! All failures surfaced by the SDK are classified into a closed set of
//! [`ErrorKind`]s so that callers can react uniformly regardless of which
//! backend produced the failure. Classification happens in three passes:
//! HTTP status code, then per-provider message patterns, then the transport.

use std::fmt;
use std::time::Duration;

use crate::types::Provider;

/// Result type for driver and adapter operations.
pub type DriverResult<T> = Result<T, SandboxError>;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials missing, expired, or rejected.
    Authentication,
    /// Sandbox, snapshot, volume, or route does not exist.
    NotFound,
    /// The operation or the remote call exceeded its deadline.
    Timeout,
    /// The provider asked us to back off.
    RateLimited,
    /// The operation conflicts with current remote state.
    Conflict,
    /// Account-level resource limits reached.
    QuotaExceeded,
    /// Transport-level failure before an HTTP status was available.
    Network,
    /// Generic upstream failure (5xx or unrecognized provider error).
    Provider,
    /// The request itself was malformed or oversized.
    Validation,
    /// The provider does not implement this optional operation.
    Unsupported,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Conflict => "conflict",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Network => "network",
            ErrorKind::Provider => "provider",
            ErrorKind::Validation => "validation",
            ErrorKind::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the SDK an error originated.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub provider: Option<Provider>,
    pub capability: Option<&'static str>,
    /// Usually `"METHOD path"` for HTTP calls or the trait method name.
    pub operation: String,
    pub sandbox_id: Option<String>,
}

/// A classified failure with enough context to act on.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SandboxError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: ErrorContext,
    /// Present for `rate_limited`, parsed from `Retry-After`.
    pub retry_after_ms: Option<u64>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SandboxError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: ErrorContext::default(),
            retry_after_ms: None,
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider, message)
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::new(
            ErrorKind::Unsupported,
            format!("operation '{operation}' is not supported by this provider"),
        )
        .with_operation(operation)
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.context.provider = Some(provider);
        self
    }

    pub fn with_capability(mut self, capability: &'static str) -> Self {
        self.context.capability = Some(capability);
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = operation.into();
        self
    }

    pub fn with_sandbox(mut self, sandbox_id: impl Into<String>) -> Self {
        self.context.sandbox_id = Some(sandbox_id.into());
        self
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    /// Whether a caller-side retry has any chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::Provider
        )
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::new(ErrorKind::Network, e.to_string()).with_source(e)
    }
}

// ── Classification ────────────────────────────────────────────────────────────

/// Map an HTTP status to an error kind. Returns `None` for 2xx/3xx.
pub fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        200..=399 => None,
        401 | 403 => Some(ErrorKind::Authentication),
        404 => Some(ErrorKind::NotFound),
        408 | 504 => Some(ErrorKind::Timeout),
        409 => Some(ErrorKind::Conflict),
        413 | 422 => Some(ErrorKind::Validation),
        429 => Some(ErrorKind::RateLimited),
        500..=599 => Some(ErrorKind::Provider),
        _ => Some(ErrorKind::Provider),
    }
}

/// Parse a `Retry-After` header value into milliseconds.
///
/// Accepts integer seconds or an HTTP-date (RFC 2822).
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.signed_duration_since(chrono::Utc::now());
    Some(delta.num_milliseconds().max(0) as u64)
}

/// Substring patterns applied when no HTTP status is available.
///
/// The base set covers messages common across backends; each provider can
/// extend it with its own vocabulary (Docker's `no such container`, Modal's
/// terminated-sandbox message, and so on).
fn message_patterns(provider: Option<Provider>) -> Vec<(&'static str, ErrorKind)> {
    let mut patterns: Vec<(&'static str, ErrorKind)> = vec![
        ("unauthorized", ErrorKind::Authentication),
        ("invalid api key", ErrorKind::Authentication),
        ("invalid token", ErrorKind::Authentication),
        ("forbidden", ErrorKind::Authentication),
        ("not found", ErrorKind::NotFound),
        ("does not exist", ErrorKind::NotFound),
        ("no such file", ErrorKind::NotFound),
        ("timed out", ErrorKind::Timeout),
        ("timeout", ErrorKind::Timeout),
        ("deadline exceeded", ErrorKind::Timeout),
        ("rate limit", ErrorKind::RateLimited),
        ("too many requests", ErrorKind::RateLimited),
        ("already exists", ErrorKind::Conflict),
        ("conflict", ErrorKind::Conflict),
        ("quota", ErrorKind::QuotaExceeded),
        ("limit exceeded", ErrorKind::QuotaExceeded),
    ];
    match provider {
        Some(Provider::Docker) => {
            patterns.splice(
                0..0,
                [
                    ("no such container", ErrorKind::NotFound),
                    ("no such volume", ErrorKind::NotFound),
                    ("no such image", ErrorKind::NotFound),
                    ("port is already allocated", ErrorKind::Conflict),
                ],
            );
        }
        Some(Provider::Modal) => {
            patterns.splice(
                0..0,
                [
                    ("sandbox has already been terminated", ErrorKind::NotFound),
                    ("token missing", ErrorKind::Authentication),
                ],
            );
        }
        Some(Provider::Daytona) => {
            patterns.splice(0..0, [("workspace not found", ErrorKind::NotFound)]);
        }
        Some(Provider::Blaxel) => {
            patterns.splice(0..0, [("sandbox is not deployed", ErrorKind::NotFound)]);
        }
        _ => {}
    }
    patterns
}

/// Classify a provider message without an HTTP status.
pub fn classify_message(provider: Option<Provider>, message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    for (needle, kind) in message_patterns(provider) {
        if lower.contains(needle) {
            return kind;
        }
    }
    ErrorKind::Provider
}

/// Classify an HTTP response into a [`SandboxError`].
pub fn classify_http(
    status: u16,
    message: impl Into<String>,
    retry_after: Option<&str>,
    context: ErrorContext,
) -> SandboxError {
    let message = message.into();
    let kind = kind_for_status(status)
        .unwrap_or_else(|| classify_message(context.provider, &message));
    let mut err = SandboxError::new(kind, message);
    err.context = context;
    if kind == ErrorKind::RateLimited {
        err.retry_after_ms = retry_after.and_then(parse_retry_after);
    }
    err
}

// ── Call-site retry policy ────────────────────────────────────────────────────

/// Delay before retry attempt `attempt` (0-based), without jitter.
///
/// Backoff ladder: 1 s, 2 s, 4 s, 8 s, 16 s, then 30 s flat.
pub fn backoff_delay(attempt: u32) -> Duration {
    const LADDER: [u64; 6] = [1, 2, 4, 8, 16, 30];
    let secs = LADDER[(attempt as usize).min(LADDER.len() - 1)];
    Duration::from_secs(secs)
}

/// Run `op` up to `max_attempts` times, sleeping between retryable failures.
///
/// Honors `retry_after_ms` when the provider supplied one. Retries are a
/// call-site decision; nothing inside the capability services retries.
pub async fn with_backoff<T, F, Fut>(max_attempts: u32, mut op: F) -> DriverResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = DriverResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let base = e
                    .retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| backoff_delay(attempt));
                let jitter = Duration::from_millis(rand::Rng::gen_range(
                    &mut rand::thread_rng(),
                    0..250,
                ));
                tracing::debug!(
                    attempt,
                    kind = %e.kind,
                    delay_ms = (base + jitter).as_millis() as u64,
                    "retrying after classified error"
                );
                tokio::time::sleep(base + jitter).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_matches_contract() {
        assert_eq!(kind_for_status(401), Some(ErrorKind::Authentication));
        assert_eq!(kind_for_status(403), Some(ErrorKind::Authentication));
        assert_eq!(kind_for_status(404), Some(ErrorKind::NotFound));
        assert_eq!(kind_for_status(408), Some(ErrorKind::Timeout));
        assert_eq!(kind_for_status(504), Some(ErrorKind::Timeout));
        assert_eq!(kind_for_status(409), Some(ErrorKind::Conflict));
        assert_eq!(kind_for_status(413), Some(ErrorKind::Validation));
        assert_eq!(kind_for_status(422), Some(ErrorKind::Validation));
        assert_eq!(kind_for_status(429), Some(ErrorKind::RateLimited));
        assert_eq!(kind_for_status(500), Some(ErrorKind::Provider));
        assert_eq!(kind_for_status(503), Some(ErrorKind::Provider));
        assert_eq!(kind_for_status(200), None);
    }

    #[test]
    fn retry_after_integer_seconds() {
        assert_eq!(parse_retry_after("2"), Some(2000));
        assert_eq!(parse_retry_after(" 10 "), Some(10_000));
    }

    #[test]
    fn retry_after_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(30);
        let ms = parse_retry_after(&future.to_rfc2822()).unwrap();
        assert!(ms > 25_000 && ms <= 31_000, "got {ms}");
    }

    #[test]
    fn retry_after_past_date_clamps_to_zero() {
        let past = chrono::Utc::now() - chrono::Duration::seconds(30);
        assert_eq!(parse_retry_after(&past.to_rfc2822()), Some(0));
    }

    #[test]
    fn rate_limited_carries_retry_after_ms() {
        let err = classify_http(429, "slow down", Some("2"), ErrorContext::default());
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(err.retry_after_ms, Some(2000));
    }

    #[test]
    fn docker_pattern_override_wins() {
        let kind = classify_message(
            Some(Provider::Docker),
            "Error response from daemon: No such container: abc123",
        );
        assert_eq!(kind, ErrorKind::NotFound);
    }

    #[test]
    fn base_patterns_apply_without_provider() {
        assert_eq!(classify_message(None, "request timed out"), ErrorKind::Timeout);
        assert_eq!(
            classify_message(None, "volume already exists"),
            ErrorKind::Conflict
        );
        assert_eq!(classify_message(None, "something odd"), ErrorKind::Provider);
    }

    #[test]
    fn unsupported_is_not_retryable() {
        assert!(!SandboxError::unsupported("pause").is_retryable());
        assert!(SandboxError::network("connection reset").is_retryable());
    }

    #[tokio::test]
    async fn with_backoff_gives_up_on_non_retryable() {
        let mut calls = 0u32;
        let result: DriverResult<()> = with_backoff(5, || {
            calls += 1;
            async { Err(SandboxError::validation("bad input")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn backoff_ladder_caps_at_thirty_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(40), Duration::from_secs(30));
    }
}
