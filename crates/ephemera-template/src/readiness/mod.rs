//! Readiness checks declared by templates.
//!
//! A check is declared with a kind (`http`, `net`) and a parameter object.
//! Before the first poll its string parameters are interpolated once through
//! a [`ParamInterpolator`]. [`ReadinessCheck::wait`] then polls until the
//! outcome matches the expected polarity or the retry budget runs out.

pub mod http;
pub mod net;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use ephemera_common::constants::{DEFAULT_READINESS_INTERVAL, DEFAULT_READINESS_RETRY_LIMIT};
use ephemera_common::error::{EphemeraError, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use self::http::HttpCheck;
pub use self::net::NetCheck;

/// Resolves placeholders in readiness check parameters.
pub trait ParamInterpolator: Send + Sync {
    /// Returns `text` with every placeholder substituted.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Interpolation` if a placeholder cannot be
    /// resolved.
    fn interpolate(&self, text: &str) -> Result<String>;
}

/// Polling budget of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Maximum number of polls.
    pub limit: u32,
    /// Pause between two polls.
    #[serde(serialize_with = "serialize_duration")]
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_READINESS_RETRY_LIMIT,
            interval: DEFAULT_READINESS_INTERVAL,
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from optional template parameters. A limit of zero
    /// falls back to the default.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` for a malformed interval.
    pub fn from_params(limit: Option<u32>, interval: Option<&str>) -> Result<Self> {
        let defaults = Self::default();
        let interval = match interval.map(str::trim).filter(|s| !s.is_empty()) {
            Some(text) => humantime::parse_duration(text).map_err(|e| EphemeraError::Config {
                message: format!("invalid retry_interval `{text}`: {e}"),
            })?,
            None => defaults.interval,
        };
        Ok(Self {
            limit: limit.filter(|l| *l > 0).unwrap_or(defaults.limit),
            interval,
        })
    }

    /// Runs `probe` until its outcome equals `expect_success`.
    ///
    /// Returns `false` when the budget is exhausted or `cancel` fires.
    pub async fn poll<F, Fut>(
        &self,
        cancel: &CancellationToken,
        check: &str,
        expect_success: bool,
        mut probe: F,
    ) -> bool
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        for attempt in 0..self.limit {
            if attempt > 0 {
                tokio::select! {
                    () = cancel.cancelled() => return false,
                    () = tokio::time::sleep(self.interval) => {}
                }
            }

            let outcome = tokio::select! {
                () = cancel.cancelled() => return false,
                outcome = probe() => outcome,
            };
            if outcome == expect_success {
                tracing::debug!(check, attempt, expect_success, "readiness check matched");
                return true;
            }
            tracing::debug!(check, attempt, outcome, "readiness poll did not match");
        }

        tracing::warn!(check, limit = self.limit, expect_success, "readiness retry budget exhausted");
        false
    }
}

/// A declared readiness check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// HTTP GET polling.
    Http(HttpCheck),
    /// TCP or UDP dialing.
    Net(NetCheck),
}

impl ReadinessCheck {
    /// Builds a check of `kind` from its parameter object.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` for an unknown kind or invalid
    /// parameters.
    pub fn from_params(kind: &str, params: serde_json::Value) -> Result<Self> {
        match kind {
            "http" => HttpCheck::from_params(params).map(Self::Http),
            "net" => NetCheck::from_params(params).map(Self::Net),
            other => Err(EphemeraError::Config {
                message: format!("unknown readiness check kind `{other}`"),
            }),
        }
    }

    /// Substitutes placeholders in every string parameter.
    ///
    /// # Errors
    ///
    /// Returns the interpolator's error.
    pub fn interpolate_parameters(&mut self, interpolator: &dyn ParamInterpolator) -> Result<()> {
        match self {
            Self::Http(check) => check.interpolate_parameters(interpolator),
            Self::Net(check) => check.interpolate_parameters(interpolator),
        }
    }

    /// Polls until the check succeeds (`expect_success`) or fails
    /// (`!expect_success`). Cancellation yields `false`.
    pub async fn wait(&self, cancel: &CancellationToken, expect_success: bool) -> bool {
        match self {
            Self::Http(check) => check.wait(cancel, expect_success).await,
            Self::Net(check) => check.wait(cancel, expect_success).await,
        }
    }

    /// Returns the check's polling budget.
    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        match self {
            Self::Http(check) => check.retry,
            Self::Net(check) => check.retry,
        }
    }
}

impl fmt::Display for ReadinessCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(check) => write!(f, "http({})", check.url),
            Self::Net(check) => write!(f, "net({}://{})", check.protocol, check.address),
        }
    }
}

fn serialize_duration<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FixedHost;

    impl ParamInterpolator for FixedHost {
        fn interpolate(&self, text: &str) -> Result<String> {
            Ok(text.replace("{{ host }}", "127.0.0.1"))
        }
    }

    #[test]
    fn retry_policy_defaults_when_unset_or_zero() {
        let policy = RetryPolicy::from_params(Some(0), None).expect("policy");
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.limit, 5);
        assert_eq!(policy.interval, Duration::from_secs(2));
    }

    #[test]
    fn retry_policy_parses_interval() {
        let policy = RetryPolicy::from_params(Some(3), Some("250ms")).expect("policy");
        assert_eq!(policy.limit, 3);
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert!(RetryPolicy::from_params(None, Some("soon")).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = ReadinessCheck::from_params("grpc", serde_json::json!({})).expect_err("kind");
        assert!(err.to_string().contains("grpc"));
    }

    #[test]
    fn display_names_kind_and_target() {
        let mut check = ReadinessCheck::from_params(
            "net",
            serde_json::json!({"protocol": "tcp", "address": "{{ host }}:5432"}),
        )
        .expect("check");
        check.interpolate_parameters(&FixedHost).expect("interpolate");
        assert_eq!(check.to_string(), "net(tcp://127.0.0.1:5432)");
    }

    #[tokio::test]
    async fn poll_stops_at_first_matching_outcome() {
        let policy = RetryPolicy {
            limit: 5,
            interval: Duration::from_millis(5),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let matched = policy
            .poll(&CancellationToken::new(), "test", true, move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { n >= 2 }
            })
            .await;
        assert!(matched);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_gives_up_after_limit() {
        let policy = RetryPolicy {
            limit: 2,
            interval: Duration::from_millis(1),
        };
        let matched = policy
            .poll(&CancellationToken::new(), "test", true, || async { false })
            .await;
        assert!(!matched);
    }

    #[tokio::test]
    async fn poll_returns_false_when_cancelled() {
        let policy = RetryPolicy {
            limit: 100,
            interval: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let matched = policy.poll(&cancel, "test", true, || async { false }).await;
        assert!(!matched);
    }
}
