//! HTTP readiness check.
//!
//! A poll succeeds when the GET response matches every configured
//! criterion: one of `codes` (any code when empty), one of the `headers`
//! maps (all headers of a map must match their pattern), and the `body`
//! pattern.

use std::collections::BTreeMap;

use ephemera_common::constants::READINESS_HTTP_TIMEOUT;
use ephemera_common::error::{EphemeraError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{ParamInterpolator, RetryPolicy};

#[derive(Debug, Deserialize)]
struct RawParams {
    url: String,
    #[serde(default)]
    codes: Vec<u16>,
    #[serde(default)]
    headers: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    retry_limit: Option<u32>,
    #[serde(default)]
    retry_interval: Option<String>,
}

/// Polls a URL until the response matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpCheck {
    /// Target URL.
    pub url: String,
    /// Accepted status codes; empty accepts any.
    pub codes: Vec<u16>,
    /// Alternative header sets, each mapping a header name to a pattern.
    pub headers: Vec<BTreeMap<String, String>>,
    /// Pattern the response body must match.
    pub body: Option<String>,
    /// Polling budget.
    pub retry: RetryPolicy,
}

struct Matchers {
    body: Option<Regex>,
    headers: Vec<Vec<(String, Regex)>>,
}

impl HttpCheck {
    /// Builds the check from its parameter object.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` if `url` is missing or a field has the
    /// wrong type.
    pub fn from_params(params: serde_json::Value) -> Result<Self> {
        let raw: RawParams = serde_json::from_value(params).map_err(|e| EphemeraError::Config {
            message: format!("invalid http readiness parameters: {e}"),
        })?;
        Ok(Self {
            url: raw.url,
            codes: raw.codes,
            headers: raw.headers,
            body: raw.body.filter(|b| !b.is_empty()),
            retry: RetryPolicy::from_params(raw.retry_limit, raw.retry_interval.as_deref())?,
        })
    }

    pub(crate) fn interpolate_parameters(
        &mut self,
        interpolator: &dyn ParamInterpolator,
    ) -> Result<()> {
        self.url = interpolator.interpolate(&self.url)?;
        if let Some(body) = &self.body {
            self.body = Some(interpolator.interpolate(body)?);
        }
        for set in &mut self.headers {
            for value in set.values_mut() {
                *value = interpolator.interpolate(value)?;
            }
        }
        let _ = self.matchers()?;
        Ok(())
    }

    fn matchers(&self) -> Result<Matchers> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| EphemeraError::Config {
                message: format!("invalid pattern `{pattern}` in {}: {e}", self.url),
            })
        };

        let body = self.body.as_deref().map(compile).transpose()?;
        let headers = self
            .headers
            .iter()
            .map(|set| {
                set.iter()
                    .map(|(name, pattern)| Ok((name.clone(), compile(pattern)?)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Matchers { body, headers })
    }

    pub(crate) async fn wait(&self, cancel: &CancellationToken, expect_success: bool) -> bool {
        let matchers = match self.matchers() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "http readiness check is invalid");
                return false;
            }
        };
        let client = match reqwest::Client::builder()
            .timeout(READINESS_HTTP_TIMEOUT)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "cannot build readiness HTTP client");
                return false;
            }
        };

        let check = format!("http({})", self.url);
        self.retry
            .poll(cancel, &check, expect_success, || self.probe(&client, &matchers))
            .await
    }

    async fn probe(&self, client: &reqwest::Client, matchers: &Matchers) -> bool {
        let response = match client.get(&self.url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "readiness request failed");
                return false;
            }
        };

        let status = response.status().as_u16();
        if !self.codes.is_empty() && !self.codes.contains(&status) {
            tracing::debug!(url = %self.url, status, "unexpected status code");
            return false;
        }

        if !matchers.headers.is_empty() {
            let headers = response.headers();
            let any_set_matches = matchers.headers.iter().any(|set| {
                set.iter().all(|(name, pattern)| {
                    headers
                        .get(name.as_str())
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| pattern.is_match(v))
                })
            });
            if !any_set_matches {
                tracing::debug!(url = %self.url, "headers mismatch");
                return false;
            }
        }

        match &matchers.body {
            Some(pattern) => match response.text().await {
                Ok(text) => pattern.is_match(&text),
                Err(e) => {
                    tracing::debug!(url = %self.url, error = %e, "cannot read response body");
                    false
                }
            },
            None => true,
        }
    }
}
