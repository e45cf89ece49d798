//! TCP/UDP readiness check: a poll succeeds when dialing `address` works.

use ephemera_common::constants::READINESS_DIAL_TIMEOUT;
use ephemera_common::error::{EphemeraError, Result};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use super::{ParamInterpolator, RetryPolicy};

#[derive(Debug, Deserialize)]
struct RawParams {
    #[serde(default = "default_protocol")]
    protocol: String,
    address: String,
    #[serde(default)]
    retry_limit: Option<u32>,
    #[serde(default)]
    retry_interval: Option<String>,
}

fn default_protocol() -> String {
    "tcp".into()
}

/// Dials an address until it answers (or stops answering).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetCheck {
    /// `tcp` or `udp`, optionally suffixed with `4` or `6`.
    pub protocol: String,
    /// `host:port` to dial.
    pub address: String,
    /// Polling budget.
    pub retry: RetryPolicy,
}

impl NetCheck {
    /// Builds the check from its parameter object.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` for a missing address or an unknown
    /// protocol.
    pub fn from_params(params: serde_json::Value) -> Result<Self> {
        let raw: RawParams = serde_json::from_value(params).map_err(|e| EphemeraError::Config {
            message: format!("invalid net readiness parameters: {e}"),
        })?;
        let protocol = raw.protocol.to_ascii_lowercase();
        if !matches!(protocol.as_str(), "tcp" | "tcp4" | "tcp6" | "udp" | "udp4" | "udp6") {
            return Err(EphemeraError::Config {
                message: format!("unsupported net readiness protocol `{}`", raw.protocol),
            });
        }
        Ok(Self {
            protocol,
            address: raw.address,
            retry: RetryPolicy::from_params(raw.retry_limit, raw.retry_interval.as_deref())?,
        })
    }

    pub(crate) fn interpolate_parameters(
        &mut self,
        interpolator: &dyn ParamInterpolator,
    ) -> Result<()> {
        self.address = interpolator.interpolate(&self.address)?;
        Ok(())
    }

    pub(crate) async fn wait(&self, cancel: &CancellationToken, expect_success: bool) -> bool {
        let check = format!("net({}://{})", self.protocol, self.address);
        self.retry
            .poll(cancel, &check, expect_success, || self.dial())
            .await
    }

    async fn dial(&self) -> bool {
        let attempt = async {
            if self.protocol.starts_with("udp") {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(self.address.as_str()).await?;
            } else {
                let _stream = TcpStream::connect(self.address.as_str()).await?;
            }
            Ok::<(), std::io::Error>(())
        };

        match tokio::time::timeout(READINESS_DIAL_TIMEOUT, attempt).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(address = %self.address, error = %e, "dial failed");
                false
            }
            Err(_) => {
                tracing::debug!(address = %self.address, "dial timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    fn check(address: &str, limit: u32) -> NetCheck {
        NetCheck::from_params(serde_json::json!({
            "protocol": "tcp",
            "address": address,
            "retry_limit": limit,
            "retry_interval": "10ms"
        }))
        .expect("params")
    }

    #[test]
    fn protocol_defaults_to_tcp() {
        let check = NetCheck::from_params(serde_json::json!({"address": "db:5432"})).expect("params");
        assert_eq!(check.protocol, "tcp");
        assert_eq!(check.retry, RetryPolicy::default());
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let err = NetCheck::from_params(serde_json::json!({"protocol": "sctp", "address": "x:1"}))
            .expect_err("protocol");
        assert!(err.to_string().contains("sctp"));
    }

    #[tokio::test]
    async fn wait_succeeds_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        assert!(check(&address, 3).wait(&CancellationToken::new(), true).await);
    }

    #[tokio::test]
    async fn wait_for_failure_after_listener_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let check = check(&address, 3);
        assert!(check.wait(&CancellationToken::new(), false).await);
        assert!(!check.wait(&CancellationToken::new(), true).await);
    }
}
