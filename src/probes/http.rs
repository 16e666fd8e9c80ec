//! HTTP GET probing
//!
//! One shared client, one GET per target with the target timeout. The body
//! is drained and discarded; response time covers the full exchange. Any
//! HTTP response counts as success regardless of status code, a transport
//! error is recorded as `request_failed:<err>`, and a deadline expiry is a
//! timeout.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::domain::{HttpKey, HttpResult, HttpTarget, ProbeStatus};
use crate::time_provider::SharedClock;

use super::Prober;

/// Runs HTTP GETs, concurrently across the batch
pub struct HttpProber {
    client: reqwest::Client,
    clock: SharedClock,
}

impl HttpProber {
    /// Creates the prober with a shared client.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the TLS backend cannot initialize.
    pub fn new(clock: SharedClock) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lightspeed-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, clock })
    }

    async fn probe_one(client: reqwest::Client, clock: SharedClock, target: HttpTarget) -> HttpResult {
        let target = target.normalized();
        let started = clock.instant();

        let response = client
            .get(&target.url)
            .timeout(target.timeout)
            .send()
            .await;

        let (status, status_code, error_code) = match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                // Drain and discard; a broken body after a received response
                // still counts as a response.
                if let Err(e) = resp.bytes().await {
                    debug!(url = %target.url, error = %e, "body drain failed");
                }
                (ProbeStatus::Success, Some(code), None)
            }
            Err(e) if e.is_timeout() => (ProbeStatus::Timeout, None, None),
            Err(e) => (
                ProbeStatus::Error,
                None,
                Some(format!("request_failed:{e}")),
            ),
        };

        HttpResult {
            status,
            response_time: started.elapsed().as_secs_f64() * 1000.0,
            status_code,
            error_code,
            last_checked: clock.now(),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    type Target = HttpTarget;
    type Key = HttpKey;
    type Output = HttpResult;

    fn class(&self) -> &'static str {
        "http"
    }

    fn key(target: &Self::Target) -> Self::Key {
        target.key()
    }

    async fn probe_all(&self, targets: &[Self::Target]) -> Vec<(Self::Key, Self::Output)> {
        let mut set = JoinSet::new();
        for target in targets.iter().cloned() {
            let client = self.client.clone();
            let clock = Arc::clone(&self.clock);
            let key = target.key();
            set.spawn(async move { (key, Self::probe_one(client, clock, target).await) });
        }

        let mut out = Vec::with_capacity(targets.len());
        while let Some(joined) = set.join_next().await {
            if let Ok(pair) = joined {
                out.push(pair);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::system_clock;

    #[tokio::test]
    async fn unroutable_url_is_a_transport_error() {
        let prober = HttpProber::new(system_clock()).unwrap();
        let target = HttpTarget {
            url: "http://host.invalid/".to_string(),
            timeout: std::time::Duration::from_secs(2),
        };
        let result = HttpProber::probe_one(prober.client.clone(), system_clock(), target).await;
        assert_eq!(result.status, ProbeStatus::Error);
        let code = result.error_code.unwrap();
        assert!(code.starts_with("request_failed:"), "got {code}");
        assert!(result.status_code.is_none());
    }
}
