//! JSON-over-HTTP calls to model services with retry and backoff.
//!
//! | Outcome | Classification | Retried |
//! |---------|----------------|---------|
//! | 2xx with JSON body | success | |
//! | 429, 5xx | `TransientService` | yes |
//! | timeout, connection error | `TransientService` | yes |
//! | other 4xx | `PermanentBatch` | no |
//! | 2xx with malformed body | `PermanentBatch` | no |
//!
//! Backoff doubles from `base_delay`: 1s, 2s, 4s, ... capped at 32× the base.

use std::time::Duration;

use lodestone_core::error::{LodestoneError, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.saturating_sub(1).min(5))
    }
}

/// Build a client whose every request times out after `timeout_secs`.
pub fn build_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}

/// POST `body` to `url` and return the decoded JSON response.
pub async fn post_json(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    policy: &RetryPolicy,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            tracing::debug!(service, attempt, ?delay, "retrying model service call");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return match response.json::<serde_json::Value>().await {
                        Ok(json) => Ok(json),
                        Err(e) if e.is_decode() => Err(LodestoneError::permanent(
                            service,
                            format!("malformed response: {}", e),
                        )),
                        Err(e) => Err(LodestoneError::transient(service, describe(&e))),
                    };
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(service, %status, attempt, "transient model service error");
                    last_err = Some(LodestoneError::transient(
                        service,
                        format!("HTTP {}: {}", status, body_text),
                    ));
                    continue;
                }

                return Err(LodestoneError::permanent(
                    service,
                    format!("HTTP {}: {}", status, body_text),
                ));
            }
            Err(e) => {
                tracing::warn!(service, attempt, error = %e, "model service request failed");
                last_err = Some(LodestoneError::transient(service, describe(&e)));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| LodestoneError::transient(service, "failed after retries")))
}
