use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::record::ExecutionRecord;

/// Header carrying the record token on every callback request.
pub const TOKEN_HEADER: &str = "X-Runbox-Token";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded retry with exponential backoff: the delay after attempt `n` is
/// `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Converts a finished record into the callback payload. Submissions and
/// gradings each supply their own converter, the dispatcher is agnostic.
pub type PayloadConverter = fn(&ExecutionRecord) -> serde_json::Value;

/// Delivers finished results to caller-supplied callback URLs. Delivery runs
/// on its own task and its failure never touches the execution record.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    policy: RetryPolicy,
    enabled: bool,
}

impl WebhookDispatcher {
    pub fn new(policy: RetryPolicy, enabled: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            policy,
            enabled,
        }
    }

    /// Rejects anything that is not an http(s) URL with a host, before any
    /// delivery is attempted.
    pub fn validate_url(raw: &str) -> Result<Url, String> {
        let url = Url::parse(raw).map_err(|e| format!("invalid callback URL: {e}"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(format!("unsupported callback scheme: {}", url.scheme()));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err("callback URL has no host".to_string());
        }
        Ok(url)
    }

    /// Fire-and-forget notification for a finished record. A blank URL or a
    /// disabled callback feature is a logged no-op, not an error.
    pub fn dispatch(self: &Arc<Self>, record: &ExecutionRecord, convert: PayloadConverter) {
        let Some(raw_url) = record
            .constraints
            .callback_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
        else {
            return;
        };

        if !self.enabled {
            log::info!(
                "Callbacks are disabled, skipping notification for {}",
                record.token
            );
            return;
        }

        let url = match Self::validate_url(raw_url) {
            Ok(url) => url,
            Err(e) => {
                log::warn!("Not delivering callback for {}: {e}", record.token);
                return;
            }
        };

        let payload = convert(record);
        let token = record.token.clone();
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.deliver(url, &token, &payload).await;
        });
    }

    /// PUTs the payload, retrying on non-2xx responses and transport errors.
    /// Returns whether a delivery succeeded within the attempt bound.
    pub async fn deliver(&self, url: Url, token: &str, payload: &serde_json::Value) -> bool {
        for attempt in 1..=self.policy.max_attempts {
            let response = self
                .client
                .put(url.clone())
                .header(TOKEN_HEADER, token)
                .json(payload)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    log::debug!("Callback for {token} delivered on attempt {attempt}");
                    return true;
                }
                Ok(resp) => {
                    log::warn!(
                        "Callback for {token} got {} on attempt {attempt}",
                        resp.status()
                    );
                }
                Err(e) => {
                    log::warn!("Callback for {token} failed on attempt {attempt}: {e}");
                }
            }

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.delay(attempt)).await;
            }
        }

        log::warn!(
            "Giving up on callback for {token} after {} attempts",
            self.policy.max_attempts
        );
        false
    }
}
