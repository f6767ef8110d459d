//! Backend readiness polling

use std::time::Duration;

use tokio::time::Instant;

use tether_core::config::BackoffConfig;
use tether_core::error::SupervisorError;

/// Exponential backoff between health probes
pub struct ExponentialBackoff {
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier)
    }

    /// Create a new backoff with custom parameters
    ///
    /// Multipliers below 1.0 (and NaN) are treated as 1.0, so delays never
    /// shrink toward zero.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier >= 1.0 {
            multiplier
        } else {
            tracing::warn!("Ignoring backoff multiplier {}, using 1.0", multiplier);
            1.0
        };
        Self {
            current: std::cmp::min(initial, max),
            max,
            multiplier,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = Duration::from_nanos((self.current.as_nanos() as f64 * self.multiplier).round() as u64);
        self.current = std::cmp::min(next, self.max);
        delay
    }
}

/// Client used for health probes; redirects count as healthy, so none are followed
pub fn probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_default()
}

/// Poll `<base_url>/version` until it answers 2xx or 3xx
///
/// Connection errors and other statuses are retried until `timeout` elapses.
/// Each probe is cut off at the deadline, so the call returns within backoff
/// granularity of `timeout`.
pub async fn wait_for_healthy(
    base_url: &str,
    timeout: Duration,
    backoff: &BackoffConfig,
) -> Result<(), SupervisorError> {
    let client = probe_client();
    let url = format!("{}/version", base_url.trim_end_matches('/'));
    let deadline = Instant::now() + timeout;
    let mut backoff = ExponentialBackoff::from_config(backoff);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let probe = match tokio::time::timeout(remaining, client.get(&url).send()).await {
            Ok(probe) => probe,
            Err(_) => {
                tracing::debug!("Health probe {} cut off at the deadline", attempts);
                return Err(SupervisorError::HealthCheckTimeout(timeout));
            }
        };
        match probe {
            Ok(response)
                if response.status().is_success() || response.status().is_redirection() =>
            {
                tracing::debug!("Backend healthy after {} probe(s)", attempts);
                return Ok(());
            }
            Ok(response) => {
                tracing::debug!("Health probe {} returned {}", attempts, response.status());
            }
            Err(e) => {
                tracing::debug!("Health probe {} failed: {}", attempts, e);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(SupervisorError::HealthCheckTimeout(timeout));
        }
        let delay = std::cmp::min(backoff.next_delay(), deadline - now);
        tokio::time::sleep(delay).await;
    }
}
