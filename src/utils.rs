use tokio::time::{Duration, sleep};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::models::retry::RetryConfig;

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// In-process retry for idempotent store writes. Job redelivery never goes
/// through here; the retry controller republishes through the broker instead.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "Store write succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_attempts => {
                warn!(
                    max_attempts = config.max_attempts,
                    error = %e,
                    "Store write failed after exhausting all attempts"
                );
                return Err(e);
            }
            Err(e) => {
                debug!(attempt, delay_ms, error = %e, "Store write failed, backing off");

                sleep(Duration::from_millis(jittered(delay_ms))).await;

                delay_ms = delay_ms
                    .saturating_mul(config.backoff_multiplier)
                    .min(config.max_delay_ms);
            }
        }
    }
}

fn jittered(delay_ms: u64) -> u64 {
    let jitter: f64 = rand::random_range(-0.1..=0.1);
    (delay_ms as f64 * (1.0 + jitter)) as u64
}
