use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    models::{
        retry::{ReconnectPolicy, RetryConfig},
        topology::BrokerTopology,
    },
    services::rules::RateLimits,
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_routing_exchange")]
    pub routing_exchange: String,
    #[serde(default = "default_delayed_exchange")]
    pub delayed_exchange: String,
    #[serde(default = "default_channel_queue_prefix")]
    pub channel_queue_prefix: String,
    #[serde(default = "default_scheduled_queue_name")]
    pub scheduled_queue_name: String,
    #[serde(default = "default_failed_queue_name")]
    pub failed_queue_name: String,
    #[serde(default = "default_dead_letter_queue_name")]
    pub dead_letter_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    pub redis_url: String,
    #[serde(default = "default_cancellation_ttl_seconds")]
    pub cancellation_ttl_seconds: u64,

    pub database_url: String,
    #[serde(default = "default_preference_cache_ttl_seconds")]
    pub preference_cache_ttl_seconds: u64,
    #[serde(default = "default_preference_cache_capacity")]
    pub preference_cache_capacity: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_rate_limit_email")]
    pub rate_limit_email: u32,
    #[serde(default = "default_rate_limit_sms")]
    pub rate_limit_sms: u32,
    #[serde(default = "default_rate_limit_push")]
    pub rate_limit_push: u32,
    #[serde(default = "default_rate_limit_in_app")]
    pub rate_limit_in_app: u32,
    #[serde(default = "default_rate_limit_webhook")]
    pub rate_limit_webhook: u32,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;

        if config.max_retry_attempts == 0 {
            return Err(anyhow!("MAX_RETRY_ATTEMPTS must be at least 1"));
        }
        if config.worker_concurrency == 0 || config.prefetch_count == 0 {
            return Err(anyhow!(
                "WORKER_CONCURRENCY and PREFETCH_COUNT must be at least 1"
            ));
        }

        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    /// Short in-process retry for Redis and Postgres writes.
    pub fn store_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay_ms: self.reconnect_delay_ms,
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn topology(&self) -> BrokerTopology {
        BrokerTopology {
            routing_exchange: self.routing_exchange.clone(),
            delayed_exchange: self.delayed_exchange.clone(),
            channel_queue_prefix: self.channel_queue_prefix.clone(),
            scheduled_queue: self.scheduled_queue_name.clone(),
            failed_queue: self.failed_queue_name.clone(),
            dead_letter_queue: self.dead_letter_queue_name.clone(),
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            email: self.rate_limit_email,
            sms: self.rate_limit_sms,
            push: self.rate_limit_push,
            in_app: self.rate_limit_in_app,
            webhook: self.rate_limit_webhook,
        }
    }

    pub fn preference_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.preference_cache_ttl_seconds)
    }

    pub fn cancellation_ttl(&self) -> Duration {
        Duration::from_secs(self.cancellation_ttl_seconds)
    }
}

fn default_routing_exchange() -> String {
    BrokerTopology::default().routing_exchange
}

fn default_delayed_exchange() -> String {
    BrokerTopology::default().delayed_exchange
}

fn default_channel_queue_prefix() -> String {
    BrokerTopology::default().channel_queue_prefix
}

fn default_scheduled_queue_name() -> String {
    BrokerTopology::default().scheduled_queue
}

fn default_failed_queue_name() -> String {
    BrokerTopology::default().failed_queue
}

fn default_dead_letter_queue_name() -> String {
    BrokerTopology::default().dead_letter_queue
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_worker_concurrency() -> usize {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_cancellation_ttl_seconds() -> u64 {
    7 * 24 * 60 * 60
}

fn default_preference_cache_ttl_seconds() -> u64 {
    300
}

fn default_preference_cache_capacity() -> u64 {
    10_000
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    300_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_rate_limit_email() -> u32 {
    RateLimits::default().email
}

fn default_rate_limit_sms() -> u32 {
    RateLimits::default().sms
}

fn default_rate_limit_push() -> u32 {
    RateLimits::default().push
}

fn default_rate_limit_in_app() -> u32 {
    RateLimits::default().in_app
}

fn default_rate_limit_webhook() -> u32 {
    RateLimits::default().webhook
}

fn default_server_port() -> u16 {
    8080
}
