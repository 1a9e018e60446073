use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::rbmq::RabbitMqClient,
    models::{
        health::{HealthCheckResponse, HealthStatus, QueueInfo, ServiceHealth},
        status::ConnectionState,
    },
    store::{CounterStore, PreferenceRepository},
};

const BROKER: &str = "message_broker";
const COUNTER_STORE: &str = "counter_store";
const PREFERENCE_STORE: &str = "preference_store";

pub struct HealthChecker {
    broker: Arc<RabbitMqClient>,
    counters: Arc<dyn CounterStore>,
    preferences: Arc<dyn PreferenceRepository>,
}

impl HealthChecker {
    pub fn new(
        broker: Arc<RabbitMqClient>,
        counters: Arc<dyn CounterStore>,
        preferences: Arc<dyn PreferenceRepository>,
    ) -> Self {
        Self {
            broker,
            counters,
            preferences,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = BTreeMap::new();

        let broker_state = self.broker.state();
        checks.insert(BROKER.to_string(), broker_health(broker_state));

        checks.insert(COUNTER_STORE.to_string(), self.check_counters().await);
        checks.insert(PREFERENCE_STORE.to_string(), self.check_preferences().await);

        let queues = self.queue_depths(broker_state).await;

        HealthCheckResponse {
            status: overall_status(&checks),
            timestamp: Utc::now(),
            broker_state,
            checks,
            queues,
        }
    }

    async fn check_counters(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.counters.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Redis health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Redis health check failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
        }
    }

    async fn check_preferences(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.preferences.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    async fn queue_depths(&self, broker_state: ConnectionState) -> BTreeMap<String, QueueInfo> {
        let mut queues = BTreeMap::new();
        if broker_state != ConnectionState::Connected {
            return queues;
        }

        for queue in self.broker.topology().all_queues() {
            match self.broker.queue_info(&queue).await {
                Ok(info) => {
                    queues.insert(queue, info);
                }
                Err(e) => warn!(queue = %queue, error = %e, "Queue inspection failed"),
            }
        }

        queues
    }
}

fn broker_health(state: ConnectionState) -> ServiceHealth {
    match state {
        ConnectionState::Connected => ServiceHealth::healthy(0),
        ConnectionState::Connecting | ConnectionState::Reconnecting => {
            ServiceHealth::degraded(format!("Broker connection is {}", state))
        }
        ConnectionState::Unavailable => {
            ServiceHealth::unhealthy("Broker reconnection attempts exhausted".to_string())
        }
    }
}

fn overall_status(checks: &BTreeMap<String, ServiceHealth>) -> HealthStatus {
    let has_unhealthy = checks
        .values()
        .any(|health| health.status == HealthStatus::Unhealthy);

    let has_degraded = checks
        .values()
        .any(|health| health.status == HealthStatus::Degraded);

    if has_unhealthy {
        HealthStatus::Unhealthy
    } else if has_degraded {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
