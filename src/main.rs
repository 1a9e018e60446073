use std::sync::Arc;

use anyhow::{Error, Result};
use notification_engine::{
    api::{AppState, run_api_server},
    broker::MessageBroker,
    clients::{
        database::PostgresPreferenceRepository, health::HealthChecker, rbmq::RabbitMqClient,
        redis::RedisCounterStore,
    },
    config::Config,
    models::channel::ChannelType,
    services::{
        consumer::{HandlerRegistry, LogOnlyHandler, RetryController},
        engine::NotificationEngine,
        preferences::PreferenceStore,
        publisher::Publisher,
        rules::DeliveryRuleEngine,
        worker::spawn_workers,
    },
    store::{CounterStore, PreferenceRepository, cache::TtlCache},
    utils::init_tracing,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_json);

    let broker = RabbitMqClient::connect(&config).await?;

    let counters: Arc<dyn CounterStore> = Arc::new(
        RedisCounterStore::connect(&config.redis_url, config.store_retry_config()).await?,
    );

    let repository =
        PostgresPreferenceRepository::connect(&config.database_url, config.store_retry_config())
            .await?;
    repository.ensure_schema().await?;
    let repository: Arc<dyn PreferenceRepository> = Arc::new(repository);

    let preferences = Arc::new(PreferenceStore::new(
        Arc::clone(&repository),
        TtlCache::new(
            config.preference_cache_ttl(),
            config.preference_cache_capacity,
        ),
    ));
    let rules = Arc::new(DeliveryRuleEngine::new(
        Arc::clone(&preferences),
        Arc::clone(&counters),
        config.rate_limits(),
    ));

    let message_broker: Arc<dyn MessageBroker> = broker.clone();
    let publisher = Publisher::new(Arc::clone(&message_broker), config.topology());

    let handlers = ChannelType::ALL
        .into_iter()
        .fold(HandlerRegistry::new(), |registry, channel| {
            registry.register(channel, Arc::new(LogOnlyHandler))
        });

    let engine = Arc::new(NotificationEngine::new(
        preferences,
        rules,
        publisher.clone(),
        Arc::clone(&counters),
        config.cancellation_ttl(),
        config.max_retry_attempts,
    ));

    let controller = Arc::new(RetryController::new(
        message_broker,
        publisher,
        handlers,
        Arc::clone(&counters),
        config.retry_config(),
    ));

    let workers = spawn_workers(
        Arc::clone(&broker),
        controller,
        config.worker_concurrency,
    );
    info!(workers = workers.len(), "Queue workers started");

    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(Arc::clone(&broker), counters, repository),
        broker,
        engine,
    });

    tokio::select! {
        result = run_api_server(state, config.server_port) => {
            if let Err(e) = result {
                error!(error = %e, "Operations server stopped");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    for worker in workers {
        worker.abort();
    }

    info!("Notification engine stopped");

    Ok(())
}
