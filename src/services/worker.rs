use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::{
    broker::DeliveryTag,
    clients::rbmq::RabbitMqClient,
    error::EngineError,
    models::channel::ChannelType,
    services::consumer::RetryController,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    Channel(ChannelType),
    Scheduled,
}

/// Consumes one queue for the life of the process. At most `concurrency`
/// deliveries are in flight at once; the broker-side prefetch caps how many
/// unacked messages it hands us. When the stream ends the worker waits for the
/// next connection generation and resubscribes; deliveries still in flight
/// from the old generation cannot be settled and are redelivered by the broker.
pub async fn run_queue_worker(
    client: Arc<RabbitMqClient>,
    controller: Arc<RetryController>,
    queue: String,
    role: QueueRole,
    concurrency: usize,
) -> Result<(), EngineError> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let consumer_tag = format!("{}_worker", queue);

    loop {
        let (mut consumer, generation) = match client.create_consumer(&queue, &consumer_tag).await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(queue = %queue, error = %e, "Could not start consumer, waiting for reconnect");
                let seen = client.generation();
                client.request_reconnect(seen);
                client.wait_for_reconnect(seen).await?;
                continue;
            }
        };

        info!(queue = %queue, ?role, concurrency, "Worker consuming");

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Consumer stream error");
                    break;
                }
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            let controller = Arc::clone(&controller);
            let queue_name = queue.clone();
            let tag = DeliveryTag::new(generation, delivery.delivery_tag);

            tokio::spawn(async move {
                let _permit = permit;
                let result = match role {
                    QueueRole::Channel(channel) => {
                        debug!(
                            queue = %queue_name,
                            %channel,
                            delivery = %tag,
                            "Handling delivery"
                        );
                        controller.handle_delivery(&delivery.data, tag).await
                    }
                    QueueRole::Scheduled => controller.forward_scheduled(&delivery.data, tag).await,
                };

                match result {
                    Ok(outcome) => debug!(queue = %queue_name, %outcome, "Message settled"),
                    Err(e) => error!(queue = %queue_name, error = %e, "Message handling failed"),
                }
            });
        }

        warn!(queue = %queue, generation, "Consumer stream ended, waiting for reconnect");
        client.request_reconnect(generation);
        client.wait_for_reconnect(generation).await?;
    }
}

/// Spawns one worker per channel queue plus the scheduled-queue forwarder.
pub fn spawn_workers(
    client: Arc<RabbitMqClient>,
    controller: Arc<RetryController>,
    concurrency: usize,
) -> Vec<tokio::task::JoinHandle<Result<(), EngineError>>> {
    let topology = client.topology().clone();

    let mut roles: Vec<(String, QueueRole)> = topology
        .channel_queues()
        .into_iter()
        .map(|(channel, queue)| (queue, QueueRole::Channel(channel)))
        .collect();
    roles.push((topology.scheduled_queue.clone(), QueueRole::Scheduled));

    roles
        .into_iter()
        .map(|(queue, role)| {
            tokio::spawn(run_queue_worker(
                Arc::clone(&client),
                Arc::clone(&controller),
                queue,
                role,
                concurrency,
            ))
        })
        .collect()
}
