use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch},
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::BrokerError,
    models::{retry::ReconnectPolicy, status::ConnectionState},
};

/// Opens and tears down the transport behind a [`ConnectionLink`]. `open`
/// must tag everything it creates with `generation` and forward connection
/// errors to `requests`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        generation: u64,
        requests: mpsc::UnboundedSender<u64>,
    ) -> Result<(), BrokerError>;

    async fn close(&self);
}

/// Connection state shared between the broker client, its workers and the
/// reconnect supervisor. Only the supervisor reconnects; everyone else asks
/// through [`ConnectionLink::request_reconnect`].
pub struct ConnectionLink {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    requests: mpsc::UnboundedSender<u64>,
}

impl ConnectionLink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<u64>) {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (requests, receiver) = mpsc::unbounded_channel();

        let link = Arc::new(Self {
            state,
            generation: AtomicU64::new(0),
            requests,
        });

        (link, receiver)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Incremented every time a connection (and its topology) is established.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn ensure_connected(&self) -> Result<(), BrokerError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(BrokerError::Unavailable(format!("connection is {}", state))),
        }
    }

    /// Asks the supervisor to replace the connection identified by
    /// `seen_generation`. Stale requests are dropped by the supervisor.
    pub fn request_reconnect(&self, seen_generation: u64) {
        if self.requests.send(seen_generation).is_err() {
            debug!(seen_generation, "Reconnect supervisor stopped, request dropped");
        }
    }

    pub fn mark_unavailable(&self) {
        self.state.send_replace(ConnectionState::Unavailable);
    }

    /// Opens the next generation through `connector` and marks it connected.
    pub async fn open(&self, connector: &dyn Connector) -> Result<u64, BrokerError> {
        let generation = self.generation() + 1;
        connector.open(generation, self.requests.clone()).await?;

        self.generation.store(generation, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);

        Ok(generation)
    }

    /// Waits until a connection newer than `seen_generation` is up.
    pub async fn wait_for_reconnect(&self, seen_generation: u64) -> Result<(), BrokerError> {
        let mut state = self.state.subscribe();

        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Unavailable => {
                    return Err(BrokerError::Unavailable(
                        "reconnection attempts exhausted".to_string(),
                    ));
                }
                ConnectionState::Connected if self.generation() > seen_generation => {
                    return Ok(());
                }
                _ => {}
            }

            state
                .changed()
                .await
                .map_err(|_| BrokerError::Unavailable("connection state closed".to_string()))?;
        }
    }
}

/// Serves reconnect requests one at a time until the connector is dropped.
/// Each cycle waits `delay * attempt` before attempt `n`; after
/// `max_attempts` failures the link is marked unavailable for good.
pub async fn supervise(
    link: Arc<ConnectionLink>,
    connector: Weak<dyn Connector>,
    policy: ReconnectPolicy,
    mut requests: mpsc::UnboundedReceiver<u64>,
) {
    while let Some(seen_generation) = requests.recv().await {
        let Some(connector) = connector.upgrade() else {
            break;
        };

        if link.generation() != seen_generation {
            debug!(seen_generation, "Connection already replaced, skipping reconnect");
            continue;
        }
        if link.state() == ConnectionState::Unavailable {
            debug!("Reconnect requested after giving up, ignoring");
            continue;
        }

        link.state.send_replace(ConnectionState::Reconnecting);
        connector.close().await;

        if !reconnect(&link, connector.as_ref(), &policy).await {
            error!(
                max_attempts = policy.max_attempts,
                "RabbitMQ reconnection attempts exhausted, broker marked unavailable"
            );
            link.mark_unavailable();
        }
    }

    debug!("Reconnect supervisor stopped");
}

async fn reconnect(link: &ConnectionLink, connector: &dyn Connector, policy: &ReconnectPolicy) -> bool {
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to RabbitMQ"
        );
        sleep(delay).await;

        match link.open(connector).await {
            Ok(generation) => {
                info!(attempt, generation, "RabbitMQ reconnected");
                return true;
            }
            Err(e) => warn!(attempt, error = %e, "RabbitMQ reconnect attempt failed"),
        }
    }

    false
}
