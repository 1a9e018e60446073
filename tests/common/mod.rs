use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notification_engine::{
    broker::{DeliveryTag, MessageBroker, OutboundMessage},
    error::{BrokerError, StoreError},
    models::{
        channel::{ChannelType, Priority},
        message::{NotificationJob, NotificationPayload},
        preference::NotificationPreference,
        retry::RetryConfig,
        topology::BrokerTopology,
    },
    services::{
        consumer::{DeliveryHandler, HandlerRegistry, RetryController},
        engine::NotificationEngine,
        preferences::PreferenceStore,
        publisher::Publisher,
        rules::{DeliveryRuleEngine, RateLimits},
    },
    store::{
        CounterStore, PreferenceRepository,
        cache::TtlCache,
        memory::{MemoryCounterStore, MemoryPreferenceRepository},
    },
};

pub const USER: &str = "user-1";
pub const ORG: &str = "org-1";

/// Broker double that records every publish and settlement.
#[derive(Default)]
pub struct RecordingBroker {
    published: Mutex<Vec<OutboundMessage>>,
    acks: Mutex<Vec<DeliveryTag>>,
    nacks: Mutex<Vec<(DeliveryTag, bool)>>,
    fail_publishes: AtomicBool,
    refuse_publishes: AtomicBool,
}

impl RecordingBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes return a broker error.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Publishes return `Ok(false)`.
    pub fn refuse_publishes(&self, refuse: bool) {
        self.refuse_publishes.store(refuse, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<OutboundMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.routing_key == routing_key)
            .collect()
    }

    pub fn last_published(&self) -> Option<OutboundMessage> {
        self.published.lock().unwrap().last().cloned()
    }

    pub fn acks(&self) -> Vec<DeliveryTag> {
        self.acks.lock().unwrap().clone()
    }

    pub fn nacks(&self) -> Vec<(DeliveryTag, bool)> {
        self.nacks.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageBroker for RecordingBroker {
    async fn publish(&self, message: OutboundMessage) -> Result<bool, BrokerError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection is reconnecting".to_string()));
        }
        if self.refuse_publishes.load(Ordering::SeqCst) {
            return Ok(false);
        }

        self.published.lock().unwrap().push(message);
        Ok(true)
    }

    async fn ack(&self, delivery: DeliveryTag) -> Result<(), BrokerError> {
        self.acks.lock().unwrap().push(delivery);
        Ok(())
    }

    async fn nack(&self, delivery: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.nacks.lock().unwrap().push((delivery, requeue));
        Ok(())
    }
}

/// Counter store whose every call fails.
pub struct FailingCounterStore;

fn redis_down() -> StoreError {
    StoreError::Unavailable("redis is down".to_string())
}

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn last_sent(&self, _key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Err(redis_down())
    }

    async fn mark_sent(
        &self,
        _key: &str,
        _at: DateTime<Utc>,
        _ttl: Duration,
    ) -> Result<(), StoreError> {
        Err(redis_down())
    }

    async fn count(&self, _key: &str) -> Result<u32, StoreError> {
        Err(redis_down())
    }

    async fn increment(&self, _key: &str, _window: Duration) -> Result<u32, StoreError> {
        Err(redis_down())
    }

    async fn set_flag(&self, _key: &str, _ttl: Duration) -> Result<(), StoreError> {
        Err(redis_down())
    }

    async fn has_flag(&self, _key: &str) -> Result<bool, StoreError> {
        Err(redis_down())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(redis_down())
    }
}

/// Preference repository whose every call fails.
pub struct FailingPreferenceRepository;

#[async_trait]
impl PreferenceRepository for FailingPreferenceRepository {
    async fn find(
        &self,
        _user_id: &str,
        _organization_id: &str,
    ) -> Result<Option<NotificationPreference>, StoreError> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    async fn save(&self, _preference: &NotificationPreference) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("database is down".to_string()))
    }
}

/// Handler that fails its first `failures` calls and succeeds afterwards.
pub struct ScriptedHandler {
    failures: u32,
    calls: AtomicU32,
}

impl ScriptedHandler {
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing(u32::MAX)
    }

    pub fn succeeding() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryHandler for ScriptedHandler {
    async fn deliver(&self, job: &NotificationJob) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if call <= self.failures {
            Err(anyhow!("smtp timeout on call {} for {}", call, job.id))
        } else {
            Ok(())
        }
    }
}

pub fn retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1_000,
        max_delay_ms: 300_000,
        backoff_multiplier: 2,
    }
}

pub fn email_job() -> NotificationJob {
    let payload = NotificationPayload {
        to: vec!["ada@example.com".to_string()],
        subject: Some("New message".to_string()),
        body: Some("You have a new message".to_string()),
        category: Some("message_received".to_string()),
        ..Default::default()
    };

    NotificationJob::new(ChannelType::Email, USER, ORG, payload)
}

pub fn job_with_priority(channel: ChannelType, priority: Priority) -> NotificationJob {
    let mut job = email_job();
    job.channel = channel;
    job.payload.priority = priority;
    job
}

pub fn preference_store(repository: Arc<dyn PreferenceRepository>) -> Arc<PreferenceStore> {
    Arc::new(PreferenceStore::new(
        repository,
        TtlCache::new(Duration::from_secs(300), 100),
    ))
}

/// Rule engine over in-memory stores.
pub struct RulesHarness {
    pub preferences: Arc<PreferenceStore>,
    pub counters: Arc<MemoryCounterStore>,
    pub rules: DeliveryRuleEngine,
}

impl RulesHarness {
    pub fn new() -> Self {
        let preferences = preference_store(Arc::new(MemoryPreferenceRepository::new()));
        let counters = Arc::new(MemoryCounterStore::new());
        let rules = DeliveryRuleEngine::new(
            Arc::clone(&preferences),
            counters.clone(),
            RateLimits::default(),
        );

        Self {
            preferences,
            counters,
            rules,
        }
    }
}

/// Retry controller wired to a recording broker.
pub struct ControllerHarness {
    pub broker: Arc<RecordingBroker>,
    pub publisher: Publisher,
    pub counters: Arc<MemoryCounterStore>,
    pub controller: RetryController,
}

impl ControllerHarness {
    pub fn new(handler: Arc<dyn DeliveryHandler>) -> Self {
        let broker = RecordingBroker::new();
        let counters = Arc::new(MemoryCounterStore::new());
        let publisher = Publisher::new(broker.clone(), BrokerTopology::default());

        let handlers = HandlerRegistry::new().register(ChannelType::Email, handler);
        let controller = RetryController::new(
            broker.clone(),
            publisher.clone(),
            handlers,
            counters.clone(),
            retry_config(),
        );

        Self {
            broker,
            publisher,
            counters,
            controller,
        }
    }
}

/// Facade over in-memory stores and a recording broker.
pub struct EngineHarness {
    pub broker: Arc<RecordingBroker>,
    pub counters: Arc<MemoryCounterStore>,
    pub engine: NotificationEngine,
}

impl EngineHarness {
    pub fn new() -> Self {
        let broker = RecordingBroker::new();
        let counters = Arc::new(MemoryCounterStore::new());
        let preferences = preference_store(Arc::new(MemoryPreferenceRepository::new()));
        let rules = Arc::new(DeliveryRuleEngine::new(
            Arc::clone(&preferences),
            counters.clone(),
            RateLimits::default(),
        ));
        let publisher = Publisher::new(broker.clone(), BrokerTopology::default());

        let engine = NotificationEngine::new(
            preferences,
            rules,
            publisher,
            counters.clone(),
            Duration::from_secs(60),
            3,
        );

        Self {
            broker,
            counters,
            engine,
        }
    }
}
