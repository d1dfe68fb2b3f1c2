//! Infrastructure wiring: queue store, bus, publisher, and processor worker.

use std::sync::Arc;

use tracing::{info, warn};

use hireloop_events::{BusError, EventBus, InMemoryEventBus};
#[cfg(feature = "redis")]
use hireloop_infra::event_bus::RedisPubSubBus;
use hireloop_infra::event_bus::ChangePublisher;
use hireloop_infra::jobs::{
    HttpUploadProcessor, InMemoryQueueStore, PostgresQueueStore, ProcessorWorker, QueueStore,
    StoreError, UploadQueue, WorkerHandle,
};
use hireloop_observability::HealthRegistry;

use crate::bridge::ConnectionRegistry;
use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("queue store: {0}")]
    Store(#[from] StoreError),
    #[error("event bus: {0}")]
    Bus(#[from] BusError),
}

/// Shared services for one process.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn QueueStore>,
    pub bus: Arc<dyn EventBus<String>>,
    pub publisher: ChangePublisher,
    pub queue: UploadQueue,
    pub registry: Arc<ConnectionRegistry>,
    pub health: HealthRegistry,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("publisher", &self.publisher)
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl AppServices {
    /// Wire services over explicit store and bus (tests, embedding).
    pub fn new(
        store: Arc<dyn QueueStore>,
        bus: Arc<dyn EventBus<String>>,
        config: &AppConfig,
    ) -> Self {
        let publisher = ChangePublisher::new(store.clone(), bus.clone(), config.event_mode);
        let queue = UploadQueue::new(store.clone(), publisher.clone());
        Self {
            store,
            bus,
            publisher,
            queue,
            registry: ConnectionRegistry::arc(config.socket_buffer),
            health: HealthRegistry::new(),
        }
    }

    /// In-process store and bus; nothing leaves this process.
    pub fn in_memory(config: &AppConfig) -> Self {
        Self::new(
            InMemoryQueueStore::arc(),
            Arc::new(InMemoryEventBus::<String>::new()),
            config,
        )
    }

    /// Start the Processor Worker if this process should run one.
    ///
    /// Enqueues through `self.queue` wake it from then on.
    pub fn spawn_worker(&mut self, config: &AppConfig) -> Option<WorkerHandle> {
        if !config.worker_enabled {
            info!("processor worker disabled; running bridge-only");
            return None;
        }
        let Some(url) = config.processor_url.as_deref() else {
            warn!("UPLOAD_PROCESSOR_URL is unset; running bridge-only");
            return None;
        };

        let processor = Arc::new(HttpUploadProcessor::new(url));
        let worker = ProcessorWorker::new(
            self.store.clone(),
            processor.clone(),
            self.publisher.clone(),
            config.worker.clone(),
            self.health.clone(),
        );
        let handle = worker.spawn();
        self.queue = self.queue.clone().with_wake(handle.wake_signal());
        info!(processor_url = %processor.url(), "processor worker started");
        Some(handle)
    }
}

/// Build services from configuration: Postgres when `DATABASE_URL` is set,
/// Redis when `REDIS_URL` is set and the `redis` feature is on.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServiceError> {
    let store: Arc<dyn QueueStore> = match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresQueueStore::connect(url).await?;
            store.ensure_schema().await?;
            info!("using postgres queue store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory queue store");
            InMemoryQueueStore::arc()
        }
    };

    let bus = build_bus(config)?;
    let services = AppServices::new(store, bus, config);
    info!(event_mode = ?services.publisher.mode(), "change publisher ready");
    Ok(services)
}

fn build_bus(config: &AppConfig) -> Result<Arc<dyn EventBus<String>>, ServiceError> {
    if let Some(url) = config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        {
            let bus = RedisPubSubBus::new(url, config.queue_channel.clone())?;
            info!(channel = %bus.channel(), "using redis pub/sub bus");
            return Ok(Arc::new(bus));
        }
        #[cfg(not(feature = "redis"))]
        {
            let _ = url;
            warn!("REDIS_URL set but redis feature not enabled, falling back to in-process bus");
        }
    }
    Ok(Arc::new(InMemoryEventBus::<String>::new()))
}
