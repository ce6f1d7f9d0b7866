//! Engine assembly and graceful teardown.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::clock::{SharedClock, SystemClock};
use crate::config::RuntimeConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::maintenance;
use crate::registry::ChannelRegistry;
use crate::router::Router;
use crate::shutdown::Shutdown;
use crate::store::{BatchWriter, BatchWriterConfig, Store};
use crate::transport::{Transport, TransportConfig};

/// A fully wired engine: store, transport, ingest pipeline, coordinator
/// and maintenance loop.
pub struct Engine {
    coordinator: Arc<Coordinator>,
    bus: Arc<EventBus>,
    shutdown: Arc<Shutdown>,
    maintenance: Option<JoinHandle<()>>,
}

impl Engine {
    /// Boots every component. A store bootstrap failure is returned (and
    /// by policy aborts the process); everything else starts degraded and
    /// recovers at runtime.
    pub fn start(config: &RuntimeConfig) -> Result<Engine> {
        Self::start_with_clock(config, Arc::new(SystemClock))
    }

    pub fn start_with_clock(config: &RuntimeConfig, clock: SharedClock) -> Result<Engine> {
        let registry = Arc::new(ChannelRegistry::bootstrap()?);
        let store = Arc::new(Store::open(&config.database_path, &registry)?);
        let shutdown = Shutdown::new();
        let bus = Arc::new(EventBus::new());
        let writer = Arc::new(BatchWriter::new(
            Arc::clone(&store),
            BatchWriterConfig::default(),
            Arc::clone(&clock),
        ));
        let router = Arc::new(Router::new());
        let (transport, events) = Transport::new(
            TransportConfig {
                host: config.transmitter_host.clone(),
                port: config.transmitter_port,
                connect_timeout: config.connection_timeout(),
            },
            Arc::clone(&shutdown),
            Arc::clone(&clock),
        );
        let coordinator = Coordinator::spawn(
            registry,
            store,
            writer,
            router,
            transport,
            Arc::clone(&bus),
            clock,
            Arc::clone(&shutdown),
            events,
        )?;
        let maintenance = maintenance::spawn(Arc::clone(&coordinator), Arc::clone(&shutdown))?;
        info!("engine started");
        Ok(Engine {
            coordinator,
            bus,
            shutdown,
            maintenance: Some(maintenance),
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub fn shutdown_token(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Graceful teardown: cancel maintenance, close the link, flush the
    /// writer, checkpoint and dispose the store.
    pub fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.maintenance.take() {
            let _ = handle.join();
        }
        self.coordinator.shutdown();
        info!("engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish()
    }
}
