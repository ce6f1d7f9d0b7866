//! # Frigorec - Refrigeration Test Bench Recorder
//!
//! Frigorec is a real-time acquisition and quality-monitoring engine for
//! a refrigeration test bench. A single network source streams a tagged
//! binary record of 134 floating-point channels at roughly 1 Hz; the
//! engine routes those channels to up to three independent recording
//! posts, each an ongoing experiment with its own anomaly rules,
//! aggregation windows and persisted history.
//!
//! ## Quick Start
//!
//! ```no_run
//! use frigorec::{Engine, ExperimentSpec, PostId, RuntimeConfig};
//!
//! let config = RuntimeConfig::load("frigorec.json");
//! let engine = Engine::start(&config)?;
//! let recovered = engine.coordinator().begin_monitoring()?;
//! println!("{} experiments recovered", recovered.len());
//!
//! let channels = engine.coordinator().read_routing().a;
//! engine
//!     .coordinator()
//!     .start_post(PostId::A, ExperimentSpec::named("compressor burn-in"), &channels)?;
//! // ... record ...
//! engine.coordinator().stop_post(PostId::A)?;
//! engine.stop();
//! # Ok::<(), frigorec::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! A layered pipeline, each stage behind its own lock:
//! - **Transport**: one TCP link with automatic reconnect
//! - **Decoder**: resynchronising parser over the byte stream
//! - **Router**: channel to post fan-out
//! - **Detector / Aggregator**: per-post state machines and windows
//! - **Batch Writer / Store**: WAL-backed SQLite persistence
//! - **Coordinator / Maintenance**: lifecycle, checkpoints, health

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod maintenance;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod store;
pub mod transport;
pub mod types;

// Re-export the main public API
pub use crate::aggregator::{Aggregate, QualityFlag, WindowAggregator};
pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use crate::config::RuntimeConfig;
pub use crate::coordinator::{Coordinator, ExperimentSpec};
pub use crate::detector::{
    AnomalyDetector, AnomalyEvent, AnomalyKind, ChannelRule, DetectorOutcome, Severity,
};
pub use crate::engine::Engine;
pub use crate::error::{EngineError, Result};
pub use crate::events::{EngineEvent, EventBus};
pub use crate::health::HealthSnapshot;
pub use crate::protocol::{decoder::FrameDecoder, Sample};
pub use crate::registry::{ChannelDef, ChannelGroup, ChannelRegistry, CHANNEL_COUNT};
pub use crate::router::Router;
pub use crate::shutdown::Shutdown;
pub use crate::store::{BatchWriter, ExperimentRow, RawRow, Store};
pub use crate::transport::{LinkStatus, Transport, TransportStats};
pub use crate::types::{ExperimentState, PerPost, PostId};
