//! Experiment coordination.
//!
//! Owns the per-post state machines, drives lifecycle commands from the
//! application, persists what the detectors and aggregators produce, and
//! keeps the authoritative routing table. A rejected lifecycle command is
//! a reported no-op, never a panic.

mod experiment;

pub use experiment::ExperimentSpec;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::detector::{AnomalyDetector, DetectorOutcome, Severity};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::health::{HealthSnapshot, PostHealth};
use crate::protocol::commands::{relay_control, START_RECORDING, STOP_RECORDING};
use crate::protocol::decoder::FrameDecoder;
use crate::protocol::Sample;
use crate::registry::ChannelRegistry;
use crate::router::{PostPipeline, Router};
use crate::shutdown::Shutdown;
use crate::store::{
    BatchWriter, CheckpointRow, ExperimentRow, RawRow, Store, SystemEventRow, UiChannelConfig,
};
use crate::transport::{LinkStatus, Transport, TransportConfig, TransportEvent};
use crate::types::{ExperimentState, PerPost, PostId};

/// Per-post bookkeeping held by the coordinator.
#[derive(Debug)]
struct PostSlot {
    state: ExperimentState,
    experiment_id: Option<String>,
    pipeline: Option<Arc<PostPipeline>>,
    anomaly_count: u64,
    checkpoint_interval_secs: u32,
}

impl Default for PostSlot {
    fn default() -> Self {
        Self {
            state: ExperimentState::Idle,
            experiment_id: None,
            pipeline: None,
            anomaly_count: 0,
            checkpoint_interval_secs: 30,
        }
    }
}

pub struct Coordinator {
    registry: Arc<ChannelRegistry>,
    store: Arc<Store>,
    writer: Arc<BatchWriter>,
    router: Arc<Router>,
    transport: Arc<Transport>,
    bus: Arc<EventBus>,
    clock: SharedClock,
    shutdown: Arc<Shutdown>,
    posts: Mutex<PerPost<PostSlot>>,
    recovery_done: AtomicBool,
    /// Samples routed since the last health tick.
    samples_tick: AtomicU64,
    ingest: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builds the coordinator and starts the ingest pipeline over the
    /// transport's event stream.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        registry: Arc<ChannelRegistry>,
        store: Arc<Store>,
        writer: Arc<BatchWriter>,
        router: Arc<Router>,
        transport: Arc<Transport>,
        bus: Arc<EventBus>,
        clock: SharedClock,
        shutdown: Arc<Shutdown>,
        events: Receiver<TransportEvent>,
    ) -> Result<Arc<Self>> {
        let coordinator = Arc::new(Self {
            registry,
            store,
            writer,
            router,
            transport,
            bus,
            clock,
            shutdown,
            posts: Mutex::new(PerPost::default()),
            recovery_done: AtomicBool::new(false),
            samples_tick: AtomicU64::new(0),
            ingest: Mutex::new(None),
        });
        let worker = Arc::clone(&coordinator);
        let handle = thread::Builder::new()
            .name("frigorec-ingest".to_string())
            .spawn(move || worker.ingest_loop(events))
            .map_err(EngineError::Io)?;
        *coordinator.ingest.lock() = Some(handle);
        Ok(coordinator)
    }

    // ── ingest pipeline ──────────────────────────────────────────────

    fn ingest_loop(self: Arc<Self>, events: Receiver<TransportEvent>) {
        let mut decoder = FrameDecoder::new(Arc::clone(&self.registry), Arc::clone(&self.clock));
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            let event = match events.recv_timeout(Duration::from_millis(500)) {
                Ok(event) => event,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
            };
            match event {
                TransportEvent::Connected => {
                    decoder.reset();
                    self.bus.publish(EngineEvent::Link(LinkStatus::Connected));
                }
                TransportEvent::Disconnected => {
                    self.bus
                        .publish(EngineEvent::Link(self.transport.status()));
                }
                TransportEvent::Data(chunk) => {
                    for sample in decoder.feed(&chunk) {
                        self.route_sample(&sample);
                    }
                }
            }
        }
    }

    fn route_sample(&self, sample: &Sample) {
        self.samples_tick.fetch_add(1, Ordering::Relaxed);
        let deliveries = self.router.dispatch(sample);
        for delivery in deliveries {
            self.writer.add(std::iter::once(RawRow {
                experiment_id: delivery.experiment_id.to_string(),
                timestamp: sample.timestamp,
                channel: sample.channel,
                value: sample.raw,
                is_valid: sample.is_valid(),
            }));
            if self.bus.has_subscribers() {
                self.bus.publish(EngineEvent::ChannelValue {
                    post: delivery.post,
                    channel: sample.channel,
                    value: sample.value(),
                    timestamp: sample.timestamp,
                });
            }
            self.apply_outcomes(delivery.post, &delivery.experiment_id, delivery.outcomes);
        }
    }

    /// Persists and publishes what a detector pass produced.
    fn apply_outcomes(&self, post: PostId, experiment_id: &str, outcomes: Vec<DetectorOutcome>) {
        for outcome in outcomes {
            match outcome {
                DetectorOutcome::Open(event) | DetectorOutcome::Instant(event) => {
                    if event.severity == Severity::Critical {
                        warn!(post = %post, channel = event.channel, kind = event.kind.as_str(),
                              "{}", event.message);
                    }
                    if event.kind.counts_as_anomaly() {
                        self.posts.lock().get_mut(post).anomaly_count += 1;
                    }
                    if let Err(err) = self.store.record_anomaly(experiment_id, &event) {
                        error!(%err, "anomaly event write failed");
                    }
                    self.bus.publish(EngineEvent::Anomaly { post, event });
                }
                DetectorOutcome::Close { channel, kind, at } => {
                    if let Err(err) = self.store.close_anomaly(experiment_id, channel, kind, at) {
                        error!(%err, "anomaly close failed");
                    }
                }
            }
        }
    }

    // ── monitoring lifecycle ─────────────────────────────────────────

    /// Updates the transmitter endpoint; applies on the next connect.
    pub fn configure(&self, host: &str, port: u16, connect_timeout: Duration) {
        self.transport.set_config(TransportConfig {
            host: host.to_string(),
            port,
            connect_timeout,
        });
    }

    /// Ensures the transport is up and, on the first call after process
    /// start, reassigns interrupted experiments to `Recovered`. Returns
    /// the recovered rows.
    pub fn begin_monitoring(&self) -> Result<Vec<ExperimentRow>> {
        let recovered = if !self.recovery_done.swap(true, Ordering::AcqRel) {
            match self.recover_interrupted() {
                Ok(rows) => rows,
                Err(err) => {
                    // Allow a later call to retry the recovery pass.
                    self.recovery_done.store(false, Ordering::Release);
                    return Err(err);
                }
            }
        } else {
            Vec::new()
        };
        match self.transport.status() {
            LinkStatus::Connected | LinkStatus::Connecting | LinkStatus::Reconnecting => {}
            // Connect failure surfaces through the status enum and the
            // log; monitoring setup itself still succeeds.
            _ => {
                if let Err(err) = self.transport.connect() {
                    warn!(%err, "transmitter link not available");
                }
            }
        }
        Ok(recovered)
    }

    fn recover_interrupted(&self) -> Result<Vec<ExperimentRow>> {
        let now = self.clock.now();
        let recovered = self.store.recover_interrupted(now)?;
        for row in &recovered {
            info!(experiment = %row.id, "experiment recovered after abnormal shutdown");
            self.journal(
                Some(row.id.clone()),
                "experiment_recovered",
                Severity::Warning,
                format!("experiment '{}' recovered after abnormal shutdown", row.name),
            );
        }
        Ok(recovered)
    }

    // ── per-post lifecycle ───────────────────────────────────────────

    /// Starts a run on an idle post. Installs detector rules from the
    /// catalogue plus UI overrides, a fresh aggregator, and the routing
    /// entries; the first running post also starts remote recording.
    pub fn start_post(
        &self,
        post: PostId,
        spec: ExperimentSpec,
        channel_indices: &[u16],
    ) -> Result<String> {
        let now = self.clock.now();
        let id = uuid::Uuid::new_v4().to_string();
        {
            let posts = self.posts.lock();
            let slot = posts.get(post);
            if slot.state != ExperimentState::Idle {
                return Err(EngineError::Rejected(format!(
                    "post {post} is {}, expected Idle",
                    slot.state
                )));
            }
        }
        let channels: Vec<u16> = {
            let mut list: Vec<u16> = channel_indices
                .iter()
                .copied()
                .filter(|&ch| self.registry.get(ch).is_some())
                .collect();
            list.sort_unstable();
            list.dedup();
            list
        };
        if channels.is_empty() {
            return Err(EngineError::Rejected(format!(
                "post {post}: no valid channels to record"
            )));
        }

        let row = spec.to_row(&id, post, now);
        self.store.create_experiment(&row)?;

        let overrides: FxHashMap<u16, UiChannelConfig> = self
            .store
            .ui_channel_configs()
            .into_iter()
            .map(|cfg| (cfg.channel, cfg))
            .collect();
        let (rules, intervals, config_rows) =
            experiment::build_channel_setup(&self.registry, &overrides, &channels, &spec);
        self.store.write_channel_configs(&id, &config_rows)?;

        let detector = AnomalyDetector::new(rules, now);
        let aggregator = crate::aggregator::WindowAggregator::new(intervals);
        let pipeline = Arc::new(PostPipeline::new(post, id.as_str(), detector, aggregator));

        let first_running = !self.router.any_active();
        self.router.install(Arc::clone(&pipeline), &channels);
        {
            let mut posts = self.posts.lock();
            let slot = posts.get_mut(post);
            slot.state = ExperimentState::Running;
            slot.experiment_id = Some(id.clone());
            slot.pipeline = Some(pipeline);
            slot.anomaly_count = 0;
            slot.checkpoint_interval_secs = spec.checkpoint_interval_secs.max(1);
        }
        if first_running {
            if let Err(err) = self.transport.send(&START_RECORDING) {
                warn!(%err, "start recording command failed");
            }
        }
        info!(post = %post, experiment = %id, channels = channels.len(), "experiment started");
        self.journal(
            Some(id.clone()),
            "experiment_started",
            Severity::Info,
            format!("experiment '{}' started on post {post}", spec.name),
        );
        self.bus.publish(EngineEvent::PostState {
            post,
            state: ExperimentState::Running,
        });
        Ok(id)
    }

    pub fn pause_post(&self, post: PostId) -> Result<()> {
        let experiment_id = {
            let mut posts = self.posts.lock();
            let slot = posts.get_mut(post);
            if slot.state != ExperimentState::Running {
                return Err(EngineError::Rejected(format!(
                    "post {post} is {}, expected Running",
                    slot.state
                )));
            }
            slot.state = ExperimentState::Paused;
            if let Some(pipeline) = &slot.pipeline {
                pipeline.set_paused(true);
            }
            slot.experiment_id.clone()
        };
        if let Some(id) = experiment_id {
            // State column follows along; a write failure only logs.
            if let Err(err) =
                self.store
                    .set_experiment_state(&id, ExperimentState::Paused, self.clock.now())
            {
                error!(%err, "pause state write failed");
            }
        }
        self.bus.publish(EngineEvent::PostState {
            post,
            state: ExperimentState::Paused,
        });
        Ok(())
    }

    pub fn resume_post(&self, post: PostId) -> Result<()> {
        let experiment_id = {
            let mut posts = self.posts.lock();
            let slot = posts.get_mut(post);
            if slot.state != ExperimentState::Paused {
                return Err(EngineError::Rejected(format!(
                    "post {post} is {}, expected Paused",
                    slot.state
                )));
            }
            slot.state = ExperimentState::Running;
            if let Some(pipeline) = &slot.pipeline {
                pipeline.set_paused(false);
            }
            slot.experiment_id.clone()
        };
        if let Some(id) = experiment_id {
            if let Err(err) =
                self.store
                    .set_experiment_state(&id, ExperimentState::Running, self.clock.now())
            {
                error!(%err, "resume state write failed");
            }
        }
        self.bus.publish(EngineEvent::PostState {
            post,
            state: ExperimentState::Running,
        });
        Ok(())
    }

    /// Stops a run: detaches routing, drains the aggregator, persists the
    /// remainder and finalizes the experiment. The last running post also
    /// stops remote recording.
    pub fn stop_post(&self, post: PostId) -> Result<()> {
        let (id, pipeline) = {
            let mut posts = self.posts.lock();
            let slot = posts.get_mut(post);
            if !matches!(
                slot.state,
                ExperimentState::Running | ExperimentState::Paused
            ) {
                return Err(EngineError::Rejected(format!(
                    "post {post} is {}, nothing to stop",
                    slot.state
                )));
            }
            let id = slot
                .experiment_id
                .take()
                .ok_or_else(|| EngineError::Rejected(format!("post {post} has no experiment")))?;
            slot.state = ExperimentState::Idle;
            slot.checkpoint_interval_secs = PostSlot::default().checkpoint_interval_secs;
            (id, slot.pipeline.take())
        };
        self.router.remove(post);
        let now = self.clock.now();
        if let Some(pipeline) = pipeline {
            let remaining = pipeline.aggregator.flush();
            if let Err(err) = self.store.insert_aggregates(&id, &remaining) {
                error!(%err, "final aggregate write failed");
            }
        }
        self.writer.flush();
        self.store.finalize_experiment(&id, now)?;
        self.journal(
            Some(id.clone()),
            "experiment_finalized",
            Severity::Info,
            format!("experiment finalized on post {post}"),
        );
        if !self.router.any_active() {
            if let Err(err) = self.transport.send(&STOP_RECORDING) {
                warn!(%err, "stop recording command failed");
            }
        }
        info!(post = %post, experiment = %id, "experiment finalized");
        self.bus.publish(EngineEvent::PostState {
            post,
            state: ExperimentState::Finalized,
        });
        Ok(())
    }

    /// Switches a post's bench relay through the fixed control packet.
    pub fn set_post_power(&self, post: PostId, on: bool) -> Result<()> {
        self.transport.send(&relay_control(post, on))
    }

    pub fn acknowledge_anomaly(&self, event_id: i64, user: &str) -> Result<bool> {
        self.store
            .acknowledge_anomaly(event_id, user, self.clock.now())
    }

    pub fn post_state(&self, post: PostId) -> ExperimentState {
        self.posts.lock().get(post).state
    }

    pub fn anomaly_count(&self, post: PostId) -> u64 {
        self.posts.lock().get(post).anomaly_count
    }

    // ── routing and configuration ────────────────────────────────────

    fn any_post_recording(&self) -> bool {
        self.posts.lock().iter().any(|(_, slot)| {
            matches!(
                slot.state,
                ExperimentState::Running | ExperimentState::Paused
            )
        })
    }

    /// Persists a post's channel assignment. Rejected while any post is
    /// recording.
    pub fn write_routing(&self, post: PostId, channels: &[u16]) -> Result<()> {
        if self.any_post_recording() {
            return Err(EngineError::Rejected(
                "routing table is locked while a post is recording".into(),
            ));
        }
        self.store.write_routing(post, channels, self.clock.now())
    }

    pub fn read_routing(&self) -> PerPost<Vec<u16>> {
        self.store.read_routing()
    }

    pub fn write_selection(&self, post: PostId, flags: &[(u16, bool)]) -> Result<()> {
        if self.any_post_recording() {
            return Err(EngineError::Rejected(
                "selection flags are locked while a post is recording".into(),
            ));
        }
        self.store.write_selection(post, flags, self.clock.now())
    }

    pub fn read_selection(&self) -> PerPost<Vec<(u16, bool)>> {
        self.store.read_selection()
    }

    pub fn upsert_ui_channel_config(&self, cfg: &UiChannelConfig) -> Result<()> {
        self.store.upsert_ui_channel_config(cfg, self.clock.now())
    }

    pub fn ui_channel_configs(&self) -> Vec<UiChannelConfig> {
        self.store.ui_channel_configs()
    }

    // ── history reads (thin wrappers over the store) ─────────────────

    pub fn experiments_for_post(
        &self,
        post: PostId,
        filter: &crate::store::ExperimentFilter,
    ) -> Vec<ExperimentRow> {
        self.store.experiments_for_post(post, filter)
    }

    pub fn channel_history(
        &self,
        experiment_id: &str,
        channel: u16,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Vec<crate::store::HistoryPoint> {
        self.store.channel_history(experiment_id, channel, from, to)
    }

    pub fn channel_history_across(
        &self,
        channel: u16,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Vec<crate::store::HistoryPoint> {
        self.store.channel_history_across(channel, from, to)
    }

    pub fn events_for_experiment(&self, experiment_id: &str) -> Vec<crate::store::AnomalyEventRow> {
        self.store.events_for_experiment(experiment_id)
    }

    pub fn data_range(&self, experiment_id: &str) -> Option<(OffsetDateTime, OffsetDateTime)> {
        self.store.data_range(experiment_id)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ── maintenance hooks ────────────────────────────────────────────

    /// Publishes the once-per-second health snapshot.
    pub fn health_tick(&self) -> HealthSnapshot {
        let samples = self.samples_tick.swap(0, Ordering::Relaxed);
        self.transport.sample_rate();
        let posts = {
            let slots = self.posts.lock();
            let mut out = PerPost::<PostHealth>::default();
            for (post, slot) in slots.iter() {
                *out.get_mut(post) = PostHealth {
                    state: slot.state,
                    experiment_id: slot.experiment_id.clone(),
                    anomaly_count: slot.anomaly_count,
                };
            }
            out
        };
        let snapshot = HealthSnapshot {
            at: self.clock.now(),
            channel_count: self.registry.len(),
            samples_per_sec: samples,
            link: self.transport.stats(),
            writer: self.writer.stats(),
            posts,
        };
        self.bus.publish(EngineEvent::Health(snapshot.clone()));
        snapshot
    }

    /// Drains completed windows, classifies their quality, persists them
    /// and runs the no-data scan. Driven every five ticks per post.
    pub fn flush_tick(&self) {
        let now = self.clock.now();
        for post in PostId::ALL {
            let (pipeline, experiment_id, paused) = {
                let posts = self.posts.lock();
                let slot = posts.get(post);
                match (&slot.pipeline, &slot.experiment_id) {
                    (Some(p), Some(id)) => (
                        Arc::clone(p),
                        id.clone(),
                        slot.state == ExperimentState::Paused,
                    ),
                    _ => continue,
                }
            };
            let ready = pipeline.aggregator.ready(now);
            if !ready.is_empty() {
                for agg in &ready {
                    let outcomes = pipeline.detector.check_aggregate(agg);
                    self.apply_outcomes(post, &experiment_id, outcomes);
                }
                if let Err(err) = self.store.insert_aggregates(&experiment_id, &ready) {
                    error!(%err, "aggregate batch write failed");
                }
            }
            // No data is expected while paused; skip the scan.
            if !paused {
                let outcomes = pipeline.detector.check_timeouts(now);
                self.apply_outcomes(post, &experiment_id, outcomes);
            }
        }
    }

    /// Writes a checkpoint row for every post whose cadence divides the
    /// current tick.
    pub fn checkpoint_tick(&self, tick: u64) {
        let now = self.clock.now();
        for post in PostId::ALL {
            let (experiment_id, due, anomaly_count) = {
                let posts = self.posts.lock();
                let slot = posts.get(post);
                let Some(id) = &slot.experiment_id else {
                    continue;
                };
                let interval = u64::from(slot.checkpoint_interval_secs.max(1));
                (id.clone(), tick % interval == 0, slot.anomaly_count)
            };
            if !due {
                continue;
            }
            if let Err(err) = self.write_checkpoint(&experiment_id, now, anomaly_count) {
                error!(%err, "checkpoint write failed");
            }
        }
    }

    fn write_checkpoint(
        &self,
        experiment_id: &str,
        now: OffsetDateTime,
        anomaly_count: u64,
    ) -> Result<()> {
        let stats = self.writer.stats();
        let queue_state_json = serde_json::to_string(&self.writer.queue_snapshot())?;
        let statistics_json = serde_json::to_string(&serde_json::json!({
            "writer": stats,
            "anomaly_count": anomaly_count,
        }))?;
        self.store.insert_checkpoint(&CheckpointRow {
            experiment_id: experiment_id.to_string(),
            checkpoint_time: now,
            last_sample_timestamp: stats.last_sample_timestamp,
            last_sample_id: stats.last_sample_id,
            queue_state_json,
            statistics_json,
        })
    }

    /// Graceful shutdown: the maintenance loop is already cancelled;
    /// close the link, flush the writer (bounded by the store's 5 s busy
    /// timeout), checkpoint the WAL.
    pub fn shutdown(&self) {
        self.transport.disconnect();
        self.writer.flush();
        if let Err(err) = self.store.wal_checkpoint_passive() {
            warn!(%err, "final WAL checkpoint failed");
        }
        if let Some(handle) = self.ingest.lock().take() {
            let _ = handle.join();
        }
        info!("coordinator shut down");
    }

    fn journal(
        &self,
        experiment_id: Option<String>,
        event_type: &str,
        severity: Severity,
        message: String,
    ) {
        let row = SystemEventRow {
            experiment_id,
            timestamp: self.clock.now(),
            event_type: event_type.to_string(),
            severity: severity.as_str().to_string(),
            message,
            source: "coordinator".to_string(),
            correlation_id: None,
            details_json: None,
        };
        if let Err(err) = self.store.insert_system_event(&row) {
            error!(%err, "system event write failed");
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish()
    }
}
