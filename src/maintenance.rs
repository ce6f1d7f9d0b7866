//! Periodic maintenance loop.
//!
//! One cooperative thread, once per second: publish the health snapshot,
//! every five ticks drain aggregates and scan for silent channels, and
//! write checkpoints on each post's cadence. Exits promptly on the
//! process-wide cancel token.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::{EngineError, Result};
use crate::shutdown::Shutdown;

const TICK: Duration = Duration::from_secs(1);
/// Aggregate drain and timeout scan cadence, in ticks.
const FLUSH_EVERY: u64 = 5;

pub fn spawn(coordinator: Arc<Coordinator>, shutdown: Arc<Shutdown>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("frigorec-maint".to_string())
        .spawn(move || run(coordinator, shutdown))
        .map_err(EngineError::Io)
}

fn run(coordinator: Arc<Coordinator>, shutdown: Arc<Shutdown>) {
    let mut tick: u64 = 0;
    while !shutdown.wait_timeout(TICK) {
        tick += 1;
        coordinator.health_tick();
        if tick % FLUSH_EVERY == 0 {
            coordinator.flush_tick();
        }
        coordinator.checkpoint_tick(tick);
    }
    debug!("maintenance loop cancelled");
}
