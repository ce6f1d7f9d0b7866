//! Engine event bus.
//!
//! The source system multicast these through delegates; here consumers
//! subscribe by taking an explicit receiver, which makes control flow and
//! back-pressure visible. Slow or dropped receivers are detached on the
//! next publish.

use std::sync::mpsc::{channel, Receiver, Sender};

use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::detector::AnomalyEvent;
use crate::health::HealthSnapshot;
use crate::transport::LinkStatus;
use crate::types::{ExperimentState, PostId};

/// Tagged event variants published by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Once per second from the maintenance loop.
    Health(HealthSnapshot),
    /// A decoded value delivered to a post.
    ChannelValue {
        post: PostId,
        channel: u16,
        value: Option<f64>,
        timestamp: OffsetDateTime,
    },
    /// Anomaly opened, closed or recorded for a post.
    Anomaly { post: PostId, event: AnomalyEvent },
    /// Post lifecycle transition.
    PostState { post: PostId, state: ExperimentState },
    /// Transport status change.
    Link(LinkStatus),
}

/// One producer, any number of subscribed consumers.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subs = self.subscribers.lock();
        if subs.is_empty() {
            return;
        }
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}
