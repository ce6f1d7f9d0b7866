//! Channel fan-out to post pipelines.
//!
//! The hot path: every decoded sample looks up the set of posts holding
//! its channel and is handed, cloned, to each one's aggregator and (for
//! valid readings) detector. The table lock is never held across that
//! work; mutation happens only from the coordinator while the affected
//! post is not recording.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::aggregator::WindowAggregator;
use crate::detector::{AnomalyDetector, DetectorOutcome};
use crate::protocol::Sample;
use crate::registry::CHANNEL_COUNT;
use crate::types::{PerPost, PostId};

/// Processing context of one recording post, owned by the coordinator and
/// shared with the router for the duration of a run.
#[derive(Debug)]
pub struct PostPipeline {
    pub post: PostId,
    pub experiment_id: Arc<str>,
    pub detector: AnomalyDetector,
    pub aggregator: WindowAggregator,
    paused: AtomicBool,
}

impl PostPipeline {
    pub fn new(
        post: PostId,
        experiment_id: impl Into<Arc<str>>,
        detector: AnomalyDetector,
        aggregator: WindowAggregator,
    ) -> Self {
        Self {
            post,
            experiment_id: experiment_id.into(),
            detector,
            aggregator,
            paused: AtomicBool::new(false),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Everything the dispatch of one sample produced for one post.
#[derive(Debug)]
pub struct Delivery {
    pub post: PostId,
    pub experiment_id: Arc<str>,
    pub outcomes: Vec<DetectorOutcome>,
}

/// Maps channel index to the set of active posts.
pub struct Router {
    targets: RwLock<Vec<SmallVec<[PostId; 3]>>>,
    pipelines: RwLock<PerPost<Option<Arc<PostPipeline>>>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(vec![SmallVec::new(); CHANNEL_COUNT]),
            pipelines: RwLock::new(PerPost::default()),
        }
    }

    /// Installs a post's pipeline and points its channels at it. Any
    /// previous assignment of the post is dropped first.
    pub fn install(&self, pipeline: Arc<PostPipeline>, channels: &[u16]) {
        let post = pipeline.post;
        {
            let mut targets = self.targets.write();
            for set in targets.iter_mut() {
                set.retain(|p| *p != post);
            }
            for &channel in channels {
                if let Some(set) = targets.get_mut(channel as usize) {
                    if !set.contains(&post) {
                        set.push(post);
                    }
                }
            }
        }
        *self.pipelines.write().get_mut(post) = Some(pipeline);
    }

    /// Detaches a post entirely; its samples are dropped at the router.
    pub fn remove(&self, post: PostId) -> Option<Arc<PostPipeline>> {
        {
            let mut targets = self.targets.write();
            for set in targets.iter_mut() {
                set.retain(|p| *p != post);
            }
        }
        self.pipelines.write().get_mut(post).take()
    }

    pub fn pipeline(&self, post: PostId) -> Option<Arc<PostPipeline>> {
        self.pipelines.read().get(post).clone()
    }

    /// Whether any post is currently installed.
    pub fn any_active(&self) -> bool {
        self.pipelines.read().iter().any(|(_, p)| p.is_some())
    }

    /// Hands one sample to every targeted, unpaused post. Samples whose
    /// channel is not routed anywhere are dropped without error.
    pub fn dispatch(&self, sample: &Sample) -> SmallVec<[Delivery; 3]> {
        let posts: SmallVec<[PostId; 3]> = {
            let targets = self.targets.read();
            match targets.get(sample.channel as usize) {
                Some(set) => set.clone(),
                None => return SmallVec::new(),
            }
        };
        let mut deliveries = SmallVec::new();
        for post in posts {
            let pipeline = {
                let pipelines = self.pipelines.read();
                pipelines.get(post).clone()
            };
            let Some(pipeline) = pipeline else {
                continue;
            };
            if pipeline.is_paused() {
                continue;
            }
            pipeline.aggregator.add_sample(sample);
            let outcomes = match sample.value() {
                Some(value) => {
                    pipeline
                        .detector
                        .check_value(sample.channel, value, sample.timestamp)
                }
                None => Vec::new(),
            };
            deliveries.push(Delivery {
                post,
                experiment_id: Arc::clone(&pipeline.experiment_id),
                outcomes,
            });
        }
        deliveries
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let targets = self.targets.read();
        let routed = targets.iter().filter(|s| !s.is_empty()).count();
        f.debug_struct("Router").field("routed_channels", &routed).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ChannelRule;
    use rustc_hash::FxHashMap;
    use time::macros::datetime;

    fn pipeline(post: PostId, exp: &str, channels: &[u16]) -> Arc<PostPipeline> {
        let now = datetime!(2024-05-01 09:00:00 UTC);
        let rules = channels
            .iter()
            .map(|&ch| ChannelRule::new(ch, format!("ch{ch}")))
            .collect();
        let intervals: FxHashMap<u16, u32> = channels.iter().map(|&ch| (ch, 20)).collect();
        Arc::new(PostPipeline::new(
            post,
            exp,
            AnomalyDetector::new(rules, now),
            WindowAggregator::new(intervals),
        ))
    }

    fn sample(channel: u16, raw: f64) -> Sample {
        Sample::new(channel, raw, datetime!(2024-05-01 09:00:01 UTC))
    }

    #[test]
    fn unrouted_channels_are_dropped() {
        let router = Router::new();
        assert!(router.dispatch(&sample(5, 1.0)).is_empty());
    }

    #[test]
    fn shared_channel_reaches_every_holder() {
        let router = Router::new();
        router.install(pipeline(PostId::A, "exp-a", &[130, 1]), &[130, 1]);
        router.install(pipeline(PostId::C, "exp-c", &[130]), &[130]);
        let deliveries = router.dispatch(&sample(130, 21.5));
        let mut posts: Vec<PostId> = deliveries.iter().map(|d| d.post).collect();
        posts.sort();
        assert_eq!(posts, vec![PostId::A, PostId::C]);
        assert_eq!(router.dispatch(&sample(1, 3.0)).len(), 1);
    }

    #[test]
    fn paused_post_is_skipped() {
        let router = Router::new();
        let p = pipeline(PostId::B, "exp-b", &[7]);
        router.install(Arc::clone(&p), &[7]);
        assert_eq!(router.dispatch(&sample(7, 1.0)).len(), 1);
        p.set_paused(true);
        assert!(router.dispatch(&sample(7, 1.0)).is_empty());
        p.set_paused(false);
        assert_eq!(router.dispatch(&sample(7, 1.0)).len(), 1);
    }

    #[test]
    fn invalid_sample_skips_detector_but_feeds_aggregator() {
        let router = Router::new();
        let p = pipeline(PostId::A, "exp-a", &[2]);
        router.install(Arc::clone(&p), &[2]);
        let deliveries = router.dispatch(&sample(2, -99.0));
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].outcomes.is_empty());
        // The sentinel landed in the window as an invalid reading.
        let flushed = p.aggregator.flush();
        assert!(flushed.is_empty(), "window had no valid samples");
    }

    #[test]
    fn remove_detaches_post() {
        let router = Router::new();
        router.install(pipeline(PostId::A, "exp-a", &[3]), &[3]);
        assert!(router.remove(PostId::A).is_some());
        assert!(router.dispatch(&sample(3, 1.0)).is_empty());
        assert!(!router.any_active());
    }
}
