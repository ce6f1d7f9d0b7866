//! Core identifiers shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the three independent recording tracks over the same channel
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PostId {
    A,
    B,
    C,
}

impl PostId {
    pub const ALL: [PostId; 3] = [PostId::A, PostId::B, PostId::C];

    pub fn as_str(self) -> &'static str {
        match self {
            PostId::A => "A",
            PostId::B => "B",
            PostId::C => "C",
        }
    }

    pub fn parse(s: &str) -> Option<PostId> {
        match s {
            "A" | "a" => Some(PostId::A),
            "B" | "b" => Some(PostId::B),
            "C" | "c" => Some(PostId::C),
            _ => None,
        }
    }

    /// Relay selector digit used by the wire protocol ('1'..'3').
    pub fn relay_digit(self) -> u8 {
        match self {
            PostId::A => b'1',
            PostId::B => b'2',
            PostId::C => b'3',
        }
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record holding one value per post. Used instead of `HashMap<PostId, T>`
/// so the A/B/C shape is enforced by the type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerPost<T> {
    pub a: T,
    pub b: T,
    pub c: T,
}

impl<T> PerPost<T> {
    pub fn get(&self, post: PostId) -> &T {
        match post {
            PostId::A => &self.a,
            PostId::B => &self.b,
            PostId::C => &self.c,
        }
    }

    pub fn get_mut(&mut self, post: PostId) -> &mut T {
        match post {
            PostId::A => &mut self.a,
            PostId::B => &mut self.b,
            PostId::C => &mut self.c,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PostId, &T)> {
        [
            (PostId::A, &self.a),
            (PostId::B, &self.b),
            (PostId::C, &self.c),
        ]
        .into_iter()
    }
}

/// Lifecycle state of an experiment. `Finalized` and `Recovered` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentState {
    Idle,
    Running,
    Paused,
    Stopped,
    Finalized,
    Recovered,
}

impl ExperimentState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentState::Idle => "Idle",
            ExperimentState::Running => "Running",
            ExperimentState::Paused => "Paused",
            ExperimentState::Stopped => "Stopped",
            ExperimentState::Finalized => "Finalized",
            ExperimentState::Recovered => "Recovered",
        }
    }

    pub fn parse(s: &str) -> Option<ExperimentState> {
        match s {
            "Idle" => Some(ExperimentState::Idle),
            "Running" => Some(ExperimentState::Running),
            "Paused" => Some(ExperimentState::Paused),
            "Stopped" => Some(ExperimentState::Stopped),
            "Finalized" => Some(ExperimentState::Finalized),
            "Recovered" => Some(ExperimentState::Recovered),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExperimentState::Finalized | ExperimentState::Recovered
        )
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
