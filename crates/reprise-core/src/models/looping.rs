//! Looping policy and the counter that drives window restarts.

use serde::{Deserialize, Serialize};

/// How many times the clip window plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", content = "times", rename_all = "lowercase")]
pub enum Looping {
    #[default]
    Once,
    /// Total number of plays, including the first.
    Times(u32),
    Forever,
}

impl Looping {
    /// `loopingTimes` argument: positive → N plays, negative → forever,
    /// zero → once.
    pub fn from_times(times: i64) -> Self {
        match times {
            0 => Looping::Once,
            t if t < 0 => Looping::Forever,
            t => Looping::Times(t.min(u32::MAX as i64) as u32),
        }
    }

    /// Total plays, `None` when unbounded.
    pub fn total_plays(&self) -> Option<u32> {
        match self {
            Looping::Once => Some(1),
            Looping::Times(n) => Some((*n).max(1)),
            Looping::Forever => None,
        }
    }
}

/// What to do when the playable window has been played through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Restart,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopCounter {
    looping: Looping,
    completed: u32,
}

impl LoopCounter {
    pub fn new(looping: Looping) -> Self {
        Self {
            looping,
            completed: 0,
        }
    }

    pub fn looping(&self) -> Looping {
        self.looping
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Change the policy mid-playback; plays already made still count.
    pub fn set_looping(&mut self, looping: Looping) {
        self.looping = looping;
    }

    pub fn reset(&mut self) {
        self.completed = 0;
    }

    pub fn on_window_end(&mut self) -> LoopAction {
        self.completed = self.completed.saturating_add(1);
        match self.looping.total_plays() {
            None => LoopAction::Restart,
            Some(total) if self.completed < total => LoopAction::Restart,
            Some(_) => LoopAction::Complete,
        }
    }
}
