// src/build/state.rs

//! Build phases and the transition log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::info;

/// Phases of one build, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum BuildState {
    Created,
    Fetching,
    Unpacking,
    RunningSteps,
    Assembling,
    Done,
    Failed,
}

impl BuildState {
    /// The state a successful phase leads to
    pub fn next(&self) -> Option<BuildState> {
        match self {
            Self::Created => Some(Self::Fetching),
            Self::Fetching => Some(Self::Unpacking),
            Self::Unpacking => Some(Self::RunningSteps),
            Self::RunningSteps => Some(Self::Assembling),
            Self::Assembling => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Fetching => "fetching",
            Self::Unpacking => "unpacking",
            Self::RunningSteps => "running steps",
            Self::Assembling => "assembling",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: BuildState,
    pub to: BuildState,
    pub at: DateTime<Utc>,
    /// Time spent in `from`
    pub duration_ms: u64,
}

impl Transition {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Tracks the current state and every transition taken
#[derive(Debug, Clone)]
pub struct PhaseLog {
    current: BuildState,
    entered_at: DateTime<Utc>,
    transitions: Vec<Transition>,
}

impl PhaseLog {
    pub fn new() -> Self {
        Self {
            current: BuildState::Created,
            entered_at: Utc::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> BuildState {
        self.current
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<Transition> {
        self.transitions
    }

    /// Move to the next phase
    ///
    /// Returns the new state, or `None` when already terminal.
    pub fn advance(&mut self) -> Option<BuildState> {
        let next = self.current.next()?;
        self.record(next);
        Some(next)
    }

    /// Enter `Failed`, returning the phase that failed
    pub fn fail(&mut self) -> BuildState {
        let failed_in = self.current;
        if !failed_in.is_terminal() {
            self.record(BuildState::Failed);
        }
        failed_in
    }

    fn record(&mut self, to: BuildState) {
        let now = Utc::now();
        let duration_ms = (now - self.entered_at).num_milliseconds().max(0) as u64;
        info!("Build {} -> {} ({} ms)", self.current, to, duration_ms);
        self.transitions.push(Transition {
            from: self.current,
            to,
            at: now,
            duration_ms,
        });
        self.current = to;
        self.entered_at = now;
    }
}

impl Default for PhaseLog {
    fn default() -> Self {
        Self::new()
    }
}
