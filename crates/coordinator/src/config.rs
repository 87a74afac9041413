//! Coordinator configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// How the vote phase reacts to a negative vote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteMode {
    /// Stop at the first negative vote
    #[default]
    FailFast,
    /// Collect every participant's vote and report all negative ones
    Exhaustive,
}

/// What rolling back a savepoint does about participants joined after it was taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LateJoinPolicy {
    /// Roll back the captured participants and leave late joiners untouched
    #[default]
    Exclude,
    /// Refuse the rollback before touching any participant
    Fail,
}

/// Configuration shared by a manager and every transaction it begins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Require an explicit `begin()`; no implicit begin or implicit abort
    pub explicit: bool,

    /// Vote phase behavior
    pub vote_mode: VoteMode,

    /// Savepoint rollback policy for late joiners
    pub late_joiners: LateJoinPolicy,

    /// Refuse savepoints when a joined participant cannot support them
    pub strict_savepoints: bool,
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a (possibly partial) configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set explicit mode
    pub fn with_explicit(mut self, explicit: bool) -> Self {
        self.explicit = explicit;
        self
    }

    /// Set vote mode
    pub fn with_vote_mode(mut self, mode: VoteMode) -> Self {
        self.vote_mode = mode;
        self
    }

    /// Set late-joiner policy
    pub fn with_late_joiners(mut self, policy: LateJoinPolicy) -> Self {
        self.late_joiners = policy;
        self
    }

    /// Set strict savepoints
    pub fn with_strict_savepoints(mut self, strict: bool) -> Self {
        self.strict_savepoints = strict;
        self
    }
}
