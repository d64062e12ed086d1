//! Atomic operation state tracking.

use std::time::{Duration, Instant};

use super::id::OperationId;
use crate::storage::wal::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Active,
    Committed,
    RolledBack,
}

impl OperationState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Committed => write!(f, "Committed"),
            Self::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// Bookkeeping the manager keeps for every operation it has started.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub id: OperationId,
    pub state: OperationState,
    /// LSN of the operation's start record.
    pub start_lsn: Lsn,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
}

impl OperationInfo {
    pub fn new(id: OperationId, start_lsn: Lsn) -> Self {
        Self {
            id,
            state: OperationState::Active,
            start_lsn,
            start_time: Instant::now(),
            end_time: None,
        }
    }

    pub fn duration(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    pub fn commit(&mut self) {
        assert!(
            self.state.is_active(),
            "Can only commit active atomic operations"
        );
        self.state = OperationState::Committed;
        self.end_time = Some(Instant::now());
    }

    pub fn roll_back(&mut self) {
        assert!(
            self.state.is_active(),
            "Can only roll back active atomic operations"
        );
        self.state = OperationState::RolledBack;
        self.end_time = Some(Instant::now());
    }
}
