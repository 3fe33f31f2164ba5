//! External life-cycle observation.
//!
//! A conveyor can be given a [`LifeCycleHandler`] that is told when the run
//! transitions between named states, typically to mirror them into some
//! external store a driver application polls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::Result;

/// The named states a conveyor run moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConveyorState {
    /// The conveyor is being configured and wired.
    Preparing,
    /// The conveyor's pools are running.
    Started,
    /// A kill was requested but has not completed yet.
    ToKill,
    /// The conveyor was killed before finishing.
    Killed,
    /// The conveyor finished, by exhaustion, success or timeout.
    Finished,
    /// The conveyor could not finish due to an internal error.
    InternalError,
}

impl fmt::Display for ConveyorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Started => write!(f, "started"),
            Self::ToKill => write!(f, "toKill"),
            Self::Killed => write!(f, "killed"),
            Self::Finished => write!(f, "finished"),
            Self::InternalError => write!(f, "internalError"),
        }
    }
}

/// Receives conveyor state transitions and status/progress updates.
///
/// All methods may perform I/O; failures are reported to the caller of the
/// mark, which for runtime-driven marks means a log line, never a failed run.
#[async_trait]
pub trait LifeCycleHandler: Send + Sync {
    /// Reads the current state.
    async fn state(&self) -> Result<ConveyorState>;

    /// Reads the last status message.
    async fn status_msg(&self) -> Result<String>;

    /// Stores a status message.
    async fn update_status_msg(&self, msg: &str) -> Result<()>;

    /// Reads the last progress value.
    async fn progress(&self) -> Result<String>;

    /// Stores a progress value.
    async fn update_progress(&self, progress: &str) -> Result<()>;

    /// Marks the conveyor as preparing.
    async fn mark_preparing(&self) -> Result<()>;

    /// Marks the conveyor as started.
    async fn mark_started(&self) -> Result<()>;

    /// Marks the conveyor as queued to be killed.
    async fn mark_to_kill(&self) -> Result<()>;

    /// Marks the conveyor as killed.
    async fn mark_killed(&self) -> Result<()>;

    /// Marks the conveyor as finished.
    async fn mark_finished(&self) -> Result<()>;

    /// Marks the conveyor as failed with an internal error.
    async fn mark_error(&self) -> Result<()>;
}

/// Dispatches a state to the matching mark method of a handler.
pub(crate) async fn mark_state(handler: &dyn LifeCycleHandler, state: ConveyorState) -> Result<()> {
    match state {
        ConveyorState::Preparing => handler.mark_preparing().await,
        ConveyorState::Started => handler.mark_started().await,
        ConveyorState::ToKill => handler.mark_to_kill().await,
        ConveyorState::Killed => handler.mark_killed().await,
        ConveyorState::Finished => handler.mark_finished().await,
        ConveyorState::InternalError => handler.mark_error().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConveyorState::Preparing.to_string(), "preparing");
        assert_eq!(ConveyorState::ToKill.to_string(), "toKill");
        assert_eq!(ConveyorState::InternalError.to_string(), "internalError");
    }

    #[test]
    fn test_state_serialize() {
        let json = serde_json::to_string(&ConveyorState::Finished).unwrap();
        assert_eq!(json, r#""finished""#);

        let back: ConveyorState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ConveyorState::Finished);
    }
}
