//! Error types for the beltline runtime.
//!
//! The taxonomy splits three ways: configuration errors are returned to the
//! caller from builder methods, per-item errors are logged and swallowed by
//! the owning stage, and termination signals (`SourceExhausted`) drive the
//! coordinated shutdown path.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type shared by builders, worker pools and user executors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// `start` was called on a conveyor with no node workers.
    #[error("conveyor is empty, no workers employed")]
    EmptyConveyor,

    /// A builder was handed a worker type it does not recognize.
    #[error("invalid worker type, pick one of NodeRole::Source/Operator/Sink")]
    InvalidWorkerType,

    /// A worker pool was started with a mode it does not support.
    #[error("invalid worker mode, pick either WorkerMode::Transaction or WorkerMode::Loop")]
    InvalidWorkerMode,

    /// A builder operation assumed node executors which were never added.
    #[error("this action assumes presence of node executors in the conveyor, but none were found")]
    NoNodesAvailable,

    /// A builder operation assumed joint executors which were never added.
    #[error("this action assumes presence of joint executors in the conveyor, but none were found")]
    NoJointsAvailable,

    /// The executor does not implement `execute` (transaction mode).
    #[error("this executor doesn't implement the execute() method")]
    ExecuteNotImplemented,

    /// The executor does not implement `execute_loop` (loop mode).
    #[error("this executor doesn't implement the execute_loop() method")]
    ExecuteLoopNotImplemented,

    /// The stage role has no input port (sources), or it was already wired.
    #[error("input channel doesn't exist for this node")]
    InputChanDoesNotExist,

    /// The stage role has no output port (sinks).
    #[error("output channel doesn't exist for this node")]
    OutputChanDoesNotExist,

    /// A source executor has produced everything it ever will.
    ///
    /// Returned by user sources in transaction mode; the runtime reacts by
    /// cancelling the shared context so the whole conveyor drains.
    #[error("source executor is exhausted")]
    SourceExhausted,

    /// A source executor hit an internal failure.
    #[error("source executor internal error")]
    SourceInternal,

    /// An operator executor rejected a single item.
    #[error("fetch executor rejected the transaction")]
    FetchRejected,

    /// An operator executor hit an internal failure.
    #[error("fetch executor internal error")]
    FetchInternal,

    /// A sink executor rejected a single item.
    #[error("sink executor rejected data")]
    SinkRejected,

    /// A sink executor hit an internal failure.
    #[error("sink executor internal error")]
    SinkInternal,

    /// A joint was asked for an input port index it does not have.
    #[error("joint worker doesn't have enough input channels")]
    LessInputChannelsInJoint,

    /// A joint was asked for an output port index it does not have.
    #[error("joint worker doesn't have enough output channels")]
    LessOutputChannelsInJoint,

    /// A joint started with zero input channels.
    #[error("number of input channels is 0")]
    NoInputChannel,

    /// A joint started with zero output channels.
    #[error("number of output channels is 0")]
    NoOutputChannel,

    /// A replicate joint was wired with more than one input channel.
    #[error("only one input channel can be replicated")]
    MultipleInputChannels,

    /// A replicate joint was wired one-to-one, which replication can't justify.
    #[error("replicate joint isn't needed for one-to-one mapping, link the nodes directly")]
    OneToOneConnection,

    /// A lifecycle mark was requested but no handler is installed.
    #[error("this conveyor instance isn't created with life cycle support")]
    LifeCycleNotSupported,

    /// `wait_and_stop` was called on a pool whose `start` never ran.
    #[error("worker pool was not started, call start() before wait_and_stop()")]
    PoolNotStarted,

    /// A send hit a channel whose consumer side has gone away.
    #[error("channel is closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::EmptyConveyor.to_string(),
            "conveyor is empty, no workers employed"
        );
        assert_eq!(
            Error::SourceExhausted.to_string(),
            "source executor is exhausted"
        );
        assert!(Error::OneToOneConnection.to_string().contains("one-to-one"));
    }

    #[test]
    fn test_errors_compare() {
        assert_eq!(Error::ExecuteNotImplemented, Error::ExecuteNotImplemented);
        assert_ne!(Error::ExecuteNotImplemented, Error::ExecuteLoopNotImplemented);
    }
}
