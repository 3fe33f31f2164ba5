//! User-facing executor contracts.
//!
//! An executor supplies the per-item or per-loop logic of one stage; the
//! worker pools own everything else. Both traits ship default method bodies
//! that return the matching `NotImplemented` error, so an implementation only
//! provides the method required by the mode it is added with.

mod replicate;

pub use replicate::ReplicateJoint;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::channel::{InputPort, OutputPort};
use crate::context::ConveyorContext;
use crate::errors::{Error, Result};
use crate::item::Item;

/// How a node worker pool drives its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// The executor owns the consume/produce loop.
    Loop,
    /// The runtime owns the loop and calls the executor once per item.
    Transaction,
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loop => write!(f, "loop"),
            Self::Transaction => write!(f, "transaction"),
        }
    }
}

/// The role a node plays in the topology, which decides its ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Generates items; has no input port.
    Source,
    /// Transforms items; has both ports.
    Operator,
    /// Consumes items; has no output port.
    Sink,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Operator => write!(f, "operator"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

/// Per-stage logic for a source, operator or sink node.
///
/// Implement [`NodeExecutor::execute_loop`] for loop mode or
/// [`NodeExecutor::execute`] for transaction mode. With `parallelism`
/// greater than one, the implementation is responsible for its own data-race
/// freedom.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Name of this executor, used in logs and wiring diagnostics.
    fn name(&self) -> &str;

    /// A stable identifier used in log messages. Defaults to the name.
    fn unique_id(&self) -> String {
        self.name().to_string()
    }

    /// Number of concurrent workers the pool runs. Values below one are
    /// coerced to one by the pool.
    fn parallelism(&self) -> usize {
        1
    }

    /// Transaction-mode entry point: transform one item.
    ///
    /// Sources receive `None` and fabricate items; a source returns
    /// [`Error::SourceExhausted`] once it has nothing left, which drains the
    /// whole conveyor. Sinks' return values are discarded by the runtime.
    ///
    /// # Errors
    ///
    /// The default body returns [`Error::ExecuteNotImplemented`], which the
    /// pool treats as fatal misconfiguration.
    async fn execute(&self, ctx: Arc<dyn ConveyorContext>, item: Option<Item>) -> Result<Item> {
        let _ = (ctx, item);
        Err(Error::ExecuteNotImplemented)
    }

    /// Loop-mode entry point: own the consume/produce loop.
    ///
    /// Sources receive no input port and sinks no output port. The
    /// implementation should drain `input` until it observes end-of-stream
    /// and use the cancellation-aware port methods so shutdown stays prompt.
    ///
    /// # Errors
    ///
    /// The default body returns [`Error::ExecuteLoopNotImplemented`], which
    /// the pool treats as fatal misconfiguration.
    async fn execute_loop(
        &self,
        ctx: Arc<dyn ConveyorContext>,
        input: Option<InputPort>,
        output: Option<OutputPort>,
    ) -> Result<()> {
        let _ = (ctx, input, output);
        Err(Error::ExecuteLoopNotImplemented)
    }

    /// Runs once per stage, after the last worker finished and before the
    /// output closes.
    ///
    /// # Errors
    ///
    /// Failures are logged by the pool, never propagated.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-stage logic for a joint, the multi-in/multi-out stage kind.
///
/// Joints always run in loop mode. The built-in variant is
/// [`ReplicateJoint`]; custom joints may use any in/out topology.
#[async_trait]
pub trait JointExecutor: Send + Sync {
    /// Name of this executor, used in logs and wiring diagnostics.
    fn name(&self) -> &str;

    /// A stable identifier used in log messages. Defaults to the name.
    fn unique_id(&self) -> String {
        self.name().to_string()
    }

    /// Number of concurrent workers the pool runs. Values below one are
    /// coerced to one by the pool.
    fn parallelism(&self) -> usize {
        1
    }

    /// Number of input ports the pool creates for this joint.
    fn input_count(&self) -> usize {
        1
    }

    /// Number of output ports this joint expects to be wired with.
    fn output_count(&self) -> usize {
        1
    }

    /// The joint's loop over its input and output ports.
    ///
    /// # Errors
    ///
    /// Topology validation errors reject the conveyor at start; anything
    /// else ends this worker and is logged.
    async fn execute_loop(
        &self,
        ctx: Arc<dyn ConveyorContext>,
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
    ) -> Result<()>;

    /// Runs once per stage, after the last worker finished and before the
    /// outputs close.
    ///
    /// # Errors
    ///
    /// Failures are logged by the pool, never propagated.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StandardContext;

    struct BareExecutor;

    #[async_trait]
    impl NodeExecutor for BareExecutor {
        fn name(&self) -> &str {
            "bare"
        }
    }

    #[tokio::test]
    async fn test_default_execute_reports_not_implemented() {
        let ctx: Arc<dyn ConveyorContext> = StandardContext::new("test");
        let err = BareExecutor.execute(ctx, None).await.unwrap_err();
        assert_eq!(err, Error::ExecuteNotImplemented);
    }

    #[tokio::test]
    async fn test_default_execute_loop_reports_not_implemented() {
        let ctx: Arc<dyn ConveyorContext> = StandardContext::new("test");
        let err = BareExecutor.execute_loop(ctx, None, None).await.unwrap_err();
        assert_eq!(err, Error::ExecuteLoopNotImplemented);
    }

    #[tokio::test]
    async fn test_default_cleanup_succeeds() {
        assert!(BareExecutor.cleanup().await.is_ok());
    }

    #[test]
    fn test_defaults() {
        assert_eq!(BareExecutor.parallelism(), 1);
        assert_eq!(BareExecutor.unique_id(), "bare");
    }

    #[test]
    fn test_mode_and_role_display() {
        assert_eq!(WorkerMode::Loop.to_string(), "loop");
        assert_eq!(WorkerMode::Transaction.to_string(), "transaction");
        assert_eq!(NodeRole::Source.to_string(), "source");
        assert_eq!(NodeRole::Operator.to_string(), "operator");
        assert_eq!(NodeRole::Sink.to_string(), "sink");
    }
}
