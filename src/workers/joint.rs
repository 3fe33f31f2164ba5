//! The worker pool behind a joint stage.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::supervised;
use crate::channel::{edge, InputPort, OutputPort};
use crate::context::{ConveyorContext, LogLevel};
use crate::errors::{Error, Result};
use crate::executor::JointExecutor;

/// Runs a [`JointExecutor`] over vectors of input and output ports.
///
/// Joints always run in loop mode. The pool creates one input edge per
/// declared input; output ports are appended as downstream nodes are linked.
/// After the last worker returns, cleanup runs once and all outputs close.
pub struct JointWorkerPool {
    executor: Arc<dyn JointExecutor>,
    parallelism: usize,
    inputs: Mutex<Vec<InputPort>>,
    /// Producer sides of the input edges, parked until linking moves each
    /// into its upstream stage.
    input_txs: Mutex<Vec<Option<OutputPort>>>,
    outputs: Mutex<Vec<OutputPort>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cleaned: AtomicBool,
}

impl JointWorkerPool {
    /// Creates a pool for the given joint executor.
    ///
    /// `parallelism` below one is coerced to one.
    #[must_use]
    pub fn new(executor: Arc<dyn JointExecutor>) -> Self {
        let parallelism = executor.parallelism().max(1);
        Self {
            executor,
            parallelism,
            inputs: Mutex::new(Vec::new()),
            input_txs: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        }
    }

    /// The executor's name.
    #[must_use]
    pub fn name(&self) -> String {
        self.executor.name().to_string()
    }

    /// Creates one input edge per declared input with the given capacity.
    pub fn create_channels(&self, buffer: usize) {
        let mut inputs = self.inputs.lock();
        let mut input_txs = self.input_txs.lock();
        for _ in 0..self.executor.input_count() {
            let (tx, rx) = edge(buffer);
            inputs.push(rx);
            input_txs.push(Some(tx));
        }
    }

    /// Hands out the producer side of the input edge at `index`.
    ///
    /// # Errors
    ///
    /// [`Error::LessInputChannelsInJoint`] when the index is out of range,
    /// [`Error::InputChanDoesNotExist`] when that slot was already wired.
    pub fn take_input_sender(&self, index: usize) -> Result<OutputPort> {
        let mut input_txs = self.input_txs.lock();
        let slot = input_txs
            .get_mut(index)
            .ok_or(Error::LessInputChannelsInJoint)?;
        slot.take().ok_or(Error::InputChanDoesNotExist)
    }

    /// Registers the producer side of one more downstream edge.
    pub fn add_output_sender(&self, port: OutputPort) {
        self.outputs.lock().push(port);
    }

    /// The number of downstream edges wired so far.
    #[must_use]
    pub fn output_count(&self) -> usize {
        self.outputs.lock().len()
    }

    /// Spawns the joint's workers.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the stage lifecycle
    /// surface.
    pub async fn start(&self, ctx: Arc<dyn ConveyorContext>) -> Result<()> {
        let inputs = self.inputs.lock().clone();
        let outputs = self.outputs.lock().clone();
        // Unlinked input edges would otherwise never close.
        for slot in self.input_txs.lock().iter_mut() {
            slot.take();
        }

        let mut workers = self.workers.lock();
        for _ in 0..self.parallelism {
            let executor = Arc::clone(&self.executor);
            let ctx = Arc::clone(&ctx);
            let inputs = inputs.clone();
            let outputs = outputs.clone();
            workers.push(tokio::spawn(async move {
                let unique_id = executor.unique_id();
                supervised(&ctx, &unique_id, async {
                    if let Err(err) = executor.execute_loop(ctx.clone(), inputs, outputs).await {
                        ctx.send_log(
                            LogLevel::Error,
                            &format!("joint worker for [{unique_id}] failed"),
                            Some(&err),
                        );
                        tracing::error!(worker = %unique_id, error = %err, "joint worker failed");
                    }
                })
                .await;
            }));
        }
        Ok(())
    }

    /// Waits for every worker, runs cleanup once, then closes all outputs.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the stage lifecycle
    /// surface.
    pub async fn wait_and_stop(&self, ctx: Arc<dyn ConveyorContext>) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            let _ = handle.await;
        }

        if !self.cleaned.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.executor.cleanup().await {
                let unique_id = self.executor.unique_id();
                ctx.send_log(
                    LogLevel::Warn,
                    &format!("cleanup failed for [{unique_id}]"),
                    Some(&err),
                );
                tracing::warn!(executor = %unique_id, error = %err, "cleanup failed");
            }
        }

        self.outputs.lock().clear();
        Ok(())
    }
}

impl std::fmt::Debug for JointWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JointWorkerPool")
            .field("name", &self.executor.name())
            .field("parallelism", &self.parallelism)
            .field("outputs", &self.outputs.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StandardContext;
    use crate::executor::ReplicateJoint;
    use crate::item::Item;

    fn ctx() -> Arc<dyn ConveyorContext> {
        StandardContext::new("test")
    }

    #[test]
    fn test_take_input_sender_out_of_range() {
        let pool = JointWorkerPool::new(Arc::new(ReplicateJoint::new("rep", 2)));
        pool.create_channels(8);

        assert!(pool.take_input_sender(0).is_ok());
        assert_eq!(
            pool.take_input_sender(1).unwrap_err(),
            Error::LessInputChannelsInJoint
        );
    }

    #[test]
    fn test_take_input_sender_twice() {
        let pool = JointWorkerPool::new(Arc::new(ReplicateJoint::new("rep", 2)));
        pool.create_channels(8);

        assert!(pool.take_input_sender(0).is_ok());
        assert_eq!(
            pool.take_input_sender(0).unwrap_err(),
            Error::InputChanDoesNotExist
        );
    }

    #[tokio::test]
    async fn test_replicates_to_all_outputs_then_closes() {
        let pool = Arc::new(JointWorkerPool::new(Arc::new(ReplicateJoint::new("rep", 2))));
        pool.create_channels(8);

        let feed = pool.take_input_sender(0).unwrap();
        let (tx_a, rx_a) = edge(8);
        let (tx_b, rx_b) = edge(8);
        pool.add_output_sender(tx_a);
        pool.add_output_sender(tx_b);

        let ctx = ctx();
        pool.start(Arc::clone(&ctx)).await.unwrap();

        for i in 0..3 {
            feed.send(Item::new().with("num", i)).await.unwrap();
        }
        drop(feed);

        pool.wait_and_stop(ctx).await.unwrap();

        for rx in [rx_a, rx_b] {
            for i in 0..3 {
                assert_eq!(rx.recv().await.unwrap().get_i64("num"), Some(i));
            }
            assert!(rx.recv().await.is_none());
        }
    }
}
