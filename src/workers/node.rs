//! The worker pool behind a source, operator or sink node.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::{abort_misconfigured, supervised};
use crate::channel::{edge, InputPort, OutputPort};
use crate::context::{ConveyorContext, LogLevel};
use crate::errors::{Error, Result};
use crate::executor::{NodeExecutor, NodeRole, WorkerMode};

/// Runs `parallelism` concurrent workers over one [`NodeExecutor`].
///
/// The pool owns the stage's ports. Its input edge is created by
/// [`NodeWorkerPool::create_channels`]; the producer side of that edge is
/// handed to the upstream stage during linking, which keeps the single
/// producer invariant: exactly one stage can ever close an edge.
pub struct NodeWorkerPool {
    executor: Arc<dyn NodeExecutor>,
    mode: WorkerMode,
    role: NodeRole,
    parallelism: usize,
    input: Mutex<Option<InputPort>>,
    /// Producer side of our own input edge, parked here until linking moves
    /// it into the upstream stage.
    input_tx: Mutex<Option<OutputPort>>,
    output: Mutex<Option<OutputPort>>,
    semaphore: Mutex<Option<Arc<Semaphore>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cleaned: AtomicBool,
}

impl NodeWorkerPool {
    /// Creates a pool for the given executor, mode and role.
    ///
    /// `parallelism` below one is coerced to one.
    #[must_use]
    pub fn new(executor: Arc<dyn NodeExecutor>, mode: WorkerMode, role: NodeRole) -> Self {
        let parallelism = executor.parallelism().max(1);
        Self {
            executor,
            mode,
            role,
            parallelism,
            input: Mutex::new(None),
            input_tx: Mutex::new(None),
            output: Mutex::new(None),
            semaphore: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        }
    }

    /// The role this pool plays in the topology.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// The mode this pool drives its executor in.
    #[must_use]
    pub fn mode(&self) -> WorkerMode {
        self.mode
    }

    /// The executor's name.
    #[must_use]
    pub fn name(&self) -> String {
        self.executor.name().to_string()
    }

    /// The number of workers this pool runs.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Creates the stage's input edge with the given buffer capacity.
    ///
    /// Sources have no input and create nothing here.
    pub fn create_channels(&self, buffer: usize) {
        if self.role == NodeRole::Source {
            return;
        }
        let (tx, rx) = edge(buffer);
        *self.input.lock() = Some(rx);
        *self.input_tx.lock() = Some(tx);
    }

    /// Hands out the producer side of this stage's input edge.
    ///
    /// Called by the linker exactly once per stage.
    ///
    /// # Errors
    ///
    /// [`Error::InputChanDoesNotExist`] for sources, or when the producer
    /// side was already handed out.
    pub fn take_input_sender(&self) -> Result<OutputPort> {
        if self.role == NodeRole::Source {
            return Err(Error::InputChanDoesNotExist);
        }
        self.input_tx.lock().take().ok_or(Error::InputChanDoesNotExist)
    }

    /// Installs the producer side of the downstream edge.
    ///
    /// # Errors
    ///
    /// [`Error::OutputChanDoesNotExist`] for sinks, which never produce.
    pub fn set_output(&self, port: OutputPort) -> Result<()> {
        if self.role == NodeRole::Sink {
            return Err(Error::OutputChanDoesNotExist);
        }
        *self.output.lock() = Some(port);
        Ok(())
    }

    /// Starts the pool.
    ///
    /// In loop mode this spawns the workers and returns. In transaction mode
    /// it runs the dispatch loop to completion: the caller is expected to be
    /// the stage's supervising task.
    ///
    /// # Errors
    ///
    /// Currently infallible for both supported modes; the `Result` mirrors
    /// the rest of the stage lifecycle surface.
    pub async fn start(&self, ctx: Arc<dyn ConveyorContext>) -> Result<()> {
        match self.mode {
            WorkerMode::Loop => {
                self.start_loop_mode(&ctx);
                Ok(())
            }
            WorkerMode::Transaction => {
                self.run_transaction_mode(&ctx).await;
                Ok(())
            }
        }
    }

    fn start_loop_mode(&self, ctx: &Arc<dyn ConveyorContext>) {
        let input = self.input.lock().clone();
        let output = self.output.lock().clone();
        // An input edge that was never linked has no producer; dropping our
        // parked sender lets the workers observe end-of-stream instead of
        // hanging until cancellation.
        self.input_tx.lock().take();

        let mut workers = self.workers.lock();
        for _ in 0..self.parallelism {
            let executor = Arc::clone(&self.executor);
            let ctx = Arc::clone(ctx);
            let input = input.clone();
            let output = output.clone();
            workers.push(tokio::spawn(async move {
                let unique_id = executor.unique_id();
                supervised(&ctx, &unique_id, async {
                    if let Err(err) = executor.execute_loop(ctx.clone(), input, output).await {
                        if err == Error::ExecuteLoopNotImplemented {
                            abort_misconfigured(&ctx, &unique_id, &err);
                        }
                        ctx.send_log(
                            LogLevel::Warn,
                            &format!("loop worker for [{unique_id}] exited with failure"),
                            Some(&err),
                        );
                        tracing::warn!(worker = %unique_id, error = %err, "loop worker exited with failure");
                    }
                })
                .await;
            }));
        }
    }

    async fn run_transaction_mode(&self, ctx: &Arc<dyn ConveyorContext>) {
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        *self.semaphore.lock() = Some(Arc::clone(&semaphore));

        let token = ctx.token();
        let unique_id = self.executor.unique_id();
        let input = match self.role {
            NodeRole::Source => None,
            _ => self.input.lock().clone(),
        };
        let output = self.output.lock().clone();
        self.input_tx.lock().take();

        loop {
            if ctx.is_done() {
                break;
            }

            let item = match &input {
                None => None,
                Some(port) => match port.recv_or_cancel(&token).await {
                    Some(item) => Some(item),
                    None => {
                        if !token.is_cancelled() {
                            ctx.send_log(
                                LogLevel::Info,
                                &format!("input channel closed for [{unique_id}], stage draining"),
                                None,
                            );
                        }
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                () = token.cancelled() => break,
                acquired = Arc::clone(&semaphore).acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let executor = Arc::clone(&self.executor);
            let task_ctx = Arc::clone(ctx);
            let task_token = token.clone();
            let task_output = output.clone();
            let task_id = unique_id.clone();
            let role = self.role;
            tokio::spawn(async move {
                // Held until the task ends, so the permit is released on the
                // success, error and panic-recovery paths alike.
                let _permit = permit;
                supervised(&task_ctx, &task_id, async {
                    match executor.execute(task_ctx.clone(), item).await {
                        Ok(produced) => {
                            if let Some(out) = &task_output {
                                if !task_ctx.is_done() {
                                    out.send_or_cancel(&task_token, produced).await;
                                }
                            }
                        }
                        Err(err) if err == Error::ExecuteNotImplemented => {
                            abort_misconfigured(&task_ctx, &task_id, &err);
                        }
                        Err(err) if err == Error::SourceExhausted && role == NodeRole::Source => {
                            task_ctx.send_log(
                                LogLevel::Info,
                                &format!("source [{task_id}] exhausted, draining conveyor"),
                                None,
                            );
                            task_ctx.cancel();
                        }
                        Err(err) => {
                            task_ctx.send_log(
                                LogLevel::Warn,
                                &format!("executor [{task_id}] failed, item dropped"),
                                Some(&err),
                            );
                            tracing::warn!(executor = %task_id, error = %err, "transaction failed, item dropped");
                        }
                    }
                })
                .await;
            });
        }
    }

    /// Waits for every worker to finish, then runs cleanup exactly once and
    /// closes the output edge exactly once.
    ///
    /// # Errors
    ///
    /// [`Error::PoolNotStarted`] in transaction mode when `start` never ran:
    /// there is no semaphore to drain and nothing to wait for.
    pub async fn wait_and_stop(&self, ctx: Arc<dyn ConveyorContext>) -> Result<()> {
        match self.mode {
            WorkerMode::Loop => {
                let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
                for handle in handles {
                    let _ = handle.await;
                }
            }
            WorkerMode::Transaction => {
                let semaphore = self
                    .semaphore
                    .lock()
                    .as_ref()
                    .map(Arc::clone)
                    .ok_or(Error::PoolNotStarted)?;
                let permits = u32::try_from(self.parallelism).unwrap_or(u32::MAX);
                // Holding every permit proves all spawned tasks have finished.
                let _ = semaphore.acquire_many(permits).await;
            }
        }

        self.run_cleanup(&ctx).await;
        self.output.lock().take();
        Ok(())
    }

    async fn run_cleanup(&self, ctx: &Arc<dyn ConveyorContext>) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
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
}

impl std::fmt::Debug for NodeWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeWorkerPool")
            .field("name", &self.executor.name())
            .field("mode", &self.mode)
            .field("role", &self.role)
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StandardContext;
    use crate::item::Item;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct EchoExecutor {
        parallelism: usize,
    }

    #[async_trait]
    impl NodeExecutor for EchoExecutor {
        fn name(&self) -> &str {
            "echo"
        }

        fn parallelism(&self) -> usize {
            self.parallelism
        }

        async fn execute(
            &self,
            _ctx: Arc<dyn ConveyorContext>,
            item: Option<Item>,
        ) -> Result<Item> {
            Ok(item.unwrap_or_default())
        }
    }

    fn ctx() -> Arc<dyn ConveyorContext> {
        StandardContext::new("test")
    }

    #[test]
    fn test_parallelism_coerced_to_one() {
        let pool = NodeWorkerPool::new(
            Arc::new(EchoExecutor { parallelism: 0 }),
            WorkerMode::Transaction,
            NodeRole::Operator,
        );
        assert_eq!(pool.parallelism(), 1);
    }

    #[test]
    fn test_source_has_no_input_port() {
        let pool = NodeWorkerPool::new(
            Arc::new(EchoExecutor { parallelism: 1 }),
            WorkerMode::Loop,
            NodeRole::Source,
        );
        pool.create_channels(8);
        assert_eq!(pool.take_input_sender().unwrap_err(), Error::InputChanDoesNotExist);
    }

    #[test]
    fn test_sink_has_no_output_port() {
        let pool = NodeWorkerPool::new(
            Arc::new(EchoExecutor { parallelism: 1 }),
            WorkerMode::Loop,
            NodeRole::Sink,
        );
        let (tx, _rx) = edge(8);
        assert_eq!(pool.set_output(tx).unwrap_err(), Error::OutputChanDoesNotExist);
    }

    #[test]
    fn test_input_sender_taken_once() {
        let pool = NodeWorkerPool::new(
            Arc::new(EchoExecutor { parallelism: 1 }),
            WorkerMode::Loop,
            NodeRole::Operator,
        );
        pool.create_channels(8);
        assert!(pool.take_input_sender().is_ok());
        assert_eq!(pool.take_input_sender().unwrap_err(), Error::InputChanDoesNotExist);
    }

    #[tokio::test]
    async fn test_wait_and_stop_without_start_is_rejected() {
        let pool = NodeWorkerPool::new(
            Arc::new(EchoExecutor { parallelism: 2 }),
            WorkerMode::Transaction,
            NodeRole::Operator,
        );
        pool.create_channels(8);

        let err = pool.wait_and_stop(ctx()).await.unwrap_err();
        assert_eq!(err, Error::PoolNotStarted);
    }

    #[tokio::test]
    async fn test_transaction_mode_forwards_items() {
        let pool = Arc::new(NodeWorkerPool::new(
            Arc::new(EchoExecutor { parallelism: 2 }),
            WorkerMode::Transaction,
            NodeRole::Operator,
        ));
        pool.create_channels(8);

        let feed = pool.take_input_sender().unwrap();
        let (downstream_tx, downstream_rx) = edge(8);
        pool.set_output(downstream_tx).unwrap();

        let ctx = ctx();
        let runner = tokio::spawn({
            let pool = Arc::clone(&pool);
            let ctx = Arc::clone(&ctx);
            async move {
                pool.start(Arc::clone(&ctx)).await.unwrap();
                pool.wait_and_stop(ctx).await.unwrap();
            }
        });

        for i in 0..5 {
            feed.send(Item::new().with("num", i)).await.unwrap();
        }
        drop(feed);

        runner.await.unwrap();

        let mut seen = 0;
        while downstream_rx.recv().await.is_some() {
            seen += 1;
        }
        assert_eq!(seen, 5);
    }

    struct CountingCleanup {
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeExecutor for CountingCleanup {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute_loop(
            &self,
            _ctx: Arc<dyn ConveyorContext>,
            _input: Option<InputPort>,
            _output: Option<OutputPort>,
        ) -> Result<()> {
            Ok(())
        }

        async fn cleanup(&self) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_exactly_once() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let pool = NodeWorkerPool::new(
            Arc::new(CountingCleanup {
                cleanups: Arc::clone(&cleanups),
            }),
            WorkerMode::Loop,
            NodeRole::Source,
        );

        let ctx = ctx();
        pool.start(Arc::clone(&ctx)).await.unwrap();
        pool.wait_and_stop(Arc::clone(&ctx)).await.unwrap();
        pool.wait_and_stop(ctx).await.unwrap();

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }
}
