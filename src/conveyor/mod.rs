//! The conveyor: topology builder and lifecycle coordinator.
//!
//! A conveyor is built fluently, stage by stage, then started once. The
//! conveyor owns the shared context, spawns one supervising task per worker
//! pool, waits for the whole graph to drain and runs the final cleanup. The
//! configuration freezes as soon as the first stage is added.

mod progress;


use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::{ConveyorContext, LogLevel, LogMessage, StandardContext};
use crate::errors::{Error, Result};
use crate::executor::{JointExecutor, NodeExecutor, NodeRole, WorkerMode};
use crate::lifecycle::{mark_state, ConveyorState, LifeCycleHandler};
use crate::linker::{link_joint_to_node, link_node_to_joint, link_node_to_node};
use crate::workers::{JointWorkerPool, NodeWorkerPool};

/// Buffer capacity used when the caller passes zero.
const DEFAULT_BUFFER_LEN: usize = 100;

/// Expected run duration used when progress is enabled with zero.
const DEFAULT_EXPECTED_DURATION: Duration = Duration::from_secs(3600);

/// Interval between progress estimates.
const PROGRESS_TICK: Duration = Duration::from_millis(500);

/// A bounded concurrent dataflow pipeline.
///
/// Stages are added in order and auto-linked; joints fan a stream out into
/// independent downstream paths. `start` runs the graph to completion,
/// `stop` kills it early, and the context's cancellation token coordinates
/// both shutdowns without deadlocking any stage.
pub struct Conveyor {
    id: String,
    name: String,
    ctx: Arc<dyn ConveyorContext>,
    buffer_len: usize,
    need_progress: bool,
    expected_duration: Duration,
    tick_progress: Duration,
    progress_tx: Arc<Mutex<Option<watch::Sender<f64>>>>,
    progress_rx: Option<watch::Receiver<f64>>,
    life_cycle: Option<Arc<dyn LifeCycleHandler>>,
    workers: Vec<Arc<NodeWorkerPool>>,
    joints: Vec<Arc<JointWorkerPool>>,
    open_for_config: AtomicBool,
    started: AtomicBool,
    cleaned: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl Conveyor {
    /// Creates a conveyor with all options set to their defaults.
    ///
    /// A `buffer_len` of zero is normalized to 100.
    #[must_use]
    pub fn new(name: impl Into<String>, buffer_len: usize) -> Self {
        let name = name.into();
        let buffer_len = if buffer_len == 0 {
            DEFAULT_BUFFER_LEN
        } else {
            buffer_len
        };

        Self {
            id: Uuid::new_v4().to_string(),
            ctx: StandardContext::new(name.clone()),
            name,
            buffer_len,
            need_progress: false,
            expected_duration: DEFAULT_EXPECTED_DURATION,
            tick_progress: PROGRESS_TICK,
            progress_tx: Arc::new(Mutex::new(None)),
            progress_rx: None,
            life_cycle: None,
            workers: Vec::new(),
            joints: Vec::new(),
            open_for_config: AtomicBool::new(true),
            started: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            started_at: Mutex::new(None),
        }
    }

    fn lock_config(&self) {
        self.open_for_config.store(false, Ordering::SeqCst);
    }

    fn config_open(&self) -> bool {
        self.open_for_config.load(Ordering::SeqCst)
    }

    /// Overrides the generated conveyor id.
    ///
    /// No effect once the first stage has been added.
    pub fn set_id(&mut self, id: impl Into<String>) -> &mut Self {
        if self.config_open() {
            self.id = id.into();
        }
        self
    }

    /// Attaches a run deadline to the shared context.
    ///
    /// A zero timeout derives a plain cancelable context instead. No effect
    /// once the first stage has been added. Call before `set_context`
    /// replaces the context, not after.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        if self.config_open() {
            self.ctx = if timeout.is_zero() {
                self.ctx.child_cancelable()
            } else {
                self.ctx.child_with_timeout(timeout)
            };
        }
        self
    }

    /// Enables the progress channel, estimating against `expected`.
    ///
    /// A zero duration is normalized to one hour. No effect once the first
    /// stage has been added.
    pub fn enable_progress(&mut self, expected: Duration) -> &mut Self {
        if self.config_open() {
            self.need_progress = true;
            self.expected_duration = if expected.is_zero() {
                DEFAULT_EXPECTED_DURATION
            } else {
                expected
            };
            let (tx, rx) = watch::channel(0.0);
            *self.progress_tx.lock() = Some(tx);
            self.progress_rx = Some(rx);
        }
        self
    }

    /// Installs a lifecycle handler.
    ///
    /// No effect once the first stage has been added.
    pub fn set_lifecycle_handler(&mut self, handler: Arc<dyn LifeCycleHandler>) -> &mut Self {
        if self.config_open() {
            self.life_cycle = Some(handler);
        }
        self
    }

    /// Substitutes a custom context implementation.
    ///
    /// No effect once the first stage has been added. Resets any timeout set
    /// earlier, so call this before `set_timeout`.
    pub fn set_context(&mut self, ctx: Arc<dyn ConveyorContext>) -> &mut Self {
        if self.config_open() {
            self.ctx = ctx;
        }
        self
    }

    /// The conveyor id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The conveyor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The normalized per-edge buffer capacity.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// The shared context driving this conveyor.
    #[must_use]
    pub fn context(&self) -> Arc<dyn ConveyorContext> {
        Arc::clone(&self.ctx)
    }

    /// A token that fires when the conveyor is done or cancelled.
    #[must_use]
    pub fn done(&self) -> CancellationToken {
        self.ctx.token()
    }

    /// Subscribes to the conveyor's log sink, if still open.
    #[must_use]
    pub fn logs(&self) -> Option<broadcast::Receiver<LogMessage>> {
        self.ctx.subscribe_logs()
    }

    /// Subscribes to the conveyor's status sink, if still open.
    #[must_use]
    pub fn status(&self) -> Option<watch::Receiver<String>> {
        self.ctx.subscribe_status()
    }

    /// The progress channel, when progress was enabled.
    #[must_use]
    pub fn progress(&self) -> Option<watch::Receiver<f64>> {
        self.progress_rx.clone()
    }

    /// The most recently added node worker.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyConveyor`] when no node was added yet.
    pub fn last_worker(&self) -> Result<Arc<NodeWorkerPool>> {
        self.workers.last().map(Arc::clone).ok_or(Error::EmptyConveyor)
    }

    /// Adds a node stage and links it after the previously added node.
    ///
    /// The first node added this way is expected to be the conveyor's
    /// source; it is left unlinked.
    ///
    /// # Errors
    ///
    /// Wiring errors, e.g. adding a node after a sink.
    pub fn add_node_executor(
        &mut self,
        executor: Arc<dyn NodeExecutor>,
        mode: WorkerMode,
        role: NodeRole,
    ) -> Result<()> {
        let pool = Arc::new(NodeWorkerPool::new(executor, mode, role));
        self.add_node_worker(pool, true)
    }

    /// Adds a prepared node worker pool, optionally auto-linking it.
    ///
    /// # Errors
    ///
    /// Wiring errors when `to_link` is set and the previous node cannot feed
    /// this one.
    pub fn add_node_worker(&mut self, pool: Arc<NodeWorkerPool>, to_link: bool) -> Result<()> {
        pool.create_channels(self.buffer_len);
        self.workers.push(pool);

        let count = self.workers.len();
        if to_link && count > 1 {
            let prev = Arc::clone(&self.workers[count - 2]);
            let curr = Arc::clone(&self.workers[count - 1]);
            if let Err(err) = link_node_to_node(&prev, &curr) {
                tracing::warn!(
                    from = %prev.name(),
                    to = %curr.name(),
                    error = %err,
                    "linking adjacent nodes failed"
                );
                return Err(err);
            }
        }

        self.lock_config();
        Ok(())
    }

    /// Adds a joint stage without linking it.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` matches the other builders.
    pub fn add_joint_executor(&mut self, executor: Arc<dyn JointExecutor>) -> Result<()> {
        let pool = Arc::new(JointWorkerPool::new(executor));
        pool.create_channels(self.buffer_len);
        self.joints.push(pool);
        self.lock_config();
        Ok(())
    }

    /// Adds a joint stage and feeds it from the last added node.
    ///
    /// # Errors
    ///
    /// [`Error::NoNodesAvailable`] when no node was added yet, plus wiring
    /// errors.
    pub fn add_joint_after_node(&mut self, executor: Arc<dyn JointExecutor>) -> Result<()> {
        let node = Arc::clone(self.workers.last().ok_or(Error::NoNodesAvailable)?);

        self.add_joint_executor(executor)?;

        let joint = Arc::clone(self.joints.last().ok_or(Error::NoJointsAvailable)?);
        link_node_to_joint(&node, &joint, 0)
    }

    /// Adds a node stage and registers it as one more output of the last
    /// added joint.
    ///
    /// # Errors
    ///
    /// [`Error::NoJointsAvailable`] when no joint was added yet, plus wiring
    /// errors.
    pub fn add_node_after_joint(
        &mut self,
        executor: Arc<dyn NodeExecutor>,
        mode: WorkerMode,
        role: NodeRole,
    ) -> Result<()> {
        let joint = Arc::clone(self.joints.last().ok_or(Error::NoJointsAvailable)?);

        let pool = Arc::new(NodeWorkerPool::new(executor, mode, role));
        self.add_node_worker(Arc::clone(&pool), false)?;

        link_joint_to_node(&joint, &pool)
    }

    /// Runs the conveyor to completion.
    ///
    /// Spawns one supervising task per stage pool, waits for the whole graph
    /// to drain, then runs the final cleanup. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyConveyor`] when no node stage was ever added.
    pub async fn start(&self) -> Result<()> {
        self.lock_config();

        if self.workers.is_empty() {
            return Err(Error::EmptyConveyor);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        *self.started_at.lock() = Some(Instant::now());

        // A deadline set through set_timeout (or a custom context) is armed
        // here, where a runtime is guaranteed to exist.
        if let Some(deadline) = self.ctx.deadline() {
            let ctx = Arc::clone(&self.ctx);
            let token = ctx.token();
            tokio::spawn(async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline.into()) => ctx.cancel(),
                }
            });
        }

        if self.need_progress {
            progress::spawn_ticker(
                Arc::clone(&self.progress_tx),
                self.ctx.token(),
                self.tick_progress,
                self.expected_duration,
            );
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for pool in &self.workers {
            let pool = Arc::clone(pool);
            let ctx = Arc::clone(&self.ctx);
            handles.push(tokio::spawn(async move {
                if let Err(err) = pool.start(Arc::clone(&ctx)).await {
                    ctx.send_log(LogLevel::Error, "node worker start failed", Some(&err));
                    tracing::error!(worker = %pool.name(), error = %err, "node worker start failed");
                    return;
                }
                if let Err(err) = pool.wait_and_stop(Arc::clone(&ctx)).await {
                    ctx.send_log(LogLevel::Error, "node worker stop failed", Some(&err));
                    tracing::error!(worker = %pool.name(), error = %err, "node worker stop failed");
                }
            }));
        }

        for pool in &self.joints {
            let pool = Arc::clone(pool);
            let ctx = Arc::clone(&self.ctx);
            handles.push(tokio::spawn(async move {
                if let Err(err) = pool.start(Arc::clone(&ctx)).await {
                    ctx.send_log(LogLevel::Error, "joint worker start failed", Some(&err));
                    tracing::error!(worker = %pool.name(), error = %err, "joint worker start failed");
                    return;
                }
                if let Err(err) = pool.wait_and_stop(Arc::clone(&ctx)).await {
                    ctx.send_log(LogLevel::Error, "joint worker stop failed", Some(&err));
                    tracing::error!(worker = %pool.name(), error = %err, "joint worker stop failed");
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        // Reached on success and on timeout alike; both are graceful ends.
        self.cleanup(false).await;

        Ok(())
    }

    /// Kills a running conveyor and returns the elapsed run time.
    ///
    /// Safe to call at any point; before `start` it is a no-op returning a
    /// zero duration.
    pub async fn stop(&self) -> Duration {
        if !self.started.load(Ordering::SeqCst) {
            return Duration::ZERO;
        }
        self.cleanup(true).await;
        self.started_at.lock().map_or(Duration::ZERO, |at| at.elapsed())
    }

    /// Marks the conveyor's current state through the lifecycle handler.
    ///
    /// # Errors
    ///
    /// [`Error::LifeCycleNotSupported`] when no handler is installed, or
    /// whatever the handler reports.
    pub async fn mark_current_state(&self, state: ConveyorState) -> Result<()> {
        let handler = self
            .life_cycle
            .as_deref()
            .ok_or(Error::LifeCycleNotSupported)?;
        mark_state(handler, state).await
    }

    /// Runs on every termination path: success, kill and timeout.
    ///
    /// Cancelling the context is idempotent, everything else is behind a
    /// one-shot guard: the progress channel closes once and the finished
    /// mark fires at most once, and only for graceful ends.
    async fn cleanup(&self, abrupt_kill: bool) {
        self.ctx.cancel();

        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.need_progress {
            self.progress_tx.lock().take();
        }

        if !abrupt_kill && self.life_cycle.is_some() {
            if let Err(err) = self.mark_current_state(ConveyorState::Finished).await {
                tracing::warn!(conveyor = %self.name, error = %err, "unable to mark conveyor as finished");
            }
        }
    }
}

impl std::fmt::Debug for Conveyor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conveyor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("buffer_len", &self.buffer_len)
            .field("workers", &self.workers.len())
            .field("joints", &self.joints.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CollectingSink, NumberSource};

    #[test]
    fn test_buffer_len_normalized() {
        let cnv = Conveyor::new("test", 0);
        assert_eq!(cnv.buffer_len(), 100);

        let cnv = Conveyor::new("test", 7);
        assert_eq!(cnv.buffer_len(), 7);
    }

    #[test]
    fn test_config_freezes_after_first_node() {
        let mut cnv = Conveyor::new("test", 10);
        cnv.set_id("before");
        assert_eq!(cnv.id(), "before");

        cnv.add_node_executor(
            Arc::new(NumberSource::new("gen", 5)),
            WorkerMode::Loop,
            NodeRole::Source,
        )
        .unwrap();

        cnv.set_id("after");
        assert_eq!(cnv.id(), "before");
        assert!(cnv.progress().is_none());
        cnv.enable_progress(Duration::from_secs(1));
        assert!(cnv.progress().is_none());
    }

    #[tokio::test]
    async fn test_start_empty_conveyor_fails() {
        let cnv = Conveyor::new("empty", 10);
        assert_eq!(cnv.start().await.unwrap_err(), Error::EmptyConveyor);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let mut cnv = Conveyor::new("test", 10);
        cnv.add_node_executor(
            Arc::new(NumberSource::new("gen", 5)),
            WorkerMode::Loop,
            NodeRole::Source,
        )
        .unwrap();

        assert_eq!(cnv.stop().await, Duration::ZERO);
        assert!(!cnv.done().is_cancelled());
    }

    #[tokio::test]
    async fn test_add_joint_after_node_requires_node() {
        let mut cnv = Conveyor::new("test", 10);
        let err = cnv
            .add_joint_after_node(Arc::new(crate::executor::ReplicateJoint::new("rep", 2)))
            .unwrap_err();
        assert_eq!(err, Error::NoNodesAvailable);
    }

    #[tokio::test]
    async fn test_add_node_after_joint_requires_joint() {
        let mut cnv = Conveyor::new("test", 10);
        let err = cnv
            .add_node_after_joint(
                Arc::new(CollectingSink::new("sink")),
                WorkerMode::Loop,
                NodeRole::Sink,
            )
            .unwrap_err();
        assert_eq!(err, Error::NoJointsAvailable);
    }

    #[tokio::test]
    async fn test_mark_without_handler_unsupported() {
        let cnv = Conveyor::new("test", 10);
        let err = cnv
            .mark_current_state(ConveyorState::Started)
            .await
            .unwrap_err();
        assert_eq!(err, Error::LifeCycleNotSupported);
    }

    #[test]
    fn test_last_worker() {
        let mut cnv = Conveyor::new("test", 10);
        assert_eq!(cnv.last_worker().unwrap_err(), Error::EmptyConveyor);

        cnv.add_node_executor(
            Arc::new(NumberSource::new("gen", 5)),
            WorkerMode::Loop,
            NodeRole::Source,
        )
        .unwrap();
        assert_eq!(cnv.last_worker().unwrap().name(), "gen");
    }
}
