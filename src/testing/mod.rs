//! Reusable executors and lifecycle doubles for exercising conveyors.
//!
//! These are small, deterministic stages used by the crate's own tests and
//! handy for downstream users writing theirs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{InputPort, OutputPort};
use crate::context::ConveyorContext;
use crate::errors::{Error, Result};
use crate::executor::NodeExecutor;
use crate::item::Item;
use crate::lifecycle::{ConveyorState, LifeCycleHandler};

/// A source of integers under the key `num`.
///
/// In loop mode it emits `0..=limit` and returns. In transaction mode it
/// counts down from `limit` and reports [`Error::SourceExhausted`] once the
/// counter reaches zero, optionally after a configurable delay that gives
/// downstream stages time to drain.
pub struct NumberSource {
    name: String,
    limit: i64,
    remaining: AtomicI64,
    exhaust_delay: Duration,
}

impl NumberSource {
    /// Creates a source that produces `limit` transaction items, or
    /// `limit + 1` loop items (`0..=limit`).
    #[must_use]
    pub fn new(name: impl Into<String>, limit: i64) -> Self {
        Self {
            name: name.into(),
            limit,
            remaining: AtomicI64::new(limit),
            exhaust_delay: Duration::ZERO,
        }
    }

    /// Delays the exhaustion report, letting in-flight items drain first.
    #[must_use]
    pub fn with_exhaust_delay(mut self, delay: Duration) -> Self {
        self.exhaust_delay = delay;
        self
    }
}

#[async_trait]
impl NodeExecutor for NumberSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: Arc<dyn ConveyorContext>, _item: Option<Item>) -> Result<Item> {
        let value = self.remaining.fetch_sub(1, Ordering::SeqCst);
        if value <= 0 {
            if !self.exhaust_delay.is_zero() {
                tokio::time::sleep(self.exhaust_delay).await;
            }
            return Err(Error::SourceExhausted);
        }
        Ok(Item::new().with("num", value))
    }

    async fn execute_loop(
        &self,
        ctx: Arc<dyn ConveyorContext>,
        _input: Option<InputPort>,
        output: Option<OutputPort>,
    ) -> Result<()> {
        let output = output.ok_or(Error::OutputChanDoesNotExist)?;
        let token = ctx.token();
        for i in 0..=self.limit {
            if !output.send_or_cancel(&token, Item::new().with("num", i)).await {
                break;
            }
        }
        Ok(())
    }
}

/// An operator that squares `num` into `sqr`.
pub struct SquareOperator {
    name: String,
    parallelism: usize,
}

impl SquareOperator {
    /// Creates a squaring operator with one worker.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parallelism: 1,
        }
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }
}

#[async_trait]
impl NodeExecutor for SquareOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }

    async fn execute(&self, _ctx: Arc<dyn ConveyorContext>, item: Option<Item>) -> Result<Item> {
        let mut item = item.ok_or(Error::FetchRejected)?;
        let num = item.get_i64("num").ok_or(Error::FetchRejected)?;
        item.set("sqr", num * num);
        Ok(item)
    }

    async fn execute_loop(
        &self,
        ctx: Arc<dyn ConveyorContext>,
        input: Option<InputPort>,
        output: Option<OutputPort>,
    ) -> Result<()> {
        let input = input.ok_or(Error::InputChanDoesNotExist)?;
        let output = output.ok_or(Error::OutputChanDoesNotExist)?;
        let token = ctx.token();
        while let Some(mut item) = input.recv_or_cancel(&token).await {
            let Some(num) = item.get_i64("num") else {
                continue;
            };
            item.set("sqr", num * num);
            if !output.send_or_cancel(&token, item).await {
                break;
            }
        }
        Ok(())
    }
}

/// An operator that adds a constant to `sqr` under the key `added`.
pub struct AddOperator {
    name: String,
    to_add: i64,
}

impl AddOperator {
    /// Creates an adding operator.
    #[must_use]
    pub fn new(name: impl Into<String>, to_add: i64) -> Self {
        Self {
            name: name.into(),
            to_add,
        }
    }
}

#[async_trait]
impl NodeExecutor for AddOperator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: Arc<dyn ConveyorContext>, item: Option<Item>) -> Result<Item> {
        let mut item = item.ok_or(Error::FetchRejected)?;
        let sqr = item.get_i64("sqr").ok_or(Error::FetchRejected)?;
        item.set("added", sqr + self.to_add);
        Ok(item)
    }
}

/// A sink that records every item it observes.
#[derive(Clone)]
pub struct CollectingSink {
    name: String,
    items: Arc<Mutex<Vec<Item>>>,
}

impl CollectingSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns a snapshot of the collected items.
    #[must_use]
    pub fn collected(&self) -> Vec<Item> {
        self.items.lock().clone()
    }

    /// Returns how many items were observed.
    #[must_use]
    pub fn count(&self) -> usize {
        self.items.lock().len()
    }
}

#[async_trait]
impl NodeExecutor for CollectingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: Arc<dyn ConveyorContext>, item: Option<Item>) -> Result<Item> {
        let item = item.ok_or(Error::SinkRejected)?;
        self.items.lock().push(item.clone());
        Ok(item)
    }

    async fn execute_loop(
        &self,
        ctx: Arc<dyn ConveyorContext>,
        input: Option<InputPort>,
        _output: Option<OutputPort>,
    ) -> Result<()> {
        let input = input.ok_or(Error::InputChanDoesNotExist)?;
        let token = ctx.token();
        while let Some(item) = input.recv_or_cancel(&token).await {
            self.items.lock().push(item);
        }
        Ok(())
    }
}

/// A source that produces nothing and waits for cancellation.
pub struct BlockingSource {
    name: String,
}

impl BlockingSource {
    /// Creates a blocking source.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NodeExecutor for BlockingSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute_loop(
        &self,
        ctx: Arc<dyn ConveyorContext>,
        _input: Option<InputPort>,
        _output: Option<OutputPort>,
    ) -> Result<()> {
        ctx.token().cancelled().await;
        Ok(())
    }
}

/// Wraps a node executor and counts its cleanup invocations.
pub struct CleanupProbe {
    inner: Arc<dyn NodeExecutor>,
    cleanups: Arc<AtomicUsize>,
}

impl CleanupProbe {
    /// Wraps an executor.
    #[must_use]
    pub fn new(inner: Arc<dyn NodeExecutor>) -> Self {
        Self {
            inner,
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns a handle to the cleanup counter.
    #[must_use]
    pub fn cleanups(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.cleanups)
    }
}

#[async_trait]
impl NodeExecutor for CleanupProbe {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn unique_id(&self) -> String {
        self.inner.unique_id()
    }

    fn parallelism(&self) -> usize {
        self.inner.parallelism()
    }

    async fn execute(&self, ctx: Arc<dyn ConveyorContext>, item: Option<Item>) -> Result<Item> {
        self.inner.execute(ctx, item).await
    }

    async fn execute_loop(
        &self,
        ctx: Arc<dyn ConveyorContext>,
        input: Option<InputPort>,
        output: Option<OutputPort>,
    ) -> Result<()> {
        self.inner.execute_loop(ctx, input, output).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.inner.cleanup().await
    }
}

/// A lifecycle handler that records every mark it receives.
#[derive(Default)]
pub struct RecordingLifeCycle {
    marks: Mutex<Vec<ConveyorState>>,
    status_msg: Mutex<String>,
    progress: Mutex<String>,
}

impl RecordingLifeCycle {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the marks observed so far, in order.
    #[must_use]
    pub fn marks(&self) -> Vec<ConveyorState> {
        self.marks.lock().clone()
    }

    /// Returns true if the given state was marked.
    #[must_use]
    pub fn was_marked(&self, state: ConveyorState) -> bool {
        self.marks.lock().contains(&state)
    }

    fn record(&self, state: ConveyorState) -> Result<()> {
        self.marks.lock().push(state);
        Ok(())
    }
}

#[async_trait]
impl LifeCycleHandler for RecordingLifeCycle {
    async fn state(&self) -> Result<ConveyorState> {
        Ok(self
            .marks
            .lock()
            .last()
            .copied()
            .unwrap_or(ConveyorState::Preparing))
    }

    async fn status_msg(&self) -> Result<String> {
        Ok(self.status_msg.lock().clone())
    }

    async fn update_status_msg(&self, msg: &str) -> Result<()> {
        *self.status_msg.lock() = msg.to_string();
        Ok(())
    }

    async fn progress(&self) -> Result<String> {
        Ok(self.progress.lock().clone())
    }

    async fn update_progress(&self, progress: &str) -> Result<()> {
        *self.progress.lock() = progress.to_string();
        Ok(())
    }

    async fn mark_preparing(&self) -> Result<()> {
        self.record(ConveyorState::Preparing)
    }

    async fn mark_started(&self) -> Result<()> {
        self.record(ConveyorState::Started)
    }

    async fn mark_to_kill(&self) -> Result<()> {
        self.record(ConveyorState::ToKill)
    }

    async fn mark_killed(&self) -> Result<()> {
        self.record(ConveyorState::Killed)
    }

    async fn mark_finished(&self) -> Result<()> {
        self.record(ConveyorState::Finished)
    }

    async fn mark_error(&self) -> Result<()> {
        self.record(ConveyorState::InternalError)
    }
}
