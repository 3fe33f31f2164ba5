//! Worker pools that drive executors.
//!
//! A pool owns the ports of one stage, runs `parallelism` workers over the
//! user executor, and guarantees the stage lifecycle: workers finish, cleanup
//! runs exactly once, then the output side closes exactly once.

mod joint;
mod node;

pub use joint::JointWorkerPool;
pub use node::NodeWorkerPool;

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::context::{ConveyorContext, LogLevel};
use crate::errors::Error;

/// Runs one worker future behind a panic boundary.
///
/// A panic in user code ends this worker only: the panic payload is published
/// to the context log sink under the executor's unique id, and every other
/// worker and stage keeps running. Callers arm their release guards (permits,
/// port clones) outside this boundary so they fire on the recovery path too.
pub(crate) async fn supervised<F>(ctx: &Arc<dyn ConveyorContext>, unique_id: &str, work: F)
where
    F: Future<Output = ()>,
{
    if let Err(payload) = AssertUnwindSafe(work).catch_unwind().await {
        let text = panic_text(payload.as_ref());
        ctx.send_log(
            LogLevel::Error,
            &format!("worker for [{unique_id}] panicked: {text}"),
            None,
        );
        tracing::error!(worker = %unique_id, panic = %text, "worker panicked, continuing with remaining workers");
    }
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Aborts the process over an executor that lacks the method its mode needs.
///
/// The diagnostic names the offending stage on the log sink and on stderr
/// before the process exits.
pub(crate) fn abort_misconfigured(ctx: &Arc<dyn ConveyorContext>, unique_id: &str, err: &Error) -> ! {
    ctx.send_log(
        LogLevel::Fatal,
        &format!("improper setup of executor [{unique_id}]"),
        Some(err),
    );
    tracing::error!(executor = %unique_id, error = %err, "executor is missing the method required by its worker mode");
    eprintln!("improper setup of executor [{unique_id}]: {err}");
    std::process::exit(1);
}
