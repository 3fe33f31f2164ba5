//! # Beltline
//!
//! A library for composing and running bounded concurrent dataflow pipelines.
//!
//! A conveyor is a linear or tree-shaped graph of stages. Each stage owns a
//! pool of workers that consume items from an input edge, transform them and
//! publish them on an output edge. Beltline supplies:
//!
//! - **Worker pools**: `parallelism` concurrent workers per stage, in either
//!   loop or transaction mode
//! - **Backpressure**: bounded, closable edges between stages
//! - **Coordinated shutdown**: success, source exhaustion, explicit stop and
//!   timeout all drain the graph without deadlocks or lost cleanup
//! - **Fanout**: the replicate joint duplicates a stream into independent
//!   downstream paths
//!
//! User code supplies only the per-item transformation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use beltline::prelude::*;
//! use std::sync::Arc;
//!
//! let mut conveyor = Conveyor::new("squaring", 100);
//! conveyor.add_node_executor(Arc::new(numbers), WorkerMode::Loop, NodeRole::Source)?;
//! conveyor.add_node_executor(Arc::new(squarer), WorkerMode::Loop, NodeRole::Operator)?;
//! conveyor.add_node_executor(Arc::new(printer), WorkerMode::Loop, NodeRole::Sink)?;
//! conveyor.start().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod channel;
pub mod context;
pub mod conveyor;
pub mod errors;
pub mod executor;
pub mod item;
pub mod lifecycle;
pub mod linker;
pub mod testing;
pub mod workers;

pub use crate::conveyor::Conveyor;
pub use crate::errors::{Error, Result};
pub use crate::item::Item;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::{InputPort, OutputPort};
    pub use crate::context::{ConveyorContext, LogLevel, LogMessage, StandardContext};
    pub use crate::conveyor::Conveyor;
    pub use crate::errors::{Error, Result};
    pub use crate::executor::{
        JointExecutor, NodeExecutor, NodeRole, ReplicateJoint, WorkerMode,
    };
    pub use crate::item::Item;
    pub use crate::lifecycle::{ConveyorState, LifeCycleHandler};
    pub use crate::workers::{JointWorkerPool, NodeWorkerPool};
}

#[cfg(test)]
mod tests {
    #[test]
    fn library_compiles() {
        assert!(true);
    }
}
