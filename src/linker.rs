//! Pure wiring between adjacent stages.
//!
//! Linking moves the producer side of the downstream stage's input edge into
//! the upstream stage, so each edge ends up with exactly one producer, which
//! is the only party that ever closes it.

use crate::errors::Result;
use crate::workers::{JointWorkerPool, NodeWorkerPool};

/// Wires node `a`'s output to node `b`'s input.
///
/// # Errors
///
/// Fails when `b` has no input to offer (a source, or already wired) or `a`
/// cannot produce (a sink).
pub fn link_node_to_node(a: &NodeWorkerPool, b: &NodeWorkerPool) -> Result<()> {
    let sender = b.take_input_sender()?;
    a.set_output(sender)
}

/// Wires node `a`'s output to input `index` of joint `j`.
///
/// # Errors
///
/// Fails with [`crate::Error::LessInputChannelsInJoint`] when `index` is out
/// of range, or when `a` cannot produce.
pub fn link_node_to_joint(a: &NodeWorkerPool, j: &JointWorkerPool, index: usize) -> Result<()> {
    let sender = j.take_input_sender(index)?;
    a.set_output(sender)
}

/// Registers node `b`'s input as one more output of joint `j`.
///
/// # Errors
///
/// Fails when `b` has no input to offer.
pub fn link_joint_to_node(j: &JointWorkerPool, b: &NodeWorkerPool) -> Result<()> {
    let sender = b.take_input_sender()?;
    j.add_output_sender(sender);
    Ok(())
}
