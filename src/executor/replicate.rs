//! The built-in replicating joint.

use async_trait::async_trait;
use std::sync::Arc;

use super::JointExecutor;
use crate::channel::{InputPort, OutputPort};
use crate::context::ConveyorContext;
use crate::errors::{Error, Result};

/// A joint that broadcasts every input item to all of its outputs.
///
/// Wired with exactly one input and `output_count` outputs. Each item is
/// copied to every output in ascending output order, and all copies are
/// delivered before the next item is read, so every downstream path observes
/// the input sequence in the same relative order.
#[derive(Debug)]
pub struct ReplicateJoint {
    name: String,
    output_count: usize,
}

impl ReplicateJoint {
    /// Creates a replicating joint that feeds `output_count` downstream nodes.
    #[must_use]
    pub fn new(name: impl Into<String>, output_count: usize) -> Self {
        Self {
            name: name.into(),
            output_count,
        }
    }
}

#[async_trait]
impl JointExecutor for ReplicateJoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_count(&self) -> usize {
        self.output_count
    }

    async fn execute_loop(
        &self,
        ctx: Arc<dyn ConveyorContext>,
        inputs: Vec<InputPort>,
        outputs: Vec<OutputPort>,
    ) -> Result<()> {
        if inputs.is_empty() {
            return Err(Error::NoInputChannel);
        }
        if outputs.is_empty() {
            return Err(Error::NoOutputChannel);
        }
        if inputs.len() > 1 {
            return Err(Error::MultipleInputChannels);
        }
        if outputs.len() == 1 {
            return Err(Error::OneToOneConnection);
        }

        let token = ctx.token();
        let input = &inputs[0];

        while let Some(item) = input.recv_or_cancel(&token).await {
            for output in &outputs {
                if !output.send_or_cancel(&token, item.clone()).await {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}
