//! Element-wise subtraction of two streams.
//!
//! The two inputs must advance in lockstep: each tick demands equal
//! stream ids, and divergence is a fault rather than silent pairing of
//! unrelated frames.

use sluice_core::{
    Buffer, Error, Processed, Requisition, Result, Task, TaskContext, TaskMode,
};

#[derive(Clone, Default)]
pub struct SubtractTask;

impl SubtractTask {
    pub fn new() -> Self {
        Self
    }
}

impl Task for SubtractTask {
    fn name(&self) -> &str {
        "subtract"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::PROCESSOR | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        2
    }

    fn num_dimensions(&self, _port: usize) -> usize {
        2
    }

    fn output_dimensions(&self) -> Option<usize> {
        Some(2)
    }

    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs[0])
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        inputs: &[&Buffer],
        output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        let output = output.expect("subtract always has an output");
        let (a, b) = (inputs[0], inputs[1]);
        if a.id() != b.id() {
            return Err(Error::IoFailed(format!(
                "input streams diverged: stream id {} on port 0, {} on port 1",
                a.id(),
                b.id()
            )));
        }
        let a = a.host()?;
        let b = b.host()?;
        for (out, (a, b)) in output.host_mut()?.iter_mut().zip(a.iter().zip(b)) {
            *out = a - b;
        }
        Ok(Processed::Continue)
    }
}
