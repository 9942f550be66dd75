//! Pass-through node that prints shape, metadata keys and residency of
//! every buffer it sees.

use sluice_core::{Buffer, Location, Processed, Requisition, Result, Task, TaskContext, TaskMode};

#[derive(Clone, Default)]
pub struct MonitorTask;

impl MonitorTask {
    pub fn new() -> Self {
        Self
    }
}

impl Task for MonitorTask {
    fn name(&self) -> &str {
        "monitor"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::PROCESSOR | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        1
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
        ctx: &mut TaskContext,
        inputs: &[&Buffer],
        output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        let input = inputs[0];
        let dims: Vec<String> = input
            .requisition()
            .dims()
            .iter()
            .map(|d| d.to_string())
            .collect();
        let keys: Vec<&str> = input.meta_keys().collect();
        let location = match input.location() {
            Location::Host => "host",
            Location::Device => "device",
            Location::DeviceImage => "image",
            Location::Invalid => "invalid",
        };
        println!(
            "monitor: dims=[{}] keys=[{}] location={}",
            dims.join(" "),
            keys.join(", "),
            location
        );

        if let Some(output) = output {
            output.copy_from(input, ctx.queue())?;
        }
        Ok(Processed::Continue)
    }
}
