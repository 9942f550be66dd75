//! GPU stripe filter for sinogram cleanup.

use sluice_core::{
    gpu, Buffer, KernelSource, Processed, Requisition, Resources, Result, Task, TaskContext,
    TaskMode,
};

const FILTER_CL: &str = include_str!("../kernels/filter.cl");

#[derive(Default)]
pub struct StripeFilterTask {
    kernel: Option<gpu::Kernel>,
}

impl StripeFilterTask {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Task for StripeFilterTask {
    fn name(&self) -> &str {
        "stripe-filter"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::PROCESSOR | TaskMode::GPU
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

    fn setup(&mut self, resources: &Resources) -> Result<()> {
        self.kernel = Some(resources.kernel(KernelSource::Text(FILTER_CL), "stripe_filter")?);
        Ok(())
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
        let output = output.expect("stripe filter always has an output");
        let queue = ctx.require_queue()?;
        let req = inputs[0].requisition();
        let kernel = self.kernel.as_mut().expect("setup compiles the kernel");
        kernel.set_arg_buffer(0, inputs[0].device()?)?;
        kernel.set_arg_buffer(1, output.device_array(queue)?)?;
        let ns = kernel.enqueue(queue, req.dims())?;
        ctx.record_kernel_ns(ns);
        Ok(Processed::Continue)
    }

    fn replicate(&self) -> Option<Box<dyn Task>> {
        Some(Box::new(StripeFilterTask { kernel: None }))
    }
}
