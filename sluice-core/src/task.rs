//! The per-task protocol: mode bits, the `Task` trait and the context
//! handed to each entry point.

use bitflags::bitflags;

use crate::buffer::{Buffer, Requisition, Value};
use crate::error::{Error, Result};
use crate::gpu;
use crate::resources::Resources;

bitflags! {
    /// What a task is (processor/reducer/generator) and where it runs
    /// (CPU/GPU). The two groups are orthogonal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskMode: u32 {
        const PROCESSOR = 1 << 0;
        const REDUCER   = 1 << 1;
        const GENERATOR = 1 << 2;
        const CPU       = 1 << 3;
        const GPU       = 1 << 4;
    }
}

impl TaskMode {
    /// At most one of PROCESSOR/REDUCER/GENERATOR may be set.
    pub fn is_well_formed(&self) -> bool {
        let kind = *self & (TaskMode::PROCESSOR | TaskMode::REDUCER | TaskMode::GENERATOR);
        kind.bits().count_ones() <= 1
    }

    pub fn is_reducer(&self) -> bool {
        self.contains(TaskMode::REDUCER)
    }

    pub fn is_generator(&self) -> bool {
        self.contains(TaskMode::GENERATOR)
    }

    pub fn wants_gpu(&self) -> bool {
        self.contains(TaskMode::GPU)
    }

    pub fn wants_cpu(&self) -> bool {
        self.contains(TaskMode::CPU)
    }
}

/// Outcome of a `process` tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Continue,
    /// End of stream from this node.
    Stop,
}

/// Per-invocation context: the bound command queue for GPU nodes, and a
/// sink for kernel times measured from OpenCL events.
pub struct TaskContext<'a> {
    queue: Option<&'a gpu::Queue>,
    kernel_ns: u64,
}

impl<'a> TaskContext<'a> {
    pub fn new(queue: Option<&'a gpu::Queue>) -> Self {
        Self { queue, kernel_ns: 0 }
    }

    /// The command queue of the GPU executor this node is bound to, or
    /// `None` on a CPU executor.
    pub fn queue(&self) -> Option<&'a gpu::Queue> {
        self.queue
    }

    /// The bound command queue, for tasks that cannot run without one.
    pub fn require_queue(&self) -> Result<&'a gpu::Queue> {
        self.queue
            .ok_or_else(|| Error::KernelLaunchFailed("node is not bound to a GPU executor".into()))
    }

    pub fn record_kernel_ns(&mut self, ns: u64) {
        self.kernel_ns += ns;
    }

    pub(crate) fn take_kernel_ns(&mut self) -> u64 {
        std::mem::take(&mut self.kernel_ns)
    }
}

/// A graph node's behavior. Optional entry points default to no-ops so a
/// plain processor only implements the handful it needs.
pub trait Task: Send {
    /// Plug-in name, e.g. `"flip"`.
    fn name(&self) -> &str;

    fn mode(&self) -> TaskMode;

    fn num_inputs(&self) -> usize;

    /// Declared dimensionality of the given input port.
    fn num_dimensions(&self, port: usize) -> usize;

    /// Declared output dimensionality, if static. `None` means dynamic;
    /// graph validation then skips the edge check.
    fn output_dimensions(&self) -> Option<usize> {
        None
    }

    /// Set a configuration option before `setup`.
    fn set_option(&mut self, name: &str, _value: Value) -> Result<()> {
        Err(Error::ConfigInvalid {
            option: name.to_owned(),
            reason: "unknown option".into(),
        })
    }

    /// One-shot initialization: compile kernels, open resources.
    fn setup(&mut self, _resources: &Resources) -> Result<()> {
        Ok(())
    }

    /// Output shape for the current tick, as a pure function of input
    /// shapes and configuration. `Requisition::none()` means consume-only.
    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition>;

    /// One tick. `output` is `None` when the requisition was empty.
    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        _inputs: &[&Buffer],
        _output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        Ok(Processed::Continue)
    }

    /// Reducer finalization, called after upstream EOF until it returns
    /// `Ok(false)`. `Ok(true)` emits `output` downstream.
    fn reduce(&mut self, _ctx: &mut TaskContext, _output: &mut Buffer) -> Result<bool> {
        Ok(false)
    }

    /// Generator emission, called until it returns `Ok(false)`.
    fn generate(&mut self, _ctx: &mut TaskContext, _output: &mut Buffer) -> Result<bool> {
        Ok(false)
    }

    /// A configured copy of this task (pre-`setup` state only), if it
    /// supports graph expansion across multiple GPUs.
    fn replicate(&self) -> Option<Box<dyn Task>> {
        None
    }
}
