//! Stub backend used when the `opencl` feature is off. The types can
//! never be constructed; `discover` reports no devices and every other
//! entry point is statically unreachable.

use crate::error::Result;

#[derive(Clone, Copy, Debug)]
enum Never {}

pub struct GpuContext {
    never: Never,
}

impl GpuContext {
    pub fn discover(_selector: Option<&str>) -> Result<Option<GpuContext>> {
        Ok(None)
    }

    pub fn num_devices(&self) -> usize {
        match self.never {}
    }

    pub fn queue(&self, _index: usize) -> &Queue {
        match self.never {}
    }

    pub fn device_name(&self, _index: usize) -> String {
        match self.never {}
    }

    pub fn compile(&self, _source: &str, _options: &[String]) -> Result<Program> {
        match self.never {}
    }
}

#[derive(Clone)]
pub struct Queue {
    never: Never,
}

pub struct DeviceArray {
    never: Never,
}

impl DeviceArray {
    pub(crate) fn alloc(queue: &Queue, _len: usize) -> Result<DeviceArray> {
        match queue.never {}
    }

    pub fn len(&self) -> usize {
        match self.never {}
    }

    pub fn upload(&self, _queue: &Queue, _host: &[f32]) -> Result<()> {
        match self.never {}
    }

    pub fn download(&self, _queue: Option<&Queue>, _host: &mut [f32]) -> Result<()> {
        match self.never {}
    }
}

pub struct Program {
    never: Never,
}

impl Program {
    pub fn kernel(&self, _symbol: &str) -> Result<Kernel> {
        match self.never {}
    }
}

pub struct Kernel {
    never: Never,
}

impl Kernel {
    pub fn set_arg_buffer(&mut self, _index: usize, _array: &DeviceArray) -> Result<()> {
        match self.never {}
    }

    pub fn set_arg_f32(&mut self, _index: usize, _value: f32) -> Result<()> {
        match self.never {}
    }

    pub fn set_arg_u32(&mut self, _index: usize, _value: u32) -> Result<()> {
        match self.never {}
    }

    /// Launch and wait; returns the kernel time in nanoseconds.
    pub fn enqueue(&mut self, queue: &Queue, _global: &[usize]) -> Result<u64> {
        match queue.never {}
    }
}
