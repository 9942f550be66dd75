//! GPU backend, selected at compile time like the platform backends of
//! the graphics layer this engine grew out of. With the `opencl` feature
//! the types wrap the `ocl` crate; without it the same surface exists
//! but discovers zero devices.

#[cfg(feature = "opencl")]
mod opencl;
#[cfg(feature = "opencl")]
pub use opencl::{DeviceArray, GpuContext, Kernel, Program, Queue};

#[cfg(not(feature = "opencl"))]
mod disabled;
#[cfg(not(feature = "opencl"))]
pub use disabled::{DeviceArray, GpuContext, Kernel, Program, Queue};
