//! OpenCL backend built on the `ocl` crate. One command queue per
//! device, created with profiling enabled so kernel times can be read
//! from event timestamps.

use ocl::enums::ProfilingInfo;
use ocl::flags::CommandQueueProperties;
use ocl::{Buffer as ClBuffer, Context, Device, Event, Platform, Program as ClProgram};

use crate::error::{Error, Result};

fn transfer_err(err: ocl::Error) -> Error {
    Error::DeviceTransferFailed(err.to_string())
}

fn launch_err(err: ocl::Error) -> Error {
    Error::KernelLaunchFailed(err.to_string())
}

/// Platform, context and one profiling-enabled queue per device.
pub struct GpuContext {
    context: Context,
    devices: Vec<Device>,
    queues: Vec<Queue>,
}

impl GpuContext {
    /// Discover devices, honoring a `PLATFORM[:DEV,DEV,...]` selector.
    /// Returns `None` when no OpenCL platform or device is present.
    pub fn discover(selector: Option<&str>) -> Result<Option<GpuContext>> {
        let platforms = Platform::list();
        if platforms.is_empty() {
            return Ok(None);
        }
        let (platform_index, device_filter) = parse_selector(selector)?;
        let platform = *platforms.get(platform_index).ok_or_else(|| Error::ConfigInvalid {
            option: "devices".into(),
            reason: format!(
                "platform index {} out of range ({} available)",
                platform_index,
                platforms.len()
            ),
        })?;

        let all = Device::list_all(platform).map_err(|e| Error::SetupFailed(e.to_string()))?;
        let devices: Vec<Device> = match device_filter {
            Some(indices) => {
                let mut picked = Vec::with_capacity(indices.len());
                for i in indices {
                    picked.push(*all.get(i).ok_or_else(|| Error::ConfigInvalid {
                        option: "devices".into(),
                        reason: format!("device index {} out of range ({} available)", i, all.len()),
                    })?);
                }
                picked
            }
            None => all,
        };
        if devices.is_empty() {
            return Ok(None);
        }

        let context = Context::builder()
            .platform(platform)
            .devices(&devices[..])
            .build()
            .map_err(|e| Error::SetupFailed(e.to_string()))?;

        let mut queues = Vec::with_capacity(devices.len());
        for device in &devices {
            let queue = ocl::Queue::new(
                &context,
                *device,
                Some(CommandQueueProperties::new().profiling()),
            )
            .map_err(|e| Error::SetupFailed(e.to_string()))?;
            queues.push(Queue(queue));
        }

        for (i, device) in devices.iter().enumerate() {
            log::info!(
                "gpu {}: {}",
                i,
                device.name().unwrap_or_else(|_| "<unknown>".into())
            );
        }
        Ok(Some(GpuContext {
            context,
            devices,
            queues,
        }))
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn queue(&self, index: usize) -> &Queue {
        &self.queues[index]
    }

    pub fn device_name(&self, index: usize) -> String {
        self.devices[index]
            .name()
            .unwrap_or_else(|_| "<unknown>".into())
    }

    /// Build a program for every configured device.
    pub fn compile(&self, source: &str, options: &[String]) -> Result<Program> {
        let mut builder = ClProgram::builder();
        builder.devices(&self.devices[..]).src(source);
        for opt in options {
            builder.cmplr_opt(opt.as_str());
        }
        let program = builder
            .build(&self.context)
            .map_err(|e| Error::SetupFailed(format!("kernel compilation failed: {}", e)))?;
        Ok(Program { inner: program })
    }
}

/// One in-order command queue; clones share the underlying queue.
#[derive(Clone)]
pub struct Queue(ocl::Queue);

/// Device-side float array bound to the shared context.
pub struct DeviceArray {
    buffer: ClBuffer<f32>,
    len: usize,
}

impl DeviceArray {
    pub(crate) fn alloc(queue: &Queue, len: usize) -> Result<DeviceArray> {
        let buffer = ClBuffer::<f32>::builder()
            .queue(queue.0.clone())
            .len(len)
            .build()
            .map_err(transfer_err)?;
        Ok(DeviceArray { buffer, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn upload(&self, queue: &Queue, host: &[f32]) -> Result<()> {
        self.buffer
            .cmd()
            .queue(&queue.0)
            .write(host)
            .enq()
            .map_err(transfer_err)
    }

    /// Read back on `queue`, or on the array's own queue when the caller
    /// has none (a CPU consumer downstream of a GPU producer).
    pub fn download(&self, queue: Option<&Queue>, host: &mut [f32]) -> Result<()> {
        let cmd = self.buffer.cmd();
        let cmd = match queue {
            Some(queue) => cmd.queue(&queue.0),
            None => cmd,
        };
        cmd.read(host).enq().map_err(transfer_err)
    }
}

/// A compiled program; kernels are created per task from it because
/// `clSetKernelArg` is not thread-safe across sharers.
#[derive(Clone)]
pub struct Program {
    inner: ClProgram,
}

impl Program {
    pub fn kernel(&self, symbol: &str) -> Result<Kernel> {
        Ok(Kernel {
            program: self.inner.clone(),
            symbol: symbol.to_owned(),
            args: Vec::new(),
        })
    }
}

enum KernelArg {
    Buffer(ClBuffer<f32>),
    F32(f32),
    U32(u32),
}

/// A kernel symbol plus its pending arguments. The underlying OpenCL
/// kernel object is created at enqueue time with the arguments applied
/// positionally.
pub struct Kernel {
    program: ClProgram,
    symbol: String,
    args: Vec<Option<KernelArg>>,
}

impl Kernel {
    fn put_arg(&mut self, index: usize, arg: KernelArg) {
        if self.args.len() <= index {
            self.args.resize_with(index + 1, || None);
        }
        self.args[index] = Some(arg);
    }

    pub fn set_arg_buffer(&mut self, index: usize, array: &DeviceArray) -> Result<()> {
        self.put_arg(index, KernelArg::Buffer(array.buffer.clone()));
        Ok(())
    }

    pub fn set_arg_f32(&mut self, index: usize, value: f32) -> Result<()> {
        self.put_arg(index, KernelArg::F32(value));
        Ok(())
    }

    pub fn set_arg_u32(&mut self, index: usize, value: u32) -> Result<()> {
        self.put_arg(index, KernelArg::U32(value));
        Ok(())
    }

    /// Launch over `global` work items on `queue`, wait for completion
    /// and return the kernel time in nanoseconds from the profiling
    /// event.
    pub fn enqueue(&mut self, queue: &Queue, global: &[usize]) -> Result<u64> {
        let mut builder = ocl::Kernel::builder();
        builder
            .program(&self.program)
            .name(self.symbol.as_str())
            .queue(queue.0.clone());
        match *global {
            [x] => builder.global_work_size(x),
            [x, y] => builder.global_work_size([x, y]),
            [x, y, z] => builder.global_work_size([x, y, z]),
            _ => {
                return Err(Error::KernelLaunchFailed(format!(
                    "unsupported work size rank {}",
                    global.len()
                )))
            }
        };
        for (index, arg) in self.args.iter().enumerate() {
            match arg {
                Some(KernelArg::Buffer(buf)) => builder.arg(buf),
                Some(KernelArg::F32(v)) => builder.arg(*v),
                Some(KernelArg::U32(v)) => builder.arg(*v),
                None => {
                    return Err(Error::KernelLaunchFailed(format!(
                        "argument {} of `{}` was never set",
                        index, self.symbol
                    )))
                }
            };
        }
        let kernel = builder.build().map_err(launch_err)?;

        let mut event = Event::empty();
        // Safety: argument lifetimes are pinned by the clones held in
        // `self.args` until the blocking wait below returns.
        unsafe {
            kernel.cmd().enew(&mut event).enq().map_err(launch_err)?;
        }
        event.wait_for().map_err(launch_err)?;

        let start = event
            .profiling_info(ProfilingInfo::Start)
            .map_err(launch_err)?
            .time()
            .map_err(launch_err)?;
        let end = event
            .profiling_info(ProfilingInfo::End)
            .map_err(launch_err)?
            .time()
            .map_err(launch_err)?;
        Ok(end.saturating_sub(start))
    }
}

/// `"P"` or `"P:D0,D1,..."`; absent means platform 0, all devices.
fn parse_selector(selector: Option<&str>) -> Result<(usize, Option<Vec<usize>>)> {
    let text = match selector {
        Some(text) if !text.trim().is_empty() => text.trim(),
        _ => return Ok((0, None)),
    };
    let invalid = |reason: String| Error::ConfigInvalid {
        option: "devices".into(),
        reason,
    };
    let (platform, devices) = match text.split_once(':') {
        Some((p, d)) => (p, Some(d)),
        None => (text, None),
    };
    let platform = platform
        .parse::<usize>()
        .map_err(|_| invalid(format!("`{}` is not a platform index", platform)))?;
    let devices = match devices {
        Some(list) => {
            let mut indices = Vec::new();
            for part in list.split(',') {
                indices.push(
                    part.trim()
                        .parse::<usize>()
                        .map_err(|_| invalid(format!("`{}` is not a device index", part)))?,
                );
            }
            Some(indices)
        }
        None => None,
    };
    Ok((platform, devices))
}
