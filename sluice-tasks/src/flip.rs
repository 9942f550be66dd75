//! Horizontal or vertical image flip. Runs the matching OpenCL kernel
//! on a GPU executor, falls back to a plain loop on a CPU one.

use std::str::FromStr;

use strum::{Display, EnumString};

use sluice_core::{
    gpu, Buffer, Error, KernelSource, Processed, Requisition, Resources, Result, Task,
    TaskContext, TaskMode, Value,
};

const FLIP_CL: &str = include_str!("../kernels/flip.cl");

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    #[default]
    Horizontal,
    Vertical,
}

pub struct FlipTask {
    direction: Direction,
    kernels: Option<[gpu::Kernel; 2]>,
}

impl Default for FlipTask {
    fn default() -> Self {
        Self::new()
    }
}

impl FlipTask {
    pub fn new() -> Self {
        Self {
            direction: Direction::Horizontal,
            kernels: None,
        }
    }

    fn flip_cpu(&self, input: &[f32], output: &mut [f32], width: usize, height: usize) {
        match self.direction {
            Direction::Horizontal => {
                for y in 0..height {
                    for x in 0..width {
                        output[y * width + (width - x - 1)] = input[y * width + x];
                    }
                }
            }
            Direction::Vertical => {
                for y in 0..height {
                    let src = &input[y * width..(y + 1) * width];
                    output[(height - y - 1) * width..(height - y) * width].copy_from_slice(src);
                }
            }
        }
    }
}

impl Task for FlipTask {
    fn name(&self) -> &str {
        "flip"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::PROCESSOR | TaskMode::CPU | TaskMode::GPU
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

    fn set_option(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "direction" => {
                let text = value.as_str().unwrap_or("");
                self.direction = Direction::from_str(text).map_err(|_| Error::ConfigInvalid {
                    option: name.to_owned(),
                    reason: format!("`{}` is neither `horizontal` nor `vertical`", text),
                })?;
                Ok(())
            }
            _ => Err(Error::ConfigInvalid {
                option: name.to_owned(),
                reason: "unknown option".into(),
            }),
        }
    }

    fn setup(&mut self, resources: &Resources) -> Result<()> {
        if resources.num_devices() > 0 {
            let horizontal = resources.kernel(KernelSource::Text(FLIP_CL), "flip_horizontal")?;
            let vertical = resources.kernel(KernelSource::Text(FLIP_CL), "flip_vertical")?;
            self.kernels = Some([horizontal, vertical]);
        }
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
        let output = output.expect("flip always has an output");
        let req = inputs[0].requisition();
        let (width, height) = (req.dims()[0], req.dims()[1]);

        if let (Some(queue), Some(kernels)) = (ctx.queue(), self.kernels.as_mut()) {
            let kernel = &mut kernels[self.direction as usize];
            kernel.set_arg_buffer(0, inputs[0].device()?)?;
            kernel.set_arg_buffer(1, output.device_array(queue)?)?;
            let ns = kernel.enqueue(queue, &[width, height])?;
            ctx.record_kernel_ns(ns);
        } else {
            self.flip_cpu(inputs[0].host()?, output.host_mut()?, width, height);
        }
        Ok(Processed::Continue)
    }

    fn replicate(&self) -> Option<Box<dyn Task>> {
        Some(Box::new(FlipTask {
            direction: self.direction,
            kernels: None,
        }))
    }
}
