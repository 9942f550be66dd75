//! Plane-wise reference averaging for ROFEX sinogram stacks: the input
//! stack interleaves `number-of-planes` planes per slice; the output
//! holds the per-plane average across slices.

use sluice_core::{
    Buffer, Error, Processed, Requisition, Result, Task, TaskContext, TaskMode, Value,
};

#[derive(Clone)]
pub struct RofexAverageRefTask {
    n_planes: usize,
}

impl Default for RofexAverageRefTask {
    fn default() -> Self {
        Self::new()
    }
}

impl RofexAverageRefTask {
    pub fn new() -> Self {
        Self { n_planes: 1 }
    }
}

impl Task for RofexAverageRefTask {
    fn name(&self) -> &str {
        "rofex-average-ref"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::PROCESSOR | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_dimensions(&self, _port: usize) -> usize {
        3
    }

    fn output_dimensions(&self) -> Option<usize> {
        Some(3)
    }

    fn set_option(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "number-of-planes" => {
                self.n_planes = match value.as_int() {
                    Some(i) if i > 0 => i as usize,
                    _ => {
                        return Err(Error::ConfigInvalid {
                            option: name.to_owned(),
                            reason: format!("expected a positive integer, got `{}`", value),
                        })
                    }
                };
                Ok(())
            }
            _ => Err(Error::ConfigInvalid {
                option: name.to_owned(),
                reason: "unknown option".into(),
            }),
        }
    }

    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
        let dims = inputs[0].dims();
        Ok(Requisition::d3(dims[0], dims[1], self.n_planes))
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        inputs: &[&Buffer],
        output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        let output = output.expect("rofex averaging always has an output");
        let req = inputs[0].requisition();
        if req.n_dims() < 3 {
            return Err(Error::IoFailed(
                "nothing to average over, expected a 3-dimensional stack".into(),
            ));
        }
        let n_vals = req.dims()[0] * req.dims()[1];
        let depth = req.dims()[2];
        if depth % self.n_planes != 0 {
            return Err(Error::ConfigInvalid {
                option: "number-of-planes".into(),
                reason: format!("{} planes do not divide a stack of depth {}", self.n_planes, depth),
            });
        }
        let n_slices = depth / self.n_planes;
        let factor = 1.0 / n_slices as f32;

        let sino = inputs[0].host()?;
        let average = output.host_mut()?;
        average.iter_mut().for_each(|v| *v = 0.0);
        for slice in 0..n_slices {
            for plane in 0..self.n_planes {
                let src = (slice * self.n_planes + plane) * n_vals;
                let dst = plane * n_vals;
                for index in 0..n_vals {
                    average[dst + index] += sino[src + index] * factor;
                }
            }
        }
        Ok(Processed::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_across_slices_per_plane() {
        let mut task = RofexAverageRefTask::new();
        task.set_option("number-of-planes", Value::Int(2)).unwrap();
        // 1x1 frames, 2 planes, 2 slices: planes [1, 2] then [3, 4].
        let input = Buffer::from_vec(&[1, 1, 4], vec![1.0, 2.0, 3.0, 4.0]);
        let mut out = Buffer::new(Requisition::d3(1, 1, 2));
        let mut ctx = TaskContext::new(None);
        task.process(&mut ctx, &[&input], Some(&mut out)).unwrap();
        assert_eq!(out.host().unwrap(), &[2.0, 3.0]);
    }

    #[test]
    fn rejects_indivisible_stacks() {
        let mut task = RofexAverageRefTask::new();
        task.set_option("number-of-planes", Value::Int(2)).unwrap();
        let input = Buffer::from_vec(&[1, 1, 3], vec![1.0; 3]);
        let mut out = Buffer::new(Requisition::d3(1, 1, 2));
        let mut ctx = TaskContext::new(None);
        assert!(task.process(&mut ctx, &[&input], Some(&mut out)).is_err());
    }
}
