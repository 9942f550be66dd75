//! Flat-field correction: `(projection - dark) / (flat - dark)`.

use sluice_core::{Buffer, Processed, Requisition, Result, Task, TaskContext, TaskMode};

#[derive(Clone, Default)]
pub struct FlatFieldCorrectionTask;

impl FlatFieldCorrectionTask {
    pub fn new() -> Self {
        Self
    }
}

impl Task for FlatFieldCorrectionTask {
    fn name(&self) -> &str {
        "flat-field-correction"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::PROCESSOR | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        // projections, dark field, flat field
        3
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
        let output = output.expect("flat-field correction always has an output");
        let proj = inputs[0].host()?;
        let dark = inputs[1].host()?;
        let flat = inputs[2].host()?;
        let out = output.host_mut()?;
        for i in 0..out.len() {
            out[i] = (proj[i] - dark[i]) / (flat[i] - dark[i]);
        }
        Ok(Processed::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrects_known_values() {
        let mut task = FlatFieldCorrectionTask::new();
        let mut ctx = TaskContext::new(None);
        let proj = Buffer::from_vec(&[2, 2], vec![10.0; 4]);
        let dark = Buffer::from_vec(&[2, 2], vec![2.0; 4]);
        let flat = Buffer::from_vec(&[2, 2], vec![18.0; 4]);
        let mut out = Buffer::new(Requisition::d2(2, 2));
        task.process(&mut ctx, &[&proj, &dark, &flat], Some(&mut out))
            .unwrap();
        assert_eq!(out.host().unwrap(), &[0.5, 0.5, 0.5, 0.5]);
    }
}
