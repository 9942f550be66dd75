//! Reducer that averages all incoming frames into a single one.

use sluice_core::{Buffer, Processed, Requisition, Result, Task, TaskContext, TaskMode};

#[derive(Clone, Default)]
pub struct AveragerTask {
    counter: u64,
    emitted: bool,
}

impl AveragerTask {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Task for AveragerTask {
    fn name(&self) -> &str {
        "averager"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::REDUCER | TaskMode::CPU
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
        _ctx: &mut TaskContext,
        inputs: &[&Buffer],
        output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        let output = output.expect("averager accumulates into its output");
        let input = inputs[0].host()?;
        let acc = output.host_mut()?;
        for (acc, value) in acc.iter_mut().zip(input) {
            *acc += value;
        }
        self.counter += 1;
        Ok(Processed::Continue)
    }

    fn reduce(&mut self, _ctx: &mut TaskContext, output: &mut Buffer) -> Result<bool> {
        if self.emitted || self.counter == 0 {
            return Ok(false);
        }
        let n = self.counter as f32;
        for value in output.host_mut()? {
            *value /= n;
        }
        self.emitted = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_three_frames() {
        let mut task = AveragerTask::new();
        let mut ctx = TaskContext::new(None);
        let mut acc = Buffer::new(Requisition::d2(2, 2));
        for value in [0.0f32, 2.0, 4.0] {
            let frame = Buffer::from_vec(&[2, 2], vec![value; 4]);
            task.process(&mut ctx, &[&frame], Some(&mut acc)).unwrap();
        }
        assert!(task.reduce(&mut ctx, &mut acc).unwrap());
        assert_eq!(acc.host().unwrap(), &[2.0, 2.0, 2.0, 2.0]);
        assert!(!task.reduce(&mut ctx, &mut acc).unwrap());
    }

    #[test]
    fn empty_stream_emits_nothing() {
        let mut task = AveragerTask::new();
        let mut ctx = TaskContext::new(None);
        let mut out = Buffer::new(Requisition::d2(1, 1));
        assert!(!task.reduce(&mut ctx, &mut out).unwrap());
    }
}
