//! Gradient-sum sharpness measure over each frame; consume-only.

use sluice_core::{Buffer, Processed, Requisition, Result, Task, TaskContext, TaskMode};

#[derive(Clone, Default)]
pub struct SharpnessMeasureTask {
    sharpness: f64,
}

impl SharpnessMeasureTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// The measure of the most recent frame.
    pub fn sharpness(&self) -> f64 {
        self.sharpness
    }
}

fn measure_sharpness(data: &[f32], width: usize, height: usize) -> f64 {
    let mut sum = 0.0f64;
    for y in 1..height {
        for x in 1..width {
            let index = y * width + x;
            let h_gradient = (data[index] - data[index - 1]).abs() as f64;
            let v_gradient = (data[index] - data[index - width]).abs() as f64;
            sum += h_gradient + v_gradient;
        }
    }
    sum / 2.0 / (width * height) as f64
}

impl Task for SharpnessMeasureTask {
    fn name(&self) -> &str {
        "sharpness-measure"
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

    fn requisition(&self, _inputs: &[Requisition]) -> Result<Requisition> {
        Ok(Requisition::none())
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        inputs: &[&Buffer],
        _output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        let req = inputs[0].requisition();
        let (width, height) = (req.dims()[0], req.dims()[1]);
        self.sharpness = measure_sharpness(inputs[0].host()?, width, height);
        log::info!("sharpness: {}", self.sharpness);
        Ok(Processed::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_image_has_zero_sharpness() {
        let mut task = SharpnessMeasureTask::new();
        let mut ctx = TaskContext::new(None);
        let input = Buffer::from_vec(&[4, 4], vec![3.0; 16]);
        task.process(&mut ctx, &[&input], None).unwrap();
        assert_eq!(task.sharpness(), 0.0);
    }

    #[test]
    fn edges_raise_the_measure() {
        let mut task = SharpnessMeasureTask::new();
        let mut ctx = TaskContext::new(None);
        let input = Buffer::from_vec(&[2, 2], vec![0.0, 1.0, 1.0, 0.0]);
        task.process(&mut ctx, &[&input], None).unwrap();
        // gradients at (1,1): |0-1| + |0-1| = 2, halved and normalized.
        assert_eq!(task.sharpness(), 2.0 / 2.0 / 4.0);
    }
}
