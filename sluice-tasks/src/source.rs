//! Synthetic frame source, the usual head of benchmark pipelines.

use sluice_core::{
    Buffer, Error, Processed, Requisition, Result, Task, TaskContext, TaskMode, Value,
};

/// Emits `number` frames of `width` x `height` filled with a constant.
/// `number = 0` keeps emitting until cancelled.
#[derive(Clone)]
pub struct DummyDataTask {
    width: usize,
    height: usize,
    number: u64,
    value: f32,
    produced: u64,
}

impl Default for DummyDataTask {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDataTask {
    pub fn new() -> Self {
        Self {
            width: 512,
            height: 512,
            number: 1,
            value: 0.0,
            produced: 0,
        }
    }
}

fn positive_int(option: &str, value: &Value) -> Result<usize> {
    match value.as_int() {
        Some(i) if i > 0 => Ok(i as usize),
        _ => Err(Error::ConfigInvalid {
            option: option.to_owned(),
            reason: format!("expected a positive integer, got `{}`", value),
        }),
    }
}

impl Task for DummyDataTask {
    fn name(&self) -> &str {
        "dummy-data"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::GENERATOR | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn num_dimensions(&self, _port: usize) -> usize {
        0
    }

    fn output_dimensions(&self) -> Option<usize> {
        Some(2)
    }

    fn set_option(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "width" => self.width = positive_int(name, &value)?,
            "height" => self.height = positive_int(name, &value)?,
            "number" => {
                self.number = value.as_int().filter(|i| *i >= 0).ok_or_else(|| {
                    Error::ConfigInvalid {
                        option: name.to_owned(),
                        reason: format!("expected a non-negative integer, got `{}`", value),
                    }
                })? as u64
            }
            "value" => {
                self.value = value.as_float().ok_or_else(|| Error::ConfigInvalid {
                    option: name.to_owned(),
                    reason: format!("expected a number, got `{}`", value),
                })? as f32
            }
            _ => {
                return Err(Error::ConfigInvalid {
                    option: name.to_owned(),
                    reason: "unknown option".into(),
                })
            }
        }
        Ok(())
    }

    fn requisition(&self, _inputs: &[Requisition]) -> Result<Requisition> {
        Ok(Requisition::d2(self.width, self.height))
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        _inputs: &[&Buffer],
        _output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        Ok(Processed::Continue)
    }

    fn generate(&mut self, _ctx: &mut TaskContext, output: &mut Buffer) -> Result<bool> {
        if self.number > 0 && self.produced >= self.number {
            return Ok(false);
        }
        output.fill(self.value)?;
        output.meta_set("frame", self.produced as i64);
        self.produced += 1;
        Ok(true)
    }
}
