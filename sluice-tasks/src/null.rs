//! Data sink that discards its input.

use sluice_core::{
    Buffer, Error, Processed, Requisition, Result, Task, TaskContext, TaskMode, Value,
};

#[derive(Clone, Default)]
pub struct NullTask {
    force_download: bool,
}

impl NullTask {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Task for NullTask {
    fn name(&self) -> &str {
        "null"
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

    fn set_option(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "force-download" => {
                self.force_download = value.as_bool().ok_or_else(|| Error::ConfigInvalid {
                    option: name.to_owned(),
                    reason: format!("expected a boolean, got `{}`", value),
                })?;
                Ok(())
            }
            _ => Err(Error::ConfigInvalid {
                option: name.to_owned(),
                reason: "unknown option".into(),
            }),
        }
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
        if self.force_download {
            // Touch the host side so device-resident data is pulled back.
            let _ = inputs[0].host()?[0];
        }
        Ok(Processed::Continue)
    }
}
