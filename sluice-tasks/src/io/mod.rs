//! File readers and writers. A single `read` task fronts the format
//! backends, picked by filename: `*.tif`/`*.tiff` for TIFF, the
//! `PATH.h5:DATASET` syntax for HDF5.

pub mod hdf5;
pub mod tiff;

use sluice_core::{
    BitDepth, Buffer, Error, Processed, Requisition, Resources, Result, Task, TaskContext,
    TaskMode, Value,
};

/// One format backend behind the `read` task.
pub(crate) trait FrameReader: Send {
    /// Whether another frame can be read.
    fn data_available(&self) -> bool;
    /// Width, height and sample depth of the next frame.
    fn meta(&self) -> (usize, usize, BitDepth);
    /// Fill `buffer` with the next frame (widened to f32) and advance.
    fn read_into(&mut self, buffer: &mut Buffer) -> Result<()>;
}

/// Streams the frames of a file as 2-D buffers.
pub struct ReadTask {
    path: String,
    reader: Option<Box<dyn FrameReader>>,
}

impl Default for ReadTask {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadTask {
    pub fn new() -> Self {
        Self {
            path: String::new(),
            reader: None,
        }
    }
}

impl Task for ReadTask {
    fn name(&self) -> &str {
        "read"
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
            "path" => {
                self.path = value
                    .as_str()
                    .ok_or_else(|| Error::ConfigInvalid {
                        option: name.to_owned(),
                        reason: format!("expected a string, got `{}`", value),
                    })?
                    .to_owned();
                Ok(())
            }
            _ => Err(Error::ConfigInvalid {
                option: name.to_owned(),
                reason: "unknown option".into(),
            }),
        }
    }

    fn setup(&mut self, _resources: &Resources) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::ConfigInvalid {
                option: "path".into(),
                reason: "no input file configured".into(),
            });
        }
        if let Some((file, dataset)) = hdf5::parse_filename(&self.path) {
            #[cfg(feature = "hdf5")]
            {
                self.reader = Some(Box::new(hdf5::Hdf5FrameReader::open(file, dataset)?));
                return Ok(());
            }
            #[cfg(not(feature = "hdf5"))]
            {
                let _ = (file, dataset);
                return Err(Error::SetupFailed(format!(
                    "`{}`: built without hdf5 support",
                    self.path
                )));
            }
        }
        if self.path.ends_with(".tif") || self.path.ends_with(".tiff") {
            self.reader = Some(Box::new(tiff::TiffFrameReader::open(&self.path)?));
            return Ok(());
        }
        Err(Error::SetupFailed(format!(
            "`{}`: unrecognized input format",
            self.path
        )))
    }

    fn requisition(&self, _inputs: &[Requisition]) -> Result<Requisition> {
        match self.reader {
            Some(ref reader) if reader.data_available() => {
                let (width, height, _) = reader.meta();
                Ok(Requisition::d2(width, height))
            }
            _ => Ok(Requisition::none()),
        }
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
        match self.reader {
            Some(ref mut reader) if reader.data_available() => {
                reader.read_into(output)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
