//! TIFF backend: multi-directory reader (one frame per directory) and a
//! scanline-strip writer. Samples are grayscale, one per pixel,
//! contiguous planes; u8/u16 ingress data is widened to f32 through the
//! buffer's explicit widening path.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::ColorType;

use sluice_core::{
    BitDepth, Buffer, Error, Processed, Requisition, Result, Task, TaskContext, TaskMode, Value,
};

use super::FrameReader;

fn io_err(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::IoFailed(format!("{}: {}", path.display(), err))
}

pub(crate) struct TiffFrameReader {
    decoder: Decoder<BufReader<File>>,
    path: std::path::PathBuf,
    more: bool,
    width: usize,
    height: usize,
    depth: BitDepth,
}

impl TiffFrameReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let decoder = Decoder::new(BufReader::new(file)).map_err(|e| io_err(&path, e))?;
        let mut reader = Self {
            decoder,
            path,
            more: true,
            width: 0,
            height: 0,
            depth: BitDepth::F32,
        };
        reader.refresh_meta()?;
        Ok(reader)
    }

    fn refresh_meta(&mut self) -> Result<()> {
        let (width, height) = self
            .decoder
            .dimensions()
            .map_err(|e| io_err(&self.path, e))?;
        self.width = width as usize;
        self.height = height as usize;
        self.depth = match self.decoder.colortype().map_err(|e| io_err(&self.path, e))? {
            ColorType::Gray(8) => BitDepth::U8,
            ColorType::Gray(16) => BitDepth::U16,
            ColorType::Gray(32) => BitDepth::F32,
            other => {
                return Err(io_err(
                    &self.path,
                    format!("unsupported sample layout {:?}", other),
                ))
            }
        };
        Ok(())
    }
}

impl FrameReader for TiffFrameReader {
    fn data_available(&self) -> bool {
        self.more
    }

    fn meta(&self) -> (usize, usize, BitDepth) {
        (self.width, self.height, self.depth)
    }

    fn read_into(&mut self, buffer: &mut Buffer) -> Result<()> {
        let n = self.width * self.height;
        let image = self
            .decoder
            .read_image()
            .map_err(|e| io_err(&self.path, e))?;
        match image {
            DecodingResult::U8(samples) => {
                buffer.host_bytes_mut()?[..n].copy_from_slice(&samples[..n]);
                buffer.reinterpret(BitDepth::U8, n)?;
            }
            DecodingResult::U16(samples) => {
                let bytes = buffer.host_bytes_mut()?;
                for (i, sample) in samples[..n].iter().enumerate() {
                    bytes[2 * i..2 * i + 2].copy_from_slice(&sample.to_ne_bytes());
                }
                buffer.reinterpret(BitDepth::U16, n)?;
            }
            DecodingResult::F32(samples) => {
                buffer.host_mut()?.copy_from_slice(&samples[..n]);
            }
            _ => {
                return Err(io_err(&self.path, "unsupported sample layout"));
            }
        }
        if self.decoder.more_images() {
            self.decoder
                .next_image()
                .map_err(|e| io_err(&self.path, e))?;
            self.refresh_meta()?;
        } else {
            self.more = false;
        }
        Ok(())
    }
}

/// Write one grayscale f32 frame.
pub fn write_tiff_f32(path: impl AsRef<Path>, data: &[f32], width: usize, height: usize) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(|e| io_err(path, e))?;
    encoder
        .write_image::<colortype::Gray32Float>(width as u32, height as u32, data)
        .map_err(|e| io_err(path, e))
}

pub fn write_tiff_u8(path: impl AsRef<Path>, data: &[u8], width: usize, height: usize) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(|e| io_err(path, e))?;
    encoder
        .write_image::<colortype::Gray8>(width as u32, height as u32, data)
        .map_err(|e| io_err(path, e))
}

pub fn write_tiff_u16(path: impl AsRef<Path>, data: &[u16], width: usize, height: usize) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(|e| io_err(path, e))?;
    encoder
        .write_image::<colortype::Gray16>(width as u32, height as u32, data)
        .map_err(|e| io_err(path, e))
}

/// Narrow widened samples back to u8, the inverse of ingress widening.
pub fn narrow_to_u8(data: &[f32]) -> Vec<u8> {
    data.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect()
}

pub fn narrow_to_u16(data: &[f32]) -> Vec<u16> {
    data.iter()
        .map(|v| v.round().clamp(0.0, 65535.0) as u16)
        .collect()
}

/// Sink writing every frame as `PREFIX%05i.tif` under a directory.
pub struct WriteTask {
    path: String,
    prefix: String,
    counter: u32,
}

impl Default for WriteTask {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteTask {
    pub fn new() -> Self {
        Self {
            path: ".".into(),
            prefix: String::new(),
            counter: 0,
        }
    }
}

impl Task for WriteTask {
    fn name(&self) -> &str {
        "write"
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
        let text = value.as_str().ok_or_else(|| Error::ConfigInvalid {
            option: name.to_owned(),
            reason: format!("expected a string, got `{}`", value),
        })?;
        match name {
            "path" => self.path = text.to_owned(),
            "prefix" => self.prefix = text.to_owned(),
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
        Ok(Requisition::none())
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        inputs: &[&Buffer],
        _output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        let req = inputs[0].requisition();
        let filename = format!("{}/{}{:05}.tif", self.path, self.prefix, self.counter);
        self.counter += 1;
        write_tiff_f32(&filename, inputs[0].host()?, req.dims()[0], req.dims()[1])?;
        Ok(Processed::Continue)
    }
}
