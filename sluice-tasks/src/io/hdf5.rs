//! HDF5 backend. Inputs use the `PATH.h5:DATASET` syntax; the gate is
//! strict: the last colon must be preceded by a path whose final three
//! characters are `.h5`, and followed by a dataset name of at least two
//! characters. Datasets are at most 3-dimensional, read as f32, with
//! the outermost dimension indexing frames.

/// Split `PATH.h5:DATASET` into its parts, or `None` if the input does
/// not pass the gate.
pub fn parse_filename(input: &str) -> Option<(&str, &str)> {
    let colon = input.rfind(':')?;
    if colon < 3 {
        return None;
    }
    if input.get(colon - 3..colon) != Some(".h5") {
        return None;
    }
    let dataset = input.get(colon + 1..)?;
    if dataset.len() < 2 {
        return None;
    }
    Some((&input[..colon], dataset))
}

#[cfg(feature = "hdf5")]
pub(crate) use reader::Hdf5FrameReader;

#[cfg(feature = "hdf5")]
mod reader {
    use sluice_core::{BitDepth, Buffer, Error, Result};

    use crate::io::FrameReader;

    /// Reads the whole dataset once and serves frames from memory.
    pub(crate) struct Hdf5FrameReader {
        data: Vec<f32>,
        width: usize,
        height: usize,
        frames: usize,
        current: usize,
    }

    impl Hdf5FrameReader {
        pub fn open(path: &str, dataset: &str) -> Result<Self> {
            let io_err = |e: hdf5::Error| Error::IoFailed(format!("{}:{}: {}", path, dataset, e));
            let file = hdf5::File::open(path).map_err(io_err)?;
            let ds = file.dataset(dataset).map_err(io_err)?;
            let shape = ds.shape();
            let (frames, height, width) = match shape.as_slice() {
                [w] => (1, 1, *w),
                [h, w] => (1, *h, *w),
                [n, h, w] => (*n, *h, *w),
                _ => {
                    return Err(Error::IoFailed(format!(
                        "{}:{}: no support for {}-dimensional data",
                        path,
                        dataset,
                        shape.len()
                    )))
                }
            };
            let data = ds.read_raw::<f32>().map_err(io_err)?;
            Ok(Self {
                data,
                width,
                height,
                frames,
                current: 0,
            })
        }
    }

    impl FrameReader for Hdf5FrameReader {
        fn data_available(&self) -> bool {
            self.current < self.frames
        }

        fn meta(&self) -> (usize, usize, BitDepth) {
            (self.width, self.height, BitDepth::F32)
        }

        fn read_into(&mut self, buffer: &mut Buffer) -> Result<()> {
            let n = self.width * self.height;
            let start = self.current * n;
            buffer.host_mut()?.copy_from_slice(&self.data[start..start + n]);
            self.current += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_filename;

    #[test]
    fn accepts_well_formed_names() {
        assert_eq!(parse_filename("f.h5:dset"), Some(("f.h5", "dset")));
        assert_eq!(
            parse_filename("/data/scan.h5:entry"),
            Some(("/data/scan.h5", "entry"))
        );
        // The gate only looks at the last colon.
        assert_eq!(parse_filename("a:b.h5:ds"), Some(("a:b.h5", "ds")));
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(parse_filename("x.h5:"), None);
        assert_eq!(parse_filename("x.h5"), None);
        assert_eq!(parse_filename("noext:dset"), None);
        assert_eq!(parse_filename("ab.h5:d"), None);
        assert_eq!(parse_filename(":dset"), None);
        assert_eq!(parse_filename("h5:dset"), None);
    }
}
