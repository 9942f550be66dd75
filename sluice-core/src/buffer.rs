//! The data buffer moved between tasks.
//!
//! A buffer holds an N-dimensional f32 image with dual host/device
//! residency. Which side currently holds the authoritative copy is
//! tracked per buffer; transfers happen lazily on access.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::gpu;

pub const MAX_DIMS: usize = 3;

/// Declared output shape for one tick. `n_dims == 0` means "no output".
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Requisition {
    n_dims: usize,
    dims: [usize; MAX_DIMS],
}

impl Requisition {
    /// The "consume without producing" requisition.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(dims: &[usize]) -> Self {
        assert!(dims.len() <= MAX_DIMS, "at most {} dimensions", MAX_DIMS);
        let mut out = Self {
            n_dims: dims.len(),
            dims: [0; MAX_DIMS],
        };
        out.dims[..dims.len()].copy_from_slice(dims);
        out
    }

    pub fn d1(n: usize) -> Self {
        Self::new(&[n])
    }

    pub fn d2(width: usize, height: usize) -> Self {
        Self::new(&[width, height])
    }

    pub fn d3(width: usize, height: usize, depth: usize) -> Self {
        Self::new(&[width, height, depth])
    }

    pub fn n_dims(&self) -> usize {
        self.n_dims
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims[..self.n_dims]
    }

    pub fn is_none(&self) -> bool {
        self.n_dims == 0
    }

    /// Number of f32 elements described by this shape.
    pub fn len(&self) -> usize {
        if self.n_dims == 0 {
            0
        } else {
            self.dims().iter().product()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Requisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Requisition{:?}", self.dims())
    }
}

/// Scalar metadata and option values.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match *self {
            Value::Float(f) => Some(f),
            Value::Int(i) => Some(i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match *self {
            Value::Str(ref s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(ref s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Which side holds the authoritative copy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Location {
    Host,
    Device,
    DeviceImage,
    Invalid,
}

/// Sample depth of ingress data sitting in a buffer's raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BitDepth {
    U8,
    U16,
    F32,
}

impl BitDepth {
    pub fn bytes(&self) -> usize {
        match *self {
            BitDepth::U8 => 1,
            BitDepth::U16 => 2,
            BitDepth::F32 => 4,
        }
    }
}

/// Shared handle used for buffers in flight; the pool reclaims a buffer
/// once the last clone is released.
pub type BufferRef = Arc<RwLock<Buffer>>;

pub struct Buffer {
    req: Requisition,
    host: Vec<f32>,
    host_valid: bool,
    device: Option<gpu::DeviceArray>,
    device_valid: bool,
    location: Location,
    meta: BTreeMap<String, Value>,
    id: u64,
}

impl Buffer {
    pub fn new(req: Requisition) -> Self {
        Self {
            req,
            host: vec![0.0; req.len()],
            host_valid: true,
            device: None,
            device_valid: false,
            location: Location::Host,
            meta: BTreeMap::new(),
            id: 0,
        }
    }

    pub fn from_vec(dims: &[usize], data: Vec<f32>) -> Self {
        let req = Requisition::new(dims);
        assert_eq!(req.len(), data.len());
        Self {
            req,
            host: data,
            host_valid: true,
            device: None,
            device_valid: false,
            location: Location::Host,
            meta: BTreeMap::new(),
            id: 0,
        }
    }

    pub fn requisition(&self) -> Requisition {
        self.req
    }

    pub fn len(&self) -> usize {
        self.req.len()
    }

    pub fn is_empty(&self) -> bool {
        self.req.len() == 0
    }

    /// Allocated host capacity in elements; never shrinks.
    pub fn capacity(&self) -> usize {
        self.host.len()
    }

    pub fn size_bytes(&self) -> usize {
        self.len() * 4
    }

    /// Reshape the buffer. Contents of both sides become meaningless; the
    /// host side stays addressable, the device side is dropped if it no
    /// longer fits.
    pub fn resize(&mut self, req: Requisition) {
        if req.len() > self.host.len() {
            self.host.resize(req.len(), 0.0);
        }
        if let Some(ref dev) = self.device {
            if dev.len() < req.len() {
                self.device = None;
            }
        }
        self.req = req;
        self.host_valid = true;
        self.device_valid = false;
        self.location = Location::Host;
    }

    pub fn fill(&mut self, value: f32) -> Result<()> {
        let len = self.len();
        self.host_mut()?[..len].iter_mut().for_each(|v| *v = value);
        Ok(())
    }

    /// Read-only host view. The host side must be valid; drivers call
    /// [`Buffer::ensure_host`] before handing buffers to CPU tasks.
    pub fn host(&self) -> Result<&[f32]> {
        if self.location == Location::Invalid {
            return Err(Error::DeviceTransferFailed("buffer is invalid".into()));
        }
        if !self.host_valid {
            return Err(Error::DeviceTransferFailed(
                "host side is stale; no transfer was performed".into(),
            ));
        }
        Ok(&self.host[..self.req.len()])
    }

    /// Writable host view. Marks the host side authoritative.
    pub fn host_mut(&mut self) -> Result<&mut [f32]> {
        if self.location == Location::Invalid {
            return Err(Error::DeviceTransferFailed("buffer is invalid".into()));
        }
        if !self.host_valid {
            return Err(Error::DeviceTransferFailed(
                "host side is stale; no transfer was performed".into(),
            ));
        }
        self.device_valid = false;
        self.location = Location::Host;
        let len = self.req.len();
        Ok(&mut self.host[..len])
    }

    /// Raw byte view of the host storage, for ingress data that is widened
    /// afterwards with [`Buffer::reinterpret`].
    pub fn host_bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.host_mut().map(bytemuck::cast_slice_mut)
    }

    /// Download from the device if the host side is stale.
    pub fn ensure_host(&mut self, queue: Option<&gpu::Queue>) -> Result<()> {
        if self.location == Location::Invalid {
            return Err(Error::DeviceTransferFailed("buffer is invalid".into()));
        }
        if self.host_valid {
            return Ok(());
        }
        let len = self.req.len();
        match self.device {
            Some(ref dev) => match dev.download(queue, &mut self.host[..len]) {
                Ok(()) => {
                    self.host_valid = true;
                    Ok(())
                }
                Err(err) => {
                    self.location = Location::Invalid;
                    Err(err)
                }
            },
            None => {
                self.location = Location::Invalid;
                Err(Error::DeviceTransferFailed(
                    "no valid side to transfer from".into(),
                ))
            }
        }
    }

    /// Upload to the device if the device side is stale. Read-only access
    /// afterwards goes through [`Buffer::device`].
    pub fn ensure_device(&mut self, queue: &gpu::Queue) -> Result<()> {
        if self.location == Location::Invalid {
            return Err(Error::DeviceTransferFailed("buffer is invalid".into()));
        }
        let len = self.req.len();
        if self.device.as_ref().map_or(true, |d| d.len() < len) {
            self.device = Some(gpu::DeviceArray::alloc(queue, len)?);
            self.device_valid = false;
        }
        if !self.device_valid {
            if !self.host_valid {
                self.location = Location::Invalid;
                return Err(Error::DeviceTransferFailed(
                    "no valid side to transfer from".into(),
                ));
            }
            let dev = self.device.as_ref().unwrap();
            if let Err(err) = dev.upload(queue, &self.host[..len]) {
                self.location = Location::Invalid;
                return Err(err);
            }
            self.device_valid = true;
        }
        Ok(())
    }

    /// Read-only device handle; requires a prior [`Buffer::ensure_device`].
    pub fn device(&self) -> Result<&gpu::DeviceArray> {
        if !self.device_valid {
            return Err(Error::DeviceTransferFailed(
                "device side is stale; no transfer was performed".into(),
            ));
        }
        Ok(self.device.as_ref().unwrap())
    }

    /// Device handle for writing. Uploads stale host data first, then
    /// marks the device side authoritative (the kernel is about to write).
    pub fn device_array(&mut self, queue: &gpu::Queue) -> Result<&gpu::DeviceArray> {
        self.ensure_device(queue)?;
        self.host_valid = false;
        self.location = Location::Device;
        Ok(self.device.as_ref().unwrap())
    }

    /// O(1) exchange of the host arrays of two equally-shaped buffers.
    /// Device sides of both become stale.
    pub fn swap_host(&mut self, other: &mut Buffer) {
        std::mem::swap(&mut self.host, &mut other.host);
        std::mem::swap(&mut self.host_valid, &mut other.host_valid);
        self.device_valid = false;
        other.device_valid = false;
        if self.location != Location::Invalid {
            self.location = Location::Host;
        }
        if other.location != Location::Invalid {
            other.location = Location::Host;
        }
    }

    /// Widen `n` raw u8/u16 samples sitting at the start of the host
    /// storage into f32, in place, back to front. Explicit loops, no
    /// pointer reinterpretation.
    pub fn reinterpret(&mut self, depth: BitDepth, n: usize) -> Result<()> {
        if n > self.host.len() {
            return Err(Error::IoFailed(format!(
                "cannot widen {} samples into a buffer of capacity {}",
                n,
                self.host.len()
            )));
        }
        match depth {
            BitDepth::F32 => {}
            BitDepth::U8 => {
                for i in (0..n).rev() {
                    let raw = bytemuck::cast_slice::<f32, u8>(&self.host)[i];
                    self.host[i] = raw as f32;
                }
            }
            BitDepth::U16 => {
                for i in (0..n).rev() {
                    let bytes = bytemuck::cast_slice::<f32, u8>(&self.host);
                    let raw = u16::from_ne_bytes([bytes[2 * i], bytes[2 * i + 1]]);
                    self.host[i] = raw as f32;
                }
            }
        }
        self.host_valid = true;
        self.device_valid = false;
        self.location = Location::Host;
        Ok(())
    }

    /// Copy shape, contents, metadata and stream id from `src`,
    /// respecting its current location.
    pub fn copy_from(&mut self, src: &Buffer, queue: Option<&gpu::Queue>) -> Result<()> {
        self.resize(src.req);
        let len = src.req.len();
        if src.host_valid {
            self.host[..len].copy_from_slice(&src.host[..len]);
        } else if src.device_valid {
            src.device
                .as_ref()
                .unwrap()
                .download(queue, &mut self.host[..len])?;
        } else {
            return Err(Error::DeviceTransferFailed(
                "source buffer has no valid side".into(),
            ));
        }
        self.meta = src.meta.clone();
        self.id = src.id;
        Ok(())
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn set_location(&mut self, location: Location) {
        self.location = location;
        match location {
            Location::Host => {
                self.host_valid = true;
                self.device_valid = false;
            }
            Location::Device | Location::DeviceImage => {
                self.device_valid = true;
                self.host_valid = false;
            }
            Location::Invalid => {
                self.host_valid = false;
                self.device_valid = false;
            }
        }
    }

    pub fn meta_get(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    pub fn meta_set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn meta_keys(&self) -> impl Iterator<Item = &str> {
        self.meta.keys().map(String::as_str)
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.meta
    }

    /// Replace metadata with a copy of `meta` (copy-on-push across edges).
    pub fn set_metadata(&mut self, meta: &BTreeMap<String, Value>) {
        self.meta = meta.clone();
    }

    pub fn clear_metadata(&mut self) {
        self.meta.clear();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = id;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("req", &self.req)
            .field("location", &self.location)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requisition_shapes() {
        let r = Requisition::d2(8, 4);
        assert_eq!(r.n_dims(), 2);
        assert_eq!(r.dims(), &[8, 4]);
        assert_eq!(r.len(), 32);
        assert!(Requisition::none().is_none());
        assert_eq!(Requisition::none().len(), 0);
    }

    #[test]
    fn swap_twice_is_identity() {
        let mut a = Buffer::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let mut b = Buffer::from_vec(&[2, 2], vec![5.0, 6.0, 7.0, 8.0]);
        a.swap_host(&mut b);
        assert_eq!(a.host().unwrap(), &[5.0, 6.0, 7.0, 8.0]);
        a.swap_host(&mut b);
        assert_eq!(a.host().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(b.host().unwrap(), &[5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn widen_u8_in_place() {
        let mut buf = Buffer::new(Requisition::d2(2, 2));
        {
            let bytes = buf.host_bytes_mut().unwrap();
            bytes[..4].copy_from_slice(&[1, 2, 3, 255]);
        }
        buf.reinterpret(BitDepth::U8, 4).unwrap();
        assert_eq!(buf.host().unwrap(), &[1.0, 2.0, 3.0, 255.0]);
    }

    #[test]
    fn widen_u16_in_place() {
        let mut buf = Buffer::new(Requisition::d2(2, 2));
        let samples: [u16; 4] = [0, 1, 256, 65535];
        {
            let bytes = buf.host_bytes_mut().unwrap();
            for (i, s) in samples.iter().enumerate() {
                bytes[2 * i..2 * i + 2].copy_from_slice(&s.to_ne_bytes());
            }
        }
        buf.reinterpret(BitDepth::U16, 4).unwrap();
        assert_eq!(buf.host().unwrap(), &[0.0, 1.0, 256.0, 65535.0]);
    }

    #[test]
    fn metadata_never_fails() {
        let mut buf = Buffer::new(Requisition::d2(1, 1));
        assert!(buf.meta_get("absent").is_none());
        buf.meta_set("frames", 4i64);
        buf.meta_set("source", "camera");
        assert_eq!(buf.meta_get("frames").and_then(Value::as_int), Some(4));
        assert_eq!(buf.meta_keys().count(), 2);
    }

    #[test]
    fn resize_keeps_capacity() {
        let mut buf = Buffer::new(Requisition::d2(4, 4));
        buf.resize(Requisition::d2(2, 2));
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.capacity(), 16);
        buf.resize(Requisition::d2(8, 8));
        assert_eq!(buf.capacity(), 64);
    }
}
