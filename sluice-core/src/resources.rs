//! Shared resources: the GPU context, the kernel cache and the buffer
//! pool. One instance per scheduler run, shared by every driver.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::buffer::{Buffer, BufferRef, Location, Requisition};
use crate::error::{Error, Result};
use crate::gpu;

/// Environment variable selecting the OpenCL platform and devices,
/// e.g. `0` or `0:1,2`.
pub const ENV_DEVICES: &str = "SLUICE_DEVICES";
/// Environment variable with a colon-separated list of kernel include
/// directories.
pub const ENV_KERNEL_PATH: &str = "SLUICE_KERNEL_PATH";

/// Where a kernel's source comes from.
pub enum KernelSource<'a> {
    /// A file name, resolved against the kernel include paths.
    File(&'a str),
    /// Inline source text.
    Text(&'a str),
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Retained buffers per size bucket; the oldest entry is freed when
    /// a bucket overflows.
    pub bucket_cap: usize,
    /// Soft cap on pooled + outstanding bytes. Exceeding it frees
    /// pooled buffers, coldest first, until the request fits, then
    /// retries the acquisition once.
    pub byte_budget: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bucket_cap: 16,
            byte_budget: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResourceConfig {
    /// Overrides [`ENV_DEVICES`] when set.
    pub device_selector: Option<String>,
    /// Prepended to the paths from [`ENV_KERNEL_PATH`].
    pub kernel_paths: Vec<PathBuf>,
    pub pool: PoolConfig,
}

struct BufferPool {
    buckets: BTreeMap<usize, VecDeque<Buffer>>,
    pooled_bytes: usize,
    outstanding_bytes: usize,
    config: PoolConfig,
}

impl BufferPool {
    fn bucket_for(len: usize) -> usize {
        len.max(1).next_power_of_two()
    }

    fn try_reuse(&mut self, bucket: usize, req: Requisition) -> Option<Buffer> {
        // Any bucket of at least the requested capacity will do; prefer
        // the tightest fit, LIFO within it for cache warmth.
        let key = *self
            .buckets
            .range(bucket..)
            .find(|(_, q)| !q.is_empty())
            .map(|(k, _)| k)?;
        let mut buffer = self.buckets.get_mut(&key)?.pop_back()?;
        self.pooled_bytes -= buffer.capacity() * 4;
        self.outstanding_bytes += buffer.capacity() * 4;
        buffer.resize(req);
        buffer.clear_metadata();
        buffer.set_id(0);
        Some(buffer)
    }

    fn over_budget(&self, extra_bytes: usize) -> bool {
        match self.config.byte_budget {
            Some(budget) => self.pooled_bytes + self.outstanding_bytes + extra_bytes > budget,
            None => false,
        }
    }

    /// Free pooled buffers, coldest bucket first and oldest entry
    /// within it, stopping as soon as `extra_bytes` fits the budget.
    /// Warm buffers in unrelated buckets stay put.
    fn evict_for(&mut self, extra_bytes: usize) -> usize {
        let mut freed = 0;
        while self.over_budget(extra_bytes) {
            let key = match self
                .buckets
                .iter()
                .find(|(_, queue)| !queue.is_empty())
                .map(|(key, _)| *key)
            {
                Some(key) => key,
                None => break,
            };
            if let Some(oldest) = self.buckets.get_mut(&key).and_then(VecDeque::pop_front) {
                let bytes = oldest.capacity() * 4;
                self.pooled_bytes -= bytes;
                freed += bytes;
            }
        }
        freed
    }

    fn put_back(&mut self, buffer: Buffer) {
        let bucket = Self::bucket_for(buffer.capacity());
        let bytes = buffer.capacity() * 4;
        self.outstanding_bytes = self.outstanding_bytes.saturating_sub(bytes);
        let queue = self.buckets.entry(bucket).or_default();
        queue.push_back(buffer);
        self.pooled_bytes += bytes;
        if queue.len() > self.config.bucket_cap {
            if let Some(oldest) = queue.pop_front() {
                self.pooled_bytes -= oldest.capacity() * 4;
            }
        }
    }
}

/// Thread-safe home of the pool and the kernel cache. The internal
/// mutexes are held only for map lookups, never across transfers or
/// compilation.
pub struct Resources {
    gpu: Option<gpu::GpuContext>,
    kernel_paths: Vec<PathBuf>,
    pool: Mutex<BufferPool>,
    programs: Mutex<HashMap<u64, gpu::Program>>,
    compile_lock: Mutex<()>,
    outstanding: AtomicUsize,
}

impl Resources {
    /// Discover devices and include paths from the environment.
    pub fn new() -> Result<Arc<Resources>> {
        Self::with_config(ResourceConfig::default())
    }

    pub fn with_config(config: ResourceConfig) -> Result<Arc<Resources>> {
        let selector = config
            .device_selector
            .or_else(|| std::env::var(ENV_DEVICES).ok());
        let gpu = gpu::GpuContext::discover(selector.as_deref())?;

        let mut kernel_paths = config.kernel_paths;
        if let Some(list) = std::env::var_os(ENV_KERNEL_PATH) {
            kernel_paths.extend(std::env::split_paths(&list));
        }

        Ok(Arc::new(Resources {
            gpu,
            kernel_paths,
            pool: Mutex::new(BufferPool {
                buckets: BTreeMap::new(),
                pooled_bytes: 0,
                outstanding_bytes: 0,
                config: config.pool,
            }),
            programs: Mutex::new(HashMap::new()),
            compile_lock: Mutex::new(()),
            outstanding: AtomicUsize::new(0),
        }))
    }

    pub fn num_devices(&self) -> usize {
        self.gpu.as_ref().map_or(0, gpu::GpuContext::num_devices)
    }

    pub fn queue(&self, index: usize) -> Option<&gpu::Queue> {
        match self.gpu {
            Some(ref gpu) if index < gpu.num_devices() => Some(gpu.queue(index)),
            _ => None,
        }
    }

    pub fn device_name(&self, index: usize) -> Option<String> {
        match self.gpu {
            Some(ref gpu) if index < gpu.num_devices() => Some(gpu.device_name(index)),
            _ => None,
        }
    }

    /// Compile-once kernel lookup. The compiled program is cached by a
    /// hash of its source text; each call returns a fresh kernel object
    /// for the requested symbol.
    pub fn kernel(&self, source: KernelSource, symbol: &str) -> Result<gpu::Kernel> {
        let gpu = self
            .gpu
            .as_ref()
            .ok_or_else(|| Error::SetupFailed("no OpenCL devices configured".into()))?;

        let text = match source {
            KernelSource::Text(text) => text.to_owned(),
            KernelSource::File(name) => {
                let path = self.resolve_kernel_file(name)?;
                std::fs::read_to_string(&path)
                    .map_err(|e| Error::IoFailed(format!("{}: {}", path.display(), e)))?
            }
        };
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let key = hasher.finish();

        if let Some(program) = self.programs.lock().unwrap().get(&key) {
            return program.kernel(symbol);
        }

        // Compilation is serialized; the cache mutex stays free while
        // the OpenCL compiler runs.
        let _serial = self.compile_lock.lock().unwrap();
        if let Some(program) = self.programs.lock().unwrap().get(&key) {
            return program.kernel(symbol);
        }
        let options: Vec<String> = self
            .kernel_paths
            .iter()
            .map(|p| format!("-I {}", p.display()))
            .collect();
        let program = gpu.compile(&text, &options)?;
        let kernel = program.kernel(symbol)?;
        self.programs.lock().unwrap().insert(key, program);
        Ok(kernel)
    }

    fn resolve_kernel_file(&self, name: &str) -> Result<PathBuf> {
        let direct = Path::new(name);
        if direct.is_file() {
            return Ok(direct.to_owned());
        }
        for dir in &self.kernel_paths {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(Error::IoFailed(format!("kernel file `{}` not found", name)))
    }

    /// Take a buffer from the pool, or allocate one rounded up to the
    /// next power-of-two bucket.
    pub fn acquire(&self, req: Requisition, _hint: Location) -> Result<Buffer> {
        let bucket = BufferPool::bucket_for(req.len());
        let mut pool = self.pool.lock().unwrap();
        if let Some(buffer) = pool.try_reuse(bucket, req) {
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            return Ok(buffer);
        }
        if pool.over_budget(bucket * 4) {
            let freed = pool.evict_for(bucket * 4);
            log::debug!("pool over budget, freed {} pooled bytes", freed);
            if pool.over_budget(bucket * 4) {
                return Err(Error::IoFailed(format!(
                    "buffer pool budget exhausted acquiring {} bytes",
                    bucket * 4
                )));
            }
        }
        pool.outstanding_bytes += bucket * 4;
        drop(pool);

        let mut buffer = Buffer::new(Requisition::d1(bucket));
        buffer.resize(req);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    /// Wrap a freshly acquired buffer for in-flight sharing.
    pub fn share(&self, buffer: Buffer) -> BufferRef {
        Arc::new(RwLock::new(buffer))
    }

    /// Drop one reference to an in-flight buffer; the last reference
    /// returns it to the pool.
    pub fn release(&self, buffer: BufferRef) {
        if let Ok(lock) = Arc::try_unwrap(buffer) {
            let buffer = lock.into_inner().unwrap_or_else(|p| p.into_inner());
            self.release_owned(buffer);
        }
    }

    /// Return an exclusively owned buffer to the pool.
    pub fn release_owned(&self, buffer: Buffer) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.pool.lock().unwrap().put_back(buffer);
    }

    /// Buffers currently out of the pool. Zero after a clean run.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}
