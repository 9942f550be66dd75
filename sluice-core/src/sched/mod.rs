//! The scheduler: binds a frozen graph to executors, allocates one
//! bounded queue per edge, runs one driver loop per node and collects
//! the first fault.

mod driver;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use once_cell::sync::OnceCell;

use crate::buffer::BufferRef;
use crate::error::{Error, Result};
use crate::gpu;
use crate::graph::{NodeKind, TaskGraph};
use crate::profiler::{NodeStats, Profile};
use crate::resources::Resources;

use driver::Driver;

/// What travels through an edge queue: a buffer, end-of-stream, or
/// fault propagation.
pub(crate) enum Envelope {
    Data(BufferRef),
    Eof,
    Abort,
}

/// Set-once slot keeping the first fault of a run.
pub(crate) struct FaultSlot {
    cell: OnceCell<Error>,
}

impl FaultSlot {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Returns true if this call stored the fault.
    pub fn set(&self, err: Error) -> bool {
        self.cell.set(err).is_ok()
    }

    pub fn get(&self) -> Option<&Error> {
        self.cell.get()
    }

    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// External cancellation. Cancel is idempotent; source drivers notice
/// the flag and propagate ABORT through the graph.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Bounded capacity of every edge queue; push blocks when full.
    pub queue_depth: usize,
    /// Replicate GPU chains across devices when more than one is
    /// configured.
    pub expand: bool,
    /// Watchdog deadline; triggers cancellation when exceeded.
    pub timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 2,
            expand: true,
            timeout: None,
        }
    }
}

#[derive(Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn run(&self, graph: TaskGraph, resources: Arc<Resources>) -> Result<Profile> {
        self.run_with_cancel(graph, resources, CancelHandle::new())
    }

    /// Run the graph to completion. Returns the profile on success, the
    /// first fault otherwise; [`Error::Cancelled`] if the run was
    /// cancelled externally or by the watchdog.
    pub fn run_with_cancel(
        &self,
        mut graph: TaskGraph,
        resources: Arc<Resources>,
        cancel: CancelHandle,
    ) -> Result<Profile> {
        graph.validate()?;
        if self.config.expand && resources.num_devices() >= 2 {
            graph.expand(resources.num_devices());
            graph.validate()?;
        }
        graph.freeze();

        // Binding: partition nodes onto executors.
        let keys = graph.keys();
        let mut bindings = Vec::with_capacity(keys.len());
        let mut next_device = 0usize;
        for &key in &keys {
            let slot = graph.slot(key);
            let mode = slot.task.mode();
            if !mode.is_well_formed() {
                return Err(Error::SetupFailed(
                    "task declares more than one of processor/reducer/generator".into(),
                )
                .in_node(&slot.name));
            }
            if slot.kind == NodeKind::Plugin
                && slot.task.num_inputs() == 0
                && !mode.is_generator()
            {
                return Err(
                    Error::SetupFailed("node without inputs must be a generator".into())
                        .in_node(&slot.name),
                );
            }
            let device = if mode.wants_gpu() {
                match resources.num_devices() {
                    0 if mode.wants_cpu() => None,
                    0 => {
                        return Err(Error::SetupFailed(
                            "task requires a GPU but none are configured".into(),
                        )
                        .in_node(&slot.name))
                    }
                    n => Some(match slot.device_hint {
                        Some(hint) => hint % n,
                        None => {
                            let d = next_device % n;
                            next_device += 1;
                            d
                        }
                    }),
                }
            } else {
                None
            };
            bindings.push(device);
        }

        // One-shot setup, in graph order, before any driver starts.
        for &key in &keys {
            let name = graph.slot(key).name.clone();
            graph
                .slot_mut(key)
                .task
                .setup(&resources)
                .map_err(|e| e.in_node(&name))?;
        }

        // One bounded queue per edge.
        let (mut slots, edges) = graph.into_parts();
        let mut channels: Vec<Option<(Sender<Envelope>, Receiver<Envelope>)>> = edges
            .iter()
            .map(|_| Some(bounded(self.config.queue_depth)))
            .collect();

        let fault = Arc::new(FaultSlot::new());
        let started = Instant::now();
        let mut handles = Vec::with_capacity(keys.len());
        for (i, &key) in keys.iter().enumerate() {
            let slot = slots.remove(key).unwrap();

            let mut in_edges: Vec<(usize, usize)> = edges
                .iter()
                .enumerate()
                .filter(|(_, e)| e.dst == key)
                .map(|(idx, e)| (e.port, idx))
                .collect();
            in_edges.sort();
            let inputs: Vec<Receiver<Envelope>> = in_edges
                .iter()
                .map(|&(_, idx)| channels[idx].as_mut().unwrap().1.clone())
                .collect();
            let outputs: Vec<Sender<Envelope>> = edges
                .iter()
                .enumerate()
                .filter(|(_, e)| e.src == key)
                .map(|(idx, _)| channels[idx].as_mut().unwrap().0.clone())
                .collect();

            let queue: Option<gpu::Queue> = bindings[i].map(|d| resources.queue(d).unwrap().clone());
            let driver = Driver::new(
                slot.name.clone(),
                slot.kind,
                slot.task,
                inputs,
                outputs,
                Arc::clone(&resources),
                queue,
                Arc::clone(&fault),
                cancel.clone(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("sluice-{}", slot.name))
                .spawn(move || driver.run())
                .map_err(|e| Error::SetupFailed(format!("cannot spawn driver: {}", e)))?;
            handles.push(handle);
        }
        // The prototype senders/receivers kept in `channels` must go
        // away so queues disconnect once their driver exits.
        channels.clear();

        // Watchdog: cancel when the run outlives the deadline.
        let (done_tx, done_rx) = unbounded::<()>();
        let watchdog = self.config.timeout.map(|timeout| {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                if let Err(crossbeam_channel::RecvTimeoutError::Timeout) =
                    done_rx.recv_timeout(timeout)
                {
                    log::warn!("watchdog deadline of {:?} hit, cancelling", timeout);
                    cancel.cancel();
                }
            })
        });

        let mut stats: Vec<NodeStats> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(node_stats) => stats.push(node_stats),
                Err(_) => {
                    fault.set(Error::SetupFailed("driver thread panicked".into()));
                }
            }
        }
        let wall_time = started.elapsed();
        drop(done_tx);
        if let Some(watchdog) = watchdog {
            let _ = watchdog.join();
        }

        // Cancellation is reported by the source driver that acted on
        // it, through the same set-once slot as any other fault; a
        // cancel arriving after every source already exited changes
        // nothing.
        if let Some(err) = fault.get() {
            return Err(err.clone());
        }
        Ok(Profile::new(wall_time, stats))
    }
}
