//! One driver loop per node: pop inputs, compute the requisition,
//! acquire an output from the pool, invoke the task, push downstream.
//! EOF and ABORT sentinels traverse the graph through these loops.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::{Buffer, BufferRef, Location, Requisition};
use crate::error::{Error, Result};
use crate::gpu;
use crate::graph::NodeKind;
use crate::profiler::NodeStats;
use crate::resources::Resources;
use crate::task::{Processed, Task, TaskContext};

use super::{CancelHandle, Envelope, FaultSlot};

/// One synchronized pop across all input ports.
enum Tick {
    Data(Vec<BufferRef>),
    Eof,
    Abort,
}

pub(crate) struct Driver {
    name: String,
    kind: NodeKind,
    task: Box<dyn Task>,
    inputs: Vec<Receiver<Envelope>>,
    outputs: Vec<Sender<Envelope>>,
    resources: Arc<Resources>,
    queue: Option<gpu::Queue>,
    fault: Arc<FaultSlot>,
    cancel: CancelHandle,
    stats: NodeStats,
    next_id: u64,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        kind: NodeKind,
        task: Box<dyn Task>,
        inputs: Vec<Receiver<Envelope>>,
        outputs: Vec<Sender<Envelope>>,
        resources: Arc<Resources>,
        queue: Option<gpu::Queue>,
        fault: Arc<FaultSlot>,
        cancel: CancelHandle,
    ) -> Self {
        let stats = NodeStats::new(name.clone());
        Self {
            name,
            kind,
            task,
            inputs,
            outputs,
            resources,
            queue,
            fault,
            cancel,
            stats,
            next_id: 0,
        }
    }

    pub fn run(mut self) -> NodeStats {
        log::debug!("driver `{}` starting", self.name);
        match self.kind {
            NodeKind::Broadcast => self.run_broadcast(),
            NodeKind::Gather => self.run_gather(),
            NodeKind::Plugin => {
                let mode = self.task.mode();
                if mode.is_generator() {
                    self.run_generator();
                } else if mode.is_reducer() {
                    self.run_reducer();
                } else {
                    self.run_processor();
                }
            }
        }
        log::debug!("driver `{}` exited", self.name);
        self.stats
    }

    //------------------------------------------------------------------
    // Queue plumbing
    //------------------------------------------------------------------

    fn timed_recv(&mut self, port: usize) -> Envelope {
        let started = Instant::now();
        // A vanished producer is a fault upstream; treat it as ABORT.
        let env = self.inputs[port].recv().unwrap_or(Envelope::Abort);
        self.stats.idle_time += started.elapsed();
        env
    }

    /// Pop one envelope from every port. ABORT wins over EOF; data
    /// arriving alongside a sentinel goes straight back to the pool.
    fn pop_tick(&mut self) -> Tick {
        let mut bufs = Vec::with_capacity(self.inputs.len());
        let mut eof = false;
        let mut abort = false;
        for port in 0..self.inputs.len() {
            match self.timed_recv(port) {
                Envelope::Data(buf) => bufs.push(buf),
                Envelope::Eof => eof = true,
                Envelope::Abort => abort = true,
            }
        }
        if abort || eof {
            self.release_all(bufs);
            if abort {
                Tick::Abort
            } else {
                Tick::Eof
            }
        } else {
            Tick::Data(bufs)
        }
    }

    /// Consume leftovers on every port so blocked producers can finish.
    fn drain_inputs(&mut self) {
        for port in 0..self.inputs.len() {
            loop {
                match self.inputs[port].recv() {
                    Ok(Envelope::Data(buf)) => self.resources.release(buf),
                    Ok(Envelope::Eof) | Ok(Envelope::Abort) | Err(_) => break,
                }
            }
        }
    }

    /// Share a buffer with every successor; the clone count drives the
    /// eventual pool release. With no successors the buffer retires
    /// immediately.
    fn push_data(&mut self, buf: BufferRef) {
        if self.outputs.is_empty() {
            self.resources.release(buf);
            return;
        }
        let started = Instant::now();
        let last = self.outputs.len() - 1;
        for i in 0..last {
            if let Err(e) = self.outputs[i].send(Envelope::Data(buf.clone())) {
                if let Envelope::Data(buf) = e.into_inner() {
                    self.resources.release(buf);
                }
            }
        }
        if let Err(e) = self.outputs[last].send(Envelope::Data(buf)) {
            if let Envelope::Data(buf) = e.into_inner() {
                self.resources.release(buf);
            }
        }
        self.stats.idle_time += started.elapsed();
    }

    fn send_eof(&self) {
        for tx in &self.outputs {
            let _ = tx.send(Envelope::Eof);
        }
    }

    fn send_abort(&self) {
        for tx in &self.outputs {
            let _ = tx.send(Envelope::Abort);
        }
    }

    fn release_all(&mut self, bufs: Vec<BufferRef>) {
        for buf in bufs {
            self.resources.release(buf);
        }
    }

    //------------------------------------------------------------------
    // Fault handling
    //------------------------------------------------------------------

    /// Record the fault (first one wins), poison downstream, unblock
    /// upstream.
    fn fail(&mut self, err: Error) {
        let err = err.in_node(&self.name);
        log::error!("{}", err);
        self.fault.set(err);
        self.send_abort();
        self.drain_inputs();
    }

    /// Fault in the middle of a tick: the unpushed output and the
    /// popped inputs go back to the pool first.
    fn fail_tick(&mut self, err: Error, inputs: Vec<BufferRef>, output: Option<Buffer>) -> bool {
        if let Some(out) = output {
            self.resources.release_owned(out);
        }
        self.release_all(inputs);
        self.fail(err);
        false
    }

    fn should_abort(&self) -> bool {
        self.cancel.is_cancelled() || self.fault.is_set()
    }

    //------------------------------------------------------------------
    // Shared tick machinery
    //------------------------------------------------------------------

    fn location_hint(&self) -> Location {
        if self.queue.is_some() {
            Location::Device
        } else {
            Location::Host
        }
    }

    /// Make every input resident on the side this node computes on.
    /// This is the one place transfers block; the read locks taken for
    /// `process` afterwards see valid data.
    fn ensure_residency(&self, inputs: &[BufferRef]) -> Result<()> {
        for buf in inputs {
            let mut guard = buf.write().unwrap();
            match self.queue {
                Some(ref queue) => guard.ensure_device(queue)?,
                None => guard.ensure_host(None)?,
            }
        }
        Ok(())
    }

    fn input_shapes(&self, inputs: &[BufferRef]) -> Vec<Requisition> {
        inputs
            .iter()
            .map(|b| b.read().unwrap().requisition())
            .collect()
    }

    fn min_input_id(&self, inputs: &[BufferRef]) -> u64 {
        inputs
            .iter()
            .map(|b| b.read().unwrap().id())
            .min()
            .unwrap_or(0)
    }

    /// Pool a fresh output for this tick; stream id and metadata are
    /// inherited here, not in the task.
    fn acquire_output(&mut self, req: Requisition, inputs: &[BufferRef]) -> Result<Buffer> {
        let mut out = self.resources.acquire(req, self.location_hint())?;
        if let Some(first) = inputs.first() {
            let first = first.read().unwrap();
            out.set_metadata(first.metadata());
        }
        out.set_id(self.min_input_id(inputs));
        Ok(out)
    }

    /// Run one `process` call over locked inputs. Returns the task's
    /// verdict; timing and byte counters are recorded here.
    fn invoke_process(
        &mut self,
        inputs: &[BufferRef],
        output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        let queue = self.queue.clone();
        let mut ctx = TaskContext::new(queue.as_ref());
        let guards: Vec<_> = inputs.iter().map(|b| b.read().unwrap()).collect();
        let refs: Vec<&Buffer> = guards.iter().map(|g| &**g).collect();
        let started = Instant::now();
        let result = self.task.process(&mut ctx, &refs, output);
        self.stats.cpu_time += started.elapsed();
        self.stats.kernel_time += Duration::from_nanos(ctx.take_kernel_ns());
        self.stats.invocations += 1;
        self.stats.bytes_in += refs.iter().map(|b| b.size_bytes() as u64).sum::<u64>();
        result
    }

    //------------------------------------------------------------------
    // Processor (and sink) loop
    //------------------------------------------------------------------

    fn run_processor(&mut self) {
        loop {
            match self.pop_tick() {
                Tick::Abort => {
                    self.send_abort();
                    self.drain_inputs();
                    return;
                }
                Tick::Eof => {
                    self.send_eof();
                    self.drain_inputs();
                    return;
                }
                Tick::Data(inputs) => {
                    if !self.processor_tick(inputs) {
                        return;
                    }
                }
            }
        }
    }

    fn processor_tick(&mut self, inputs: Vec<BufferRef>) -> bool {
        let shapes = self.input_shapes(&inputs);
        let req = match self.task.requisition(&shapes) {
            Ok(req) => req,
            Err(err) => return self.fail_tick(err, inputs, None),
        };
        if let Err(err) = self.ensure_residency(&inputs) {
            return self.fail_tick(err, inputs, None);
        }
        let mut output = if req.is_none() {
            None
        } else {
            match self.acquire_output(req, &inputs) {
                Ok(out) => Some(out),
                Err(err) => return self.fail_tick(err, inputs, None),
            }
        };

        match self.invoke_process(&inputs, output.as_mut()) {
            Ok(Processed::Continue) => {
                if let Some(out) = output {
                    self.stats.bytes_out += out.size_bytes() as u64;
                    let shared = self.resources.share(out);
                    self.push_data(shared);
                }
                self.release_all(inputs);
                true
            }
            Ok(Processed::Stop) => {
                if let Some(out) = output {
                    self.resources.release_owned(out);
                }
                self.release_all(inputs);
                self.send_eof();
                self.drain_inputs();
                false
            }
            Err(err) => self.fail_tick(err, inputs, output),
        }
    }

    //------------------------------------------------------------------
    // Reducer loop: ACCUMULATE -> FINALIZE -> DONE
    //------------------------------------------------------------------

    fn run_reducer(&mut self) {
        let mut acc: Option<Buffer> = None;
        'accumulate: loop {
            match self.pop_tick() {
                Tick::Abort => {
                    if let Some(acc) = acc.take() {
                        self.resources.release_owned(acc);
                    }
                    self.send_abort();
                    self.drain_inputs();
                    return;
                }
                Tick::Eof => break 'accumulate,
                Tick::Data(inputs) => {
                    if acc.is_none() {
                        let shapes = self.input_shapes(&inputs);
                        let req = match self.task.requisition(&shapes) {
                            Ok(req) => req,
                            Err(err) => {
                                self.fail_tick(err, inputs, None);
                                return;
                            }
                        };
                        if !req.is_none() {
                            // The accumulator starts zeroed; tasks add
                            // into it across ticks.
                            let mut out = match self.acquire_output(req, &inputs) {
                                Ok(out) => out,
                                Err(err) => {
                                    self.fail_tick(err, inputs, None);
                                    return;
                                }
                            };
                            if let Err(err) = out.fill(0.0) {
                                self.fail_tick(err, inputs, Some(out));
                                return;
                            }
                            acc = Some(out);
                        }
                    }
                    if let Err(err) = self.ensure_residency(&inputs) {
                        if let Some(acc) = acc.take() {
                            self.resources.release_owned(acc);
                        }
                        self.fail_tick(err, inputs, None);
                        return;
                    }
                    match self.invoke_process(&inputs, acc.as_mut()) {
                        Ok(Processed::Continue) => self.release_all(inputs),
                        Ok(Processed::Stop) => {
                            self.release_all(inputs);
                            break 'accumulate;
                        }
                        Err(err) => {
                            if let Some(acc) = acc.take() {
                                self.resources.release_owned(acc);
                            }
                            self.fail_tick(err, inputs, None);
                            return;
                        }
                    }
                }
            }
        }
        self.drain_inputs();

        // FINALIZE: emit until the task says stop. Each emission is
        // shared downstream, so every further call gets a fresh buffer.
        let mut out = match acc {
            Some(out) => out,
            None => {
                self.send_eof();
                return;
            }
        };
        loop {
            let queue = self.queue.clone();
            let mut ctx = TaskContext::new(queue.as_ref());
            let started = Instant::now();
            let result = self.task.reduce(&mut ctx, &mut out);
            self.stats.cpu_time += started.elapsed();
            self.stats.kernel_time += Duration::from_nanos(ctx.take_kernel_ns());
            self.stats.invocations += 1;
            match result {
                Ok(true) => {
                    let req = out.requisition();
                    let id = out.id();
                    self.stats.bytes_out += out.size_bytes() as u64;
                    let shared = self.resources.share(out);
                    self.push_data(shared);
                    out = match self.resources.acquire(req, self.location_hint()) {
                        Ok(out) => out,
                        Err(err) => {
                            self.fail(err);
                            return;
                        }
                    };
                    if let Err(err) = out.fill(0.0) {
                        self.resources.release_owned(out);
                        self.fail(err);
                        return;
                    }
                    out.set_id(id + 1);
                }
                Ok(false) => {
                    self.resources.release_owned(out);
                    self.send_eof();
                    return;
                }
                Err(err) => {
                    self.resources.release_owned(out);
                    self.fail(err);
                    return;
                }
            }
        }
    }

    //------------------------------------------------------------------
    // Generator loop: (PRIME ->) EMIT -> DONE
    //------------------------------------------------------------------

    fn run_generator(&mut self) {
        if !self.inputs.is_empty() {
            match self.pop_tick() {
                Tick::Abort => {
                    self.send_abort();
                    self.drain_inputs();
                    return;
                }
                // EOF before any data: nothing to prime with, emit anyway.
                Tick::Eof => {}
                Tick::Data(inputs) => {
                    if !self.prime_tick(inputs) {
                        return;
                    }
                }
            }
        }

        loop {
            // Sources are where cancellation enters the graph. The
            // set-once slot keeps an earlier real fault over Cancelled.
            if self.should_abort() {
                self.fault.set(Error::Cancelled);
                self.send_abort();
                self.drain_inputs();
                return;
            }
            let req = match self.task.requisition(&[]) {
                Ok(req) => req,
                Err(err) => {
                    self.fail(err);
                    return;
                }
            };
            if req.is_none() {
                break;
            }
            let mut out = match self.resources.acquire(req, self.location_hint()) {
                Ok(out) => out,
                Err(err) => {
                    self.fail(err);
                    return;
                }
            };
            out.set_id(self.next_id);

            let queue = self.queue.clone();
            let mut ctx = TaskContext::new(queue.as_ref());
            let started = Instant::now();
            let result = self.task.generate(&mut ctx, &mut out);
            self.stats.cpu_time += started.elapsed();
            self.stats.kernel_time += Duration::from_nanos(ctx.take_kernel_ns());
            self.stats.invocations += 1;
            match result {
                Ok(true) => {
                    self.next_id += 1;
                    self.stats.bytes_out += out.size_bytes() as u64;
                    let shared = self.resources.share(out);
                    self.push_data(shared);
                }
                Ok(false) => {
                    self.resources.release_owned(out);
                    break;
                }
                Err(err) => {
                    self.resources.release_owned(out);
                    self.fail(err);
                    return;
                }
            }
        }
        self.send_eof();
        self.drain_inputs();
    }

    /// The single priming `process` call of a generator with inputs.
    fn prime_tick(&mut self, inputs: Vec<BufferRef>) -> bool {
        let shapes = self.input_shapes(&inputs);
        let req = match self.task.requisition(&shapes) {
            Ok(req) => req,
            Err(err) => return self.fail_tick(err, inputs, None),
        };
        if let Err(err) = self.ensure_residency(&inputs) {
            return self.fail_tick(err, inputs, None);
        }
        let mut output = if req.is_none() {
            None
        } else {
            match self.acquire_output(req, &inputs) {
                Ok(out) => Some(out),
                Err(err) => return self.fail_tick(err, inputs, None),
            }
        };
        match self.invoke_process(&inputs, output.as_mut()) {
            Ok(Processed::Continue) => {
                if let Some(out) = output {
                    self.stats.bytes_out += out.size_bytes() as u64;
                    let shared = self.resources.share(out);
                    self.push_data(shared);
                }
                self.release_all(inputs);
                true
            }
            Ok(Processed::Stop) => {
                if let Some(out) = output {
                    self.resources.release_owned(out);
                }
                self.release_all(inputs);
                self.send_eof();
                self.drain_inputs();
                false
            }
            Err(err) => self.fail_tick(err, inputs, output),
        }
    }

    //------------------------------------------------------------------
    // Expansion endpoints
    //------------------------------------------------------------------

    /// Round-robin dispatch across the replicated chains; stream ids
    /// pass through untouched.
    fn run_broadcast(&mut self) {
        let mut index = 0;
        loop {
            match self.timed_recv(0) {
                Envelope::Data(buf) => {
                    self.stats.invocations += 1;
                    let bytes = buf.read().unwrap().size_bytes() as u64;
                    self.stats.bytes_in += bytes;
                    self.stats.bytes_out += bytes;
                    let started = Instant::now();
                    if let Err(e) = self.outputs[index].send(Envelope::Data(buf)) {
                        if let Envelope::Data(buf) = e.into_inner() {
                            self.resources.release(buf);
                        }
                    }
                    self.stats.idle_time += started.elapsed();
                    index = (index + 1) % self.outputs.len();
                }
                Envelope::Eof => {
                    self.send_eof();
                    return;
                }
                Envelope::Abort => {
                    self.send_abort();
                    self.drain_inputs();
                    return;
                }
            }
        }
    }

    /// K-way merge by stream id; each replica delivers in order, so a
    /// min-heap over the head of every port restores the global order.
    fn run_gather(&mut self) {
        let ports = self.inputs.len();
        let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(ports);
        let mut pending: Vec<Option<BufferRef>> = (0..ports).map(|_| None).collect();

        for port in 0..ports {
            match self.timed_recv(port) {
                Envelope::Data(buf) => {
                    let id = buf.read().unwrap().id();
                    heap.push(Reverse((id, port)));
                    pending[port] = Some(buf);
                }
                Envelope::Eof => {}
                Envelope::Abort => {
                    self.release_all(pending.iter_mut().filter_map(Option::take).collect());
                    self.send_abort();
                    self.drain_inputs();
                    return;
                }
            }
        }

        while let Some(Reverse((_, port))) = heap.pop() {
            let buf = pending[port].take().unwrap();
            self.stats.invocations += 1;
            let bytes = buf.read().unwrap().size_bytes() as u64;
            self.stats.bytes_in += bytes;
            self.stats.bytes_out += bytes;
            self.push_data(buf);
            match self.timed_recv(port) {
                Envelope::Data(buf) => {
                    let id = buf.read().unwrap().id();
                    heap.push(Reverse((id, port)));
                    pending[port] = Some(buf);
                }
                Envelope::Eof => {}
                Envelope::Abort => {
                    self.release_all(pending.iter_mut().filter_map(Option::take).collect());
                    self.send_abort();
                    self.drain_inputs();
                    return;
                }
            }
        }
        self.send_eof();
    }
}
