//! End-to-end scheduler behavior: termination, ordering, fan-out,
//! fault and cancellation propagation, reducer phase transitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sluice_core::{
    Buffer, CancelHandle, Error, Processed, Requisition, Resources, Result, Scheduler,
    SchedulerConfig, Task, TaskContext, TaskMode, TaskGraph,
};

/// Emits `number` constant frames; endless when `number` is zero.
struct CountSource {
    number: u64,
    width: usize,
    height: usize,
    produced: u64,
}

impl CountSource {
    fn new(number: u64, width: usize, height: usize) -> Self {
        Self {
            number,
            width,
            height,
            produced: 0,
        }
    }
}

impl Task for CountSource {
    fn name(&self) -> &str {
        "count-source"
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

    fn requisition(&self, _inputs: &[Requisition]) -> Result<Requisition> {
        Ok(Requisition::d2(self.width, self.height))
    }

    fn generate(&mut self, _ctx: &mut TaskContext, output: &mut Buffer) -> Result<bool> {
        if self.number > 0 && self.produced >= self.number {
            return Ok(false);
        }
        output.fill(self.produced as f32)?;
        self.produced += 1;
        Ok(true)
    }
}

/// Pass-through copy.
struct Relay;

impl Task for Relay {
    fn name(&self) -> &str {
        "relay"
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

    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs[0])
    }

    fn process(
        &mut self,
        ctx: &mut TaskContext,
        inputs: &[&Buffer],
        output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        output
            .expect("relay always has an output")
            .copy_from(inputs[0], ctx.queue())?;
        Ok(Processed::Continue)
    }
}

/// Records the stream id and first element of every buffer it consumes.
struct CollectSink {
    seen: Arc<Mutex<Vec<(u64, f32)>>>,
    delay: Option<Duration>,
}

impl CollectSink {
    fn new(seen: Arc<Mutex<Vec<(u64, f32)>>>) -> Self {
        Self { seen, delay: None }
    }

    fn slow(seen: Arc<Mutex<Vec<(u64, f32)>>>, delay: Duration) -> Self {
        Self {
            seen,
            delay: Some(delay),
        }
    }
}

impl Task for CollectSink {
    fn name(&self) -> &str {
        "collect"
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
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.seen
            .lock()
            .unwrap()
            .push((inputs[0].id(), inputs[0].host()?[0]));
        Ok(Processed::Continue)
    }
}

/// Fails on the n-th frame it sees.
struct FailOn {
    tick: u64,
    seen: u64,
}

impl Task for FailOn {
    fn name(&self) -> &str {
        "fail-on"
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

    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs[0])
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        _inputs: &[&Buffer],
        _output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        self.seen += 1;
        if self.seen == self.tick {
            return Err(Error::IoFailed("injected failure".into()));
        }
        Ok(Processed::Continue)
    }
}

/// Accumulates frame count, then emits `emissions` single-pixel frames.
/// Also asserts the accumulate phase never resumes after finalize.
struct CountingReducer {
    emissions: u64,
    emitted: u64,
    accumulated: Arc<AtomicU64>,
    finalized: bool,
}

impl Task for CountingReducer {
    fn name(&self) -> &str {
        "counting-reducer"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::REDUCER | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_dimensions(&self, _port: usize) -> usize {
        2
    }

    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs[0])
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        _inputs: &[&Buffer],
        _output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        if self.finalized {
            return Err(Error::IoFailed(
                "process called after the reduce transition".into(),
            ));
        }
        self.accumulated.fetch_add(1, Ordering::SeqCst);
        Ok(Processed::Continue)
    }

    fn reduce(&mut self, _ctx: &mut TaskContext, output: &mut Buffer) -> Result<bool> {
        self.finalized = true;
        if self.emitted >= self.emissions {
            return Ok(false);
        }
        output.fill(self.emitted as f32)?;
        self.emitted += 1;
        Ok(true)
    }
}

fn resources() -> Arc<Resources> {
    Resources::new().unwrap()
}

#[test]
fn identity_chain_terminates() {
    let res = resources();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(4, 8, 8));
    let relay = graph.add(Relay);
    let sink = graph.add(CollectSink::new(seen.clone()));
    graph.connect(source, relay).unwrap();
    graph.connect(relay, sink).unwrap();

    let profile = Scheduler::new().run(graph, res.clone()).unwrap();

    assert_eq!(seen.lock().unwrap().len(), 4);
    assert_eq!(profile.node("collect").unwrap().invocations, 4);
    assert_eq!(profile.node("relay").unwrap().invocations, 4);
    assert_eq!(
        profile.node("relay").unwrap().bytes_in,
        4 * 8 * 8 * 4,
    );
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn edges_preserve_fifo_order() {
    let res = resources();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(16, 4, 4));
    let sink = graph.add(CollectSink::new(seen.clone()));
    graph.connect(source, sink).unwrap();

    Scheduler::new().run(graph, res.clone()).unwrap();

    let seen = seen.lock().unwrap();
    let ids: Vec<u64> = seen.iter().map(|(id, _)| *id).collect();
    let values: Vec<f32> = seen.iter().map(|(_, v)| *v).collect();
    assert_eq!(ids, (0..16).collect::<Vec<u64>>());
    assert_eq!(values, (0..16).map(|v| v as f32).collect::<Vec<f32>>());
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn fan_out_shares_and_releases() {
    let res = resources();
    let left = Arc::new(Mutex::new(Vec::new()));
    let right = Arc::new(Mutex::new(Vec::new()));
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(8, 4, 4));
    let sink_a = graph.add(CollectSink::new(left.clone()));
    let sink_b = graph.add(CollectSink::new(right.clone()));
    graph.connect(source, sink_a).unwrap();
    graph.connect(source, sink_b).unwrap();

    Scheduler::new().run(graph, res.clone()).unwrap();

    assert_eq!(left.lock().unwrap().len(), 8);
    assert_eq!(right.lock().unwrap().len(), 8);
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn first_fault_reaches_the_caller() {
    let res = resources();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(64, 4, 4));
    let failing = graph.add(FailOn { tick: 3, seen: 0 });
    let sink = graph.add(CollectSink::new(seen.clone()));
    graph.connect(source, failing).unwrap();
    graph.connect(failing, sink).unwrap();

    let err = Scheduler::new().run(graph, res.clone()).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("fail-on"), "got: {}", message);
    assert!(message.contains("injected failure"), "got: {}", message);
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn cancellation_stops_an_endless_stream() {
    let res = resources();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(0, 4, 4));
    let sink = graph.add(CollectSink::slow(seen.clone(), Duration::from_millis(5)));
    graph.connect(source, sink).unwrap();

    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        trigger.cancel();
    });

    let started = Instant::now();
    let err = Scheduler::new()
        .run_with_cancel(graph, res.clone(), cancel.clone())
        .unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, Error::Cancelled));
    // The cancel fired at 100 ms; the scheduler has to come back within
    // a couple of queue depths of sink latency, not seconds.
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "cancellation took {:?}",
        started.elapsed()
    );
    // Cancel is idempotent.
    cancel.cancel();
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn watchdog_timeout_cancels() {
    let res = resources();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(0, 4, 4));
    let sink = graph.add(CollectSink::slow(seen.clone(), Duration::from_millis(2)));
    graph.connect(source, sink).unwrap();

    let scheduler = Scheduler::with_config(SchedulerConfig {
        timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let err = scheduler.run(graph, res.clone()).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn reducer_finalizes_exactly_once() {
    let res = resources();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let accumulated = Arc::new(AtomicU64::new(0));
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(5, 2, 2));
    let reducer = graph.add(CountingReducer {
        emissions: 2,
        emitted: 0,
        accumulated: accumulated.clone(),
        finalized: false,
    });
    let sink = graph.add(CollectSink::new(seen.clone()));
    graph.connect(source, reducer).unwrap();
    graph.connect(reducer, sink).unwrap();

    Scheduler::new().run(graph, res.clone()).unwrap();

    // Every upstream frame was accumulated, then the emission count the
    // reducer chose came out the other side.
    assert_eq!(accumulated.load(Ordering::SeqCst), 5);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(res.outstanding(), 0);
}

/// Primes from the first input frame, then emits copies of it.
struct ReplayGenerator {
    copies: u64,
    emitted: u64,
    seed: Option<Vec<f32>>,
    shape: Requisition,
}

impl Task for ReplayGenerator {
    fn name(&self) -> &str {
        "replay"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::GENERATOR | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_dimensions(&self, _port: usize) -> usize {
        2
    }

    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs.first().copied().unwrap_or(self.shape))
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        inputs: &[&Buffer],
        output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        self.seed = Some(inputs[0].host()?.to_vec());
        self.shape = inputs[0].requisition();
        if let Some(output) = output {
            output.host_mut()?.copy_from_slice(inputs[0].host()?);
        }
        Ok(Processed::Continue)
    }

    fn generate(&mut self, _ctx: &mut TaskContext, output: &mut Buffer) -> Result<bool> {
        let seed = match self.seed {
            Some(ref seed) => seed,
            None => return Ok(false),
        };
        if self.emitted >= self.copies {
            return Ok(false);
        }
        output.host_mut()?.copy_from_slice(seed);
        self.emitted += 1;
        Ok(true)
    }
}

#[test]
fn generator_primes_once_then_emits() {
    let res = resources();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(4, 2, 2));
    let replay = graph.add(ReplayGenerator {
        copies: 3,
        emitted: 0,
        seed: None,
        shape: Requisition::d2(2, 2),
    });
    let sink = graph.add(CollectSink::new(seen.clone()));
    graph.connect(source, replay).unwrap();
    graph.connect(replay, sink).unwrap();

    Scheduler::new().run(graph, res.clone()).unwrap();

    let seen = seen.lock().unwrap();
    // Prime output plus three emissions, all carrying the first frame.
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().all(|(_, v)| *v == 0.0));
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn invalid_graph_is_rejected_before_running() {
    let res = resources();
    let mut graph = TaskGraph::new();
    let a = graph.add(Relay);
    let b = graph.add(Relay);
    graph.connect(a, b).unwrap();
    graph.connect(b, a).unwrap();

    let err = Scheduler::new().run(graph, res).unwrap_err();
    assert!(matches!(err, Error::GraphInvalid(_)));
}

#[cfg(not(feature = "opencl"))]
#[test]
fn gpu_only_task_without_devices_fails_setup() {
    struct GpuOnly;
    impl Task for GpuOnly {
        fn name(&self) -> &str {
            "gpu-only"
        }
        fn mode(&self) -> TaskMode {
            TaskMode::PROCESSOR | TaskMode::GPU
        }
        fn num_inputs(&self) -> usize {
            1
        }
        fn num_dimensions(&self, _port: usize) -> usize {
            2
        }
        fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
            Ok(inputs[0])
        }
    }

    let res = resources();
    let mut graph = TaskGraph::new();
    let source = graph.add(CountSource::new(1, 2, 2));
    let gpu = graph.add(GpuOnly);
    graph.connect(source, gpu).unwrap();

    let err = Scheduler::new().run(graph, res).unwrap_err();
    assert!(err.to_string().contains("requires a GPU"), "got: {}", err);
}
