//! Whole-pipeline scenarios: known images through real task graphs,
//! plus file round-trips through the TIFF backend.

use std::sync::{Arc, Mutex};

use sluice_core::{
    Buffer, Processed, Requisition, Resources, Result, Scheduler, Task, TaskContext, TaskMode,
    TaskGraph, Value,
};
use sluice_tasks::io::tiff::{narrow_to_u16, narrow_to_u8, write_tiff_f32, write_tiff_u16, write_tiff_u8};
use sluice_tasks::{
    AveragerTask, DummyDataTask, FlatFieldCorrectionTask, FlipTask, NullTask, ReadTask,
    SubtractTask,
};

/// Emits a fixed list of frames, all of the same shape.
struct PatternSource {
    width: usize,
    height: usize,
    frames: Vec<Vec<f32>>,
    next: usize,
}

impl PatternSource {
    fn new(width: usize, height: usize, frames: Vec<Vec<f32>>) -> Self {
        Self {
            width,
            height,
            frames,
            next: 0,
        }
    }
}

impl Task for PatternSource {
    fn name(&self) -> &str {
        "pattern-source"
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

    fn requisition(&self, _inputs: &[Requisition]) -> Result<Requisition> {
        Ok(Requisition::d2(self.width, self.height))
    }

    fn generate(&mut self, _ctx: &mut TaskContext, output: &mut Buffer) -> Result<bool> {
        match self.frames.get(self.next) {
            Some(frame) => {
                output.host_mut()?.copy_from_slice(frame);
                self.next += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Collects full frames for later inspection.
struct FrameSink {
    frames: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl Task for FrameSink {
    fn name(&self) -> &str {
        "frame-sink"
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
        self.frames
            .lock()
            .unwrap()
            .push(inputs[0].host()?.to_vec());
        Ok(Processed::Continue)
    }
}

/// Adds an offset to the stream id of everything passing through.
struct IdShift {
    offset: u64,
}

impl Task for IdShift {
    fn name(&self) -> &str {
        "id-shift"
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
        let output = output.expect("id-shift always has an output");
        output.copy_from(inputs[0], ctx.queue())?;
        output.set_id(inputs[0].id() + self.offset);
        Ok(Processed::Continue)
    }
}

fn collector() -> (Arc<Mutex<Vec<Vec<f32>>>>, FrameSink) {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = FrameSink {
        frames: frames.clone(),
    };
    (frames, sink)
}

fn configured(mut task: impl Task + 'static, options: &[(&str, Value)]) -> Box<dyn Task> {
    for (name, value) in options {
        task.set_option(name, value.clone()).unwrap();
    }
    Box::new(task)
}

#[test]
fn dummy_data_through_null() {
    let res = Resources::new().unwrap();
    let mut graph = TaskGraph::new();
    let source = graph.add_boxed(configured(
        DummyDataTask::new(),
        &[
            ("width", Value::Int(8)),
            ("height", Value::Int(8)),
            ("number", Value::Int(4)),
        ],
    ));
    let null = graph.add(NullTask::new());
    graph.connect(source, null).unwrap();

    let profile = Scheduler::new().run(graph, res.clone()).unwrap();
    assert_eq!(profile.node("null").unwrap().invocations, 4);
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn double_flip_is_identity() {
    let res = Resources::new().unwrap();
    let (frames, sink) = collector();
    let mut graph = TaskGraph::new();
    let source = graph.add(PatternSource::new(2, 2, vec![vec![1.0, 2.0, 3.0, 4.0]]));
    let once = graph.add_boxed(configured(
        FlipTask::new(),
        &[("direction", Value::from("horizontal"))],
    ));
    let twice = graph.add_boxed(configured(
        FlipTask::new(),
        &[("direction", Value::from("horizontal"))],
    ));
    let sink = graph.add(sink);
    graph.connect(source, once).unwrap();
    graph.connect(once, twice).unwrap();
    graph.connect(twice, sink).unwrap();

    Scheduler::new().run(graph, res).unwrap();

    let frames = frames.lock().unwrap();
    assert_eq!(frames.as_slice(), &[vec![1.0, 2.0, 3.0, 4.0]]);
}

#[test]
fn averager_emits_the_mean_frame() {
    let res = Resources::new().unwrap();
    let (frames, sink) = collector();
    let mut graph = TaskGraph::new();
    let source = graph.add(PatternSource::new(
        2,
        2,
        vec![vec![0.0; 4], vec![2.0; 4], vec![4.0; 4]],
    ));
    let averager = graph.add(AveragerTask::new());
    let sink = graph.add(sink);
    graph.connect(source, averager).unwrap();
    graph.connect(averager, sink).unwrap();

    Scheduler::new().run(graph, res.clone()).unwrap();

    let frames = frames.lock().unwrap();
    assert_eq!(frames.as_slice(), &[vec![2.0, 2.0, 2.0, 2.0]]);
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn subtract_aligned_streams() {
    let res = Resources::new().unwrap();
    let (frames, sink) = collector();
    let mut graph = TaskGraph::new();
    let minuend = graph.add(PatternSource::new(2, 2, vec![vec![5.0; 4], vec![5.0; 4]]));
    let subtrahend = graph.add(PatternSource::new(2, 2, vec![vec![3.0; 4], vec![3.0; 4]]));
    let subtract = graph.add(SubtractTask::new());
    let sink = graph.add(sink);
    graph.connect_port(minuend, subtract, 0).unwrap();
    graph.connect_port(subtrahend, subtract, 1).unwrap();
    graph.connect(subtract, sink).unwrap();

    Scheduler::new().run(graph, res.clone()).unwrap();

    let frames = frames.lock().unwrap();
    assert_eq!(frames.as_slice(), &[vec![2.0; 4], vec![2.0; 4]]);
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn subtract_rejects_misaligned_streams() {
    let res = Resources::new().unwrap();
    let (_frames, sink) = collector();
    let mut graph = TaskGraph::new();
    let minuend = graph.add(PatternSource::new(2, 2, vec![vec![5.0; 4]]));
    let subtrahend = graph.add(PatternSource::new(2, 2, vec![vec![3.0; 4]]));
    let shift = graph.add(IdShift { offset: 1 });
    let subtract = graph.add(SubtractTask::new());
    let sink = graph.add(sink);
    graph.connect(minuend, shift).unwrap();
    graph.connect_port(shift, subtract, 0).unwrap();
    graph.connect_port(subtrahend, subtract, 1).unwrap();
    graph.connect(subtract, sink).unwrap();

    let err = Scheduler::new().run(graph, res.clone()).unwrap_err();
    assert!(err.to_string().contains("diverged"), "got: {}", err);
    assert_eq!(res.outstanding(), 0);
}

#[test]
fn flat_field_correction_of_known_values() {
    let res = Resources::new().unwrap();
    let (frames, sink) = collector();
    let mut graph = TaskGraph::new();
    let proj = graph.add(PatternSource::new(2, 2, vec![vec![10.0; 4]]));
    let dark = graph.add(PatternSource::new(2, 2, vec![vec![2.0; 4]]));
    let flat = graph.add(PatternSource::new(2, 2, vec![vec![18.0; 4]]));
    let correction = graph.add(FlatFieldCorrectionTask::new());
    let sink = graph.add(sink);
    graph.connect_port(proj, correction, 0).unwrap();
    graph.connect_port(dark, correction, 1).unwrap();
    graph.connect_port(flat, correction, 2).unwrap();
    graph.connect(correction, sink).unwrap();

    Scheduler::new().run(graph, res).unwrap();

    let frames = frames.lock().unwrap();
    assert_eq!(frames.as_slice(), &[vec![0.5; 4]]);
}

fn read_frames(path: &str) -> Vec<Vec<f32>> {
    let res = Resources::new().unwrap();
    let (frames, sink) = collector();
    let mut graph = TaskGraph::new();
    let read = graph.add_boxed(configured(ReadTask::new(), &[("path", Value::from(path))]));
    let sink = graph.add(sink);
    graph.connect(read, sink).unwrap();
    Scheduler::new().run(graph, res).unwrap();
    let frames = frames.lock().unwrap();
    frames.clone()
}

#[test]
fn tiff_f32_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.tif");
    let second = dir.path().join("second.tif");
    let data: Vec<f32> = (0..12).map(|v| v as f32 * 0.25).collect();

    write_tiff_f32(&first, &data, 4, 3).unwrap();
    let frames = read_frames(first.to_str().unwrap());
    assert_eq!(frames.as_slice(), &[data.clone()]);

    write_tiff_f32(&second, &frames[0], 4, 3).unwrap();
    assert_eq!(
        std::fs::read(&first).unwrap(),
        std::fs::read(&second).unwrap()
    );
}

#[test]
fn tiff_u8_round_trip_through_widening() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.tif");
    let second = dir.path().join("second.tif");
    let data: Vec<u8> = (0..16).map(|v| (v * 17) as u8).collect();

    write_tiff_u8(&first, &data, 4, 4).unwrap();
    let frames = read_frames(first.to_str().unwrap());
    let widened: Vec<f32> = data.iter().map(|v| *v as f32).collect();
    assert_eq!(frames.as_slice(), &[widened]);

    write_tiff_u8(&second, &narrow_to_u8(&frames[0]), 4, 4).unwrap();
    assert_eq!(
        std::fs::read(&first).unwrap(),
        std::fs::read(&second).unwrap()
    );
}

#[test]
fn tiff_u16_round_trip_through_widening() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.tif");
    let second = dir.path().join("second.tif");
    let data: Vec<u16> = vec![0, 1, 256, 4096, 65535, 7, 42, 1000];

    write_tiff_u16(&first, &data, 4, 2).unwrap();
    let frames = read_frames(first.to_str().unwrap());
    let widened: Vec<f32> = data.iter().map(|v| *v as f32).collect();
    assert_eq!(frames.as_slice(), &[widened]);

    write_tiff_u16(&second, &narrow_to_u16(&frames[0]), 4, 2).unwrap();
    assert_eq!(
        std::fs::read(&first).unwrap(),
        std::fs::read(&second).unwrap()
    );
}

#[test]
fn narrowing_inverts_widening() {
    let all: Vec<u8> = (0..=255).collect();
    let widened: Vec<f32> = all.iter().map(|v| *v as f32).collect();
    assert_eq!(narrow_to_u8(&widened), all);

    let samples: Vec<u16> = vec![0, 1, 255, 256, 32768, 65535];
    let widened: Vec<f32> = samples.iter().map(|v| *v as f32).collect();
    assert_eq!(narrow_to_u16(&widened), samples);
}

#[test]
fn tiff_reader_streams_every_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.tif");
    let file = std::fs::File::create(&path).unwrap();
    let mut encoder = tiff::encoder::TiffEncoder::new(std::io::BufWriter::new(file)).unwrap();
    for value in 0..3 {
        let frame = vec![value as f32; 4];
        encoder
            .write_image::<tiff::encoder::colortype::Gray32Float>(2, 2, &frame)
            .unwrap();
    }
    drop(encoder);

    let frames = read_frames(path.to_str().unwrap());
    assert_eq!(
        frames.as_slice(),
        &[vec![0.0; 4], vec![1.0; 4], vec![2.0; 4]]
    );
}
