//! Benchmark driver: a synthetic stream through a small processing
//! chain, timed by the scheduler. Exits nonzero with the first fault on
//! failure.

use std::process::ExitCode;

use sluice::engine::{Resources, Result, Scheduler, TaskGraph, Value};
use sluice::tasks::PluginManager;

fn measure(frames: i64, size: i64) -> Result<()> {
    let pm = PluginManager::with_builtins();

    let mut source = pm.create("dummy-data")?;
    source.set_option("width", Value::Int(size))?;
    source.set_option("height", Value::Int(size))?;
    source.set_option("number", Value::Int(frames))?;

    let mut flip = pm.create("flip")?;
    flip.set_option("direction", Value::from("horizontal"))?;

    let null = pm.create("null")?;

    let mut graph = TaskGraph::new();
    let source = graph.add_boxed(source);
    let flip = graph.add_boxed(flip);
    let null = graph.add_boxed(null);
    graph.connect(source, flip)?;
    graph.connect(flip, null)?;

    let resources = Resources::new()?;
    log::info!(
        "{} gpu device(s), {} cpu thread(s) available",
        resources.num_devices(),
        num_cpus::get()
    );

    let profile = Scheduler::new().run(graph, resources)?;
    profile.log_summary();
    println!(
        "{} frames of {}x{} in {:?}",
        frames, size, size, profile.wall_time
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let frames = args
        .next()
        .and_then(|a| a.parse().ok())
        .unwrap_or(256i64);
    let size = args.next().and_then(|a| a.parse().ok()).unwrap_or(1024i64);

    match measure(frames, size) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
