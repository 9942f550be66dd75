//! Umbrella crate: the engine plus the built-in task plug-ins.

pub use sluice_core as engine;
pub use sluice_tasks as tasks;
