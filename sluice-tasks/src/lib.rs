//! Built-in task plug-ins for the sluice engine, plus the expression
//! compiler and the file format backends.

mod averager;
pub mod expr;
mod flat_field;
mod flip;
pub mod io;
mod monitor;
mod null;
mod rofex;
mod sharpness;
mod source;
mod stripe;
mod subtract;

pub use averager::AveragerTask;
pub use flat_field::FlatFieldCorrectionTask;
pub use flip::{Direction, FlipTask};
pub use io::tiff::WriteTask;
pub use io::ReadTask;
pub use monitor::MonitorTask;
pub use null::NullTask;
pub use rofex::RofexAverageRefTask;
pub use sharpness::SharpnessMeasureTask;
pub use source::DummyDataTask;
pub use stripe::StripeFilterTask;
pub use subtract::SubtractTask;

use std::collections::BTreeMap;

use sluice_core::{Error, Result, Task};

type Factory = fn() -> Box<dyn Task>;

pub struct Plugin {
    pub name: &'static str,
    pub version: &'static str,
    factory: Factory,
}

/// Enumerates the available task factories by name.
#[derive(Default)]
pub struct PluginManager {
    plugins: BTreeMap<&'static str, Plugin>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager with every built-in task registered.
    pub fn with_builtins() -> Self {
        const VERSION: &str = env!("CARGO_PKG_VERSION");
        let mut pm = Self::new();
        pm.register("averager", VERSION, || Box::new(AveragerTask::new()));
        pm.register("dummy-data", VERSION, || Box::new(DummyDataTask::new()));
        pm.register("flat-field-correction", VERSION, || {
            Box::new(FlatFieldCorrectionTask::new())
        });
        pm.register("flip", VERSION, || Box::new(FlipTask::new()));
        pm.register("monitor", VERSION, || Box::new(MonitorTask::new()));
        pm.register("null", VERSION, || Box::new(NullTask::new()));
        pm.register("read", VERSION, || Box::new(ReadTask::new()));
        pm.register("rofex-average-ref", VERSION, || {
            Box::new(RofexAverageRefTask::new())
        });
        pm.register("sharpness-measure", VERSION, || {
            Box::new(SharpnessMeasureTask::new())
        });
        pm.register("stripe-filter", VERSION, || Box::new(StripeFilterTask::new()));
        pm.register("subtract", VERSION, || Box::new(SubtractTask::new()));
        pm.register("write", VERSION, || Box::new(WriteTask::new()));
        pm
    }

    pub fn register(&mut self, name: &'static str, version: &'static str, factory: Factory) {
        self.plugins.insert(
            name,
            Plugin {
                name,
                version,
                factory,
            },
        );
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Task>> {
        let plugin = self
            .plugins
            .get(name)
            .ok_or_else(|| Error::SetupFailed(format!("unknown task `{}`", name)))?;
        Ok((plugin.factory)())
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Plugin> {
        self.plugins.values()
    }
}
