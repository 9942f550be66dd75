//! Per-node counters collected by the drivers and exposed read-only
//! once the scheduler has exited.

use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub name: String,
    /// Calls into `process`/`generate`/`reduce`.
    pub invocations: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Time spent inside task entry points on the driver thread.
    pub cpu_time: Duration,
    /// Kernel time accumulated from OpenCL event timestamps.
    pub kernel_time: Duration,
    /// Time spent blocked on input pops and output pushes.
    pub idle_time: Duration,
}

impl NodeStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// The result of a completed run: wall time from first push to last
/// driver exit, plus one stats record per node.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub wall_time: Duration,
    nodes: Vec<NodeStats>,
}

impl Profile {
    pub(crate) fn new(wall_time: Duration, mut nodes: Vec<NodeStats>) -> Self {
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Self { wall_time, nodes }
    }

    pub fn nodes(&self) -> &[NodeStats] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&NodeStats> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn log_summary(&self) {
        log::info!("run finished in {:?}", self.wall_time);
        for node in &self.nodes {
            log::info!(
                "  {}: {} calls, {} B in, {} B out, cpu {:?}, kernel {:?}, idle {:?}",
                node.name,
                node.invocations,
                node.bytes_in,
                node.bytes_out,
                node.cpu_time,
                node.kernel_time,
                node.idle_time,
            );
        }
    }
}
