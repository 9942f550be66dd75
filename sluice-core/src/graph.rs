//! The task graph: a directed multigraph of task nodes with typed edges.
//!
//! Nodes live in a slotmap and are addressed by generational keys. The
//! scheduler may expand a GPU-capable chain across devices before
//! freezing the graph; after `freeze` the structure is immutable.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::buffer::{Buffer, Requisition};
use crate::error::{GraphError, Result};
use crate::task::{Processed, Task, TaskContext, TaskMode};

new_key_type! {
    /// Key for a node in a [`TaskGraph`].
    pub struct NodeKey;
}

/// Scheduler-relevant role of a node. Broadcast and gather are inserted
/// by graph expansion and get special driver loops.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeKind {
    Plugin,
    Broadcast,
    Gather,
}

pub(crate) struct NodeSlot {
    pub name: String,
    pub task: Box<dyn Task>,
    pub kind: NodeKind,
    /// Preferred GPU device index, set on expansion replicas.
    pub device_hint: Option<usize>,
}

/// An edge carries the input-port index on its target.
#[derive(Clone, Copy, Debug)]
pub struct Edge {
    pub src: NodeKey,
    pub dst: NodeKey,
    pub port: usize,
}

pub struct TaskGraph {
    nodes: SlotMap<NodeKey, NodeSlot>,
    edges: Vec<Edge>,
    name_counts: HashMap<String, usize>,
    frozen: bool,
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            edges: Vec::new(),
            name_counts: HashMap::new(),
            frozen: false,
        }
    }

    pub fn add(&mut self, task: impl Task + 'static) -> NodeKey {
        self.add_boxed(Box::new(task))
    }

    pub fn add_boxed(&mut self, task: Box<dyn Task>) -> NodeKey {
        let base = task.name().to_owned();
        let count = self.name_counts.entry(base.clone()).or_insert(0);
        *count += 1;
        let name = if *count == 1 {
            base
        } else {
            format!("{}-{}", base, count)
        };
        self.insert(name, task, NodeKind::Plugin, None)
    }

    fn insert(
        &mut self,
        name: String,
        task: Box<dyn Task>,
        kind: NodeKind,
        device_hint: Option<usize>,
    ) -> NodeKey {
        self.nodes.insert(NodeSlot {
            name,
            task,
            kind,
            device_hint,
        })
    }

    /// Connect `src` to input port 0 of `dst`.
    pub fn connect(&mut self, src: NodeKey, dst: NodeKey) -> Result<(), GraphError> {
        self.connect_port(src, dst, 0)
    }

    pub fn connect_port(&mut self, src: NodeKey, dst: NodeKey, port: usize) -> Result<(), GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        self.edges.push(Edge { src, dst, port });
        Ok(())
    }

    pub fn node_name(&self, key: NodeKey) -> &str {
        &self.nodes[key].name
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.keys().collect()
    }

    /// Incoming edges of `n`, sorted by port.
    pub(crate) fn in_edges(&self, n: NodeKey) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.edges.iter().copied().filter(|e| e.dst == n).collect();
        edges.sort_by_key(|e| e.port);
        edges
    }

    /// Outgoing edges of `n`, in connection order.
    pub(crate) fn out_edges(&self, n: NodeKey) -> Vec<Edge> {
        self.edges.iter().copied().filter(|e| e.src == n).collect()
    }

    pub fn predecessors(&self, n: NodeKey) -> Vec<NodeKey> {
        self.in_edges(n).iter().map(|e| e.src).collect()
    }

    pub fn successors(&self, n: NodeKey) -> Vec<NodeKey> {
        self.out_edges(n).iter().map(|e| e.dst).collect()
    }

    /// Kahn's algorithm; reports a cycle through the first node that
    /// never became free.
    pub fn topological_order(&self) -> Result<Vec<NodeKey>, GraphError> {
        let mut in_degree: HashMap<NodeKey, usize> =
            self.nodes.keys().map(|k| (k, 0)).collect();
        for edge in &self.edges {
            *in_degree.get_mut(&edge.dst).unwrap() += 1;
        }
        let mut ready: Vec<NodeKey> = self
            .nodes
            .keys()
            .filter(|k| in_degree[k] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(key) = ready.pop() {
            order.push(key);
            for edge in self.out_edges(key) {
                let d = in_degree.get_mut(&edge.dst).unwrap();
                *d -= 1;
                if *d == 0 {
                    ready.push(edge.dst);
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .keys()
                .find(|k| !order.contains(k))
                .map(|k| self.nodes[k].name.clone())
                .unwrap_or_default();
            return Err(GraphError::CycleDetected(stuck));
        }
        Ok(order)
    }

    /// Check acyclicity, input arity and declared dimensions.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.topological_order()?;

        for (key, slot) in &self.nodes {
            let expected = match slot.kind {
                NodeKind::Plugin => slot.task.num_inputs(),
                NodeKind::Broadcast => 1,
                NodeKind::Gather => slot.task.num_inputs(),
            };
            let in_edges = self.in_edges(key);
            let mut ports: Vec<usize> = in_edges.iter().map(|e| e.port).collect();
            ports.dedup();
            if in_edges.len() != expected || ports.len() != expected {
                return Err(GraphError::ArityMismatch {
                    node: slot.name.clone(),
                    expected,
                    connected: in_edges.len(),
                });
            }
            for (i, port) in ports.iter().enumerate() {
                if *port != i {
                    return Err(GraphError::ArityMismatch {
                        node: slot.name.clone(),
                        expected,
                        connected: in_edges.len(),
                    });
                }
            }
        }

        for edge in &self.edges {
            let src = &self.nodes[edge.src];
            let dst = &self.nodes[edge.dst];
            if src.kind != NodeKind::Plugin || dst.kind != NodeKind::Plugin {
                continue;
            }
            if let Some(got) = src.task.output_dimensions() {
                let expected = dst.task.num_dimensions(edge.port);
                if got != expected {
                    return Err(GraphError::DimensionMismatch {
                        src: src.name.clone(),
                        dst: dst.name.clone(),
                        port: edge.port,
                        expected,
                        got,
                    });
                }
            }
        }
        Ok(())
    }

    /// Forbid further mutation; called by the scheduler before binding.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Replicate the first qualifying linear chain of GPU-capable
    /// processors across `replicas` devices, inserting a round-robin
    /// broadcast at the head and a stream-id-ordered gather at the tail.
    /// No-op once the graph is frozen, which makes expansion idempotent
    /// after binding.
    pub fn expand(&mut self, replicas: usize) {
        if self.frozen || replicas < 2 {
            return;
        }
        let chain = match self.find_expandable_chain() {
            Some(chain) => chain,
            None => return,
        };

        let head = chain[0];
        let tail = *chain.last().unwrap();
        let in_edge = self.in_edges(head)[0];
        let out_edge = self.out_edges(tail)[0];

        // Clone the chain's tasks once per extra device.
        let mut replica_chains: Vec<Vec<NodeKey>> = Vec::new();
        for r in 1..replicas {
            let mut keys = Vec::with_capacity(chain.len());
            for &node in &chain {
                let copy = self.nodes[node]
                    .task
                    .replicate()
                    .expect("checked by find_expandable_chain");
                let name = format!("{}@{}", self.nodes[node].name, r);
                keys.push(self.insert(name, copy, NodeKind::Plugin, Some(r)));
            }
            for pair in keys.windows(2) {
                self.edges.push(Edge {
                    src: pair[0],
                    dst: pair[1],
                    port: 0,
                });
            }
            replica_chains.push(keys);
        }
        for &node in &chain {
            self.nodes[node].device_hint = Some(0);
        }

        let broadcast = self.insert(
            "broadcast".into(),
            Box::new(BroadcastTask),
            NodeKind::Broadcast,
            None,
        );
        let gather = self.insert(
            "gather".into(),
            Box::new(GatherTask { fan: replicas }),
            NodeKind::Gather,
            None,
        );

        // Reroute head and tail edges through the new endpoints.
        self.edges.retain(|e| {
            !(e.src == in_edge.src && e.dst == head && e.port == in_edge.port)
                && !(e.src == tail && e.dst == out_edge.dst && e.port == out_edge.port)
        });
        self.edges.push(Edge {
            src: in_edge.src,
            dst: broadcast,
            port: 0,
        });
        self.edges.push(Edge {
            src: broadcast,
            dst: head,
            port: 0,
        });
        self.edges.push(Edge {
            src: tail,
            dst: gather,
            port: 0,
        });
        for (r, keys) in replica_chains.iter().enumerate() {
            self.edges.push(Edge {
                src: broadcast,
                dst: keys[0],
                port: 0,
            });
            self.edges.push(Edge {
                src: *keys.last().unwrap(),
                dst: gather,
                port: r + 1,
            });
        }
        self.edges.push(Edge {
            src: gather,
            dst: out_edge.dst,
            port: out_edge.port,
        });

        log::debug!(
            "expanded chain of {} nodes across {} devices",
            chain.len(),
            replicas
        );
    }

    /// A maximal run of replicable GPU processors with single-input,
    /// single-output connectivity, bracketed by other nodes.
    fn find_expandable_chain(&self) -> Option<Vec<NodeKey>> {
        let order = self.topological_order().ok()?;
        let candidate = |key: NodeKey| {
            let slot = &self.nodes[key];
            slot.kind == NodeKind::Plugin
                && slot.task.mode().wants_gpu()
                && !slot.task.mode().is_reducer()
                && !slot.task.mode().is_generator()
                && slot.task.num_inputs() == 1
                && self.in_edges(key).len() == 1
                && self.out_edges(key).len() == 1
                && slot.task.replicate().is_some()
        };

        let mut chain: Vec<NodeKey> = Vec::new();
        for &key in &order {
            if !candidate(key) {
                continue;
            }
            if chain.is_empty() {
                chain.push(key);
                continue;
            }
            let prev = *chain.last().unwrap();
            if self.out_edges(prev)[0].dst == key {
                chain.push(key);
            }
        }
        // The chain's neighbors must be outside it so broadcast and
        // gather have somewhere to attach.
        if chain.is_empty() {
            return None;
        }
        let head_pred = self.in_edges(chain[0])[0].src;
        let tail_succ = self.out_edges(*chain.last().unwrap())[0].dst;
        if chain.contains(&head_pred) || chain.contains(&tail_succ) {
            return None;
        }
        Some(chain)
    }

    pub(crate) fn slot(&self, key: NodeKey) -> &NodeSlot {
        &self.nodes[key]
    }

    pub(crate) fn slot_mut(&mut self, key: NodeKey) -> &mut NodeSlot {
        &mut self.nodes[key]
    }

    pub(crate) fn into_parts(self) -> (SlotMap<NodeKey, NodeSlot>, Vec<Edge>) {
        (self.nodes, self.edges)
    }
}

/// Round-robin dispatch endpoint inserted by expansion. The driver loop
/// handles the actual fan logic; the task only declares structure.
pub(crate) struct BroadcastTask;

impl Task for BroadcastTask {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::PROCESSOR | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_dimensions(&self, _port: usize) -> usize {
        0
    }

    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs.first().copied().unwrap_or_default())
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        _inputs: &[&Buffer],
        _output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        Ok(Processed::Continue)
    }
}

/// Stream-id-ordered merge endpoint inserted by expansion.
pub(crate) struct GatherTask {
    pub fan: usize,
}

impl Task for GatherTask {
    fn name(&self) -> &str {
        "gather"
    }

    fn mode(&self) -> TaskMode {
        TaskMode::PROCESSOR | TaskMode::CPU
    }

    fn num_inputs(&self) -> usize {
        self.fan
    }

    fn num_dimensions(&self, _port: usize) -> usize {
        0
    }

    fn requisition(&self, inputs: &[Requisition]) -> Result<Requisition> {
        Ok(inputs.first().copied().unwrap_or_default())
    }

    fn process(
        &mut self,
        _ctx: &mut TaskContext,
        _inputs: &[&Buffer],
        _output: Option<&mut Buffer>,
    ) -> Result<Processed> {
        Ok(Processed::Continue)
    }
}
