use std::num::NonZero;

use rustc_hash::FxHashMap;

use crate::value::{Dimension, ValueId, ValueInfo, ValueMap, ValueType};

/// ID of an operator node in a [`Graph`].
///
/// Node IDs are dense indices into the graph's topologically ordered node
/// list.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(NonZero<u32>);

impl NodeId {
    /// Return the underlying u32 value of the ID.
    pub fn as_u32(self) -> u32 {
        self.0.get() - 1
    }

    /// Return the underlying ID value as a usize, for slice indexing.
    pub fn as_usize(self) -> usize {
        self.as_u32() as usize
    }

    /// Construct a node ID from a u32 value.
    ///
    /// Panics if the value exceeds `i32::MAX`.
    pub fn from_u32(value: u32) -> NodeId {
        assert!(value <= i32::MAX as u32);

        // Valid node IDs are in the range `[0, i32::MAX]`, so we store them
        // as values in `[1, i32::MAX + 1]` internally and reserve 0 as a
        // niche to make `Option<NodeId>` the same size as `NodeId`.
        NodeId(unsafe {
            // Safety: `value + 1` cannot be zero
            NonZero::new_unchecked(value + 1)
        })
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_u32().fmt(f)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.as_u32())
    }
}

/// An operator node in a computation graph.
///
/// Input and output slots are positional; a `None` entry is an omitted
/// optional argument. Implicit inputs are values captured from an enclosing
/// scope by subgraph-bearing operators and are analyzed like explicit inputs.
#[derive(Debug)]
pub struct Node {
    name: Option<String>,
    op_type: String,
    op_version: i32,
    provider: String,
    inputs: Vec<Option<ValueId>>,
    implicit_inputs: Vec<Option<ValueId>>,
    outputs: Vec<Option<ValueId>>,
}

impl Node {
    pub fn new(op_type: &str, provider: &str) -> Node {
        Node {
            name: None,
            op_type: op_type.to_owned(),
            op_version: 1,
            provider: provider.to_owned(),
            inputs: Vec::new(),
            implicit_inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Node {
        self.name = Some(name.to_owned());
        self
    }

    pub fn with_version(mut self, version: i32) -> Node {
        self.op_version = version;
        self
    }

    pub fn with_inputs(mut self, inputs: &[Option<ValueId>]) -> Node {
        self.inputs = inputs.to_vec();
        self
    }

    pub fn with_implicit_inputs(mut self, inputs: &[Option<ValueId>]) -> Node {
        self.implicit_inputs = inputs.to_vec();
        self
    }

    pub fn with_outputs(mut self, outputs: &[Option<ValueId>]) -> Node {
        self.outputs = outputs.to_vec();
        self
    }

    /// Return the debug name of this node.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Opset version the node was created against, used in diagnostics.
    pub fn op_version(&self) -> i32 {
        self.op_version
    }

    /// Type of the execution provider this node is assigned to.
    pub fn provider_type(&self) -> &str {
        &self.provider
    }

    pub fn input_ids(&self) -> &[Option<ValueId>] {
        &self.inputs
    }

    pub fn implicit_input_ids(&self) -> &[Option<ValueId>] {
        &self.implicit_inputs
    }

    pub fn output_ids(&self) -> &[Option<ValueId>] {
        &self.outputs
    }

    /// Iterate over all present input and implicit-input value IDs.
    pub fn all_input_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs
            .iter()
            .chain(self.implicit_inputs.iter())
            .filter_map(|id| *id)
    }

    /// Iterate over every present value ID the node touches: inputs,
    /// implicit inputs and outputs.
    pub fn all_value_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs
            .iter()
            .chain(self.implicit_inputs.iter())
            .chain(self.outputs.iter())
            .filter_map(|id| *id)
    }
}

/// An immutable-once-built computation graph over named values.
///
/// Nodes must be added in topological order (every producer before its
/// consumers, as serialized models are laid out); the insertion order is the
/// execution order used by the planner. Dataflow edges between nodes are
/// derived incrementally as nodes are added.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
    values: Vec<ValueInfo>,
    value_map: ValueMap,

    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    initializers: Vec<ValueId>,
    captures: Vec<ValueId>,

    /// Node that defines each value, if any.
    producers: FxHashMap<ValueId, NodeId>,

    /// Per-node count of incoming dataflow edges (one per input slot whose
    /// value is produced by another node in this graph).
    in_edge_counts: Vec<u32>,

    /// Per-node successor lists. Consumers are inserted after producers, so
    /// each list is in ascending node-index order.
    out_edges: Vec<Vec<NodeId>>,
}

impl Graph {
    /// Create a new empty dataflow graph.
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Register a value and return its ID.
    ///
    /// `name` must be unique within the graph.
    pub fn add_value(&mut self, name: &str, ty: ValueType, shape: Option<Vec<Dimension>>) -> ValueId {
        let id = self.value_map.add(name);
        self.values.push(ValueInfo::new(name, ty, shape));
        id
    }

    /// Mark a value as a required graph input, supplied by the caller.
    pub fn add_input(&mut self, id: ValueId) {
        self.inputs.push(id);
    }

    /// Mark a value as an initializer (weight) baked into the model.
    pub fn add_initializer(&mut self, id: ValueId) {
        self.initializers.push(id);
    }

    /// Mark a value as captured from an enclosing graph's scope.
    pub fn add_capture(&mut self, id: ValueId) {
        self.captures.push(id);
    }

    /// Mark a value as a graph output, consumed by the caller.
    pub fn add_output(&mut self, id: ValueId) {
        self.outputs.push(id);
    }

    /// Append an operator node.
    ///
    /// Values consumed by the node must already have a producer in the graph
    /// or be graph inputs, initializers or captures.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::from_u32(self.nodes.len() as u32);

        let mut in_edges = 0;
        for input in node.all_input_ids() {
            if let Some(&producer) = self.producers.get(&input) {
                self.out_edges[producer.as_usize()].push(id);
                in_edges += 1;
            }
        }
        for output in node.output_ids().iter().filter_map(|id| *id) {
            let prev = self.producers.insert(output, id);
            debug_assert!(prev.is_none(), "value {} has multiple producers", output);
        }

        self.nodes.push(node);
        self.in_edge_counts.push(in_edges);
        self.out_edges.push(Vec::new());
        id
    }

    /// Return node IDs in topological (insertion) order.
    pub fn topological_order(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|i| NodeId::from_u32(i as u32))
    }

    /// Exclusive upper bound on node indices in this graph.
    pub fn max_node_index(&self) -> usize {
        self.nodes.len()
    }

    /// Retrieve a node by ID.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.as_usize())
    }

    /// Return the debug name for a node.
    pub fn node_name(&self, id: NodeId) -> String {
        self.get_node(id)
            .and_then(|node| node.name())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("[ID: {}]", id))
    }

    /// Iterate over `(id, node)` pairs in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId::from_u32(i as u32), node))
    }

    /// Required graph inputs, excluding initializers.
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Graph inputs together with initializers.
    pub fn inputs_including_initializers(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs
            .iter()
            .chain(self.initializers.iter())
            .copied()
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn initializers(&self) -> &[ValueId] {
        &self.initializers
    }

    /// Values captured from an enclosing scope when this graph is the body
    /// of a control-flow operator.
    pub fn captures(&self) -> &[ValueId] {
        &self.captures
    }

    /// Nodes with no incoming dataflow edges.
    pub fn root_nodes(&self) -> Vec<NodeId> {
        self.in_edge_counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(i, _)| NodeId::from_u32(i as u32))
            .collect()
    }

    /// Number of incoming dataflow edges of a node.
    pub fn in_edge_count(&self, id: NodeId) -> u32 {
        self.in_edge_counts[id.as_usize()]
    }

    /// Successor nodes of `id`, in ascending node-index order, with one
    /// entry per consumed input slot.
    pub fn out_edges(&self, id: NodeId) -> &[NodeId] {
        &self.out_edges[id.as_usize()]
    }

    /// Node that defines a value, or `None` for inputs, initializers and
    /// captures.
    pub fn producer(&self, id: ValueId) -> Option<NodeId> {
        self.producers.get(&id).copied()
    }

    /// Retrieve a value's metadata by ID.
    pub fn value(&self, id: ValueId) -> Option<&ValueInfo> {
        self.values.get(id.as_usize())
    }

    /// The name/index registry for this graph's values.
    pub fn value_map(&self) -> &ValueMap {
        &self.value_map
    }
}
