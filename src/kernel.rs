use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::RunError;
use crate::graph::Node;
use crate::provider::MemType;
use crate::value::Value;

/// Errors reported by kernels during compute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpError {
    /// A required input was not provided.
    MissingInputs,

    /// An input or attribute had a value that is invalid for the operator.
    InvalidValue(&'static str),

    /// Input shapes are not compatible with each other.
    IncompatibleInputShapes(&'static str),

    /// An input had an element type the kernel does not support.
    UnsupportedType,
}

impl Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::MissingInputs => write!(f, "required inputs were missing"),
            OpError::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
            OpError::IncompatibleInputShapes(msg) => {
                write!(f, "incompatible input shapes: {}", msg)
            }
            OpError::UnsupportedType => write!(f, "unsupported input type"),
        }
    }
}

impl Error for OpError {}

/// Static descriptor of a kernel: the aliasing, memory-type and execution
/// queue metadata the planner and executors key on.
///
/// Built with [`KernelDef::builder`].
#[derive(Clone, Debug)]
pub struct KernelDef {
    op_type: String,
    since_version: i32,
    alias: SmallVec<[(usize, usize); 1]>,
    may_inplace: SmallVec<[(usize, usize); 1]>,
    input_mem_types: FxHashMap<usize, MemType>,
    output_mem_types: FxHashMap<usize, MemType>,
    exec_queue_id: u32,
}

impl KernelDef {
    pub fn builder(op_type: &str) -> KernelDefBuilder {
        KernelDefBuilder {
            def: KernelDef {
                op_type: op_type.to_owned(),
                since_version: 1,
                alias: SmallVec::new(),
                may_inplace: SmallVec::new(),
                input_mem_types: FxHashMap::default(),
                output_mem_types: FxHashMap::default(),
                exec_queue_id: 0,
            },
        }
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn since_version(&self) -> i32 {
        self.since_version
    }

    /// `(input, output)` position pairs where the output must share the
    /// input's buffer. Aliasing is a semantic contract of the kernel, eg. a
    /// reshape returning a different view of the same data.
    pub fn alias(&self) -> &[(usize, usize)] {
        &self.alias
    }

    /// `(input, output)` position pairs where the kernel can update the
    /// input in place if the planner decides the buffers may be shared.
    pub fn may_inplace(&self) -> &[(usize, usize)] {
        &self.may_inplace
    }

    /// Memory type expected for the input at `pos`.
    pub fn input_memory_type(&self, pos: usize) -> MemType {
        self.input_mem_types.get(&pos).copied().unwrap_or_default()
    }

    /// Memory type produced for the output at `pos`.
    pub fn output_memory_type(&self, pos: usize) -> MemType {
        self.output_mem_types.get(&pos).copied().unwrap_or_default()
    }

    /// Whether the input at `pos` must be in CPU-accessible memory.
    pub fn is_input_on_cpu(&self, pos: usize) -> bool {
        self.input_memory_type(pos) == MemType::CpuInput
    }

    /// Device queue the kernel executes on. Non-zero queues are
    /// asynchronous and require fences around buffers the kernel touches.
    pub fn exec_queue_id(&self) -> u32 {
        self.exec_queue_id
    }
}

/// Builder for [`KernelDef`].
pub struct KernelDefBuilder {
    def: KernelDef,
}

impl KernelDefBuilder {
    pub fn since_version(mut self, version: i32) -> Self {
        self.def.since_version = version;
        self
    }

    /// Declare that output `output_pos` aliases input `input_pos`.
    pub fn alias(mut self, input_pos: usize, output_pos: usize) -> Self {
        self.def.alias.push((input_pos, output_pos));
        self
    }

    /// Declare that output `output_pos` may be computed in place over input
    /// `input_pos`.
    pub fn may_inplace(mut self, input_pos: usize, output_pos: usize) -> Self {
        self.def.may_inplace.push((input_pos, output_pos));
        self
    }

    pub fn input_memory_type(mut self, pos: usize, mem_type: MemType) -> Self {
        self.def.input_mem_types.insert(pos, mem_type);
        self
    }

    pub fn output_memory_type(mut self, pos: usize, mem_type: MemType) -> Self {
        self.def.output_mem_types.insert(pos, mem_type);
        self
    }

    pub fn exec_queue_id(mut self, queue_id: u32) -> Self {
        self.def.exec_queue_id = queue_id;
        self
    }

    pub fn build(self) -> KernelDef {
        self.def
    }
}

/// Per-node view over the execution frame handed to a kernel's compute
/// call.
///
/// Inputs are reference-counted handles to the frame's buffers; taking an
/// input moves the handle out, which lets last-use kernels mutate the
/// buffer without a copy when no other reference remains.
pub struct KernelContext<'a> {
    node: &'a Node,
    inputs: Vec<Option<Value>>,
    implicit_inputs: Vec<Option<Value>>,
    outputs: Vec<Option<Value>>,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        node: &'a Node,
        inputs: Vec<Option<Value>>,
        implicit_inputs: Vec<Option<Value>>,
    ) -> KernelContext<'a> {
        let outputs = vec![None; node.output_ids().len()];
        KernelContext {
            node,
            inputs,
            implicit_inputs,
            outputs,
        }
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn implicit_input_count(&self) -> usize {
        self.implicit_inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// The input at `pos`, or `None` if it was omitted.
    pub fn input(&self, pos: usize) -> Option<&Value> {
        self.inputs.get(pos).and_then(|v| v.as_ref())
    }

    /// The input at `pos`, failing if it was omitted.
    pub fn require_input(&self, pos: usize) -> Result<&Value, OpError> {
        self.input(pos).ok_or(OpError::MissingInputs)
    }

    /// Move the input at `pos` out of the context.
    pub fn take_input(&mut self, pos: usize) -> Option<Value> {
        self.inputs.get_mut(pos).and_then(|v| v.take())
    }

    pub fn implicit_input(&self, pos: usize) -> Option<&Value> {
        self.implicit_inputs.get(pos).and_then(|v| v.as_ref())
    }

    /// Store the output at `pos`.
    pub fn set_output(&mut self, pos: usize, value: Value) {
        self.outputs[pos] = Some(value);
    }

    pub(crate) fn into_outputs(self) -> Vec<Option<Value>> {
        self.outputs
    }
}

/// Implementation of an operator for a particular execution provider.
pub trait Kernel: Send + Sync {
    /// Run the operator, reading inputs from `ctx` and storing outputs into
    /// it.
    fn compute(&self, ctx: &mut KernelContext) -> Result<(), OpError>;
}

/// A registered kernel: its descriptor plus the implementation.
pub struct KernelCreateInfo {
    pub def: KernelDef,
    pub kernel: Arc<dyn Kernel>,
}

impl fmt::Debug for KernelCreateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCreateInfo")
            .field("def", &self.def)
            .finish_non_exhaustive()
    }
}

/// Registry resolving `(provider type, op type)` pairs to kernels.
#[derive(Default)]
pub struct KernelRegistry {
    kernels: FxHashMap<(String, String), KernelCreateInfo>,
}

impl KernelRegistry {
    pub fn new() -> KernelRegistry {
        KernelRegistry::default()
    }

    /// Register a kernel for a provider. The op type comes from the
    /// descriptor.
    pub fn register(&mut self, provider: &str, info: KernelCreateInfo) {
        let key = (provider.to_owned(), info.def.op_type().to_owned());
        self.kernels.insert(key, info);
    }

    /// Resolve the kernel bound to a node.
    pub fn resolve(&self, node: &Node, node_name: &str) -> Result<&KernelCreateInfo, RunError> {
        self.kernels
            .get(&(
                node.provider_type().to_owned(),
                node.op_type().to_owned(),
            ))
            .ok_or_else(|| RunError::KernelNotFound {
                op_type: node.op_type().to_owned(),
                op_version: node.op_version(),
                node: node_name.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Kernel, KernelContext, KernelCreateInfo, KernelDef, KernelRegistry, OpError};
    use crate::graph::Node;
    use crate::provider::MemType;

    struct Noop;

    impl Kernel for Noop {
        fn compute(&self, _ctx: &mut KernelContext) -> Result<(), OpError> {
            Ok(())
        }
    }

    #[test]
    fn test_kernel_def_builder() {
        let def = KernelDef::builder("Reshape")
            .since_version(5)
            .alias(0, 0)
            .input_memory_type(1, MemType::CpuInput)
            .exec_queue_id(1)
            .build();

        assert_eq!(def.op_type(), "Reshape");
        assert_eq!(def.since_version(), 5);
        assert_eq!(def.alias(), &[(0, 0)]);
        assert!(def.may_inplace().is_empty());
        assert_eq!(def.input_memory_type(0), MemType::Default);
        assert_eq!(def.input_memory_type(1), MemType::CpuInput);
        assert!(def.is_input_on_cpu(1));
        assert!(!def.is_input_on_cpu(0));
        assert_eq!(def.exec_queue_id(), 1);
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = KernelRegistry::new();
        registry.register(
            "cpu",
            KernelCreateInfo {
                def: KernelDef::builder("Relu").build(),
                kernel: Arc::new(Noop),
            },
        );

        let relu = Node::new("Relu", "cpu").with_name("relu_0");
        assert!(registry.resolve(&relu, "relu_0").is_ok());

        let conv = Node::new("Conv", "cpu").with_name("conv_0").with_version(11);
        let err = registry.resolve(&conv, "conv_0").unwrap_err();
        assert_eq!(
            err.to_string(),
            "no kernel found for op Conv(11) (node \"conv_0\")"
        );

        // Same op on an unregistered provider is also a miss.
        let gpu_relu = Node::new("Relu", "cuda").with_name("relu_1");
        assert!(registry.resolve(&gpu_relu, "relu_1").is_err());
    }
}
