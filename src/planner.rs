use std::fmt;
use std::fmt::Display;

use rustc_hash::FxHashSet;

use crate::error::RunError;
use crate::graph::{Graph, Node, NodeId};
use crate::kernel::{KernelDef, KernelRegistry};
use crate::provider::{ExecutionProviders, MemType, MemoryInfo};
use crate::value::{Dimension, ValueId, ValueInfo, ValueMap, ValueType};


/// How the buffer backing a value is obtained and who owns it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocKind {
    /// Fresh allocation at first use, released per the deallocation plan.
    Allocate,

    /// Weight/initializer storage that lives for the session lifetime.
    AllocateStatically,

    /// Caller-supplied buffer (graph input or outer-scope capture); never
    /// reused, never freed by the plan.
    PreExisting,

    /// Shares the buffer of another value; `reused_buffer` names the root.
    Reuse,

    /// Produced into a caller-provided output slot; never reused.
    AllocateOutput,

    /// Pass-through of a caller-owned buffer to a loop-body output.
    Share,
}

impl Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocKind::Allocate => "Allocate",
            AllocKind::AllocateStatically => "AllocateStatically",
            AllocKind::PreExisting => "PreExisting",
            AllocKind::Reuse => "Reuse",
            AllocKind::AllocateOutput => "AllocateOutput",
            AllocKind::Share => "Share",
        };
        f.write_str(name)
    }
}

/// Allocation decision for one value.
#[derive(Clone, Debug)]
pub struct AllocPlanPerValue {
    pub alloc_kind: AllocKind,

    /// Root of the buffer-sharing set this value belongs to. Initially the
    /// value itself; rewritten when the value reuses another buffer. Only
    /// the root is actually allocated.
    pub reused_buffer: ValueId,

    /// Device memory location the buffer lives in.
    pub location: MemoryInfo,

    pub value_type: Option<ValueType>,

    /// Whether a synchronization fence must be created for this value when
    /// its device uses asynchronous queues.
    pub create_fence_if_async: bool,
}

impl AllocPlanPerValue {
    fn new(value: ValueId, location: MemoryInfo) -> AllocPlanPerValue {
        AllocPlanPerValue {
            alloc_kind: AllocKind::Allocate,
            reused_buffer: value,
            location,
            value_type: None,
            create_fence_if_async: false,
        }
    }
}

/// One step of the execution plan: the node to run plus the range of
/// `to_be_freed` entries that may be released once the step completes.
///
/// An empty range is encoded as `free_from_index > free_to_index`.
#[derive(Clone, Debug)]
pub struct NodeExecutionPlan {
    pub node_index: NodeId,
    pub free_from_index: usize,
    pub free_to_index: usize,
}

impl NodeExecutionPlan {
    fn new(node_index: NodeId) -> NodeExecutionPlan {
        NodeExecutionPlan {
            node_index,
            free_from_index: 1,
            free_to_index: 0,
        }
    }

    /// Indices into `to_be_freed` of the values released after this step,
    /// or `None` if the step frees nothing.
    pub fn free_range(&self) -> Option<std::ops::RangeInclusive<usize>> {
        (self.free_from_index <= self.free_to_index)
            .then(|| self.free_from_index..=self.free_to_index)
    }
}

/// The planner's contract with the executors: node order, per-value
/// allocation decisions, the deallocation schedule and per-node fence flags.
pub struct SequentialExecutionPlan {
    /// One step per graph node, in execution order.
    pub execution_plan: Vec<NodeExecutionPlan>,

    /// Allocation decision per value, indexed by value ID.
    pub allocation_plan: Vec<AllocPlanPerValue>,

    /// Flat list of values to release, indexed by the per-step free ranges.
    pub to_be_freed: Vec<ValueId>,

    /// Per-node flag, indexed by node ID: true if any value the node
    /// touches requires fences around the kernel invocation.
    pub node_has_fence: Vec<bool>,
}

impl SequentialExecutionPlan {
    /// Whether fences must be applied around the given node's kernel.
    pub fn has_fence(&self, node: NodeId) -> bool {
        self.node_has_fence
            .get(node.as_usize())
            .copied()
            .unwrap_or(false)
    }

    /// Root of the buffer-sharing set containing `value`. The root is the
    /// only member whose buffer is actually allocated.
    pub fn buffer_root(&self, value: ValueId) -> Result<ValueId, RunError> {
        self.allocation_plan
            .get(value.as_usize())
            .map(|plan| plan.reused_buffer)
            .ok_or(RunError::IndexOutOfRange {
                index: value.as_u32(),
                len: self.allocation_plan.len(),
            })
    }

    /// Render the plan for debugging: the per-value allocation decisions
    /// followed by the step list with per-step freed values.
    pub fn display<'a>(&'a self, values: &'a ValueMap, graph: &'a Graph) -> PlanDisplay<'a> {
        PlanDisplay {
            plan: self,
            values,
            graph,
        }
    }
}

/// See [`SequentialExecutionPlan::display`].
pub struct PlanDisplay<'a> {
    plan: &'a SequentialExecutionPlan,
    values: &'a ValueMap,
    graph: &'a Graph,
}

impl Display for PlanDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocation Plan:")?;
        writeln!(f, "(value_idx) name : <allocation plan>")?;
        for (name, id) in self.values.iter() {
            write!(f, "({}) {} : ", id, name)?;
            if let Some(plan) = self.plan.allocation_plan.get(id.as_usize()) {
                write!(f, "{}", plan.alloc_kind)?;
                if plan.alloc_kind == AllocKind::Reuse {
                    write!(f, " {}", plan.reused_buffer)?;
                }
                write!(f, ", {}", plan.location)?;
                if plan.create_fence_if_async {
                    write!(f, ", use fence when async")?;
                }
            } else {
                write!(f, "index out-of-range!")?;
            }
            writeln!(f)?;
        }

        writeln!(f)?;
        writeln!(f, "Execution Plan:")?;
        for (step_index, step) in self.plan.execution_plan.iter().enumerate() {
            let op_type = self
                .graph
                .get_node(step.node_index)
                .map(|node| node.op_type())
                .unwrap_or("?");
            writeln!(
                f,
                "[{}] {} ({})",
                step_index,
                op_type,
                self.graph.node_name(step.node_index)
            )?;
            if let Some(range) = step.free_range() {
                write!(f, "Free values: ")?;
                let mut sep = "";
                for index in range {
                    let freed = self.plan.to_be_freed[index];
                    let name = self.values.name(freed).unwrap_or("INVALID INDEX");
                    write!(f, "{}({}) {}", sep, freed, name)?;
                    sep = ", ";
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

/// Options consulted by the planner; the per-value symbolic shapes come
/// from the graph's value metadata.
#[derive(Clone, Debug, Default)]
pub struct PlanOptions {
    /// Whether the plan will be run by the parallel executor. Dead-buffer
    /// recycling is disabled in that case since buffers do not die in step
    /// order.
    pub parallel_execution: bool,
}

/// Produces a [`SequentialExecutionPlan`] for a graph.
pub struct SequentialPlanner;

impl SequentialPlanner {
    /// Create an execution plan for `graph`.
    ///
    /// `parent_node` is the node of the enclosing graph when `graph` is a
    /// control-flow subgraph. `outer_scope_values` lists values captured
    /// from enclosing scopes; like graph inputs, their buffers are owned by
    /// the caller. `values` must be the registry covering every value the
    /// graph references.
    pub fn create_plan(
        parent_node: Option<&Node>,
        graph: &Graph,
        outer_scope_values: &[ValueId],
        providers: &ExecutionProviders,
        kernels: &KernelRegistry,
        values: &ValueMap,
        options: &PlanOptions,
    ) -> Result<SequentialExecutionPlan, RunError> {
        let num_values = values.len();
        let default_location = providers.default_cpu_memory_info().clone();

        let plan = SequentialExecutionPlan {
            execution_plan: graph
                .topological_order()
                .map(NodeExecutionPlan::new)
                .collect(),
            allocation_plan: (0..num_values)
                .map(|i| AllocPlanPerValue::new(ValueId::from_u32(i as u32), default_location.clone()))
                .collect(),
            to_be_freed: Vec::new(),
            node_has_fence: vec![false; graph.max_node_index()],
        };

        let planner = PlannerImpl {
            parent_node,
            graph,
            outer_scope_values,
            providers,
            kernels,
            options,
            plan,
            usecount: vec![0; num_values],
            reused_buffer: (0..num_values)
                .map(|i| ValueId::from_u32(i as u32))
                .collect(),
            freelist: Vec::new(),
        };
        planner.create_plan()
    }
}

/// Tracks a buffer that became free after a given execution step.
struct FreeBufferInfo {
    value: ValueId,

    /// Index into the execution plan; the buffer becomes free after this
    /// step completes.
    deallocate_point: usize,
}

struct PlannerImpl<'a> {
    parent_node: Option<&'a Node>,
    graph: &'a Graph,
    outer_scope_values: &'a [ValueId],
    providers: &'a ExecutionProviders,
    kernels: &'a KernelRegistry,
    options: &'a PlanOptions,

    plan: SequentialExecutionPlan,

    /// Static reference count per value: the number of not-yet-scanned
    /// consumers of the value's buffer.
    usecount: Vec<usize>,

    /// Buffer-sharing structure: `reused_buffer[i]` is `i` until the value
    /// joins another buffer's set, after which it names the set's root.
    reused_buffer: Vec<ValueId>,

    /// Buffers free for recycling, in the order they died. The most
    /// recently freed buffer is at the back and is considered first.
    freelist: Vec<FreeBufferInfo>,
}

impl<'a> PlannerImpl<'a> {
    fn create_plan(mut self) -> Result<SequentialExecutionPlan, RunError> {
        // Execution order is the graph's default topological order; the
        // steps were seeded from it when `plan` was built.
        self.compute_use_counts()?;
        self.compute_reuse_plan()?;
        // Fence analysis must run after reuse so flags propagate through
        // shared buffers.
        self.compute_fence_check()?;
        self.generate_deallocation_plan();
        Ok(self.plan)
    }

    fn value_info(&self, value: ValueId) -> Result<&'a ValueInfo, RunError> {
        self.graph.value(value).ok_or(RunError::IndexOutOfRange {
            index: value.as_u32(),
            len: self.usecount.len(),
        })
    }

    fn out_of_range(&self, value: ValueId) -> RunError {
        RunError::IndexOutOfRange {
            index: value.as_u32(),
            len: self.usecount.len(),
        }
    }

    fn use_count(&self, value: ValueId) -> Result<usize, RunError> {
        self.usecount
            .get(value.as_usize())
            .copied()
            .ok_or_else(|| self.out_of_range(value))
    }

    fn use_count_mut(&mut self, value: ValueId) -> Result<&mut usize, RunError> {
        if value.as_usize() >= self.usecount.len() {
            return Err(self.out_of_range(value));
        }
        Ok(&mut self.usecount[value.as_usize()])
    }

    /// Root of the buffer-sharing set containing `value`.
    fn buffer(&self, value: ValueId) -> Result<ValueId, RunError> {
        self.reused_buffer
            .get(value.as_usize())
            .copied()
            .ok_or_else(|| self.out_of_range(value))
    }

    fn alloc_plan_mut(&mut self, value: ValueId) -> Result<&mut AllocPlanPerValue, RunError> {
        if value.as_usize() >= self.plan.allocation_plan.len() {
            return Err(self.out_of_range(value));
        }
        Ok(&mut self.plan.allocation_plan[value.as_usize()])
    }

    /// Initialize state for a value at its definition site.
    fn process_def(&mut self, value: ValueId) -> Result<(), RunError> {
        *self.use_count_mut(value)? = 0;
        // Initially no reuse; the value uses its own buffer.
        self.reused_buffer[value.as_usize()] = value;
        Ok(())
    }

    /// Record that `reused_for` shares the buffer of `reused`.
    ///
    /// The new member's outstanding uses transfer to the set's root so the
    /// root's count equals the consumers of the underlying buffer across
    /// all aliased views.
    fn reuse(
        &mut self,
        reused: ValueId,
        reused_for: ValueId,
        alloc_kind: AllocKind,
    ) -> Result<(), RunError> {
        assert_ne!(reused, reused_for);
        let original = self.buffer(reused)?;
        self.reused_buffer[reused_for.as_usize()] = original;
        let transferred = self.use_count(reused_for)?;
        *self.use_count_mut(original)? += transferred;

        let plan = self.alloc_plan_mut(reused_for)?;
        plan.alloc_kind = alloc_kind;
        plan.reused_buffer = original;
        Ok(())
    }

    fn node(&self, node_index: NodeId) -> Result<&'a Node, RunError> {
        self.graph
            .get_node(node_index)
            .ok_or(RunError::IndexOutOfRange {
                index: node_index.as_u32(),
                len: self.graph.max_node_index(),
            })
    }

    /// First planner pass: seed per-value reference counts, assign initial
    /// device locations and mark values touched by async-queue kernels.
    fn compute_use_counts(&mut self) -> Result<(), RunError> {
        let graph = self.graph;
        let kernels = self.kernels;
        let providers = self.providers;

        // A value's definition appears before all of its uses in a
        // topological order, so a single forward walk sees every
        // definition first.
        let graph_inputs: FxHashSet<ValueId> = graph.inputs_including_initializers().collect();

        for input in graph.inputs() {
            self.process_def(*input)?;
            // Models the caller's usage post-inference; ensures the buffer
            // is never recycled.
            *self.use_count_mut(*input)? += 1;
        }

        for capture in self.outer_scope_values {
            self.process_def(*capture)?;
            // This graph does not own the buffer.
            *self.use_count_mut(*capture)? += 1;
        }

        // All initializers are treated as inputs.
        for weight in graph.initializers() {
            self.process_def(*weight)?;
            *self.use_count_mut(*weight)? += 1;
        }

        for step_index in 0..self.plan.execution_plan.len() {
            let node_index = self.plan.execution_plan[step_index].node_index;
            let node = self.node(node_index)?;
            let create_info = kernels.resolve(node, &graph.node_name(node_index))?;
            let provider = providers.get(node.provider_type()).ok_or_else(|| {
                RunError::ProviderNotFound {
                    provider: node.provider_type().to_owned(),
                    node: graph.node_name(node_index),
                }
            })?;

            // Positions restart at zero for the implicit-input list, and a
            // later use simply overwrites the location recorded by an
            // earlier one.
            let input_lists = [node.input_ids(), node.implicit_input_ids()];
            for inputs in input_lists {
                for (pos, input) in inputs.iter().enumerate() {
                    let Some(input) = *input else {
                        continue;
                    };
                    *self.use_count_mut(input)? += 1;

                    // Graph inputs and captures are placed where their
                    // consumers expect them; copy nodes are assumed to have
                    // been inserted already where providers disagree.
                    if graph_inputs.contains(&input) || self.outer_scope_values.contains(&input) {
                        let location = provider
                            .allocator_info(create_info.def.input_memory_type(pos))
                            .clone();
                        self.alloc_plan_mut(input)?.location = location;
                    }
                }
            }

            for (pos, output) in node.output_ids().iter().enumerate() {
                let Some(output) = *output else {
                    continue;
                };
                self.process_def(output)?;
                // The definition itself counts as a use; it is decremented
                // again when the reuse pass scans the outputs.
                *self.use_count_mut(output)? += 1;
                let location = provider
                    .allocator_info(create_info.def.output_memory_type(pos))
                    .clone();
                self.alloc_plan_mut(output)?.location = location;
            }

            // Kernels on a non-default queue run asynchronously; every
            // value they touch needs a fence when its device supports one.
            if create_info.def.exec_queue_id() != 0 {
                for value in node.all_value_ids() {
                    self.alloc_plan_mut(value)?.create_fence_if_async = true;
                }
            }
        }

        for output in graph.outputs() {
            // Models the caller's usage post-inference.
            *self.use_count_mut(*output)? += 1;
        }

        Ok(())
    }

    /// Expected location of the input at `input_index` of `node`, for
    /// weight placement.
    fn location_for_node_input(
        &self,
        input_index: usize,
        node_index: NodeId,
        node: &Node,
    ) -> Result<MemoryInfo, RunError> {
        let create_info = self.kernels.resolve(node, &self.graph.node_name(node_index))?;
        if create_info.def.is_input_on_cpu(input_index) {
            // Weights are not produced by any node, so placing them on the
            // CPU provider is always valid.
            return Ok(self.providers.default_cpu_memory_info().clone());
        }
        let provider = self
            .providers
            .get(node.provider_type())
            .ok_or_else(|| RunError::ProviderNotFound {
                provider: node.provider_type().to_owned(),
                node: self.graph.node_name(node_index),
            })?;
        Ok(provider.allocator_info(MemType::Default).clone())
    }

    /// Decide where each initializer lives: the unique location its readers
    /// expect, or default CPU memory when readers disagree.
    fn generate_plan_for_weights(&mut self) -> Result<(), RunError> {
        let graph = self.graph;
        let weights: FxHashSet<ValueId> = graph.initializers().iter().copied().collect();
        let mut locations: Vec<Vec<MemoryInfo>> = vec![Vec::new(); self.usecount.len()];

        for (node_index, node) in graph.nodes() {
            for (input_index, input) in node.input_ids().iter().enumerate() {
                let Some(input) = *input else {
                    continue;
                };
                if !weights.contains(&input) {
                    continue;
                }
                locations[input.as_usize()].push(self.location_for_node_input(
                    input_index,
                    node_index,
                    node,
                )?);
            }
        }

        for (index, expected) in locations.into_iter().enumerate() {
            let Some(first) = expected.first() else {
                continue;
            };
            let location = if expected.iter().all(|loc| loc == first) {
                first.clone()
            } else {
                // The weight is read from multiple devices and must live
                // where every device can reach it.
                self.providers.default_cpu_memory_info().clone()
            };
            let plan = &mut self.plan.allocation_plan[index];
            plan.alloc_kind = AllocKind::AllocateStatically;
            plan.location = location;
        }
        Ok(())
    }

    /// Find an input whose buffer must or may back the output at
    /// `output_arg_num`.
    ///
    /// Aliasing entries are honored unconditionally; a may-inplace entry
    /// applies only when the input's root buffer has exactly one
    /// outstanding use (this is its last) and the two values have the same
    /// size. The first alias match wins without consulting the
    /// may-inplace table.
    fn find_reusable_input(
        &self,
        node: &Node,
        def: &KernelDef,
        output_arg_num: usize,
        output: ValueId,
    ) -> Result<Option<ValueId>, RunError> {
        for &(input_pos, output_pos) in def.alias() {
            if output_pos != output_arg_num {
                continue;
            }
            if let Some(Some(input)) = node.input_ids().get(input_pos) {
                return Ok(Some(*input));
            }
        }

        for &(input_pos, output_pos) in def.may_inplace() {
            if output_pos != output_arg_num {
                continue;
            }
            let Some(Some(input)) = node.input_ids().get(input_pos) else {
                continue;
            };
            let original = self.buffer(*input)?;
            if self.use_count(original)? == 1
                && same_size(self.value_info(*input)?, self.value_info(output)?)
            {
                return Ok(Some(*input));
            }
        }
        Ok(None)
    }

    /// Find a dead buffer on the freelist matching the output's location
    /// and size, removing and returning it.
    fn find_reusable_tensor(&mut self, output: ValueId) -> Result<Option<ValueId>, RunError> {
        let required_info = self.value_info(output)?;
        if required_info.shape().is_none() {
            return Ok(None);
        }
        let required_location = self.plan.allocation_plan[output.as_usize()].location.clone();

        // Scan most recently freed first.
        for pos in (0..self.freelist.len()).rev() {
            let candidate = self.freelist[pos].value;
            let available_location = &self.plan.allocation_plan[candidate.as_usize()].location;
            if *available_location != required_location {
                continue;
            }
            let candidate_info = self.value_info(candidate)?;
            if candidate_info.shape().is_some() && same_size(candidate_info, required_info) {
                self.freelist.remove(pos);
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Second planner pass: per-output allocation decisions, buffer-sharing
    /// merges and the freelist of per-step buffer deaths.
    fn compute_reuse_plan(&mut self) -> Result<(), RunError> {
        let graph = self.graph;
        let kernels = self.kernels;

        // Input buffers are owned by the caller of the run: they must be
        // allocated by the caller and are never reused during inference.
        for input in graph.inputs() {
            self.setup_preexisting(*input)?;
        }

        // Outer-scope captures are treated the same as graph inputs.
        for capture in self.outer_scope_values {
            self.setup_preexisting(*capture)?;
        }

        self.generate_plan_for_weights()?;

        for program_counter in 0..self.plan.execution_plan.len() {
            let node_index = self.plan.execution_plan[program_counter].node_index;
            let node = self.node(node_index)?;
            let create_info = kernels.resolve(node, &graph.node_name(node_index))?;

            // Outputs are claimed before this step's inputs are released so
            // a non-aliasing kernel can never recycle its own live input.
            let mut output_arg_num = 0;
            for output in node.output_ids() {
                let Some(current) = *output else {
                    continue;
                };
                let info = self.value_info(current)?;
                self.alloc_plan_mut(current)?.value_type = Some(info.ty());

                if graph.outputs().contains(&current) {
                    // The value leaves the graph, so intermediate buffers
                    // cannot back it.
                    self.alloc_plan_mut(current)?.alloc_kind = AllocKind::AllocateOutput;

                    // Workaround for converted models that route loop state
                    // through an Identity: pass the caller-owned buffer
                    // through instead of copying it.
                    if let Some(parent) = self.parent_node {
                        if node.op_type() == "Identity" && parent.op_type() == "Loop" {
                            if let Some(Some(input)) = node.input_ids().first() {
                                let input = *input;
                                if self.plan.allocation_plan[input.as_usize()].alloc_kind
                                    == AllocKind::PreExisting
                                {
                                    self.reuse(input, current, AllocKind::Share)?;
                                }
                            }
                        }
                    }
                } else if is_non_tensor(info) {
                    // No sharing is attempted for opaque values.
                    self.alloc_plan_mut(current)?.alloc_kind = AllocKind::Allocate;
                } else if let Some(reused) =
                    self.find_reusable_input(node, &create_info.def, output_arg_num, current)?
                {
                    self.reuse(reused, current, AllocKind::Reuse)?;
                } else if !self.options.parallel_execution {
                    if let Some(reused) = self.find_reusable_tensor(current)? {
                        self.reuse(reused, current, AllocKind::Reuse)?;
                    } else {
                        self.alloc_plan_mut(current)?.alloc_kind = AllocKind::Allocate;
                    }
                } else {
                    self.alloc_plan_mut(current)?.alloc_kind = AllocKind::Allocate;
                }
                output_arg_num += 1;
            }

            // Release this step's inputs.
            for input in node.all_input_ids() {
                self.release(input, program_counter)?;
            }

            // Collect outputs that nobody consumes.
            for output in node.output_ids().iter().filter_map(|id| *id) {
                self.release(output, program_counter)?;
            }
        }
        Ok(())
    }

    fn setup_preexisting(&mut self, value: ValueId) -> Result<(), RunError> {
        let ty = self.value_info(value)?.ty();
        let plan = self.alloc_plan_mut(value)?;
        plan.alloc_kind = AllocKind::PreExisting;
        plan.value_type = Some(ty);
        Ok(())
    }

    /// Drop one use of `value`'s root buffer; when the count reaches zero
    /// the buffer dies at `program_counter`.
    fn release(&mut self, value: ValueId, program_counter: usize) -> Result<(), RunError> {
        let original = self.buffer(value)?;
        let count = self.use_count_mut(original)?;
        *count -= 1;
        if *count == 0 {
            self.freelist.push(FreeBufferInfo {
                value: original,
                deallocate_point: program_counter,
            });
        }
        Ok(())
    }

    /// Whether a value requires fences, looking through buffer reuse to the
    /// root's flag.
    fn value_has_fence(&self, value: ValueId) -> bool {
        let plan = &self.plan.allocation_plan[value.as_usize()];
        let mut has_fence = plan.create_fence_if_async;
        if plan.alloc_kind == AllocKind::Reuse {
            has_fence = has_fence
                || self.plan.allocation_plan[plan.reused_buffer.as_usize()].create_fence_if_async;
        }
        has_fence
    }

    /// Third planner pass: mark nodes that must issue fences around their
    /// kernel invocation.
    fn compute_fence_check(&mut self) -> Result<(), RunError> {
        for step_index in 0..self.plan.execution_plan.len() {
            let node_index = self.plan.execution_plan[step_index].node_index;
            let node = self.node(node_index)?;
            let has_fence = node.all_value_ids().any(|value| self.value_has_fence(value));
            self.plan.node_has_fence[node_index.as_usize()] = has_fence;
        }
        Ok(())
    }

    /// Convert the freelist into the flat `to_be_freed` vector and the
    /// per-step free ranges.
    ///
    /// Freelist entries were pushed in ascending step order, so one forward
    /// walk sees each step's deaths contiguously; a range is opened on
    /// every change of step and closed at the next change.
    fn generate_deallocation_plan(&mut self) {
        self.plan.to_be_freed.reserve(self.freelist.len());

        let mut has_prev_dealloc_point = false;
        let mut prev_dealloc_point = 0;
        let mut current = 0;

        for info in &self.freelist {
            self.plan.to_be_freed.push(info.value);
            if info.deallocate_point != prev_dealloc_point {
                if has_prev_dealloc_point {
                    self.plan.execution_plan[prev_dealloc_point].free_to_index = current - 1;
                }
                prev_dealloc_point = info.deallocate_point;
                has_prev_dealloc_point = true;
                self.plan.execution_plan[prev_dealloc_point].free_from_index = current;
            }
            current += 1;
        }

        if has_prev_dealloc_point {
            self.plan.execution_plan[prev_dealloc_point].free_to_index = current - 1;
        }
    }
}

/// Two shapes are the same iff they have equal rank and every dimension
/// pair is either the same known extent or the same non-empty symbolic
/// name. Unknown-versus-known and differently named symbolic dimensions
/// are treated as different.
fn same_shape(shape1: &[Dimension], shape2: &[Dimension]) -> bool {
    if shape1.len() != shape2.len() {
        return false;
    }
    shape1.iter().zip(shape2).all(|(dim1, dim2)| match (dim1, dim2) {
        (Dimension::Fixed(size1), Dimension::Fixed(size2)) => size1 == size2,
        (Dimension::Symbolic(name1), Dimension::Symbolic(name2)) => {
            name1 == name2 && !name1.is_empty()
        }
        _ => false,
    })
}

/// Two values have the same size iff their element sizes are equal and
/// their shapes are the same. Values with unknown shapes are conservatively
/// assumed to differ.
fn same_size(info1: &ValueInfo, info2: &ValueInfo) -> bool {
    let (Some(elem1), Some(elem2)) = (info1.ty().element_size(), info2.ty().element_size()) else {
        return false;
    };
    let (Some(shape1), Some(shape2)) = (info1.shape(), info2.shape()) else {
        return false;
    };
    elem1 == elem2 && same_shape(shape1, shape2)
}

fn is_non_tensor(info: &ValueInfo) -> bool {
    !info.ty().is_tensor()
}
