use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rayon::Scope;
use rustc_hash::FxHashMap;

use crate::error::RunError;
use crate::frame::ExecutionFrame;
use crate::graph::{Node, NodeId};
use crate::kernel::{KernelContext, KernelDef};
use crate::provider::{MemType, CPU_PROVIDER};
use crate::session::SessionState;
use crate::threading::thread_pool;
use crate::timer::Timer;
use crate::value::{Value, ValueId};

/// Options for a single run of a graph.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Whether to log times spent in different operators when run completes.
    pub timing: bool,

    /// Whether to log information about each graph operation as it is
    /// executed. This will slow down execution.
    pub verbose: bool,

    /// Cooperative cancellation flag. Setting it aborts in-progress chains
    /// at the next node boundary; running kernels are not interrupted.
    pub terminate: Option<Arc<AtomicBool>>,
}

/// Build the per-node context by handing the node reference-counted views
/// of its input buffers.
fn make_context<'a>(frame: &ExecutionFrame, node: &'a Node) -> Result<KernelContext<'a>, RunError> {
    let mut inputs = Vec::with_capacity(node.input_ids().len());
    for id in node.input_ids() {
        inputs.push(match id {
            Some(id) => frame.value(*id)?,
            None => None,
        });
    }
    let mut implicit_inputs = Vec::with_capacity(node.implicit_input_ids().len());
    for id in node.implicit_input_ids() {
        implicit_inputs.push(match id {
            Some(id) => frame.value(*id)?,
            None => None,
        });
    }
    Ok(KernelContext::new(node, inputs, implicit_inputs))
}

/// Bind the outputs a kernel produced to their frame slots.
fn commit_outputs(
    frame: &ExecutionFrame,
    node: &Node,
    ctx: KernelContext,
) -> Result<(), RunError> {
    for (id, value) in node.output_ids().iter().zip(ctx.into_outputs()) {
        if let (Some(id), Some(value)) = (id, value) {
            frame.set_value(*id, value)?;
        }
    }
    Ok(())
}

/// Issue the pre-compute fence calls for a node.
///
/// The provider type reported for an input is overridden to CPU when the
/// kernel pins that input position to CPU memory.
fn fences_before(
    frame: &ExecutionFrame,
    node: &Node,
    def: &KernelDef,
    queue_id: u32,
) -> Result<(), RunError> {
    let input_lists = [node.input_ids(), node.implicit_input_ids()];
    for inputs in input_lists {
        for (pos, input) in inputs.iter().enumerate() {
            let Some(input) = *input else {
                continue;
            };
            if let Some(fence) = frame.fence(input)? {
                let provider_type = if def.input_memory_type(pos) == MemType::CpuInput {
                    CPU_PROVIDER
                } else {
                    node.provider_type()
                };
                fence.before_using_as_input(provider_type, queue_id);
            }
        }
    }
    for output in node.output_ids().iter().filter_map(|id| *id) {
        if let Some(fence) = frame.fence(output)? {
            fence.before_using_as_output(node.provider_type(), queue_id);
        }
    }
    Ok(())
}

/// Issue the post-compute fence calls for a node.
fn fences_after(frame: &ExecutionFrame, node: &Node, queue_id: u32) -> Result<(), RunError> {
    for input in node.all_input_ids() {
        if let Some(fence) = frame.fence(input)? {
            fence.after_used_as_input(queue_id);
        }
    }
    for output in node.output_ids().iter().filter_map(|id| *id) {
        if let Some(fence) = frame.fence(output)? {
            fence.after_used_as_output(queue_id);
        }
    }
    Ok(())
}

/// Run one node: resolve its kernel, apply fences, compute and publish the
/// outputs.
fn run_step(
    session: &SessionState,
    frame: &ExecutionFrame,
    node_index: NodeId,
) -> Result<(), RunError> {
    let graph = session.graph();
    let node = graph
        .get_node(node_index)
        .ok_or(RunError::IndexOutOfRange {
            index: node_index.as_u32(),
            len: graph.max_node_index(),
        })?;
    let create_info = session.kernels().resolve(node, &graph.node_name(node_index))?;
    let queue_id = create_info.def.exec_queue_id();
    let has_fence = session.plan().has_fence(node_index);

    let mut ctx = make_context(frame, node)?;
    if has_fence {
        fences_before(frame, node, &create_info.def, queue_id)?;
    }
    create_info
        .kernel
        .compute(&mut ctx)
        .map_err(|error| RunError::KernelComputeFailed {
            node: graph.node_name(node_index),
            error,
        })?;
    commit_outputs(frame, node, ctx)?;
    if has_fence {
        fences_after(frame, node, queue_id)?;
    }
    Ok(())
}

/// Collect the requested fetches out of the frame.
fn collect_fetches(frame: &ExecutionFrame, fetch_ids: &[ValueId]) -> Result<Vec<Value>, RunError> {
    fetch_ids
        .iter()
        .map(|id| {
            // The planner pinned the use count of every graph output, so a
            // completed run always has these bound.
            Ok(frame.take_value(*id)?.expect("missing output value"))
        })
        .collect()
}

#[derive(Default)]
struct Completion {
    /// Tasks enqueued but not yet completed.
    outstanding: usize,
    errors: Vec<RunError>,
}

struct ExecState<'a> {
    session: &'a SessionState,
    frame: &'a ExecutionFrame,

    /// Per-node count of unsatisfied input edges. Held briefly per node
    /// completion so ready/enqueue decisions are atomic with respect to
    /// sibling completions.
    node_refs: Mutex<Vec<u32>>,

    completion: Mutex<Completion>,
    terminate: Option<Arc<AtomicBool>>,
}

impl ExecState<'_> {
    /// Schedule a ready node on the worker pool.
    fn enqueue<'s>(&'s self, scope: &Scope<'s>, node_index: NodeId) {
        {
            let mut completion = self.completion.lock().unwrap();
            // If there are errors there is no point queuing more work.
            if !completion.errors.is_empty() {
                return;
            }
            completion.outstanding += 1;
        }
        scope.spawn(move |scope| {
            let result = self.run_node_chain(scope, node_index);
            let mut completion = self.completion.lock().unwrap();
            completion.outstanding -= 1;
            if let Err(error) = result {
                completion.errors.push(error);
            }
        });
    }

    /// Worker loop: run a chain of nodes on one worker.
    ///
    /// When a node completes, the first successor it made ready continues
    /// on this worker instead of being re-queued; linear chains dominate
    /// inference graphs and this spares them a queue round-trip per node.
    /// Any further successors made ready are enqueued.
    fn run_node_chain<'s>(&'s self, scope: &Scope<'s>, start: NodeId) -> Result<(), RunError> {
        let graph = self.session.graph();
        let mut node_index = start;
        loop {
            if let Some(flag) = &self.terminate {
                if flag.load(Ordering::Relaxed) {
                    return Err(RunError::Terminated);
                }
            }

            run_step(self.session, self.frame, node_index)?;

            let mut next = None;
            {
                let mut node_refs = self.node_refs.lock().unwrap();
                for &succ in graph.out_edges(node_index) {
                    let refs = &mut node_refs[succ.as_usize()];
                    *refs -= 1;
                    if *refs == 0 {
                        if next.is_none() {
                            next = Some(succ);
                        } else {
                            self.enqueue(scope, succ);
                        }
                    }
                }
            }

            match next {
                Some(succ) => node_index = succ,
                None => return Ok(()),
            }
        }
    }
}

/// Dataflow executor dispatching ready nodes to a worker pool.
///
/// Nodes run as soon as every producer of their inputs has completed;
/// independent branches run concurrently. A node's kernel is invoked
/// strictly after its producers returned success and their post-compute
/// fences ran.
pub struct ParallelExecutor;

impl ParallelExecutor {
    /// Run the session's graph, feeding `feeds` and returning the values
    /// listed in `fetch_ids`.
    ///
    /// On failure the first error is returned as-is; when several branches
    /// failed before the run drained, the errors are joined under
    /// [`RunError::Aggregate`]. Scheduling of new work stops at the first
    /// recorded error, but in-flight nodes run to completion.
    pub fn execute(
        session: &SessionState,
        feeds: Vec<(ValueId, Value)>,
        fetch_ids: &[ValueId],
        opts: Option<RunOptions>,
    ) -> Result<Vec<Value>, RunError> {
        let opts = opts.unwrap_or_default();
        let graph = session.graph();
        let frame = session.new_frame(feeds)?;

        let mut node_refs = vec![0u32; graph.max_node_index()];
        for (id, _) in graph.nodes() {
            node_refs[id.as_usize()] = graph.in_edge_count(id);
        }

        let mut timer = Timer::new();
        if opts.timing {
            timer.start();
        }

        let state = ExecState {
            session,
            frame: &frame,
            node_refs: Mutex::new(node_refs),
            completion: Mutex::new(Completion::default()),
            terminate: opts.terminate.clone(),
        };

        // The scope joins once every enqueued chain has drained, which is
        // the point where no tasks remain outstanding.
        thread_pool().in_place_scope(|scope| {
            for root in graph.root_nodes() {
                state.enqueue(scope, root);
            }
        });

        let completion = state.completion.into_inner().unwrap();
        debug_assert_eq!(completion.outstanding, 0);

        let mut errors = completion.errors;
        if !errors.is_empty() {
            return Err(if errors.len() == 1 {
                errors.remove(0)
            } else {
                RunError::Aggregate(errors)
            });
        }

        if opts.timing {
            timer.end();
            println!(
                "Parallel run of {} nodes finished in {}ms",
                graph.max_node_index(),
                timer.elapsed_ms()
            );
        }

        collect_fetches(&frame, fetch_ids)
    }
}

/// Executor that runs the plan's steps in order on the calling thread and
/// releases buffers eagerly using the plan's per-step deallocation ranges.
pub struct SequentialExecutor;

impl SequentialExecutor {
    /// Run the session's graph in plan order.
    pub fn execute(
        session: &SessionState,
        feeds: Vec<(ValueId, Value)>,
        fetch_ids: &[ValueId],
        opts: Option<RunOptions>,
    ) -> Result<Vec<Value>, RunError> {
        let opts = opts.unwrap_or_default();
        let graph = session.graph();
        let plan = session.plan();
        let frame = session.new_frame(feeds)?;

        let mut run_timer = Timer::new();
        if opts.timing {
            run_timer.start();
        }
        let mut op_elapsed: FxHashMap<&str, f32> = FxHashMap::default();
        let record_timing = opts.timing || opts.verbose;

        for (step_index, step) in plan.execution_plan.iter().enumerate() {
            if let Some(flag) = &opts.terminate {
                if flag.load(Ordering::Relaxed) {
                    return Err(RunError::Terminated);
                }
            }

            let mut op_timer = Timer::new();
            if record_timing {
                op_timer.start();
            }

            run_step(session, &frame, step.node_index)?;

            if record_timing {
                op_timer.end();
                if let Some(node) = graph.get_node(step.node_index) {
                    *op_elapsed.entry(node.op_type()).or_insert(0.) += op_timer.elapsed_ms();
                    if opts.verbose {
                        println!(
                            "#{} {} ({}) time: {}ms",
                            step_index,
                            node.op_type(),
                            graph.node_name(step.node_index),
                            op_timer.elapsed_ms()
                        );
                    }
                }
            }

            // Buffers whose last consumer was this step can be released.
            if let Some(range) = step.free_range() {
                for index in range {
                    frame.release(plan.to_be_freed[index])?;
                }
            }
        }

        if opts.timing {
            run_timer.end();
            println!(
                "Graph run of {} ops finished in {}ms",
                plan.execution_plan.len(),
                run_timer.elapsed_ms()
            );
            print_timings(&op_elapsed, run_timer.elapsed_ms());
        }

        collect_fetches(&frame, fetch_ids)
    }
}

/// Print a table of cumulative operator timings from a graph run.
fn print_timings(op_elapsed: &FxHashMap<&str, f32>, run_time: f32) {
    let total_op_time: f32 = op_elapsed.values().sum();
    let mut op_timings: Vec<_> = op_elapsed.iter().map(|(name, time)| (*name, *time)).collect();
    op_timings.sort_by(|a, b| a.0.cmp(b.0));

    // Show time taken by non-operator processing, such as buffer
    // management done outside of kernels.
    op_timings.push(("[Other]", run_time - total_op_time));

    let rows: Vec<_> = op_timings
        .iter()
        .map(|(op_name, op_total_time)| {
            let op_percent = (*op_total_time / total_op_time) * 100.;
            [
                op_name.to_string(),
                format!("{:.2}ms", op_total_time),
                format!("({:.2}%)", op_percent),
            ]
        })
        .collect();
    let col_widths: Vec<usize> = (0..3)
        .map(|col| rows.iter().fold(0, |width, row| row[col].len().max(width)))
        .collect();

    for row in rows {
        println!(
            "{0:1$} {2:3$} {4:5$}",
            row[0], col_widths[0], row[1], col_widths[1], row[2], col_widths[2]
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use super::{ParallelExecutor, RunOptions, SequentialExecutor};
    use crate::error::RunError;
    use crate::frame::tests::RecordingFence;
    use crate::graph::{Graph, Node};
    use crate::kernel::{Kernel, KernelContext, KernelCreateInfo, KernelDef, KernelRegistry, OpError};
    use crate::planner::PlanOptions;
    use crate::provider::{ExecutionProviders, FenceFactory, MemType, MemoryInfo, Provider};
    use crate::session::SessionState;
    use crate::value::{DataType, Dimension, Value, ValueId, ValueType};

    /// Kernel that adds one to its input and counts how often it ran.
    struct AddOne {
        runs: Arc<AtomicU32>,
    }

    impl AddOne {
        fn new() -> (AddOne, Arc<AtomicU32>) {
            let runs = Arc::new(AtomicU32::new(0));
            (AddOne { runs: runs.clone() }, runs)
        }
    }

    impl Kernel for AddOne {
        fn compute(&self, ctx: &mut KernelContext) -> Result<(), OpError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let input = ctx.require_input(0)?.as_float().ok_or(OpError::UnsupportedType)?.clone();
            let output = input.map(|x| x + 1.0).into_shared();
            ctx.set_output(0, Value::Float(output));
            Ok(())
        }
    }

    /// Kernel that adds its two inputs elementwise.
    struct Add;

    impl Kernel for Add {
        fn compute(&self, ctx: &mut KernelContext) -> Result<(), OpError> {
            let a = ctx.require_input(0)?.as_float().ok_or(OpError::UnsupportedType)?;
            let b = ctx.require_input(1)?.as_float().ok_or(OpError::UnsupportedType)?;
            if a.shape() != b.shape() {
                return Err(OpError::IncompatibleInputShapes("shapes must match"));
            }
            ctx.set_output(0, Value::Float((a + b).into_shared()));
            Ok(())
        }
    }

    /// Kernel that always fails.
    struct Fail;

    impl Kernel for Fail {
        fn compute(&self, _ctx: &mut KernelContext) -> Result<(), OpError> {
            Err(OpError::InvalidValue("always fails"))
        }
    }

    /// Kernel that passes its input through unchanged.
    struct PassThrough;

    impl Kernel for PassThrough {
        fn compute(&self, ctx: &mut KernelContext) -> Result<(), OpError> {
            let input = ctx.take_input(0).ok_or(OpError::MissingInputs)?;
            ctx.set_output(0, input);
            Ok(())
        }
    }

    fn float_value(graph: &mut Graph, name: &str, size: usize) -> ValueId {
        graph.add_value(
            name,
            ValueType::Tensor(DataType::Float),
            Some(vec![Dimension::Fixed(size)]),
        )
    }

    fn register(registry: &mut KernelRegistry, provider: &str, def: KernelDef, kernel: impl Kernel + 'static) {
        registry.register(
            provider,
            KernelCreateInfo {
                def,
                kernel: Arc::new(kernel),
            },
        );
    }

    /// Diamond a -> {b, c} -> d. After `a` completes both branches are
    /// ready: one continues on a's worker, the other is enqueued. `d` runs
    /// only after both complete.
    fn diamond_session() -> (SessionState, ValueId, ValueId, Vec<Arc<AtomicU32>>) {
        let mut graph = Graph::new();
        let x = float_value(&mut graph, "x", 2);
        graph.add_input(x);
        let t = float_value(&mut graph, "t", 2);
        let u1 = float_value(&mut graph, "u1", 2);
        let u2 = float_value(&mut graph, "u2", 2);
        let y = float_value(&mut graph, "y", 2);
        graph.add_output(y);

        graph.add_node(
            Node::new("AddOneA", "cpu")
                .with_name("a")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(t)]),
        );
        graph.add_node(
            Node::new("AddOneB", "cpu")
                .with_name("b")
                .with_inputs(&[Some(t)])
                .with_outputs(&[Some(u1)]),
        );
        graph.add_node(
            Node::new("AddOneC", "cpu")
                .with_name("c")
                .with_inputs(&[Some(t)])
                .with_outputs(&[Some(u2)]),
        );
        graph.add_node(
            Node::new("Add", "cpu")
                .with_name("d")
                .with_inputs(&[Some(u1), Some(u2)])
                .with_outputs(&[Some(y)]),
        );

        let mut registry = KernelRegistry::new();
        let mut counters = Vec::new();
        for op in ["AddOneA", "AddOneB", "AddOneC"] {
            let (kernel, runs) = AddOne::new();
            counters.push(runs);
            register(&mut registry, "cpu", KernelDef::builder(op).build(), kernel);
        }
        register(&mut registry, "cpu", KernelDef::builder("Add").build(), Add);

        let session = SessionState::new(
            graph,
            ExecutionProviders::cpu_only(),
            registry,
            PlanOptions {
                parallel_execution: true,
            },
        )
        .unwrap();
        (session, x, y, counters)
    }

    #[test]
    fn test_parallel_diamond() {
        let (session, x, y, counters) = diamond_session();

        let result = ParallelExecutor::execute(
            &session,
            vec![(x, Value::from_f32(&[2], vec![1., 2.]))],
            &[y],
            None,
        )
        .unwrap();

        assert_eq!(result.len(), 1);
        let out = result[0].as_float().unwrap();
        // x+1 on each branch of the diamond, then summed.
        assert_eq!(out.as_slice().unwrap(), &[6., 8.]);
        for counter in counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_parallel_linear_chain() {
        let mut graph = Graph::new();
        let x = float_value(&mut graph, "x", 3);
        graph.add_input(x);
        let mut prev = x;
        for i in 0..100 {
            let next = float_value(&mut graph, &format!("t{}", i), 3);
            graph.add_node(
                Node::new("AddOne", "cpu")
                    .with_inputs(&[Some(prev)])
                    .with_outputs(&[Some(next)]),
            );
            prev = next;
        }
        graph.add_output(prev);

        let mut registry = KernelRegistry::new();
        let (kernel, runs) = AddOne::new();
        register(&mut registry, "cpu", KernelDef::builder("AddOne").build(), kernel);

        let session = SessionState::new(
            graph,
            ExecutionProviders::cpu_only(),
            registry,
            PlanOptions {
                parallel_execution: true,
            },
        )
        .unwrap();

        let fetch = session.graph().outputs()[0];
        let result = ParallelExecutor::execute(
            &session,
            vec![(x, Value::from_f32(&[3], vec![0., 1., 2.]))],
            &[fetch],
            None,
        )
        .unwrap();

        let out = result[0].as_float().unwrap();
        assert_eq!(out.as_slice().unwrap(), &[100., 101., 102.]);
        assert_eq!(runs.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_parallel_error_stops_downstream() {
        let mut graph = Graph::new();
        let x = float_value(&mut graph, "x", 2);
        graph.add_input(x);
        let t = float_value(&mut graph, "t", 2);
        let y = float_value(&mut graph, "y", 2);
        graph.add_output(y);

        graph.add_node(
            Node::new("Fail", "cpu")
                .with_name("boom")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(t)]),
        );
        graph.add_node(
            Node::new("AddOne", "cpu")
                .with_inputs(&[Some(t)])
                .with_outputs(&[Some(y)]),
        );

        let mut registry = KernelRegistry::new();
        register(&mut registry, "cpu", KernelDef::builder("Fail").build(), Fail);
        let (kernel, runs) = AddOne::new();
        register(&mut registry, "cpu", KernelDef::builder("AddOne").build(), kernel);

        let session = SessionState::new(
            graph,
            ExecutionProviders::cpu_only(),
            registry,
            PlanOptions {
                parallel_execution: true,
            },
        )
        .unwrap();

        let result = ParallelExecutor::execute(
            &session,
            vec![(x, Value::from_f32(&[2], vec![1., 2.]))],
            &[y],
            None,
        );

        assert_eq!(
            result.err(),
            Some(RunError::KernelComputeFailed {
                node: "boom".to_string(),
                error: OpError::InvalidValue("always fails"),
            })
        );
        // The failing node's successors never became ready.
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parallel_independent_failures() {
        // Two independent root nodes that both fail. Depending on timing the
        // second may be enqueued before or after the first error is
        // recorded, so either a single error or an aggregate is valid.
        let mut graph = Graph::new();
        let x = float_value(&mut graph, "x", 2);
        graph.add_input(x);
        let y1 = float_value(&mut graph, "y1", 2);
        let y2 = float_value(&mut graph, "y2", 2);
        graph.add_output(y1);
        graph.add_output(y2);

        graph.add_node(
            Node::new("Fail", "cpu")
                .with_name("boom_1")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(y1)]),
        );
        graph.add_node(
            Node::new("Fail", "cpu")
                .with_name("boom_2")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(y2)]),
        );

        let mut registry = KernelRegistry::new();
        register(&mut registry, "cpu", KernelDef::builder("Fail").build(), Fail);

        let session = SessionState::new(
            graph,
            ExecutionProviders::cpu_only(),
            registry,
            PlanOptions {
                parallel_execution: true,
            },
        )
        .unwrap();

        let result = ParallelExecutor::execute(
            &session,
            vec![(x, Value::from_f32(&[2], vec![1., 2.]))],
            &[y1, y2],
            None,
        );

        match result.err().expect("run must fail") {
            RunError::KernelComputeFailed { .. } => {}
            RunError::Aggregate(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors
                    .iter()
                    .all(|e| matches!(e, RunError::KernelComputeFailed { .. })));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_terminate_flag() {
        let (session, x, y, _counters) = diamond_session();

        let terminate = Arc::new(AtomicBool::new(true));
        let opts = RunOptions {
            terminate: Some(terminate),
            ..Default::default()
        };

        let result = ParallelExecutor::execute(
            &session,
            vec![(x, Value::from_f32(&[2], vec![1., 2.]))],
            &[y],
            Some(opts),
        );
        assert_eq!(result.err(), Some(RunError::Terminated));
    }

    #[test]
    fn test_parallel_fences() {
        let fences: Arc<std::sync::Mutex<Vec<Arc<RecordingFence>>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let fences_clone = fences.clone();
        let factory: FenceFactory = Arc::new(move || {
            let fence = Arc::new(RecordingFence::default());
            fences_clone.lock().unwrap().push(fence.clone());
            fence
        });

        let mut graph = Graph::new();
        let x = float_value(&mut graph, "x", 2);
        graph.add_input(x);
        let t = float_value(&mut graph, "t", 2);
        let y = float_value(&mut graph, "y", 2);
        graph.add_output(y);

        graph.add_node(
            Node::new("GpuAddOne", "cuda")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(t)]),
        );
        // Consumes `t` through a CPU-pinned input position.
        graph.add_node(
            Node::new("GpuReadBack", "cuda")
                .with_inputs(&[Some(t)])
                .with_outputs(&[Some(y)]),
        );

        let mut registry = KernelRegistry::new();
        let (kernel, _) = AddOne::new();
        register(
            &mut registry,
            "cuda",
            KernelDef::builder("GpuAddOne").exec_queue_id(1).build(),
            kernel,
        );
        register(
            &mut registry,
            "cuda",
            KernelDef::builder("GpuReadBack")
                .exec_queue_id(1)
                .input_memory_type(0, MemType::CpuInput)
                .build(),
            PassThrough,
        );

        let mut providers = ExecutionProviders::new();
        providers.register(Provider::cpu());
        providers.register(
            Provider::new("cuda", MemoryInfo::new("cuda", 0, MemType::Default))
                .with_allocator(MemType::CpuInput, MemoryInfo::cpu())
                .with_fence_factory(factory),
        );

        let session = SessionState::new(
            graph,
            providers,
            registry,
            PlanOptions {
                parallel_execution: true,
            },
        )
        .unwrap();

        let result = ParallelExecutor::execute(
            &session,
            vec![(x, Value::from_f32(&[2], vec![1., 2.]))],
            &[y],
            None,
        )
        .unwrap();
        assert_eq!(result[0].as_float().unwrap().as_slice().unwrap(), &[2., 3.]);

        let all_calls: Vec<String> = fences
            .lock()
            .unwrap()
            .iter()
            .flat_map(|fence| fence.calls.lock().unwrap().clone())
            .collect();

        // `t` lives on the async device: produced under an output fence,
        // then read through a CPU-pinned position, which overrides the
        // provider type reported to the fence.
        assert!(all_calls.contains(&"before_output cuda 1".to_string()));
        assert!(all_calls.contains(&"after_output 1".to_string()));
        assert!(all_calls.contains(&"before_input cpu 1".to_string()));
        assert!(all_calls.contains(&"after_input 1".to_string()));
    }

    #[test]
    fn test_sequential_executor() {
        let mut graph = Graph::new();
        let x = float_value(&mut graph, "x", 2);
        graph.add_input(x);
        let t1 = float_value(&mut graph, "t1", 2);
        let t2 = float_value(&mut graph, "t2", 2);
        let y = float_value(&mut graph, "y", 2);
        graph.add_output(y);

        graph.add_node(
            Node::new("AddOne", "cpu")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(t1)]),
        );
        graph.add_node(
            Node::new("AddOne", "cpu")
                .with_inputs(&[Some(t1)])
                .with_outputs(&[Some(t2)]),
        );
        graph.add_node(
            Node::new("Add", "cpu")
                .with_inputs(&[Some(t2), Some(x)])
                .with_outputs(&[Some(y)]),
        );

        let mut registry = KernelRegistry::new();
        let (kernel, runs) = AddOne::new();
        register(&mut registry, "cpu", KernelDef::builder("AddOne").build(), kernel);
        register(&mut registry, "cpu", KernelDef::builder("Add").build(), Add);

        let session = SessionState::new(
            graph,
            ExecutionProviders::cpu_only(),
            registry,
            PlanOptions::default(),
        )
        .unwrap();

        // The plan releases t1 once the second AddOne has consumed it.
        let frees: usize = session
            .plan()
            .execution_plan
            .iter()
            .filter_map(|step| step.free_range())
            .map(|range| range.count())
            .sum();
        assert!(frees > 0);

        let result = SequentialExecutor::execute(
            &session,
            vec![(x, Value::from_f32(&[2], vec![1., 2.]))],
            &[y],
            None,
        )
        .unwrap();

        assert_eq!(result[0].as_float().unwrap().as_slice().unwrap(), &[4., 6.]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sequential_terminate() {
        let (session, x, y, _counters) = diamond_session();
        let opts = RunOptions {
            terminate: Some(Arc::new(AtomicBool::new(true))),
            ..Default::default()
        };
        let result = SequentialExecutor::execute(
            &session,
            vec![(x, Value::from_f32(&[2], vec![1., 2.]))],
            &[y],
            Some(opts),
        );
        assert_eq!(result.err(), Some(RunError::Terminated));
    }
}
