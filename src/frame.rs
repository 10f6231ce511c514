use std::sync::{Arc, Mutex};

use crate::error::RunError;
use crate::planner::SequentialExecutionPlan;
use crate::provider::ExecutionProviders;
use crate::value::{Value, ValueId};

/// Synchronization handle inserted around kernels that run on asynchronous
/// device queues.
///
/// The `before_*` calls block until the buffer is safe to read or write
/// from the given provider's queue; the `after_*` calls record the access
/// so later users can wait on it.
pub trait Fence: Send + Sync {
    fn before_using_as_input(&self, provider_type: &str, queue_id: u32);
    fn before_using_as_output(&self, provider_type: &str, queue_id: u32);
    fn after_used_as_input(&self, queue_id: u32);
    fn after_used_as_output(&self, queue_id: u32);
}

/// Binds value indices to concrete buffers for one run.
///
/// Buffers are stored only at buffer-sharing roots; reads and writes of a
/// non-root value resolve through the allocation plan first, so every view
/// of a shared buffer observes the same storage. Slots hold
/// reference-counted values and their locks are only held long enough to
/// move a handle in or out, never across a kernel call.
pub struct ExecutionFrame {
    slots: Vec<Mutex<Option<Value>>>,

    /// Fence per root slot, for values whose plan requested one and whose
    /// provider supports asynchronous queues.
    fences: Vec<Option<Arc<dyn Fence>>>,

    /// Buffer-sharing root per value, from the allocation plan.
    roots: Vec<ValueId>,
}

impl ExecutionFrame {
    /// Create a frame for a run of `plan`, installing initializer tensors
    /// and caller-supplied feeds into their slots.
    pub fn new(
        plan: &SequentialExecutionPlan,
        providers: &ExecutionProviders,
        feeds: Vec<(ValueId, Value)>,
        initializers: impl IntoIterator<Item = (ValueId, Value)>,
    ) -> Result<ExecutionFrame, RunError> {
        let len = plan.allocation_plan.len();
        let roots: Vec<ValueId> = plan
            .allocation_plan
            .iter()
            .map(|per_value| per_value.reused_buffer)
            .collect();

        let mut fences: Vec<Option<Arc<dyn Fence>>> = vec![None; len];
        for (index, per_value) in plan.allocation_plan.iter().enumerate() {
            if !per_value.create_fence_if_async {
                continue;
            }
            let root = roots[index].as_usize();
            if fences[root].is_some() {
                continue;
            }
            // The flag is ignored when the value's provider has no
            // asynchronous queues.
            if let Some(provider) = providers.get(&per_value.location.provider) {
                if let Some(fence) = provider.create_fence() {
                    fences[root] = Some(fence);
                }
            }
        }

        let mut frame = ExecutionFrame {
            slots: (0..len).map(|_| Mutex::new(None)).collect(),
            fences,
            roots,
        };

        for (id, value) in initializers {
            frame.install(id, value)?;
        }
        for (id, value) in feeds {
            frame.install(id, value)?;
        }
        Ok(frame)
    }

    fn install(&mut self, id: ValueId, value: Value) -> Result<(), RunError> {
        let root = self.root(id)?;
        *self.slots[root.as_usize()].get_mut().unwrap() = Some(value);
        Ok(())
    }

    fn root(&self, id: ValueId) -> Result<ValueId, RunError> {
        self.roots
            .get(id.as_usize())
            .copied()
            .ok_or(RunError::IndexOutOfRange {
                index: id.as_u32(),
                len: self.roots.len(),
            })
    }

    /// Current buffer bound to `id`, if one has been produced. The returned
    /// handle shares storage with the slot.
    pub fn value(&self, id: ValueId) -> Result<Option<Value>, RunError> {
        let root = self.root(id)?;
        Ok(self.slots[root.as_usize()].lock().unwrap().clone())
    }

    /// Bind a buffer to `id`'s slot, replacing any previous binding.
    pub fn set_value(&self, id: ValueId, value: Value) -> Result<(), RunError> {
        let root = self.root(id)?;
        *self.slots[root.as_usize()].lock().unwrap() = Some(value);
        Ok(())
    }

    /// Move the buffer bound to `id` out of the frame.
    pub fn take_value(&self, id: ValueId) -> Result<Option<Value>, RunError> {
        let root = self.root(id)?;
        Ok(self.slots[root.as_usize()].lock().unwrap().take())
    }

    /// Release the buffer bound to `id` per the deallocation plan.
    pub fn release(&self, id: ValueId) -> Result<(), RunError> {
        self.take_value(id).map(|_| ())
    }

    /// Fence guarding `id`'s buffer, if any.
    pub fn fence(&self, id: ValueId) -> Result<Option<&dyn Fence>, RunError> {
        let root = self.root(id)?;
        Ok(self.fences[root.as_usize()].as_deref())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::{ExecutionFrame, Fence};
    use crate::graph::Graph;
    use crate::kernel::{Kernel, KernelContext, KernelCreateInfo, KernelDef, KernelRegistry, OpError};
    use crate::planner::{PlanOptions, SequentialPlanner};
    use crate::provider::{ExecutionProviders, FenceFactory, MemType, MemoryInfo, Provider};
    use crate::value::{DataType, Dimension, Value, ValueType};
    use crate::Node;

    struct Noop;

    impl Kernel for Noop {
        fn compute(&self, _ctx: &mut KernelContext) -> Result<(), OpError> {
            Ok(())
        }
    }

    /// Fence that records each call made against it.
    #[derive(Default)]
    pub struct RecordingFence {
        pub calls: Mutex<Vec<String>>,
    }

    impl Fence for RecordingFence {
        fn before_using_as_input(&self, provider_type: &str, queue_id: u32) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("before_input {} {}", provider_type, queue_id));
        }

        fn before_using_as_output(&self, provider_type: &str, queue_id: u32) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("before_output {} {}", provider_type, queue_id));
        }

        fn after_used_as_input(&self, queue_id: u32) {
            self.calls.lock().unwrap().push(format!("after_input {}", queue_id));
        }

        fn after_used_as_output(&self, queue_id: u32) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("after_output {}", queue_id));
        }
    }

    #[test]
    fn test_shared_buffer_slots() {
        // Reshape's output aliases its input, so both ids must resolve to
        // the same slot.
        let mut graph = Graph::new();
        let x = graph.add_value(
            "x",
            ValueType::Tensor(DataType::Float),
            Some(vec![Dimension::Fixed(4)]),
        );
        graph.add_input(x);
        let y = graph.add_value(
            "y",
            ValueType::Tensor(DataType::Float),
            Some(vec![Dimension::Fixed(4)]),
        );
        let z = graph.add_value(
            "z",
            ValueType::Tensor(DataType::Float),
            Some(vec![Dimension::Fixed(4)]),
        );
        graph.add_output(z);
        graph.add_node(
            Node::new("Reshape", "cpu")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(y)]),
        );
        graph.add_node(
            Node::new("Relu", "cpu")
                .with_inputs(&[Some(y)])
                .with_outputs(&[Some(z)]),
        );

        let mut registry = KernelRegistry::new();
        registry.register(
            "cpu",
            KernelCreateInfo {
                def: KernelDef::builder("Reshape").alias(0, 0).build(),
                kernel: Arc::new(Noop),
            },
        );
        registry.register(
            "cpu",
            KernelCreateInfo {
                def: KernelDef::builder("Relu").build(),
                kernel: Arc::new(Noop),
            },
        );
        let providers = ExecutionProviders::cpu_only();
        let plan = SequentialPlanner::create_plan(
            None,
            &graph,
            &[],
            &providers,
            &registry,
            graph.value_map(),
            &PlanOptions::default(),
        )
        .unwrap();

        let frame = ExecutionFrame::new(&plan, &providers, Vec::new(), Vec::new()).unwrap();
        frame
            .set_value(y, Value::from_f32(&[4], vec![1., 2., 3., 4.]))
            .unwrap();

        // `y` reuses `x`'s buffer, so the value is visible through both.
        assert!(frame.value(x).unwrap().is_some());
        assert!(frame.value(y).unwrap().is_some());

        frame.release(x).unwrap();
        assert!(frame.value(y).unwrap().is_none());
    }

    #[test]
    fn test_fences_created_at_roots() {
        let fences: Arc<Mutex<Vec<Arc<RecordingFence>>>> = Arc::new(Mutex::new(Vec::new()));
        let fences_clone = fences.clone();
        let factory: FenceFactory = Arc::new(move || {
            let fence = Arc::new(RecordingFence::default());
            fences_clone.lock().unwrap().push(fence.clone());
            fence
        });

        let mut graph = Graph::new();
        let x = graph.add_value(
            "x",
            ValueType::Tensor(DataType::Float),
            Some(vec![Dimension::Fixed(2)]),
        );
        graph.add_input(x);
        let y = graph.add_value(
            "y",
            ValueType::Tensor(DataType::Float),
            Some(vec![Dimension::Fixed(2)]),
        );
        graph.add_output(y);
        graph.add_node(
            Node::new("Relu", "cuda")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(y)]),
        );

        let mut registry = KernelRegistry::new();
        registry.register(
            "cuda",
            KernelCreateInfo {
                def: KernelDef::builder("Relu").exec_queue_id(1).build(),
                kernel: Arc::new(Noop),
            },
        );
        let mut providers = ExecutionProviders::new();
        providers.register(Provider::cpu());
        providers.register(
            Provider::new("cuda", MemoryInfo::new("cuda", 0, MemType::Default))
                .with_fence_factory(factory),
        );

        let plan = SequentialPlanner::create_plan(
            None,
            &graph,
            &[],
            &providers,
            &registry,
            graph.value_map(),
            &PlanOptions::default(),
        )
        .unwrap();

        let frame = ExecutionFrame::new(&plan, &providers, Vec::new(), Vec::new()).unwrap();
        assert!(frame.fence(x).unwrap().is_some());
        assert!(frame.fence(y).unwrap().is_some());
        // One fence per value, each its own root.
        assert_eq!(fences.lock().unwrap().len(), 2);
    }
}
