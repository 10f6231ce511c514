use rustc_hash::FxHashMap;

use crate::error::RunError;
use crate::frame::ExecutionFrame;
use crate::graph::Graph;
use crate::kernel::KernelRegistry;
use crate::planner::{PlanOptions, SequentialExecutionPlan, SequentialPlanner};
use crate::provider::ExecutionProviders;
use crate::value::{Value, ValueId};

/// Everything executors need to run a graph: the graph itself, the kernel
/// and provider registries, initializer tensors and the execution plan.
///
/// The plan is created once when the session is built and is immutable
/// afterwards; every run creates a fresh [`ExecutionFrame`] against it.
pub struct SessionState {
    graph: Graph,
    providers: ExecutionProviders,
    kernels: KernelRegistry,
    initializers: FxHashMap<ValueId, Value>,
    plan: SequentialExecutionPlan,
}

impl SessionState {
    /// Build a session for a root graph, running the planner over it.
    pub fn new(
        graph: Graph,
        providers: ExecutionProviders,
        kernels: KernelRegistry,
        options: PlanOptions,
    ) -> Result<SessionState, RunError> {
        let plan = SequentialPlanner::create_plan(
            None,
            &graph,
            graph.captures(),
            &providers,
            &kernels,
            graph.value_map(),
            &options,
        )?;
        Ok(SessionState {
            graph,
            providers,
            kernels,
            initializers: FxHashMap::default(),
            plan,
        })
    }

    /// Bind an initializer tensor to its value. Initializer data can be
    /// supplied any time before the first run.
    pub fn set_initializer(&mut self, id: ValueId, value: Value) {
        self.initializers.insert(id, value);
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn plan(&self) -> &SequentialExecutionPlan {
        &self.plan
    }

    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    pub fn providers(&self) -> &ExecutionProviders {
        &self.providers
    }

    /// Create the execution frame for one run, binding initializers and the
    /// caller's feeds to their slots.
    pub fn new_frame(&self, feeds: Vec<(ValueId, Value)>) -> Result<ExecutionFrame, RunError> {
        ExecutionFrame::new(
            &self.plan,
            &self.providers,
            feeds,
            self.initializers
                .iter()
                .map(|(id, value)| (*id, value.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState;
    use crate::graph::{Graph, Node};
    use crate::kernel::KernelRegistry;
    use crate::planner::PlanOptions;
    use crate::provider::ExecutionProviders;
    use crate::value::{DataType, Dimension, ValueType};

    #[test]
    fn test_session_planning_fails_on_missing_kernel() {
        let mut graph = Graph::new();
        let x = graph.add_value(
            "x",
            ValueType::Tensor(DataType::Float),
            Some(vec![Dimension::Fixed(1)]),
        );
        graph.add_input(x);
        let y = graph.add_value(
            "y",
            ValueType::Tensor(DataType::Float),
            Some(vec![Dimension::Fixed(1)]),
        );
        graph.add_output(y);
        graph.add_node(
            Node::new("Mystery", "cpu")
                .with_name("m")
                .with_inputs(&[Some(x)])
                .with_outputs(&[Some(y)]),
        );

        let result = SessionState::new(
            graph,
            ExecutionProviders::cpu_only(),
            KernelRegistry::new(),
            PlanOptions::default(),
        );
        assert!(result.is_err());
    }
}
