//! flowrt is the scheduling core of a neural-network inference runtime: a
//! sequential allocation planner plus the executors that consume its plans.
//!
//! The planner walks an immutable, topologically ordered computation graph
//! and decides, for every value in the graph, how its buffer is obtained
//! (fresh allocation, static weight storage, caller-owned pass-through or
//! reuse of another value's buffer) and when it can be released. The result
//! is a [`SequentialExecutionPlan`] shared by two executors:
//!
//! - [`SequentialExecutor`] runs nodes in plan order and releases buffers
//!   eagerly using the plan's per-step deallocation ranges.
//! - [`ParallelExecutor`] runs the graph as a dataflow: nodes dispatch to a
//!   worker pool as their inputs become ready, with linear chains executed
//!   on a single worker to avoid queue round-trips.
//!
//! Kernels, execution providers and device memory locations are supplied by
//! the embedding application through [`KernelRegistry`] and
//! [`ExecutionProviders`]; a small set of reference CPU kernels lives in
//! [`ops`].

pub mod ops;

mod error;
mod executor;
mod frame;
mod graph;
mod kernel;
mod planner;
mod provider;
mod session;
mod threading;
mod timer;
mod value;

pub use error::RunError;
pub use executor::{ParallelExecutor, RunOptions, SequentialExecutor};
pub use frame::{ExecutionFrame, Fence};
pub use graph::{Graph, Node, NodeId};
pub use kernel::{
    Kernel, KernelContext, KernelCreateInfo, KernelDef, KernelDefBuilder, KernelRegistry, OpError,
};
pub use planner::{
    AllocKind, AllocPlanPerValue, NodeExecutionPlan, PlanDisplay, PlanOptions,
    SequentialExecutionPlan, SequentialPlanner,
};
pub use provider::{ExecutionProviders, FenceFactory, MemType, MemoryInfo, Provider, CPU_PROVIDER};
pub use session::SessionState;
pub use threading::thread_pool;
pub use value::{
    DataType, Dimension, TensorData, Value, ValueId, ValueInfo, ValueMap, ValueType,
};
