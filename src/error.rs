use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::kernel::OpError;

/// Errors that occur when planning or executing a graph.
#[derive(Debug, PartialEq)]
pub enum RunError {
    /// No kernel is registered for a node's operator type and execution
    /// provider.
    KernelNotFound {
        op_type: String,
        op_version: i32,
        /// Debug name of the node.
        node: String,
    },

    /// A node references an execution provider that is not registered.
    ProviderNotFound {
        provider: String,
        /// Debug name of the node.
        node: String,
    },

    /// A value or node index exceeds the registered range. This indicates an
    /// inconsistency between the graph and the value registry and is not
    /// recoverable.
    IndexOutOfRange { index: u32, len: usize },

    /// A kernel's compute call failed.
    KernelComputeFailed {
        /// Debug name of the node.
        node: String,
        error: OpError,
    },

    /// Execution was aborted because the caller's terminate flag was set.
    Terminated,

    /// Multiple branches of a parallel run failed.
    Aggregate(Vec<RunError>),
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::KernelNotFound {
                op_type,
                op_version,
                node,
            } => write!(
                f,
                "no kernel found for op {}({}) (node \"{}\")",
                op_type, op_version, node
            ),
            RunError::ProviderNotFound { provider, node } => write!(
                f,
                "execution provider \"{}\" not found for node \"{}\"",
                provider, node
            ),
            RunError::IndexOutOfRange { index, len } => {
                write!(f, "index {} out of range for registry of size {}", index, len)
            }
            RunError::KernelComputeFailed { node, error } => {
                write!(f, "compute failed for node \"{}\": {}", node, error)
            }
            RunError::Terminated => write!(f, "exiting due to terminate flag being set"),
            RunError::Aggregate(errors) => {
                write!(f, "multiple errors were found.")?;
                for error in errors {
                    write!(f, "\n{}", error)?;
                }
                Ok(())
            }
        }
    }
}

impl Error for RunError {}
