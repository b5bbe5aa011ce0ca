//! Workflow graph compilation and execution.

pub mod engine;
pub mod nodes;
pub mod state;

pub use engine::{compile, execute, new_cancel_flag, CompiledWorkflow, ExecutionDeps, ExecutionResult};
pub use nodes::{NodeExecCtx, NodeOutcome};
pub use state::{resolve_variables, WorkflowState};
