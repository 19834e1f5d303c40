// src/lib.rs

// The multi-agent task orchestrator core.
pub mod orchestrator;

pub use orchestrator::dispatcher::Dispatcher;
pub use orchestrator::worker_loop::WorkerLoop;
pub use orchestrator::workflow_graph::WorkflowGraph;
