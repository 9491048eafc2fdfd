//! Flow execution: graph validation and compilation, the node interpreter,
//! per-conversation lanes, the flow catalog, previews and the JSONL run log.

pub mod catalog;
pub mod effects;
pub mod engine;
pub mod graph;
pub mod lane;
pub mod nodes;
pub mod router;
pub mod run_log;
pub mod simulation;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::FlowCatalog;
pub use effects::Effect;
pub use engine::{AdvanceResult, Disposition, EngineOptions, ExecutionEngine, WakeUp};
pub use graph::{ensure_valid, validate_flow, FlowGraph};
pub use lane::{LaneRegistry, PendingAdvance};
pub use nodes::Services;
pub use run_log::RunLogger;
pub use simulation::{simulated_services, Simulation, SimulationRunner, TranscriptEntry};
