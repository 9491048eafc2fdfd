pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod hooks;
pub mod render;
pub mod state;
pub mod traits;
pub mod types;
pub mod validation;

pub use config::AppConfig;
pub use error::{ChatflowError, GraphIssue, Result, StateError};
pub use event::EventBus;
pub use flow::*;
pub use state::{ExecutionState, RunStatus};
pub use types::*;
