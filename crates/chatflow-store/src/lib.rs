pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use chatflow_core::error::{ChatflowError, Result};
use chatflow_core::state::ExecutionState;

/// Optimistic commit check shared by both stores.
///
/// `stored` is the revision currently held for the pair, if any.
pub(crate) fn check_revision(state: &ExecutionState, stored: Option<u64>) -> Result<()> {
    let expected = state.revision.saturating_sub(1);
    let ok = match stored {
        Some(found) => found == expected && state.revision > 0,
        None => state.revision == 1,
    };
    if ok {
        Ok(())
    } else {
        Err(ChatflowError::Conflict {
            pair: state.pair().to_string(),
            expected,
            found: stored.unwrap_or(0),
        })
    }
}
