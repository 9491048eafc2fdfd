use futures::future::BoxFuture;
use tracing::info;

use chatflow_core::error::Result;
use chatflow_core::traits::ContactDirectory;
use chatflow_core::types::{ContactId, TagAction};

/// Contact directory for deployments without a CRM: tag changes are only logged.
#[derive(Debug, Default)]
pub struct LogContactDirectory;

impl ContactDirectory for LogContactDirectory {
    fn apply_tags(&self, contact: &ContactId, action: TagAction, tags: &[String]) -> BoxFuture<'_, Result<()>> {
        info!(contact = %contact, action = ?action, tags = %tags.join(","), "Contact tags changed");
        Box::pin(async { Ok(()) })
    }
}
