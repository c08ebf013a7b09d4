//! Persistent one-line progress status.

use std::sync::Arc;

use crate::storage::BlobStore;

/// Key of the status record in the admin store.
pub const STATUS_KEY: &str = "status.txt";

const IDLE: &str = "idle";

/// Reads and writes the last status line, visible across invocations.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn BlobStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Overwrite the status. Failures are logged; progress reporting never
    /// stops a run.
    pub async fn set(&self, status: &str) {
        log::debug!("Status: {}", status);
        if let Err(e) = self
            .store
            .put(STATUS_KEY, "text/plain", status.as_bytes())
            .await
        {
            log::warn!("Writing status failed: {}", e);
        }
    }

    /// The last status written, or `idle` if none.
    pub async fn get(&self) -> String {
        self.store
            .get_string(STATUS_KEY)
            .await
            .unwrap_or_else(|| IDLE.to_string())
    }
}
