//! Per-copier locks shared by the executor and the reconciler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Serializes mutating work on a single copier's positions.
#[derive(Clone, Default)]
pub struct CopierLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl CopierLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, copier_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        // Poisoning only follows a panic while inserting; recover the map.
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(copier_id.to_string()).or_default())
    }

    /// Wait for exclusive access to `copier_id`.
    pub async fn acquire(&self, copier_id: &str) -> OwnedMutexGuard<()> {
        self.entry(copier_id).lock_owned().await
    }
}
