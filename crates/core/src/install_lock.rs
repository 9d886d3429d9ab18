use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::{Mutex, MutexGuard};

/// Serializes install and uninstall of tunnel services.
///
/// All controllers share one service name, so no two of them may install or
/// uninstall at the same time. Held only around those critical sections,
/// never for a whole connection.
#[derive(Debug, Clone, Default)]
pub struct InstallLock {
    inner: Arc<Mutex<()>>,
}

impl InstallLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide lock used by controllers built without an explicit one.
    pub fn global() -> Self {
        GLOBAL_INSTALL_LOCK.clone()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }

    #[cfg(test)]
    fn shares_with(&self, other: &InstallLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

static GLOBAL_INSTALL_LOCK: Lazy<InstallLock> = Lazy::new(InstallLock::new);
