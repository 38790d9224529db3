//! Session teardown shared by sign-out, refresh failure and startup validation.

use std::sync::Arc;

use tracing::info;

use super::credentials::StorageError;
use super::refresh::{PendingQueue, RefreshFailure};
use super::state::AuthState;

/// Deterministic session teardown.
///
/// Used for explicit sign-out, refresh failure and irrecoverable startup
/// validation alike. Calling it again, or concurrently, only re-notifies
/// observers.
#[derive(Clone)]
pub struct LogoutCascade {
    auth: Arc<AuthState>,
    queue: Arc<PendingQueue>,
}

impl LogoutCascade {
    pub fn new(auth: Arc<AuthState>, queue: Arc<PendingQueue>) -> Self {
        Self { auth, queue }
    }

    pub(crate) fn queue(&self) -> Arc<PendingQueue> {
        Arc::clone(&self.queue)
    }

    /// Clear storage, reset auth state, then reject every request still
    /// waiting on a refresh. Memory is reset even if storage fails; the
    /// storage error is returned.
    pub fn logout(&self) -> Result<(), StorageError> {
        let result = self.auth.clear();
        let rejected = self.queue.reject_all(RefreshFailure::LoggedOut);
        info!(rejected, storage_cleared = result.is_ok(), "Logout complete");
        result
    }

    /// Log out only if the session is still generation `epoch`.
    ///
    /// A refresh that fails after the user already signed out, or signed in
    /// again, must not tear down the newer session. Returns whether the
    /// cascade ran.
    pub fn logout_if_current(&self, epoch: u64) -> Result<bool, StorageError> {
        let result = match self.auth.clear_if_current(epoch) {
            Ok(false) => return Ok(false),
            Ok(true) => Ok(true),
            // Memory was reset regardless, finish the cascade
            Err(e) => Err(e),
        };
        let rejected = self.queue.reject_all(RefreshFailure::LoggedOut);
        info!(rejected, epoch, storage_cleared = result.is_ok(), "Logout complete");
        result
    }
}
