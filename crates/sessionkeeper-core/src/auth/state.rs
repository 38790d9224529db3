//! In-memory, observable authentication state.
//!
//! `AuthState` mirrors the credential store and is the single source of truth
//! the rest of the application reads. Every transition persists first, then
//! swaps the snapshot, then notifies observers through a `watch` channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::credentials::{
    CredentialStore, StorageError, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY,
};
use crate::api::ApiError;
use crate::utils::mask_token;

/// Point-in-time view of the session.
/// `is_authenticated` holds exactly when both the token and the user id are set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AuthSnapshot {
    pub is_authenticated: bool,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
}

impl AuthSnapshot {
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    fn authenticated(access_token: &str, user_id: &str) -> Self {
        Self {
            is_authenticated: true,
            access_token: Some(access_token.to_string()),
            user_id: Some(user_id.to_string()),
        }
    }
}

pub struct AuthState {
    store: Arc<dyn CredentialStore>,
    /// Session generation. Serializes transitions while held.
    epoch: Mutex<u64>,
    snapshot: watch::Sender<AuthSnapshot>,
}

impl AuthState {
    /// Create an unauthenticated state over the given store.
    /// Nothing is read from the store here; startup validation seeds it.
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (snapshot, _) = watch::channel(AuthSnapshot::unauthenticated());
        Self {
            store,
            epoch: Mutex::new(0),
            snapshot,
        }
    }

    /// Synchronous snapshot of the current state
    pub fn read(&self) -> AuthSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Current access token, without cloning the rest of the snapshot
    pub fn access_token(&self) -> Option<String> {
        self.snapshot.borrow().access_token.clone()
    }

    /// Observe transitions. The receiver sees every notification, including
    /// repeated logouts.
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshot.subscribe()
    }

    /// Session generation. Moves on every logout and whenever a different
    /// session is authenticated, but not on refresh. A refresh records it
    /// when it starts and commits only if it has not moved.
    pub fn epoch(&self) -> u64 {
        *self.lock_epoch()
    }

    /// Set the authenticated session.
    ///
    /// Passing `authenticated = false` is a logout. A `None` refresh token
    /// keeps whatever refresh token is already stored.
    pub fn set_authenticated(
        &self,
        authenticated: bool,
        access_token: &str,
        refresh_token: Option<&str>,
        user_id: &str,
    ) -> Result<AuthSnapshot, ApiError> {
        if !authenticated {
            self.clear()?;
            return Ok(self.read());
        }
        let mut epoch = self.lock_epoch();
        self.authenticate(&mut epoch, access_token, refresh_token, user_id, &[])
    }

    /// Replace the session with one issued by login, signup or email
    /// verification. Unlike `set_authenticated`, a `None` refresh token
    /// removes the stored one in the same write.
    pub fn establish(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user_id: &str,
    ) -> Result<AuthSnapshot, ApiError> {
        let removals: &[&str] = match refresh_token {
            Some(_) => &[],
            None => &[REFRESH_TOKEN_KEY],
        };
        let mut epoch = self.lock_epoch();
        self.authenticate(&mut epoch, access_token, refresh_token, user_id, removals)
    }

    /// Commit tokens produced by a refresh that began at `expected_epoch`.
    /// Fails with `SessionExpired` if the session changed in between.
    pub fn commit_refresh(
        &self,
        expected_epoch: u64,
        access_token: &str,
        refresh_token: Option<&str>,
        user_id: &str,
    ) -> Result<AuthSnapshot, ApiError> {
        let epoch = self.lock_epoch();
        if *epoch != expected_epoch {
            warn!(
                expected_epoch,
                current_epoch = *epoch,
                "Discarding refreshed tokens, session changed mid-refresh"
            );
            return Err(ApiError::SessionExpired);
        }
        self.apply(access_token, refresh_token, user_id, &[])
    }

    /// Clear persisted credentials and reset to unauthenticated.
    ///
    /// Memory is reset and observers notified even when the store fails, so
    /// the UI never believes in a session storage may still hold. The store
    /// error is returned afterwards.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut epoch = self.lock_epoch();
        self.clear_locked(&mut epoch)
    }

    /// Clear only if the session is still generation `expected_epoch`.
    /// Returns `false` without touching anything when a newer session exists.
    pub fn clear_if_current(&self, expected_epoch: u64) -> Result<bool, StorageError> {
        let mut epoch = self.lock_epoch();
        if *epoch != expected_epoch {
            debug!(expected_epoch, current_epoch = *epoch, "Session superseded, not clearing");
            return Ok(false);
        }
        self.clear_locked(&mut epoch).map(|()| true)
    }

    /// Stored refresh token, if any
    pub fn refresh_token(&self) -> Result<Option<String>, StorageError> {
        self.store.get(REFRESH_TOKEN_KEY)
    }

    /// Stored `(access_token, user_id)` pair, read at startup
    pub fn stored_credentials(&self) -> Result<(Option<String>, Option<String>), StorageError> {
        let access_token = self.store.get(ACCESS_TOKEN_KEY)?;
        let user_id = self.store.get(USER_ID_KEY)?;
        Ok((access_token, user_id))
    }

    /// Stored user id, used when a refresh response omits the user
    pub fn stored_user_id(&self) -> Result<Option<String>, StorageError> {
        self.store.get(USER_ID_KEY)
    }

    fn lock_epoch(&self) -> MutexGuard<'_, u64> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_locked(&self, epoch: &mut u64) -> Result<(), StorageError> {
        *epoch += 1;

        let result = self.store.clear_all();
        if let Err(ref e) = result {
            warn!(error = %e, "Failed to clear credential storage, resetting memory anyway");
        }

        let was_authenticated = self.snapshot.borrow().is_authenticated;
        self.snapshot.send_replace(AuthSnapshot::unauthenticated());
        if was_authenticated {
            info!(epoch = *epoch, "Session cleared");
        } else {
            debug!(epoch = *epoch, "Session already cleared");
        }
        result
    }

    /// Apply a non-refresh transition, starting a new generation when the
    /// token or user changes
    fn authenticate(
        &self,
        epoch: &mut u64,
        access_token: &str,
        refresh_token: Option<&str>,
        user_id: &str,
        removals: &[&str],
    ) -> Result<AuthSnapshot, ApiError> {
        let unchanged = {
            let current = self.snapshot.borrow();
            current.access_token.as_deref() == Some(access_token) && current.user_id.as_deref() == Some(user_id)
        };
        let snapshot = self.apply(access_token, refresh_token, user_id, removals)?;
        if !unchanged {
            *epoch += 1;
        }
        Ok(snapshot)
    }

    /// Persist then publish. Caller holds the epoch lock.
    fn apply(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user_id: &str,
        removals: &[&str],
    ) -> Result<AuthSnapshot, ApiError> {
        if user_id.trim().is_empty() {
            return Err(ApiError::InvalidArgument(
                "user id must not be empty for an authenticated session".to_string(),
            ));
        }
        if access_token.is_empty() {
            return Err(ApiError::InvalidArgument(
                "access token must not be empty for an authenticated session".to_string(),
            ));
        }

        let mut entries = vec![(ACCESS_TOKEN_KEY, access_token), (USER_ID_KEY, user_id)];
        if let Some(refresh_token) = refresh_token {
            entries.push((REFRESH_TOKEN_KEY, refresh_token));
        }
        self.store.replace_all(&entries, removals)?;

        let snapshot = AuthSnapshot::authenticated(access_token, user_id);
        self.snapshot.send_replace(snapshot.clone());
        info!(
            user_id,
            token = %mask_token(access_token),
            rotated_refresh = refresh_token.is_some(),
            "Session authenticated"
        );
        Ok(snapshot)
    }
}
