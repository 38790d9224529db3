//! Single-flight access token refresh.
//!
//! When any request hits 401/403 it calls [`RefreshCoordinator::recover`].
//! The first caller while `Idle` starts exactly one refresh call in a spawned
//! task and moves the coordinator to `Refreshing`; every caller arriving
//! while `Refreshing` is queued behind it. When the refresh settles the
//! queue is drained in FIFO order: callers are woken to retry (reading the
//! token current at retry time) or rejected with `SessionExpired` after the
//! logout cascade has run.
//!
//! A refresh belongs to the session generation it started in. Once the user
//! logs out or another session is established, that refresh can no longer
//! commit tokens or log anybody out, and new callers do not queue behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::credentials::StorageError;
use super::logout::LogoutCascade;
use super::state::AuthState;
use crate::api::ApiError;
use crate::utils::mask_token;

/// Why a refresh did not produce a usable session.
/// Callers only ever see this as `ApiError::SessionExpired`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("No refresh token stored")]
    MissingRefreshToken,

    #[error("Refresh rejected with status {0}")]
    Rejected(u16),

    #[error("Refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("Refresh request failed: {0}")]
    Transport(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Failed to persist refreshed tokens: {0}")]
    Storage(StorageError),

    #[error("Session was logged out")]
    LoggedOut,
}

impl From<RefreshFailure> for ApiError {
    fn from(_: RefreshFailure) -> Self {
        ApiError::SessionExpired
    }
}

/// Tokens returned by a successful refresh call.
/// Absent fields keep their current values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
}

/// Performs the refresh network call. Kept separate from the state machine so
/// the coordinator can be driven without HTTP.
pub trait TokenRefresher: Send + Sync + 'static {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'static, Result<RefreshedTokens, RefreshFailure>>;
}

pub type RefreshResult = Result<(), RefreshFailure>;

type Waiter = oneshot::Sender<RefreshResult>;

enum RefreshState {
    Idle,
    Refreshing {
        /// Identifies this refresh among all issued
        id: u64,
        /// Session generation the refresh belongs to
        epoch: u64,
        waiters: VecDeque<Waiter>,
    },
}

/// The coordinator's state plus its queue of suspended callers.
/// Shared with the logout cascade so a logout can reject waiters immediately.
pub struct PendingQueue {
    state: Mutex<RefreshState>,
    refreshes_started: AtomicU64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
            refreshes_started: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock(), RefreshState::Refreshing { .. })
    }

    /// Number of callers waiting on the in-flight refresh
    pub fn pending(&self) -> usize {
        match &*self.lock() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { waiters, .. } => waiters.len(),
        }
    }

    /// Total refresh calls issued since startup
    pub fn refreshes_started(&self) -> u64 {
        self.refreshes_started.load(Ordering::SeqCst)
    }

    /// Reject every queued caller. An in-flight refresh stays in flight and
    /// keeps the state at `Refreshing` until it settles.
    pub fn reject_all(&self, failure: RefreshFailure) -> usize {
        let drained: Vec<Waiter> = match &mut *self.lock() {
            RefreshState::Idle => Vec::new(),
            RefreshState::Refreshing { waiters, .. } => waiters.drain(..).collect(),
        };
        notify(drained, Err(failure))
    }

    /// Reject the callers queued on refresh `id`, if it is still the current one
    fn reject(&self, id: u64, failure: RefreshFailure) -> usize {
        let drained: Vec<Waiter> = match &mut *self.lock() {
            RefreshState::Refreshing { id: current, waiters, .. } if *current == id => waiters.drain(..).collect(),
            _ => Vec::new(),
        };
        notify(drained, Err(failure))
    }

    /// Return to `Idle` if refresh `id` is still the current one, handing
    /// back whoever is still queued on it
    fn finish(&self, id: u64) -> Vec<Waiter> {
        let mut state = self.lock();
        match &*state {
            RefreshState::Refreshing { id: current, .. } if *current == id => {}
            _ => return Vec::new(),
        }
        match std::mem::replace(&mut *state, RefreshState::Idle) {
            RefreshState::Idle => Vec::new(),
            RefreshState::Refreshing { waiters, .. } => waiters.into(),
        }
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(waiters: Vec<Waiter>, result: RefreshResult) -> usize {
    let count = waiters.len();
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
    count
}

/// What `recover` should do, decided in one critical section
enum Admission {
    /// A refresh already completed since the caller's request was sent
    Retry,
    Wait(oneshot::Receiver<RefreshResult>),
    Rejected(RefreshFailure),
}

pub struct RefreshCoordinator {
    auth: Arc<AuthState>,
    queue: Arc<PendingQueue>,
    cascade: LogoutCascade,
    refresher: Arc<dyn TokenRefresher>,
    timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        auth: Arc<AuthState>,
        cascade: LogoutCascade,
        refresher: Arc<dyn TokenRefresher>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            auth,
            queue: cascade.queue(),
            cascade,
            refresher,
            timeout,
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.queue.is_refreshing()
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    pub fn refreshes_started(&self) -> u64 {
        self.queue.refreshes_started()
    }

    /// Recover from an auth failure on a request sent with `stale_token`.
    ///
    /// Resolves `Ok(())` when the caller should retry with the current token,
    /// or `Err(SessionExpired)` once the session has been logged out.
    pub async fn recover(self: &Arc<Self>, stale_token: Option<&str>) -> Result<(), ApiError> {
        let rx = match self.admit(stale_token) {
            Admission::Retry => return Ok(()),
            Admission::Rejected(failure) => return Err(failure.into()),
            Admission::Wait(rx) => rx,
        };
        match rx.await {
            Ok(result) => result.map_err(ApiError::from),
            // Sender dropped without an answer: the refresh task died
            Err(_) => Err(ApiError::SessionExpired),
        }
    }

    fn admit(self: &Arc<Self>, stale_token: Option<&str>) -> Admission {
        let mut state = self.queue.lock();
        // Captured before reading any token so a logout or new login racing
        // with these reads is always detected at commit time
        let epoch = self.auth.epoch();

        if let RefreshState::Refreshing { epoch: started_at, waiters, .. } = &mut *state {
            if *started_at == epoch {
                let (tx, rx) = oneshot::channel();
                waiters.push_back(tx);
                debug!(pending = waiters.len(), "Joined in-flight token refresh");
                return Admission::Wait(rx);
            }
            // The in-flight refresh belongs to a session that has since been
            // replaced. Its callers are done; this session gets its own refresh.
            let orphaned: Vec<Waiter> = waiters.drain(..).collect();
            debug!(orphaned = orphaned.len(), "Leaving refresh of a superseded session");
            notify(orphaned, Err(RefreshFailure::LoggedOut));
        }

        let current = self.auth.access_token();
        if current.is_some() && current.as_deref() != stale_token {
            debug!("Token already refreshed since request was sent, retrying");
            return Admission::Retry;
        }

        let refresh_token = match self.auth.refresh_token() {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => {
                drop(state);
                info!("Auth failure with no refresh token, logging out");
                self.logout_session(epoch);
                return Admission::Rejected(RefreshFailure::MissingRefreshToken);
            }
            Err(e) => {
                drop(state);
                warn!(error = %e, "Could not read refresh token, logging out");
                self.logout_session(epoch);
                return Admission::Rejected(RefreshFailure::Storage(e));
            }
        };

        let (tx, rx) = oneshot::channel();
        let id = self.queue.refreshes_started.fetch_add(1, Ordering::SeqCst) + 1;
        *state = RefreshState::Refreshing {
            id,
            epoch,
            waiters: VecDeque::from([tx]),
        };
        drop(state);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_refresh(id, refresh_token, epoch).await;
        });
        Admission::Wait(rx)
    }

    async fn run_refresh(self: Arc<Self>, id: u64, refresh_token: String, epoch: u64) {
        info!(refresh = id, refresh_token = %mask_token(&refresh_token), "Refreshing access token");

        let outcome = match tokio::time::timeout(self.timeout, self.refresher.refresh(refresh_token)).await {
            Ok(Ok(tokens)) => self.commit(epoch, tokens),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(RefreshFailure::Timeout(self.timeout)),
        };

        match outcome {
            Ok(()) => {
                let waiters = self.queue.finish(id);
                info!(refresh = id, waiters = waiters.len(), "Token refresh succeeded, replaying queued requests");
                notify(waiters, Ok(()));
            }
            Err(failure) => {
                // Reject while still `Refreshing` so no new caller can start
                // a second refresh with the dead refresh token
                let rejected = self.queue.reject(id, failure.clone());
                if self.logout_session(epoch) {
                    warn!(refresh = id, error = %failure, "Token refresh failed, logged out");
                } else {
                    info!(refresh = id, error = %failure, "Refresh of a superseded session settled, discarded");
                }
                let stragglers = notify(self.queue.finish(id), Err(failure));
                debug!(rejected = rejected + stragglers, "Rejected queued requests");
            }
        }
    }

    fn commit(&self, epoch: u64, tokens: RefreshedTokens) -> RefreshResult {
        let user_id = match tokens.user_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => match self.auth.read().user_id {
                Some(id) => id,
                None => self
                    .auth
                    .stored_user_id()
                    .map_err(RefreshFailure::Storage)?
                    .ok_or_else(|| RefreshFailure::InvalidResponse("no user id for refreshed session".to_string()))?,
            },
        };

        // The epoch check also rejects a user id read from a newer session
        self.auth
            .commit_refresh(epoch, &tokens.access_token, tokens.refresh_token.as_deref(), &user_id)
            .map(|_| ())
            .map_err(|e| match e {
                ApiError::SessionExpired => RefreshFailure::LoggedOut,
                ApiError::Storage(e) => RefreshFailure::Storage(e),
                other => RefreshFailure::InvalidResponse(other.to_string()),
            })
    }

    /// Run the logout cascade for session generation `epoch` only.
    /// Returns whether that session was still current.
    fn logout_session(&self, epoch: u64) -> bool {
        match self.cascade.logout_if_current(epoch) {
            Ok(logged_out) => logged_out,
            Err(e) => {
                warn!(error = %e, "Logout cascade could not clear credential storage");
                true
            }
        }
    }
}
