//! Authentication module for managing sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: durable storage for the token pair and user id
//! - `AuthState`: the observable in-memory session, persisted before publish
//! - `RefreshCoordinator`: single-flight token refresh with a pending queue
//! - `LogoutCascade`: storage clear, state reset and queue rejection
//! - `SessionValidator`: startup check of stored credentials

pub mod credentials;
pub mod logout;
pub mod refresh;
pub mod state;
pub mod validator;

pub use credentials::{
    CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore,
    StorageError, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS, USER_ID_KEY,
};
pub use logout::LogoutCascade;
pub use refresh::{
    PendingQueue, RefreshCoordinator, RefreshFailure, RefreshResult, RefreshedTokens,
    TokenRefresher,
};
pub use state::{AuthSnapshot, AuthState};
pub use validator::{required_fields_predicate, CompletenessPredicate, SessionOutcome, SessionValidator};
