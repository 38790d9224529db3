//! End-to-end session flows against a stub backend

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use sessionkeeper_core::auth::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY};
use sessionkeeper_core::{
    ApiError, ApiRequest, AuthSnapshot, CredentialStore, MemoryCredentialStore, Session,
    SessionConfig, SessionOutcome, StorageError,
};

#[derive(Default)]
struct BackendState {
    /// Access tokens the protected endpoints accept
    valid_access: HashSet<String>,
    /// refresh token -> (new access token, rotated refresh token)
    refresh_grants: HashMap<String, (String, Option<String>)>,
    refresh_calls: Vec<String>,
    /// (path, Authorization header) for every request received
    seen: Vec<(String, Option<String>)>,
    refresh_delay: Duration,
    profile: Value,
}

#[derive(Clone, Default)]
struct Backend {
    state: Arc<Mutex<BackendState>>,
}

impl Backend {
    fn with<R>(&self, f: impl FnOnce(&mut BackendState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn record(&self, path: &str, headers: &HeaderMap) -> Option<String> {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.with(|s| s.seen.push((path.to_string(), auth.clone())));
        auth
    }

    fn authorized(&self, auth: Option<String>) -> bool {
        let token = auth.as_deref().and_then(|v| v.strip_prefix("Bearer "));
        self.with(|s| token.map(|t| s.valid_access.contains(t)).unwrap_or(false))
    }

    fn headers_for(&self, path: &str) -> Vec<Option<String>> {
        self.with(|s| {
            s.seen
                .iter()
                .filter(|(p, _)| p == path)
                .map(|(_, auth)| auth.clone())
                .collect()
        })
    }

    fn refresh_calls(&self) -> Vec<String> {
        self.with(|s| s.refresh_calls.clone())
    }
}

async fn login(State(backend): State<Backend>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    backend.record("/auth/login", &headers);
    if body["email"] == "a@b.com" && body["password"] == "secret123" {
        Json(json!({"access_token": "AT1", "refresh_token": "RT1", "user": {"id": "U1"}})).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, "invalid credentials").into_response()
    }
}

async fn refresh(State(backend): State<Backend>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    backend.record("/auth/refresh", &headers);
    let token = body["refresh_token"].as_str().unwrap_or_default().to_string();
    let (delay, grant) = backend.with(|s| {
        s.refresh_calls.push(token.clone());
        (s.refresh_delay, s.refresh_grants.get(&token).cloned())
    });
    tokio::time::sleep(delay).await;
    match grant {
        Some((access, Some(rotated))) => Json(json!({"access_token": access, "refresh_token": rotated})).into_response(),
        Some((access, None)) => Json(json!({"access_token": access})).into_response(),
        None => (StatusCode::UNAUTHORIZED, "refresh token revoked").into_response(),
    }
}

async fn me(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    let auth = backend.record("/user/me", &headers);
    if backend.authorized(auth) {
        Json(backend.with(|s| s.profile.clone())).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn meals(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    let auth = backend.record("/meals", &headers);
    if backend.authorized(auth) {
        Json(json!([])).into_response()
    } else {
        StatusCode::FORBIDDEN.into_response()
    }
}

async fn broken(State(backend): State<Backend>, headers: HeaderMap) -> Response {
    backend.record("/broken", &headers);
    (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable").into_response()
}

struct BackendStub {
    base_url: String,
    backend: Backend,
    shutdown: Option<oneshot::Sender<()>>,
}

impl BackendStub {
    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn spawn_backend(backend: Backend) -> Result<BackendStub> {
    let app = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/user/me", get(me))
        .route("/meals", get(meals))
        .route("/broken", get(broken))
        .with_state(backend.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    Ok(BackendStub {
        base_url: format!("http://{}", addr),
        backend,
        shutdown: Some(shutdown_tx),
    })
}

/// Backend where AT1 is already expired and RT1 refreshes to AT2
fn expiring_backend() -> Backend {
    let backend = Backend::default();
    backend.with(|s| {
        s.valid_access.insert("AT2".to_string());
        s.refresh_grants.insert("RT1".to_string(), ("AT2".to_string(), None));
        s.profile = json!({"id": "U1", "goal": "maintain"});
    });
    backend
}

/// Memory store whose reads can be switched to fail, like a locked keychain
#[derive(Default)]
struct LockableStore {
    inner: MemoryCredentialStore,
    locked: AtomicBool,
}

impl CredentialStore for LockableStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(StorageError::Read {
                key: key.to_string(),
                message: "keychain locked".to_string(),
            });
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key)
    }
}

fn session_for(base_url: &str, store: Arc<dyn CredentialStore>) -> Session {
    let config = SessionConfig {
        base_url: base_url.to_string(),
        refresh_timeout_secs: 5,
        ..SessionConfig::default()
    };
    Session::new(&config, store).expect("session should build")
}

fn seed_store(store: &MemoryCredentialStore, access: &str, refresh: &str, user: &str) {
    store
        .set_all(&[(ACCESS_TOKEN_KEY, access), (REFRESH_TOKEN_KEY, refresh), (USER_ID_KEY, user)])
        .unwrap();
}

#[tokio::test]
async fn test_login_expire_refresh_replay_scenario() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    let session = session_for(&stub.base_url, store.clone());

    let snapshot = session.login("a@b.com", "secret123").await?;
    assert_eq!(snapshot.access_token.as_deref(), Some("AT1"));
    assert_eq!(store.get(REFRESH_TOKEN_KEY)?.as_deref(), Some("RT1"));

    let profile = session.dispatcher().fetch_profile().await?;
    assert_eq!(profile["id"], "U1");

    assert_eq!(stub.backend.refresh_calls(), vec!["RT1".to_string()]);
    assert_eq!(
        stub.backend.headers_for("/user/me"),
        vec![Some("Bearer AT1".to_string()), Some("Bearer AT2".to_string())]
    );
    // Public endpoints never carry credentials
    assert_eq!(stub.backend.headers_for("/auth/login"), vec![None]);
    assert_eq!(stub.backend.headers_for("/auth/refresh"), vec![None]);

    assert_eq!(
        session.read(),
        AuthSnapshot {
            is_authenticated: true,
            access_token: Some("AT2".to_string()),
            user_id: Some("U1".to_string()),
        }
    );
    assert_eq!(store.get(ACCESS_TOKEN_KEY)?.as_deref(), Some("AT2"));
    assert_eq!(store.get(REFRESH_TOKEN_KEY)?.as_deref(), Some("RT1"));

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_expired_requests_refresh_once() -> Result<()> {
    let backend = expiring_backend();
    backend.with(|s| {
        s.refresh_delay = Duration::from_millis(100);
        s.refresh_grants
            .insert("RT1".to_string(), ("AT2".to_string(), Some("RT2".to_string())));
    });
    let stub = spawn_backend(backend).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    let session = session_for(&stub.base_url, store.clone());
    session.login("a@b.com", "secret123").await?;

    let requests = (0..6).map(|i| {
        let path = if i % 2 == 0 { "/user/me" } else { "/meals" };
        session.send(ApiRequest::get(path))
    });
    let results = futures::future::join_all(requests).await;
    for result in results {
        result?;
    }

    assert_eq!(stub.backend.refresh_calls(), vec!["RT1".to_string()]);
    assert_eq!(session.coordinator().refreshes_started(), 1);
    assert_eq!(store.get(REFRESH_TOKEN_KEY)?.as_deref(), Some("RT2"));

    // Every request's final attempt used the refreshed token
    for path in ["/user/me", "/meals"] {
        let headers = stub.backend.headers_for(path);
        assert_eq!(headers.iter().filter(|h| h.as_deref() == Some("Bearer AT2")).count(), 3);
    }

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_refresh_rejected_logs_out() -> Result<()> {
    let backend = expiring_backend();
    backend.with(|s| s.refresh_grants.clear());
    let stub = spawn_backend(backend).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    let session = session_for(&stub.base_url, store.clone());
    session.login("a@b.com", "secret123").await?;
    let mut observer = session.subscribe();

    let result = session.send(ApiRequest::get("/meals")).await;
    assert!(matches!(result, Err(ApiError::SessionExpired)));

    assert_eq!(session.read(), AuthSnapshot::unauthenticated());
    assert!(!observer.borrow_and_update().is_authenticated);
    for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY] {
        assert_eq!(store.get(key)?, None);
    }

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_server_errors_pass_through_without_refresh() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let session = session_for(&stub.base_url, Arc::new(MemoryCredentialStore::new()));
    session.login("a@b.com", "secret123").await?;

    match session.send(ApiRequest::get("/broken")).await {
        Err(ApiError::Http { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "database unavailable");
        }
        other => panic!("expected HTTP 500, got {:?}", other),
    }
    assert!(stub.backend.refresh_calls().is_empty());
    assert!(session.read().is_authenticated);

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_bad_login_is_not_an_expired_session() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let session = session_for(&stub.base_url, Arc::new(MemoryCredentialStore::new()));

    let result = session.login("a@b.com", "wrong").await;
    assert!(matches!(result, Err(ApiError::Http { status: 401, .. })));
    assert!(stub.backend.refresh_calls().is_empty());
    assert!(!session.read().is_authenticated);

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_network_error_never_refreshes_or_logs_out() -> Result<()> {
    // Reserve a port, then close it so connections are refused
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);
    drop(listener);

    let store = Arc::new(MemoryCredentialStore::new());
    let session = session_for(&base_url, store.clone());
    session.auth().set_authenticated(true, "AT1", Some("RT1"), "U1")?;

    let result = session.send(ApiRequest::get("/meals")).await;
    assert!(matches!(result, Err(ApiError::Network(_))));
    assert_eq!(session.coordinator().refreshes_started(), 0);
    assert!(session.read().is_authenticated);
    assert_eq!(store.get(REFRESH_TOKEN_KEY)?.as_deref(), Some("RT1"));

    // Startup validation surfaces the same error instead of logging out
    let outcome = session.validate().await;
    assert!(matches!(outcome, Err(ApiError::Network(_))));
    assert_eq!(store.get(ACCESS_TOKEN_KEY)?.as_deref(), Some("AT1"));
    Ok(())
}

#[tokio::test]
async fn test_validate_without_credentials() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    store.set(REFRESH_TOKEN_KEY, "orphaned")?;
    let session = session_for(&stub.base_url, store.clone());

    assert_eq!(session.validate().await?, SessionOutcome::NoCredentials);
    assert!(stub.backend.headers_for("/user/me").is_empty());
    assert_eq!(store.get(REFRESH_TOKEN_KEY)?, None);

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_validate_valid_session_classifies_profile() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    seed_store(&store, "AT2", "RT1", "U1");

    let config = SessionConfig {
        base_url: stub.base_url.clone(),
        required_profile_fields: vec!["goal".to_string(), "height_cm".to_string()],
        ..SessionConfig::default()
    };
    let session = Session::new(&config, store.clone())?;
    assert_eq!(session.validate().await?, SessionOutcome::ValidIncomplete);
    assert_eq!(session.read().access_token.as_deref(), Some("AT2"));

    let session = Session::new(&config, store.clone())?
        .with_completeness(Arc::new(|profile: &Value| profile["goal"] == "maintain"));
    assert_eq!(session.validate().await?, SessionOutcome::ValidComplete);
    assert!(stub.backend.refresh_calls().is_empty());

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_validate_refreshes_expired_stored_token() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    seed_store(&store, "AT1", "RT1", "U1");
    let session = session_for(&stub.base_url, store.clone());

    assert_eq!(session.validate().await?, SessionOutcome::ValidComplete);
    assert_eq!(stub.backend.refresh_calls(), vec!["RT1".to_string()]);
    assert_eq!(session.read().access_token.as_deref(), Some("AT2"));
    assert_eq!(session.read().user_id.as_deref(), Some("U1"));
    assert_eq!(store.get(ACCESS_TOKEN_KEY)?.as_deref(), Some("AT2"));

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_validate_with_dead_refresh_token() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    seed_store(&store, "AT1", "revoked", "U1");
    let session = session_for(&stub.base_url, store.clone());

    assert_eq!(session.validate().await?, SessionOutcome::InvalidCredentials);
    assert_eq!(session.read(), AuthSnapshot::unauthenticated());
    for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY] {
        assert_eq!(store.get(key)?, None);
    }

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_explicit_logout_is_idempotent() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    let session = session_for(&stub.base_url, store.clone());
    session.login("a@b.com", "secret123").await?;

    session.logout()?;
    session.logout()?;

    assert_eq!(session.read(), AuthSnapshot::unauthenticated());
    assert_eq!(store.get(ACCESS_TOKEN_KEY)?, None);

    // Protected request after logout goes out bare and cannot refresh
    let result = session.send(ApiRequest::get("/meals")).await;
    assert!(matches!(result, Err(ApiError::SessionExpired)));
    assert_eq!(stub.backend.headers_for("/meals"), vec![None]);
    assert!(stub.backend.refresh_calls().is_empty());

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_forbidden_response_triggers_refresh() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    let session = session_for(&stub.base_url, store.clone());
    session.login("a@b.com", "secret123").await?;

    let response = session.send(ApiRequest::get("/meals")).await?;
    assert_eq!(response.status, 200);

    assert_eq!(stub.backend.refresh_calls(), vec!["RT1".to_string()]);
    assert_eq!(
        stub.backend.headers_for("/meals"),
        vec![Some("Bearer AT1".to_string()), Some("Bearer AT2".to_string())]
    );
    assert_eq!(store.get(ACCESS_TOKEN_KEY)?.as_deref(), Some("AT2"));

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_auth_failure_after_refresh_is_not_retried_again() -> Result<()> {
    let backend = expiring_backend();
    // The server hands out a token its own endpoints refuse
    backend.with(|s| {
        s.refresh_grants.insert("RT1".to_string(), ("AT3".to_string(), None));
    });
    let stub = spawn_backend(backend).await?;
    let session = session_for(&stub.base_url, Arc::new(MemoryCredentialStore::new()));
    session.login("a@b.com", "secret123").await?;

    let result = session.send(ApiRequest::get("/user/me")).await;
    assert!(matches!(result, Err(ApiError::AuthExpired { status: 401 })));

    assert_eq!(stub.backend.refresh_calls(), vec!["RT1".to_string()]);
    assert_eq!(
        stub.backend.headers_for("/user/me"),
        vec![Some("Bearer AT1".to_string()), Some("Bearer AT3".to_string())]
    );
    assert_eq!(session.coordinator().refreshes_started(), 1);
    assert_eq!(session.read().access_token.as_deref(), Some("AT3"));

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_validate_refused_after_refresh_is_invalid() -> Result<()> {
    let backend = expiring_backend();
    backend.with(|s| {
        s.refresh_grants.insert("RT1".to_string(), ("AT3".to_string(), None));
    });
    let stub = spawn_backend(backend).await?;
    let store = Arc::new(MemoryCredentialStore::new());
    seed_store(&store, "AT1", "RT1", "U1");
    let session = session_for(&stub.base_url, store.clone());

    assert_eq!(session.validate().await?, SessionOutcome::InvalidCredentials);
    assert_eq!(stub.backend.refresh_calls(), vec!["RT1".to_string()]);
    assert_eq!(session.read(), AuthSnapshot::unauthenticated());
    for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_ID_KEY] {
        assert_eq!(store.get(key)?, None);
    }

    stub.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_validate_with_unreadable_storage() -> Result<()> {
    let stub = spawn_backend(expiring_backend()).await?;
    let store = Arc::new(LockableStore::default());
    let session = session_for(&stub.base_url, store.clone());
    session.auth().set_authenticated(true, "AT2", Some("RT1"), "U1")?;
    store.locked.store(true, Ordering::SeqCst);

    assert_eq!(session.validate().await?, SessionOutcome::NoCredentials);
    assert!(stub.backend.headers_for("/user/me").is_empty());
    assert_eq!(session.read(), AuthSnapshot::unauthenticated());
    // Defensive logout still cleared what it could
    assert_eq!(store.inner.get(ACCESS_TOKEN_KEY)?, None);
    assert_eq!(store.inner.get(REFRESH_TOKEN_KEY)?, None);

    stub.stop().await;
    Ok(())
}
