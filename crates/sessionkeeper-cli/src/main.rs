//! sessionkeeper - drive a persisted API session from the command line.
//!
//! Useful for checking a backend's auth endpoints by hand: sign in once,
//! then issue protected requests across runs while the session core handles
//! token refresh and logout.

use std::io::{self, Write};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionkeeper_core::{ApiError, ApiRequest, Session, SessionConfig, SessionOutcome};

/// Environment variable overriding the configured base URL
const BASE_URL_ENV: &str = "SESSIONKEEPER_BASE_URL";

/// Environment variable supplying the login email
const EMAIL_ENV: &str = "SESSIONKEEPER_EMAIL";

const USAGE: &str = "\
Usage: sessionkeeper <command>

Commands:
  login [email]        Sign in and store the session
  status               Show the stored session
  validate             Check the stored session against the server
  get <path>           Send an authenticated GET request
  post <path> <json>   Send an authenticated POST request
  logout               Clear the stored session";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

fn load_config() -> Result<SessionConfig> {
    let mut config = SessionConfig::load()?;
    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
        config.base_url = base_url;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = load_config()?;
    let store = Session::open_store(&config)?;
    let session = Session::new(&config, store).context("Failed to initialize session")?;
    info!(command, base_url = %config.base_url, "sessionkeeper starting");

    match (command, &args[1..]) {
        ("login", rest) => login(&session, rest.first().cloned()).await,
        ("status", _) => status(&session),
        ("validate", _) => validate(&session).await,
        ("get", [path]) => request(&session, ApiRequest::get(path.as_str())).await,
        ("post", [path, body]) => {
            let body: Value = serde_json::from_str(body).context("Request body is not valid JSON")?;
            request(&session, ApiRequest::post(path.as_str(), body)).await
        }
        ("logout", _) => {
            session.logout()?;
            println!("Signed out.");
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

async fn login(session: &Session, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| std::env::var(EMAIL_ENV).ok()) {
        Some(email) => email,
        None => prompt_email()?,
    };
    let password = rpassword::prompt_password("Password: ")?;

    println!("\nAuthenticating...");
    let snapshot = session.login(&email, &password).await.map_err(describe)?;
    println!(
        "Login successful! Signed in as {}",
        snapshot.user_id.as_deref().unwrap_or("unknown user")
    );
    Ok(())
}

fn prompt_email() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;

    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    Ok(email.trim().to_string())
}

/// Report what storage holds without contacting the server
fn status(session: &Session) -> Result<()> {
    let (token, user_id) = session.auth().stored_credentials()?;
    let has_refresh = session.auth().refresh_token()?.is_some();
    match (token, user_id) {
        (Some(token), Some(user_id)) => {
            println!("Stored session for {}", user_id);
            println!("  access token:  {}", sessionkeeper_core::utils::mask_token(&token));
            println!("  refresh token: {}", if has_refresh { "present" } else { "missing" });
        }
        _ => println!("No stored session."),
    }
    Ok(())
}

async fn validate(session: &Session) -> Result<()> {
    let outcome = session.validate().await.map_err(describe)?;
    let message = match outcome {
        SessionOutcome::NoCredentials => "No stored session.",
        SessionOutcome::InvalidCredentials => "Stored session was rejected and has been cleared.",
        SessionOutcome::ValidIncomplete => "Session valid, profile incomplete.",
        SessionOutcome::ValidComplete => "Session valid.",
    };
    println!("{}", message);
    Ok(())
}

async fn request(session: &Session, request: ApiRequest) -> Result<()> {
    // Seed in-memory state from storage before sending
    let outcome = session.validate().await.map_err(describe)?;
    if !outcome.is_authenticated() && !request.public {
        anyhow::bail!("Not signed in. Run `sessionkeeper login` first.");
    }

    let response = session.send(request).await.map_err(describe)?;
    match serde_json::from_str::<Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}

/// Turn session errors into messages a person can act on
fn describe(error: ApiError) -> anyhow::Error {
    match error {
        ApiError::Network(e) => {
            anyhow::anyhow!("Unable to connect to server. Check your internet connection. ({})", e)
        }
        ApiError::SessionExpired => anyhow::anyhow!("Session expired. Run `sessionkeeper login` again."),
        ApiError::Http { status: 401, .. } => anyhow::anyhow!("Invalid email or password"),
        other => anyhow::Error::new(other),
    }
}
