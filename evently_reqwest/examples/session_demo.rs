use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use evently_reqwest::{
    retry_api_call_or_default, ApiClient, ApiConfig, LoadingTracker, LoginRedirect, RetryPolicy,
};
use evently_session::{
    expiry::{ExpiryPrompt, ExpiryWarning, ExpiryWatch, DEFAULT_CHECK_PERIOD},
    store::FileTokenStore,
    Password, SessionState, SessionStatus,
};
use serde::Deserialize;
use tokio::time;

#[derive(Debug, Parser)]
#[command(about = "Signs in to the Evently API and keeps the session alive")]
struct Opts {
    /// The user to sign in as, if no session was saved
    #[arg(short, long, env = "EVENTHUB_USERNAME")]
    username: Option<String>,

    /// The user's password
    #[arg(short, long, env = "EVENTHUB_PASSWORD", hide_env_values = true)]
    password: Option<Password>,

    /// The local file used to persist the session
    #[arg(
        short = 'f',
        long,
        env = "EVENTHUB_TOKEN_FILE",
        value_name = "FILE",
        default_value = ".evently-session.json"
    )]
    token_file: PathBuf,

    /// How many times to fetch the event list before exiting
    #[arg(short, long, default_value_t = 3)]
    rounds: u32,
}

#[derive(Debug, Deserialize)]
struct Event {
    id: u64,
    title: String,
}

/// Renews the session automatically, as a user who always chooses to continue would
#[derive(Debug)]
struct ConsoleWarning;

impl ExpiryWarning for ConsoleWarning {
    fn show(&self, seconds_left: u64, prompt: ExpiryPrompt) {
        tracing::warn!(seconds_left, "session about to expire, continuing");
        tokio::spawn(async move {
            if let Err(error) = prompt.continue_session().await {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "unable to continue session"
                );
            }
        });
    }

    fn dismiss(&self) {
        tracing::debug!("expiry warning dismissed");
    }
}

#[derive(Debug)]
struct ConsoleRedirect;

impl LoginRedirect for ConsoleRedirect {
    fn redirect_to_login(&self) {
        tracing::error!("session expired, sign in again with --username and --password");
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let config = ApiConfig::from_env()?;

    let session =
        SessionState::builder(FileTokenStore::open(&opts.token_file), config.token_authority()?)
            .build();

    if let SessionStatus::LoggedOut = session.restore().await {
        match (&opts.username, &opts.password) {
            (Some(username), Some(password)) => {
                let user = session.login_with_password(username, password).await?;
                tracing::info!(user = user.username.as_deref(), "signed in");
            }
            _ => color_eyre::eyre::bail!("no saved session, provide --username and --password"),
        }
    }

    let _watch = ExpiryWatch::new(session.clone(), ConsoleWarning).spawn(DEFAULT_CHECK_PERIOD);

    let tracker = Arc::new(LoadingTracker::new());
    let mut messages = tracker.subscribe();
    tokio::spawn(async move {
        while messages.changed().await.is_ok() {
            if let Some(message) = messages.borrow_and_update().as_deref() {
                tracing::info!(progress = message, "loading");
            }
        }
    });

    let client = ApiClient::builder(config, session.clone())
        .with_observer(Arc::clone(&tracker))
        .with_login_redirect(ConsoleRedirect)
        .build()?;

    let mut interval = time::interval(Duration::from_secs(10));
    for _ in 0..opts.rounds {
        interval.tick().await;

        let events: Vec<Event> =
            retry_api_call_or_default(|| client.get("events"), RetryPolicy::default()).await;

        tracing::info!(
            count = events.len(),
            seconds_until_expiry = session.seconds_until_expiry(),
            "fetched events"
        );
        for event in &events {
            tracing::debug!(id = event.id, title = %event.title, "event");
        }
    }

    Ok(())
}
