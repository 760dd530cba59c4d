//! The request pipeline between the Evently client and its API
//!
//! Every API call goes through an [`ApiClient`], which sends it through a
//! [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware) stack:
//!
//! 1. [`LoadingMiddleware`] tells the user interface a request is underway.
//! 2. [`SessionMiddleware`] renews an expired session and attaches the
//!    session's access token as a bearer token.
//!
//! If the session cannot be renewed, it is cleared, a [`LoginRedirect`] is
//! performed, and the request fails with [`ApiError::SessionExpired`]
//! without ever reaching the server.
//!
//! ```no_run
//! use evently_reqwest::{retry_api_call_or_default, ApiClient, ApiConfig, RetryPolicy};
//! use evently_session::SessionState;
//! # use evently_session::store::MemoryTokenStore;
//!
//! # #[derive(serde::Deserialize)] struct Event;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ApiConfig::from_env()?;
//! let session = SessionState::builder(MemoryTokenStore::new(), config.token_authority()?).build();
//! session.restore().await;
//!
//! let client = ApiClient::builder(config, session).build()?;
//!
//! let events: Vec<Event> =
//!     retry_api_call_or_default(|| client.get("events"), RetryPolicy::default()).await;
//! # Ok(())
//! # }
//! ```
//!
//! The middlewares can also be used on their own in any other
//! `reqwest-middleware` stack. The session middleware can be restricted to
//! particular hosts with a predicate:
//!
//! ```
//! use evently_reqwest::{ApiHost, SessionMiddleware};
//! # use evently_session::{store::MemoryTokenStore, testing::ScriptedAuthority, SessionState};
//! # let session = SessionState::builder(
//! #     MemoryTokenStore::new(),
//! #     ScriptedAuthority::rejecting(reqwest::StatusCode::UNAUTHORIZED),
//! # ).build();
//!
//! let api = "https://api.example.com/v1/".parse().unwrap();
//! SessionMiddleware::new(session).with_predicate(ApiHost::from_url(&api));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod client;
pub mod config;
mod error;
pub mod loading;
mod retry;
mod session;

pub use client::{ApiClient, ApiClientBuilder, ApiRequest};
pub use config::{ApiConfig, ConfigError, Environment};
pub use error::ApiError;
pub use loading::{LoadingMiddleware, LoadingTracker, RequestObserver, SuppressLoading};
pub use retry::{
    retry_api_call, retry_api_call_or_default, safe_api_call, safe_api_call_or_default,
    RetryPolicy,
};
pub use session::{ApiHost, LoginRedirect, NoRedirect, SessionCancelled, SessionMiddleware};
