//! Client-side session management for the Evently API
//!
//! A session is an access token and the refresh token issued alongside it.
//! This crate keeps that pair in a [`TokenStore`], decodes the access token's
//! claims to learn who is logged in and when the token stops being useful,
//! renews it through a [`TokenAuthority`][authority::TokenAuthority], and warns
//! the user before it runs out.
//!
//! # General flow
//!
//! On start-up, build a [`SessionState`] over the store and the authority and
//! let it reconcile itself with whatever was persisted by a previous run.
//! Then spawn an [`ExpiryWatch`][expiry::ExpiryWatch] so the user is asked
//! whether to continue shortly before the token expires.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use evently_session::{
//!     authority::HttpTokenAuthority,
//!     expiry::{ExpiryPrompt, ExpiryWarning, ExpiryWatch, DEFAULT_CHECK_PERIOD},
//!     store::FileTokenStore,
//!     SessionState,
//! };
//!
//! # #[derive(Debug)]
//! # struct Console;
//! # impl ExpiryWarning for Console {
//! #     fn show(&self, _: u64, _: ExpiryPrompt) {}
//! #     fn dismiss(&self) {}
//! # }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let base = reqwest::Url::parse("http://localhost:8000/api/")?;
//! let authority = HttpTokenAuthority::new(
//!     reqwest::Client::new(),
//!     base.join("auth/login")?,
//!     base.join("auth/refresh")?,
//! );
//!
//! let session = SessionState::builder(FileTokenStore::open("tokens.json"), authority).build();
//! session.restore().await;
//!
//! let _watch = ExpiryWatch::new(session.clone(), Console).spawn(DEFAULT_CHECK_PERIOD);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `test-util`: Exposes the [`testing`] module, with helpers for minting
//!   unsigned tokens and scripting a token authority.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod authority;
mod braids;
pub mod expiry;
pub mod inspect;
mod session;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

pub use braids::*;
pub use inspect::{Claims, DecodeError};
pub use session::{SessionError, SessionState, SessionStateBuilder, SessionStatus};
pub use store::{TokenKeys, TokenPair, TokenStore};
