//! Helpers for tests that need tokens or a token authority
//!
//! Enabled by the `test-util` feature.

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use evently_clock::UnixTime;
use reqwest::StatusCode;

use crate::{
    authority::{AuthorityError, IssuedTokens, RefreshedTokens, TokenAuthority},
    AccessToken, PasswordRef, RefreshToken, RefreshTokenRef,
};

/// Mints an unsigned token carrying `claims` as its payload
pub fn unsigned_token(claims: &serde_json::Value) -> AccessToken {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    AccessToken::new(format!("{header}.{payload}.unsigned"))
}

/// Mints an unsigned token for a test user expiring at `exp`
pub fn token_expiring_at(exp: UnixTime) -> AccessToken {
    unsigned_token(&serde_json::json!({
        "sub": "7",
        "exp": exp.0,
        "is_superuser": false,
        "user_type": "member",
        "email": "test@example.com",
        "username": "test-user",
    }))
}

#[derive(Clone, Debug)]
enum Script {
    Issue {
        access_token: AccessToken,
        refresh_token: Option<RefreshToken>,
    },
    Reject(StatusCode),
}

/// A token authority answering from a script and counting its calls
#[derive(Debug)]
pub struct ScriptedAuthority {
    script: Script,
    delay: Option<Duration>,
    refresh_calls: AtomicUsize,
    login_calls: AtomicUsize,
}

impl ScriptedAuthority {
    fn new(script: Script) -> Self {
        Self {
            script,
            delay: None,
            refresh_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
        }
    }

    /// An authority that issues `access_token`, rotating to `refresh_token` if given
    pub fn issuing(access_token: AccessToken, refresh_token: Option<RefreshToken>) -> Self {
        Self::new(Script::Issue {
            access_token,
            refresh_token,
        })
    }

    /// An authority that rejects every request with `status`
    pub fn rejecting(status: StatusCode) -> Self {
        Self::new(Script::Reject(status))
    }

    /// Waits for `delay` before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of refresh requests received so far
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Number of login requests received so far
    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    async fn answer(&self) -> Script {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script.clone()
    }
}

#[async_trait]
impl TokenAuthority for ScriptedAuthority {
    async fn login(
        &self,
        _username: &str,
        _password: &PasswordRef,
    ) -> Result<IssuedTokens, AuthorityError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        match self.answer().await {
            Script::Issue {
                access_token,
                refresh_token: Some(refresh_token),
            } => Ok(IssuedTokens {
                access_token,
                refresh_token,
            }),
            Script::Issue { .. } => Err(AuthorityError::Rejected {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "login issued no refresh token".to_owned(),
            }),
            Script::Reject(status) => Err(AuthorityError::Rejected {
                status,
                body: String::new(),
            }),
        }
    }

    async fn refresh(
        &self,
        _refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedTokens, AuthorityError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        match self.answer().await {
            Script::Issue {
                access_token,
                refresh_token,
            } => Ok(RefreshedTokens {
                access_token,
                refresh_token,
            }),
            Script::Reject(status) => Err(AuthorityError::Rejected {
                status,
                body: String::new(),
            }),
        }
    }
}
