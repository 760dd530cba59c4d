//! The server endpoints that issue and renew tokens

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{AccessToken, PasswordRef, RefreshToken, RefreshTokenRef};

/// Tokens issued by a successful login
#[derive(Clone, Debug, Deserialize)]
pub struct IssuedTokens {
    /// The new access token
    pub access_token: AccessToken,
    /// The new refresh token
    pub refresh_token: RefreshToken,
}

/// Tokens issued by a successful refresh
///
/// The authority may or may not rotate the refresh token. When it does not,
/// the caller keeps using the refresh token it already has.
#[derive(Clone, Debug)]
pub struct RefreshedTokens {
    /// The new access token
    pub access_token: AccessToken,
    /// A rotated refresh token, if the authority issued one
    pub refresh_token: Option<RefreshToken>,
}

#[derive(Debug, Serialize)]
struct LoginForm<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a RefreshTokenRef,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<AccessToken>,
    #[serde(default)]
    refresh_token: Option<RefreshToken>,
}

/// An error while asking the authority for tokens
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The authority answered with a non-success status
    #[error("authority rejected the request with status {status}: {body}")]
    Rejected {
        /// The response status
        status: StatusCode,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBody(#[from] serde_json::Error),
    /// The authority answered successfully but issued no access token
    #[error("authority response did not include an access token")]
    MissingAccessToken,
    /// Unable to read the response
    #[error("error reading response body")]
    BodyRead(#[source] reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
}

/// The source of session tokens
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    /// Exchanges a username and password for a token pair
    async fn login(
        &self,
        username: &str,
        password: &PasswordRef,
    ) -> Result<IssuedTokens, AuthorityError>;

    /// Exchanges a refresh token for a new access token
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedTokens, AuthorityError>;
}

#[async_trait]
impl<T: TokenAuthority + ?Sized> TokenAuthority for Arc<T> {
    async fn login(
        &self,
        username: &str,
        password: &PasswordRef,
    ) -> Result<IssuedTokens, AuthorityError> {
        (**self).login(username, password).await
    }

    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedTokens, AuthorityError> {
        (**self).refresh(refresh_token).await
    }
}

/// The Evently API's login and refresh endpoints
#[derive(Clone, Debug)]
pub struct HttpTokenAuthority {
    client: reqwest::Client,
    login_url: reqwest::Url,
    refresh_url: reqwest::Url,
}

impl HttpTokenAuthority {
    /// Constructs an authority from the full URLs of both endpoints
    pub fn new(client: reqwest::Client, login_url: reqwest::Url, refresh_url: reqwest::Url) -> Self {
        Self {
            client,
            login_url,
            refresh_url,
        }
    }
}

#[async_trait]
impl TokenAuthority for HttpTokenAuthority {
    #[tracing::instrument(err, skip(self, password), fields(login_url = %self.login_url))]
    async fn login(
        &self,
        username: &str,
        password: &PasswordRef,
    ) -> Result<IssuedTokens, AuthorityError> {
        tracing::trace!("requesting login from authority");

        let req = self.client.post(self.login_url.clone()).form(&LoginForm {
            username,
            password: password.as_str(),
        });
        let body = send_for_body(req).await?;
        let tokens: IssuedTokens = serde_json::from_slice(&body)?;

        tracing::info!("received tokens for new session");
        Ok(tokens)
    }

    #[tracing::instrument(err, skip_all, fields(refresh_url = %self.refresh_url))]
    async fn refresh(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<RefreshedTokens, AuthorityError> {
        tracing::trace!("requesting token refresh from authority");

        let req = self
            .client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token });
        let body = send_for_body(req).await?;
        let resp: RefreshResponse = serde_json::from_slice(&body)?;

        let access_token = resp.access_token.ok_or(AuthorityError::MissingAccessToken)?;

        tracing::info!(
            has_refresh_token = resp.refresh_token.is_some(),
            "received refreshed tokens"
        );

        Ok(RefreshedTokens {
            access_token,
            refresh_token: resp.refresh_token,
        })
    }
}

async fn send_for_body(req: reqwest::RequestBuilder) -> Result<bytes::Bytes, AuthorityError> {
    let resp = req.send().await.map_err(AuthorityError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received response from token authority"
    );

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.map_err(AuthorityError::BodyRead)?;
        return Err(AuthorityError::Rejected { status, body });
    }

    resp.bytes().await.map_err(AuthorityError::BodyRead)
}
