use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use evently_clock::{Clock, System, UnixTime};
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    authority::{AuthorityError, TokenAuthority},
    inspect::{self, Claims, DecodeError},
    store::{TokenKeys, TokenPair, TokenStore},
    AccessToken, AccessTokenRef, PasswordRef, RefreshToken,
};

/// Who, if anyone, is currently logged in
#[derive(Clone, Debug, PartialEq)]
pub enum SessionStatus {
    /// No session
    LoggedOut,
    /// A session backed by a valid access token
    LoggedIn(Claims),
    /// A refresh is in flight; holds the user of the session being renewed, if any
    Refreshing(Option<Claims>),
}

impl SessionStatus {
    /// The current user's claims, if known
    pub fn user(&self) -> Option<&Claims> {
        match self {
            Self::LoggedIn(claims) => Some(claims),
            Self::Refreshing(claims) => claims.as_ref(),
            Self::LoggedOut => None,
        }
    }
}

/// A failure to establish or renew a session
///
/// Every refresh failure has already ended the session by the time the
/// caller sees it.
#[derive(Clone, Debug, Error)]
pub enum SessionError {
    /// There was no refresh token to exchange
    #[error("no refresh token available")]
    NoRefreshToken,
    /// The token authority could not issue tokens
    #[error("token authority request failed")]
    Authority(#[source] Arc<AuthorityError>),
    /// The authority issued an access token that could not be decoded
    #[error("issued access token could not be decoded")]
    Decode(#[source] Arc<DecodeError>),
    /// The session was logged in or out while the refresh was in flight
    ///
    /// The refreshed tokens were discarded in favor of the newer session.
    #[error("session changed while the token refresh was in flight")]
    Superseded,
    /// The refresh task stopped before producing an outcome
    #[error("token refresh was interrupted")]
    Interrupted,
}

impl From<AuthorityError> for SessionError {
    fn from(error: AuthorityError) -> Self {
        Self::Authority(Arc::new(error))
    }
}

impl From<DecodeError> for SessionError {
    fn from(error: DecodeError) -> Self {
        Self::Decode(Arc::new(error))
    }
}

type RefreshFlight = Shared<BoxFuture<'static, Result<TokenPair, SessionError>>>;

/// The authoritative in-memory record of who is logged in
///
/// A `SessionState` is a handle; clones share the same session. Every change
/// to the session is mirrored into the [`TokenStore`] and published to
/// subscribers.
///
/// Refreshes are single-flight: concurrent callers of [`refresh_token()`][Self::refresh_token]
/// or [`refresh_expired()`][Self::refresh_expired] share one call to the authority and
/// all observe the same outcome. The call runs on its own Tokio task, so it
/// completes even if every caller stops waiting for it.
#[derive(Clone)]
pub struct SessionState {
    inner: Arc<Inner>,
}

struct Inner {
    store: Box<dyn TokenStore>,
    authority: Box<dyn TokenAuthority>,
    keys: TokenKeys,
    clock: Box<dyn Clock + Send + Sync>,
    status: watch::Sender<SessionStatus>,
    generation: Mutex<u64>,
    in_flight: Mutex<Option<RefreshFlight>>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("keys", &self.inner.keys)
            .field("status", &*self.inner.status.borrow())
            .field("generation", &*self.inner.generation())
            .finish_non_exhaustive()
    }
}

/// Configures and builds a [`SessionState`]
pub struct SessionStateBuilder {
    store: Box<dyn TokenStore>,
    authority: Box<dyn TokenAuthority>,
    keys: TokenKeys,
    clock: Box<dyn Clock + Send + Sync>,
}

impl fmt::Debug for SessionStateBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStateBuilder")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl SessionStateBuilder {
    /// Uses a different pair of storage keys, such as [`TokenKeys::ADMIN`]
    pub fn with_keys(mut self, keys: TokenKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Builds the session from whatever is already in the store
    ///
    /// A stored, decodable, unexpired access token with its refresh token
    /// starts the session logged in. Anything else starts logged out; call
    /// [`SessionState::restore()`] to attempt a silent refresh.
    pub fn build(self) -> SessionState {
        let now = self.clock.now();
        let initial = TokenPair::load(&*self.store, self.keys)
            .and_then(|pair| inspect::decode(pair.access_token.as_str()).ok())
            .filter(|claims| !claims.is_expired_at(now))
            .map_or(SessionStatus::LoggedOut, SessionStatus::LoggedIn);

        let (status, _) = watch::channel(initial);

        SessionState {
            inner: Arc::new(Inner {
                store: self.store,
                authority: self.authority,
                keys: self.keys,
                clock: self.clock,
                status,
                generation: Mutex::new(0),
                in_flight: Mutex::new(None),
            }),
        }
    }
}

impl SessionState {
    /// Starts building a session over `store`, obtaining tokens from `authority`
    ///
    /// Uses [`TokenKeys::USER`] and the system clock unless configured otherwise.
    pub fn builder(
        store: impl TokenStore + 'static,
        authority: impl TokenAuthority + 'static,
    ) -> SessionStateBuilder {
        SessionStateBuilder {
            store: Box::new(store),
            authority: Box::new(authority),
            keys: TokenKeys::USER,
            clock: Box::new(System),
        }
    }

    /// Brings the session in line with the store at start-up
    ///
    /// A valid stored access token keeps the session. An expired one is
    /// silently refreshed if a refresh token is available. Anything else
    /// clears the store and leaves the session logged out.
    pub async fn restore(&self) -> SessionStatus {
        if self.is_logged_in() {
            return self.status();
        }

        match TokenPair::load(&*self.inner.store, self.inner.keys) {
            Some(pair) => match inspect::decode(pair.access_token.as_str()) {
                Ok(_) => {
                    tracing::debug!("stored access token has expired, attempting refresh");
                    if let Err(error) = self.refresh_token().await {
                        tracing::info!(
                            error = (&error as &dyn error::Error),
                            "unable to restore session"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "stored access token is malformed, clearing session"
                    );
                    self.logout();
                }
            },
            None => self.logout(),
        }

        self.status()
    }

    /// Establishes a session from a freshly issued token pair
    ///
    /// Fails, leaving the session untouched, if `access_token` cannot be
    /// decoded.
    pub fn login(
        &self,
        access_token: AccessToken,
        refresh_token: RefreshToken,
    ) -> Result<Claims, DecodeError> {
        self.inner.login(TokenPair {
            access_token,
            refresh_token,
        })
    }

    /// Exchanges a username and password for a new session
    pub async fn login_with_password(
        &self,
        username: &str,
        password: &PasswordRef,
    ) -> Result<Claims, SessionError> {
        let issued = self.inner.authority.login(username, password).await?;
        Ok(self.login(issued.access_token, issued.refresh_token)?)
    }

    /// Ends the session and forgets both tokens
    ///
    /// Calling this on a session that is already logged out is harmless.
    pub fn logout(&self) {
        self.inner.logout();
    }

    /// Exchanges the stored refresh token for a new access token
    ///
    /// Without a refresh token, the session is logged out immediately. Any
    /// failure is terminal for the session and is not retried.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub async fn refresh_token(&self) -> Result<TokenPair, SessionError> {
        self.join_refresh(None).await
    }

    /// Renews the session because `seen` was found to be expired
    ///
    /// If another participant has already replaced `seen` with a valid token,
    /// that token is returned without contacting the authority.
    pub async fn refresh_expired(&self, seen: &AccessTokenRef) -> Result<TokenPair, SessionError> {
        self.join_refresh(Some(seen)).await
    }

    async fn join_refresh(&self, seen: Option<&AccessTokenRef>) -> Result<TokenPair, SessionError> {
        let flight = {
            let mut slot = self.inner.in_flight();
            if let Some(flight) = slot.as_ref() {
                tracing::debug!("joining in-flight token refresh");
                flight.clone()
            } else {
                if let Some(pair) = seen.and_then(|seen| self.inner.superseding_pair(seen)) {
                    tracing::debug!("token already refreshed by another caller");
                    return Ok(pair);
                }

                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move { inner.run_refresh().await });
                let flight = async move {
                    task.await.unwrap_or_else(|error| {
                        tracing::error!(
                            error = (&error as &dyn error::Error),
                            "token refresh task failed"
                        );
                        Err(SessionError::Interrupted)
                    })
                }
                .boxed()
                .shared();
                *slot = Some(flight.clone());
                flight
            }
        };

        flight.await
    }

    /// A snapshot of the current status
    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Subscribes to status changes
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// The current user's claims, if logged in
    pub fn user(&self) -> Option<Claims> {
        self.inner.status.borrow().user().cloned()
    }

    /// Whether a user is logged in with a valid access token
    pub fn is_logged_in(&self) -> bool {
        matches!(*self.inner.status.borrow(), SessionStatus::LoggedIn(_))
    }

    /// The stored access token, if any
    pub fn access_token(&self) -> Option<AccessToken> {
        self.inner.store.get(self.inner.keys.access).map(AccessToken::new)
    }

    /// Whether a refresh token is stored
    pub fn has_refresh_token(&self) -> bool {
        self.inner.store.get(self.inner.keys.refresh).is_some()
    }

    /// Whether `token` is expired according to this session's clock
    pub fn is_expired(&self, token: &AccessTokenRef) -> bool {
        inspect::is_expired_at(Some(token.as_str()), self.now())
    }

    /// Signed seconds until the stored access token expires
    ///
    /// `None` if there is no token or it cannot be decoded.
    pub fn seconds_until_expiry(&self) -> Option<i64> {
        let token = self.access_token()?;
        inspect::decode(token.as_str())
            .ok()?
            .seconds_until_expiry_at(self.now())
    }

    /// Whether the session is valid but will expire within `threshold_secs`
    pub fn in_warning_window(&self, threshold_secs: i64) -> bool {
        matches!(self.seconds_until_expiry(), Some(left) if 0 < left && left < threshold_secs)
    }

    /// The storage keys used by this session
    pub fn keys(&self) -> TokenKeys {
        self.inner.keys
    }

    /// The current time according to this session's clock
    pub fn now(&self) -> UnixTime {
        self.inner.clock.now()
    }
}

/// Empties the refresh slot when the refresh task ends, even by panicking
struct Landing<'a>(&'a Mutex<Option<RefreshFlight>>);

impl Drop for Landing<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, Option<RefreshFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts logins and logouts; held while the store and status change together
    fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn login(&self, pair: TokenPair) -> Result<Claims, DecodeError> {
        let claims = inspect::decode(pair.access_token.as_str())?;

        let mut generation = self.generation();
        *generation += 1;
        self.establish(&pair, claims.clone());

        Ok(claims)
    }

    fn logout(&self) {
        let mut generation = self.generation();
        *generation += 1;
        self.clear();
    }

    fn establish(&self, pair: &TokenPair, claims: Claims) {
        pair.persist(&*self.store, self.keys);

        tracing::info!(
            keys = self.keys.access,
            user = claims.username.as_deref().unwrap_or_default(),
            expiry = claims.exp.map(|e| e.0),
            "session established"
        );

        self.status.send_replace(SessionStatus::LoggedIn(claims));
    }

    fn clear(&self) {
        TokenPair::clear(&*self.store, self.keys);
        let previous = self.status.send_replace(SessionStatus::LoggedOut);

        if previous != SessionStatus::LoggedOut {
            tracing::info!(keys = self.keys.access, "session ended");
        }
    }

    /// The stored pair, if it has replaced `seen` with a token that is still valid
    fn superseding_pair(&self, seen: &AccessTokenRef) -> Option<TokenPair> {
        let now = self.clock.now();
        TokenPair::load(&*self.store, self.keys).filter(|pair| {
            pair.access_token.as_str() != seen.as_str()
                && !inspect::is_expired_at(Some(pair.access_token.as_str()), now)
        })
    }

    async fn run_refresh(&self) -> Result<TokenPair, SessionError> {
        let _landing = Landing(&self.in_flight);
        self.exchange_refresh_token().await
    }

    async fn exchange_refresh_token(&self) -> Result<TokenPair, SessionError> {
        let Some(refresh_token) = self.store.get(self.keys.refresh).map(RefreshToken::new) else {
            tracing::info!("no refresh token available, ending session");
            self.logout();
            return Err(SessionError::NoRefreshToken);
        };

        let started = *self.generation();
        self.status.send_modify(|status| {
            let user = status.user().cloned();
            *status = SessionStatus::Refreshing(user);
        });

        tracing::debug!("requesting new access token");
        let refreshed = self.authority.refresh(&refresh_token).await;
        let outcome = refreshed
            .map_err(SessionError::from)
            .and_then(|refreshed| {
                let pair = TokenPair {
                    access_token: refreshed.access_token,
                    refresh_token: refreshed.refresh_token.unwrap_or(refresh_token),
                };
                let claims = inspect::decode(pair.access_token.as_str())?;
                Ok((pair, claims))
            });

        // A login or logout that happened while the refresh was in flight wins
        let mut generation = self.generation();
        if *generation != started {
            drop(generation);
            tracing::debug!(
                refreshed = outcome.is_ok(),
                "session changed during refresh, discarding outcome"
            );
            return Err(SessionError::Superseded);
        }
        *generation += 1;

        match outcome {
            Ok((pair, claims)) => {
                self.establish(&pair, claims);
                Ok(pair)
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "token refresh failed"
                );
                self.clear();
                Err(error)
            }
        }
    }
}
