use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use evently_session::{AccessToken, SessionError, SessionState};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, Url};
use reqwest_middleware::{Middleware, Next, Result};
use thiserror::Error;

/// Sends the user back to the login screen once their session cannot be renewed
pub trait LoginRedirect: Send + Sync {
    /// Performs the redirect
    fn redirect_to_login(&self);
}

impl<T: LoginRedirect + ?Sized> LoginRedirect for Arc<T> {
    fn redirect_to_login(&self) {
        (**self).redirect_to_login()
    }
}

/// A redirect that does nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRedirect;

impl LoginRedirect for NoRedirect {
    fn redirect_to_login(&self) {}
}

/// A request was cancelled because its session expired and could not be renewed
///
/// The session has already been cleared by the time this error is observed.
#[derive(Debug, Error)]
#[error("session expired and could not be renewed, request cancelled")]
pub struct SessionCancelled {
    #[source]
    cause: SessionError,
}

impl SessionCancelled {
    /// Wraps the refresh failure that ended the session
    pub fn new(cause: SessionError) -> Self {
        Self { cause }
    }

    /// Why the session could not be renewed
    pub fn cause(&self) -> &SessionError {
        &self.cause
    }
}

/// A middleware that renews an expired session and attaches its access token
///
/// Before each request is sent, the stored access token is read. An expired
/// token is exchanged for a new one first, sharing a single call to the token
/// authority with any other request doing the same. If the session cannot be
/// renewed, it is cleared, the user is redirected to log in, and the request
/// fails with [`SessionCancelled`] without reaching the server.
///
/// Requests without a token are sent unauthenticated. A request that already
/// carries an `Authorization` header is left alone.
pub struct SessionMiddleware<P> {
    session: SessionState,
    redirect: Arc<dyn LoginRedirect>,
    predicate: P,
}

impl<P: fmt::Debug> fmt::Debug for SessionMiddleware<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMiddleware")
            .field("session", &self.session)
            .field("predicate", &self.predicate)
            .finish_non_exhaustive()
    }
}

impl<P: Clone> Clone for SessionMiddleware<P> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            redirect: Arc::clone(&self.redirect),
            predicate: self.predicate.clone(),
        }
    }
}

impl SessionMiddleware<predicates::constant::BooleanPredicate> {
    /// Constructs a new middleware over a session
    ///
    /// By default, every request is considered for a token. Use
    /// [`with_predicate()`][Self::with_predicate()] to restrict the token to
    /// specific hosts, such as with [`ApiHost`].
    pub fn new(session: SessionState) -> Self {
        Self {
            session,
            redirect: Arc::new(NoRedirect),
            predicate: predicate::always(),
        }
    }
}

impl<P> SessionMiddleware<P> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> SessionMiddleware<Q> {
        SessionMiddleware {
            session: self.session,
            redirect: self.redirect,
            predicate,
        }
    }

    /// Sets the redirect performed when the session cannot be renewed
    pub fn with_login_redirect(mut self, redirect: impl LoginRedirect + 'static) -> Self {
        self.redirect = Arc::new(redirect);
        self
    }

    async fn current_token(&self) -> std::result::Result<Option<AccessToken>, SessionCancelled> {
        let Some(token) = self.session.access_token() else {
            return Ok(None);
        };

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!(
                token.until_expired = self.session.seconds_until_expiry(),
                "obtained access token"
            );
        }

        if !self.session.is_expired(&token) {
            return Ok(Some(token));
        }

        tracing::debug!("access token expired, renewing before sending request");
        match self.session.refresh_expired(&token).await {
            Ok(pair) => Ok(Some(pair.access_token)),
            Err(cause) => {
                if let Some(current) = self
                    .session
                    .access_token()
                    .filter(|current| !self.session.is_expired(current))
                {
                    tracing::debug!(
                        error = (&cause as &dyn std::error::Error),
                        "refresh failed but the session was re-established, sending request"
                    );
                    return Ok(Some(current));
                }

                tracing::info!(
                    error = (&cause as &dyn std::error::Error),
                    "unable to renew session, cancelling request"
                );
                self.redirect.redirect_to_login();
                Err(SessionCancelled::new(cause))
            }
        }
    }
}

fn bearer(token: &AccessToken) -> Option<header::HeaderValue> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());

    match header::HeaderValue::from_maybe_shared(header_value.freeze()) {
        Ok(mut value) => {
            value.set_sensitive(true);
            Some(value)
        }
        Err(_) => {
            tracing::warn!("stored access token is not a valid header value, sending without it");
            None
        }
    }
}

#[async_trait::async_trait]
impl<P> Middleware for SessionMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.predicate.eval(&req) && !req.headers().contains_key(header::AUTHORIZATION) {
            let token = self
                .current_token()
                .await
                .map_err(reqwest_middleware::Error::middleware)?;

            if let Some(value) = token.as_ref().and_then(bearer) {
                req.headers_mut().insert(header::AUTHORIZATION, value);
            }
        }

        next.run(req, extensions).await
    }
}

/// Only attach the session's token to requests bound for the API's own host and port
#[derive(Clone, Debug)]
pub struct ApiHost {
    host: String,
    port: Option<u16>,
}

impl ApiHost {
    /// Constructs a predicate matching the host and port of `url`
    pub fn from_url(url: &Url) -> Self {
        Self {
            host: url.host_str().unwrap_or_default().to_owned(),
            port: url.port_or_known_default(),
        }
    }
}

impl Predicate<Request> for ApiHost {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host) && req.url().port_or_known_default() == self.port
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result)
                    .add_product(reflection::Product::new(
                        "host",
                        req.url()
                            .host_str()
                            .unwrap_or("<value not valid utf-8>")
                            .to_owned(),
                    ))
                    .add_product(reflection::Product::new(
                        "port",
                        req.url().port_or_known_default().unwrap_or_default(),
                    )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ApiHost {}
impl fmt::Display for ApiHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use evently_clock::{DurationSecs, TestClock, UnixTime};
    use evently_session::{
        store::MemoryTokenStore,
        testing::{token_expiring_at, ScriptedAuthority},
        RefreshToken, TokenStore,
    };
    use reqwest::{Client, StatusCode};
    use reqwest_middleware::ClientBuilder;

    use super::*;

    const NOW: UnixTime = UnixTime(1_700_000_000);

    fn valid_token() -> AccessToken {
        token_expiring_at(NOW + DurationSecs(3600))
    }

    fn expired_token() -> AccessToken {
        token_expiring_at(NOW - DurationSecs(1))
    }

    struct AuthChecker {
        expected_authorization: String,
        checked: AtomicUsize,
    }

    impl AuthChecker {
        pub fn new(expected: impl Into<String>) -> Self {
            Self {
                expected_authorization: expected.into(),
                checked: AtomicUsize::new(0),
            }
        }

        fn bearer(token: &AccessToken) -> Self {
            Self::new(format!("Bearer {}", token.as_str()))
        }
    }

    #[async_trait::async_trait]
    impl Middleware for AuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization_header = req
                .headers()
                .get(header::AUTHORIZATION)
                .expect("no authorization header")
                .to_str()
                .expect("authorization header was not valid UTF-8");

            assert_eq!(authorization_header, self.expected_authorization);
            self.checked.fetch_add(1, Ordering::AcqRel);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Default)]
    struct NoAuthChecker {
        checked: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Middleware for NoAuthChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            assert_eq!(req.headers().get(header::AUTHORIZATION), None);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    #[derive(Default)]
    struct Unreachable;

    #[async_trait::async_trait]
    impl Middleware for Unreachable {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            panic!("request to {} should have been cancelled", req.url());
        }
    }

    #[derive(Default)]
    struct RecordingRedirect {
        redirects: AtomicUsize,
    }

    impl LoginRedirect for RecordingRedirect {
        fn redirect_to_login(&self) {
            self.redirects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        store: Arc<MemoryTokenStore>,
        authority: Arc<ScriptedAuthority>,
        redirect: Arc<RecordingRedirect>,
        session: SessionState,
    }

    impl Fixture {
        fn new(authority: ScriptedAuthority) -> Self {
            let store = Arc::new(MemoryTokenStore::new());
            let authority = Arc::new(authority);
            let session = SessionState::builder(Arc::clone(&store), Arc::clone(&authority))
                .with_clock(TestClock::new(NOW))
                .build();

            Self {
                store,
                authority,
                redirect: Arc::new(RecordingRedirect::default()),
                session,
            }
        }

        fn middleware(&self) -> SessionMiddleware<predicates::constant::BooleanPredicate> {
            SessionMiddleware::new(self.session.clone())
                .with_login_redirect(Arc::clone(&self.redirect))
        }

        fn client(&self, terminal: Arc<impl Middleware>) -> reqwest_middleware::ClientWithMiddleware {
            ClientBuilder::new(Client::default())
                .with(self.middleware())
                .with_arc(terminal)
                .build()
        }

        fn redirects(&self) -> usize {
            self.redirect.redirects.load(Ordering::SeqCst)
        }
    }

    mod when_token_is_valid {
        use super::*;

        #[tokio::test]
        async fn middleware_attaches_access_token() {
            let f = Fixture::new(ScriptedAuthority::rejecting(StatusCode::UNAUTHORIZED));
            f.session
                .login(valid_token(), RefreshToken::from_static("r1"))
                .unwrap();
            let auth_checker = Arc::new(AuthChecker::bearer(&valid_token()));

            let resp = f
                .client(auth_checker.clone())
                .get("https://api.example.com/events")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(auth_checker.checked.load(Ordering::Acquire), 1);
            assert_eq!(f.authority.refresh_calls(), 0);
        }

        #[tokio::test]
        async fn existing_authorization_header_is_kept() {
            let f = Fixture::new(ScriptedAuthority::rejecting(StatusCode::UNAUTHORIZED));
            f.session
                .login(valid_token(), RefreshToken::from_static("r1"))
                .unwrap();
            let auth_checker = Arc::new(AuthChecker::new("Bearer overridden!"));

            f.client(auth_checker.clone())
                .get("https://api.example.com/events")
                .bearer_auth("overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(auth_checker.checked.load(Ordering::Acquire), 1);
        }
    }

    mod when_there_is_no_session {
        use super::*;

        #[tokio::test]
        async fn request_is_sent_unauthenticated() {
            let f = Fixture::new(ScriptedAuthority::issuing(valid_token(), None));
            let no_auth = Arc::new(NoAuthChecker::default());

            f.client(no_auth.clone())
                .get("https://api.example.com/events")
                .send()
                .await
                .unwrap();

            assert!(no_auth.checked.load(Ordering::Acquire));
            assert_eq!(f.authority.refresh_calls(), 0);
            assert_eq!(f.redirects(), 0);
        }
    }

    mod when_token_is_expired {
        use super::*;

        #[tokio::test]
        async fn refreshes_once_then_sends_new_token() {
            let f = Fixture::new(ScriptedAuthority::issuing(
                valid_token(),
                Some(RefreshToken::from_static("r2")),
            ));
            f.session
                .login(expired_token(), RefreshToken::from_static("r1"))
                .unwrap();
            let auth_checker = Arc::new(AuthChecker::bearer(&valid_token()));

            f.client(auth_checker.clone())
                .get("https://api.example.com/events")
                .send()
                .await
                .unwrap();

            assert_eq!(f.authority.refresh_calls(), 1);
            assert_eq!(auth_checker.checked.load(Ordering::Acquire), 1);
            assert_eq!(f.store.get("refresh_token").as_deref(), Some("r2"));
        }

        #[tokio::test]
        async fn without_refresh_token_request_is_cancelled() {
            let f = Fixture::new(ScriptedAuthority::issuing(valid_token(), None));
            f.store.set("access_token", expired_token().as_str());

            let result = f
                .client(Arc::new(Unreachable))
                .get("https://api.example.com/events")
                .send()
                .await;

            let error = result.expect_err("request should not succeed");
            assert!(matches!(
                &error,
                reqwest_middleware::Error::Middleware(inner) if inner.is::<SessionCancelled>()
            ));
            assert_eq!(f.authority.refresh_calls(), 0);
            assert_eq!(f.store.get("access_token"), None);
            assert_eq!(f.redirects(), 1);
        }

        #[tokio::test]
        async fn failed_refresh_cancels_request_and_clears_session() {
            let f = Fixture::new(ScriptedAuthority::rejecting(StatusCode::UNAUTHORIZED));
            f.session
                .login(expired_token(), RefreshToken::from_static("r1"))
                .unwrap();

            let result = f
                .client(Arc::new(Unreachable))
                .get("https://api.example.com/events")
                .send()
                .await;

            assert!(result.is_err());
            assert_eq!(f.authority.refresh_calls(), 1);
            assert_eq!(f.store.get("refresh_token"), None);
            assert!(!f.session.is_logged_in());
            assert_eq!(f.redirects(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn failed_refresh_defers_to_a_newer_login() {
            let f = Fixture::new(
                ScriptedAuthority::rejecting(StatusCode::UNAUTHORIZED)
                    .with_delay(Duration::from_millis(250)),
            );
            f.session
                .login(expired_token(), RefreshToken::from_static("r1"))
                .unwrap();
            let auth_checker = Arc::new(AuthChecker::bearer(&valid_token()));
            let client = f.client(auth_checker.clone());

            let session = f.session.clone();
            let relogin = async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                session
                    .login(valid_token(), RefreshToken::from_static("r9"))
                    .unwrap();
            };

            let (result, ()) = tokio::join!(
                client.get("https://api.example.com/events").send(),
                relogin,
            );

            result.unwrap();
            assert_eq!(auth_checker.checked.load(Ordering::Acquire), 1);
            assert_eq!(f.redirects(), 0);
            assert!(f.session.is_logged_in());
        }

        #[tokio::test(start_paused = true)]
        async fn concurrent_requests_share_one_refresh() {
            let f = Fixture::new(
                ScriptedAuthority::issuing(valid_token(), None)
                    .with_delay(Duration::from_millis(250)),
            );
            f.session
                .login(expired_token(), RefreshToken::from_static("r1"))
                .unwrap();
            let auth_checker = Arc::new(AuthChecker::bearer(&valid_token()));
            let client = f.client(auth_checker.clone());

            let (a, b) = tokio::join!(
                client.get("https://api.example.com/events").send(),
                client.get("https://api.example.com/tickets").send(),
            );

            a.unwrap();
            b.unwrap();
            assert_eq!(f.authority.refresh_calls(), 1);
            assert_eq!(auth_checker.checked.load(Ordering::Acquire), 2);
        }
    }

    mod when_predicate_evaluates_to_ignore {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_attach_access_token() {
            let f = Fixture::new(ScriptedAuthority::rejecting(StatusCode::UNAUTHORIZED));
            f.session
                .login(expired_token(), RefreshToken::from_static("r1"))
                .unwrap();
            let no_auth = Arc::new(NoAuthChecker::default());

            let client = ClientBuilder::new(Client::default())
                .with(f.middleware().with_predicate(ApiHost::from_url(
                    &"https://api.example.com/".parse().unwrap(),
                )))
                .with_arc(no_auth.clone())
                .build();

            client
                .get("https://cdn.example.com/banner.png")
                .send()
                .await
                .unwrap();

            assert!(no_auth.checked.load(Ordering::Acquire));
            assert_eq!(f.authority.refresh_calls(), 0);
        }
    }

    mod api_host_predicate {
        use super::*;

        fn api_host() -> ApiHost {
            ApiHost::from_url(&"http://localhost:8000/api/v1/".parse().unwrap())
        }

        #[test]
        fn matches_when_request_has_same_host_and_port() {
            let request = Request::new(
                reqwest::Method::GET,
                "http://localhost:8000/api/v1/events".parse().unwrap(),
            );
            let predicate = api_host();
            let result = dbg!(predicate.find_case(true, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_different_port() {
            let request = Request::new(
                reqwest::Method::GET,
                "http://localhost:9000/api/v1/events".parse().unwrap(),
            );
            let predicate = api_host();
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }

        #[test]
        fn does_not_match_when_request_has_different_host() {
            let request = Request::new(
                reqwest::Method::GET,
                "http://does-not-match.com:8000/".parse().unwrap(),
            );
            let predicate = api_host();
            let result = dbg!(predicate.find_case(false, &request));
            assert!(result.is_none())
        }
    }
}
