use std::{fmt, sync::Arc};

use evently_session::SessionState;
use reqwest::{header, Method, Response, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    config::{ApiConfig, ConfigError},
    loading::{LoadingMiddleware, NoopObserver, RequestObserver, SuppressLoading},
    session::{ApiHost, LoginRedirect, NoRedirect, SessionMiddleware},
    ApiError,
};

/// The Evently API, reached through the session-aware request pipeline
///
/// Construct one at start-up and share it; clones share both pipelines.
///
/// Ordinary calls go through the default pipeline, which reports loading
/// signals and uses the configured default timeout. Calls marked with
/// [`ApiRequest::long_timeout()`] go through the long pipeline, which uses
/// the long timeout and reports no loading signals.
#[derive(Clone)]
pub struct ApiClient {
    config: Arc<ApiConfig>,
    session: SessionState,
    default: ClientWithMiddleware,
    long: ClientWithMiddleware,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("config", &self.config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Configures and builds an [`ApiClient`]
pub struct ApiClientBuilder {
    config: ApiConfig,
    session: SessionState,
    observer: Arc<dyn RequestObserver>,
    redirect: Arc<dyn LoginRedirect>,
}

impl fmt::Debug for ApiClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClientBuilder")
            .field("config", &self.config)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ApiClientBuilder {
    /// Reports loading signals of the default pipeline to `observer`
    pub fn with_observer(mut self, observer: impl RequestObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Performs `redirect` when a request finds the session cannot be renewed
    pub fn with_login_redirect(mut self, redirect: impl LoginRedirect + 'static) -> Self {
        self.redirect = Arc::new(redirect);
        self
    }

    /// Builds both pipelines
    pub fn build(self) -> Result<ApiClient, ConfigError> {
        let api_host = ApiHost::from_url(self.config.base_url());
        let session_middleware = SessionMiddleware::new(self.session.clone())
            .with_login_redirect(Arc::clone(&self.redirect))
            .with_predicate(api_host);

        let default = ClientBuilder::new(self.config.http_client(self.config.timeout())?)
            .with(LoadingMiddleware::new(Arc::clone(&self.observer)))
            .with(session_middleware.clone())
            .build();

        let long = ClientBuilder::new(self.config.http_client(self.config.long_timeout())?)
            .with(session_middleware)
            .build();

        Ok(ApiClient {
            config: Arc::new(self.config),
            session: self.session,
            default,
            long,
        })
    }
}

impl ApiClient {
    /// Starts building a client for the API described by `config`
    pub fn builder(config: ApiConfig, session: SessionState) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            session,
            observer: Arc::new(NoopObserver),
            redirect: Arc::new(NoRedirect),
        }
    }

    /// The API configuration
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// The session whose token is attached to requests
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Starts a request to `path`, relative to the API's base URL
    pub fn request(&self, method: Method, path: &str) -> ApiRequest<'_> {
        let url = self
            .config
            .endpoint(path)
            .map_err(|source| ApiError::InvalidPath {
                path: path.to_owned(),
                source,
            });

        ApiRequest {
            client: self,
            method,
            url,
            body: Ok(None),
            suppress_loading: false,
            long_timeout: false,
        }
    }

    /// Fetches and decodes `path`
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path).send_json().await
    }

    /// Fetches and decodes `path` through the long pipeline
    pub async fn get_long<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path)
            .long_timeout()
            .send_json()
            .await
    }

    /// Posts `body` as JSON to `path` and decodes the response
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(Method::POST, path).json(body).send_json().await
    }

    /// Puts `body` as JSON to `path` and decodes the response
    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(Method::PUT, path).json(body).send_json().await
    }

    /// Patches `path` with `body` as JSON and decodes the response
    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(Method::PATCH, path).json(body).send_json().await
    }

    /// Deletes `path`, discarding any response body
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.request(Method::DELETE, path).send().await.map(drop)
    }
}

/// A request being prepared by an [`ApiClient`]
///
/// Errors in preparing the request are held until it is sent.
#[must_use = "requests do nothing until sent"]
pub struct ApiRequest<'a> {
    client: &'a ApiClient,
    method: Method,
    url: Result<Url, ApiError>,
    body: Result<Option<Vec<u8>>, ApiError>,
    suppress_loading: bool,
    long_timeout: bool,
}

impl fmt::Debug for ApiRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_ref().map(Url::as_str).ok())
            .field("suppress_loading", &self.suppress_loading)
            .field("long_timeout", &self.long_timeout)
            .finish_non_exhaustive()
    }
}

impl ApiRequest<'_> {
    /// Sends `body` serialized as JSON
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Self {
        self.body = serde_json::to_vec(body).map(Some).map_err(ApiError::Encode);
        self
    }

    /// Appends query parameters to the URL
    pub fn query<K, V>(mut self, pairs: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if let Ok(url) = &mut self.url {
            url.query_pairs_mut()
                .extend_pairs(pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref())));
        }
        self
    }

    /// Keeps this request out of the loading signals
    pub fn suppress_loading(mut self) -> Self {
        self.suppress_loading = true;
        self
    }

    /// Sends this request through the long pipeline
    pub fn long_timeout(mut self) -> Self {
        self.long_timeout = true;
        self
    }

    /// Sends the request, failing on any non-success status
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(
            method = %self.method,
            path = self.url.as_ref().map(Url::path).unwrap_or_default(),
            long = self.long_timeout,
        )
    )]
    pub async fn send(self) -> Result<Response, ApiError> {
        let url = self.url?;
        let body = self.body?;

        let pipeline = if self.long_timeout {
            &self.client.long
        } else {
            &self.client.default
        };

        let mut req = pipeline.request(self.method, url);
        if let Some(body) = body {
            req = req
                .header(header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        if self.suppress_loading {
            req = req.with_extension(SuppressLoading);
        }

        let resp = req.send().await?;
        let status = resp.status();
        tracing::debug!(response.status = status.as_u16(), "received API response");

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Rejected { status, body });
        }

        Ok(resp)
    }

    /// Sends the request and decodes the JSON response body
    pub async fn send_json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let body = self.send().await?.bytes().await?;
        serde_json::from_slice(&body).map_err(ApiError::Decode)
    }
}
