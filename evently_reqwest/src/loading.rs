//! Loading signals for the user interface
//!
//! Requests sent through the default pipeline tell a [`RequestObserver`] when
//! they start and when they settle, along with a short progress message
//! describing what the request does.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use reqwest::{Method, Request, Response};
use reqwest_middleware::{Middleware, Next, Result};
use tokio::sync::watch;

/// Receives loading signals from the request pipeline
pub trait RequestObserver: Send + Sync {
    /// A request is about to be sent
    fn on_request_start(&self, message: &str);

    /// A request has settled, successfully or not
    fn on_request_end(&self);
}

impl<T: RequestObserver + ?Sized> RequestObserver for Arc<T> {
    fn on_request_start(&self, message: &str) {
        (**self).on_request_start(message)
    }

    fn on_request_end(&self) {
        (**self).on_request_end()
    }
}

/// An observer that ignores every signal
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl RequestObserver for NoopObserver {
    fn on_request_start(&self, _message: &str) {}

    fn on_request_end(&self) {}
}

/// Request extension that keeps a request out of the loading signals
#[derive(Clone, Copy, Debug, Default)]
pub struct SuppressLoading;

/// Describes a request in words suitable for a loading indicator
pub fn progress_message(method: &Method, path: &str) -> &'static str {
    let path = path.to_ascii_lowercase();

    if path
        .split('/')
        .any(|segment| matches!(segment, "login" | "token" | "signin"))
    {
        return "Signing in...";
    }

    if *method == Method::POST {
        if path.contains("payment") || path.contains("checkout") {
            return "Processing payment...";
        }
        if path.contains("register") || path.contains("registration") {
            return "Registering for event...";
        }
    }

    match *method {
        Method::GET => "Loading...",
        Method::POST => "Saving...",
        Method::PUT | Method::PATCH => "Updating...",
        Method::DELETE => "Deleting...",
        _ => "Processing...",
    }
}

/// A middleware that reports requests to a [`RequestObserver`]
///
/// Requests carrying the [`SuppressLoading`] extension pass through silently.
#[derive(Clone)]
pub struct LoadingMiddleware {
    observer: Arc<dyn RequestObserver>,
}

impl fmt::Debug for LoadingMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingMiddleware").finish_non_exhaustive()
    }
}

impl LoadingMiddleware {
    /// Constructs a middleware reporting to `observer`
    pub fn new(observer: impl RequestObserver + 'static) -> Self {
        Self {
            observer: Arc::new(observer),
        }
    }
}

/// Ends the loading signal even if the request future is dropped mid-flight
struct Settle<'a>(&'a dyn RequestObserver);

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        self.0.on_request_end();
    }
}

#[async_trait::async_trait]
impl Middleware for LoadingMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if extensions.get::<SuppressLoading>().is_some() {
            return next.run(req, extensions).await;
        }

        let message = progress_message(req.method(), req.url().path());
        tracing::trace!(progress = message, "request started");

        self.observer.on_request_start(message);
        let _settle = Settle(&*self.observer);

        next.run(req, extensions).await
    }
}

/// An observer counting in-flight requests and publishing the latest message
///
/// The message is cleared once every request has settled.
#[derive(Debug)]
pub struct LoadingTracker {
    in_flight: AtomicUsize,
    message: watch::Sender<Option<String>>,
}

impl Default for LoadingTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadingTracker {
    /// Constructs an idle tracker
    pub fn new() -> Self {
        let (message, _) = watch::channel(None);
        Self {
            in_flight: AtomicUsize::new(0),
            message,
        }
    }

    /// Number of requests that have started but not settled
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether any request is in flight
    pub fn is_loading(&self) -> bool {
        self.in_flight() > 0
    }

    /// The message of the most recently started request, while loading
    pub fn message(&self) -> Option<String> {
        self.message.borrow().clone()
    }

    /// Subscribes to message changes
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.message.subscribe()
    }
}

impl RequestObserver for LoadingTracker {
    fn on_request_start(&self, message: &str) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.message.send_replace(Some(message.to_owned()));
    }

    fn on_request_end(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or_default();

        if previous <= 1 {
            self.message.send_replace(None);
        }
    }
}
