//! Periodic expiry checks and the "continue or log out" warning
//!
//! The [`ExpiryWatch`] wakes up on a fixed period and looks at the stored
//! access token. Shortly before the token expires it asks an
//! [`ExpiryWarning`] to show the user a prompt; once the token has expired it
//! ends the session outright.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{inspect, SessionError, SessionState, TokenPair};

/// How often the watch checks the session by default
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(30);

/// How close to expiry a warning is shown by default, in seconds
pub const DEFAULT_WARNING_THRESHOLD_SECS: i64 = 120;

/// Presents the user with a choice to continue or end a session about to expire
///
/// Implementations hold on to the [`ExpiryPrompt`] and call exactly one of its
/// methods once the user decides.
pub trait ExpiryWarning: Send + Sync {
    /// Shows the warning with the whole number of seconds left
    fn show(&self, seconds_left: u64, prompt: ExpiryPrompt);

    /// Hides a warning that is no longer relevant
    fn dismiss(&self);
}

impl<T: ExpiryWarning + ?Sized> ExpiryWarning for Arc<T> {
    fn show(&self, seconds_left: u64, prompt: ExpiryPrompt) {
        (**self).show(seconds_left, prompt)
    }

    fn dismiss(&self) {
        (**self).dismiss()
    }
}

/// The user's two choices when warned about an expiring session
pub struct ExpiryPrompt {
    session: SessionState,
    showing: Arc<AtomicBool>,
    warning: Weak<dyn ExpiryWarning>,
}

impl fmt::Debug for ExpiryPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiryPrompt")
            .field("session", &self.session)
            .field("showing", &self.showing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ExpiryPrompt {
    /// Renews the session, then dismisses the warning
    ///
    /// The warning counts as showing until the renewal settles, so the watch
    /// does not warn again in the meantime.
    pub async fn continue_session(self) -> Result<TokenPair, SessionError> {
        let renewed = self.session.refresh_token().await;
        self.close();
        renewed
    }

    /// Dismisses the warning and ends the session
    pub fn logout(self) {
        self.close();
        self.session.logout();
    }

    fn close(&self) {
        if self.showing.swap(false, Ordering::SeqCst) {
            if let Some(warning) = self.warning.upgrade() {
                warning.dismiss();
            }
        }
    }
}

/// The result of a single expiry check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryCheck {
    /// No access token is stored
    NoSession,
    /// The token has more time left than the warning threshold
    Healthy {
        /// Seconds until expiry
        seconds_left: i64,
    },
    /// The warning was just shown
    Warned {
        /// Seconds until expiry
        seconds_left: i64,
    },
    /// The warning is already showing
    AlreadyWarned {
        /// Seconds until expiry
        seconds_left: i64,
    },
    /// The token was expired or unreadable, so the session was ended
    LoggedOut,
}

/// Watches a session for approaching expiry
pub struct ExpiryWatch {
    session: SessionState,
    warning: Arc<dyn ExpiryWarning>,
    threshold_secs: i64,
    showing: Arc<AtomicBool>,
}

impl fmt::Debug for ExpiryWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiryWatch")
            .field("session", &self.session)
            .field("threshold_secs", &self.threshold_secs)
            .field("showing", &self.showing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ExpiryWatch {
    /// Constructs a watch over `session` that warns through `warning`
    pub fn new(session: SessionState, warning: impl ExpiryWarning + 'static) -> Self {
        Self {
            session,
            warning: Arc::new(warning),
            threshold_secs: DEFAULT_WARNING_THRESHOLD_SECS,
            showing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shows the warning when fewer than `threshold_secs` seconds remain
    pub fn with_warning_threshold(mut self, threshold_secs: i64) -> Self {
        self.threshold_secs = threshold_secs;
        self
    }

    /// Whether the warning is currently showing
    pub fn is_warning(&self) -> bool {
        self.showing.load(Ordering::SeqCst)
    }

    /// Checks the session once
    pub fn check(&self) -> ExpiryCheck {
        let Some(token) = self.session.access_token() else {
            return ExpiryCheck::NoSession;
        };

        let exp = match inspect::decode(token.as_str()) {
            Ok(claims) => claims.exp,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "stored access token is unreadable, ending session"
                );
                None
            }
        };

        let Some(exp) = exp else {
            self.end_session();
            return ExpiryCheck::LoggedOut;
        };

        let seconds_left = self.session.now().seconds_until(exp);

        if seconds_left <= 0 {
            tracing::info!("access token expired, ending session");
            self.end_session();
            ExpiryCheck::LoggedOut
        } else if seconds_left < self.threshold_secs {
            if self.showing.swap(true, Ordering::SeqCst) {
                ExpiryCheck::AlreadyWarned { seconds_left }
            } else {
                tracing::debug!(seconds_left, "session about to expire, warning user");
                self.warning.show(seconds_left.unsigned_abs(), self.prompt());
                ExpiryCheck::Warned { seconds_left }
            }
        } else {
            tracing::trace!(seconds_left, "session healthy");
            ExpiryCheck::Healthy { seconds_left }
        }
    }

    /// Runs [`check()`][Self::check] every `period` on a background task
    ///
    /// The first check happens one full period after spawning. The task stops
    /// when the returned handle is stopped or dropped.
    pub fn spawn(self, period: Duration) -> WatchHandle {
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                self.check();
            }
        });

        WatchHandle { join }
    }

    fn prompt(&self) -> ExpiryPrompt {
        ExpiryPrompt {
            session: self.session.clone(),
            showing: Arc::clone(&self.showing),
            warning: Arc::downgrade(&self.warning),
        }
    }

    fn end_session(&self) {
        if self.showing.swap(false, Ordering::SeqCst) {
            self.warning.dismiss();
        }
        self.session.logout();
    }
}

/// Keeps a spawned [`ExpiryWatch`] running
///
/// Dropping the handle stops the watch.
#[derive(Debug)]
pub struct WatchHandle {
    join: JoinHandle<()>,
}

impl WatchHandle {
    /// Stops the watch
    pub fn stop(self) {}
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.join.abort();
    }
}
