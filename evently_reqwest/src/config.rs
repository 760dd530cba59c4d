//! Environment configuration, read once at start-up

use std::{env, fmt, num::ParseIntError, str::FromStr, time::Duration};

use evently_session::authority::HttpTokenAuthority;
use reqwest::Url;
use thiserror::Error;

/// Variable holding the base URL of the API
pub const API_URL_VAR: &str = "EVENTHUB_API_URL";
/// Variable selecting `development` or `production`
pub const ENVIRONMENT_VAR: &str = "EVENTHUB_ENV";
/// Variable overriding the default pipeline's timeout, in seconds
pub const TIMEOUT_VAR: &str = "EVENTHUB_TIMEOUT_SECS";
/// Variable overriding the long pipeline's timeout, in seconds
pub const LONG_TIMEOUT_VAR: &str = "EVENTHUB_LONG_TIMEOUT_SECS";

/// Base URL used in development when none is configured
pub const DEVELOPMENT_API_URL: &str = "http://localhost:8000/api/v1/";

/// Timeout of the default pipeline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout of the long pipeline, for calls paging over large result sets
pub const DEFAULT_LONG_TIMEOUT: Duration = Duration::from_secs(30);

const LOGIN_PATH: &str = "auth/login";
const REFRESH_PATH: &str = "auth/refresh";

/// The deployment the client is talking to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Environment {
    /// A local or staging backend
    #[default]
    Development,
    /// The live backend, reachable only over HTTPS
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ConfigError::InvalidEnvironment(s.to_owned())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

/// An error in the API configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Production requires an explicit API URL
    #[error("EVENTHUB_API_URL must be set in production")]
    MissingApiUrl,
    /// The API URL could not be parsed
    #[error("invalid API URL {value:?}")]
    InvalidApiUrl {
        /// The configured value
        value: String,
        /// The parse failure
        #[source]
        source: url::ParseError,
    },
    /// Production API URLs must use HTTPS
    #[error("API URL {0} must use https in production")]
    InsecureApiUrl(Url),
    /// The environment name was not recognized
    #[error("unknown environment {0:?}, expected `development` or `production`")]
    InvalidEnvironment(String),
    /// A timeout override was not a whole number of seconds
    #[error("invalid value {value:?} for {key}")]
    InvalidTimeout {
        /// The variable holding the value
        key: &'static str,
        /// The configured value
        value: String,
        /// The parse failure
        #[source]
        source: ParseIntError,
    },
    /// The HTTP client could not be constructed
    #[error("unable to build HTTP client")]
    HttpClient(#[source] reqwest::Error),
}

/// Where the API lives and how long to wait for it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiConfig {
    base_url: Url,
    environment: Environment,
    timeout: Duration,
    long_timeout: Duration,
}

impl ApiConfig {
    /// Constructs a configuration for `base_url` with the default timeouts
    pub fn new(base_url: Url, environment: Environment) -> Result<Self, ConfigError> {
        if environment == Environment::Production && base_url.scheme() != "https" {
            return Err(ConfigError::InsecureApiUrl(base_url));
        }

        Ok(Self {
            base_url: with_trailing_slash(base_url),
            environment,
            timeout: DEFAULT_TIMEOUT,
            long_timeout: DEFAULT_LONG_TIMEOUT,
        })
    }

    /// Reads the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let environment = lookup(ENVIRONMENT_VAR)
            .map(|value| value.parse::<Environment>())
            .transpose()?
            .unwrap_or_default();

        let raw_url = match (lookup(API_URL_VAR), environment) {
            (Some(url), _) => url,
            (None, Environment::Development) => DEVELOPMENT_API_URL.to_owned(),
            (None, Environment::Production) => return Err(ConfigError::MissingApiUrl),
        };
        let base_url = Url::parse(&raw_url).map_err(|source| ConfigError::InvalidApiUrl {
            value: raw_url,
            source,
        })?;

        let mut config = Self::new(base_url, environment)?;
        if let Some(timeout) = seconds_override(&lookup, TIMEOUT_VAR)? {
            config.timeout = timeout;
        }
        if let Some(timeout) = seconds_override(&lookup, LONG_TIMEOUT_VAR)? {
            config.long_timeout = timeout;
        }

        tracing::debug!(
            base_url = %config.base_url,
            environment = %config.environment,
            timeout_ms = config.timeout.as_millis() as u64,
            long_timeout_ms = config.long_timeout.as_millis() as u64,
            "loaded API configuration"
        );

        Ok(config)
    }

    /// Overrides the default pipeline's timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the long pipeline's timeout
    pub fn with_long_timeout(mut self, timeout: Duration) -> Self {
        self.long_timeout = timeout;
        self
    }

    /// The base URL, always ending in a slash
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The configured environment
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Timeout of the default pipeline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Timeout of the long pipeline
    pub fn long_timeout(&self) -> Duration {
        self.long_timeout
    }

    /// Resolves an API path, with or without a leading slash, against the base URL
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path.trim_start_matches('/'))
    }

    /// Builds a plain HTTP client with `timeout`
    ///
    /// In production the client refuses to send anything over plain HTTP.
    pub fn http_client(&self, timeout: Duration) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .timeout(timeout)
            .https_only(self.environment == Environment::Production)
            .build()
            .map_err(ConfigError::HttpClient)
    }

    /// The login and refresh endpoints of this API
    pub fn token_authority(&self) -> Result<HttpTokenAuthority, ConfigError> {
        let endpoint = |path: &str| {
            self.endpoint(path)
                .map_err(|source| ConfigError::InvalidApiUrl {
                    value: path.to_owned(),
                    source,
                })
        };

        Ok(HttpTokenAuthority::new(
            self.http_client(self.timeout)?,
            endpoint(LOGIN_PATH)?,
            endpoint(REFRESH_PATH)?,
        ))
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn seconds_override(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map(Duration::from_secs)
                .map_err(|source| ConfigError::InvalidTimeout { key, value, source })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let vars: HashMap<_, _> = vars.iter().copied().collect();
        move |key| vars.get(key).map(|v| (*v).to_owned())
    }

    #[test]
    fn development_is_the_default() {
        let config = ApiConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.environment(), Environment::Development);
        assert_eq!(config.base_url().as_str(), DEVELOPMENT_API_URL);
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.long_timeout(), DEFAULT_LONG_TIMEOUT);
    }

    #[test]
    fn endpoints_resolve_under_the_base_path() {
        let config =
            ApiConfig::from_lookup(lookup(&[(API_URL_VAR, "https://api.example.com/v2")])).unwrap();

        assert_eq!(
            config.endpoint("/events").unwrap().as_str(),
            "https://api.example.com/v2/events"
        );
        assert_eq!(
            config.endpoint("events/7/register").unwrap().as_str(),
            "https://api.example.com/v2/events/7/register"
        );
    }

    #[test]
    fn timeouts_can_be_overridden() {
        let config = ApiConfig::from_lookup(lookup(&[
            (TIMEOUT_VAR, "5"),
            (LONG_TIMEOUT_VAR, " 60 "),
        ]))
        .unwrap();

        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.long_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn environment_names_are_case_insensitive() {
        assert_eq!("Production".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
    }

    mod when_configuration_is_invalid {
        use super::*;

        #[test]
        fn production_requires_an_api_url() {
            let result = ApiConfig::from_lookup(lookup(&[(ENVIRONMENT_VAR, "production")]));
            assert!(matches!(result, Err(ConfigError::MissingApiUrl)));
        }

        #[test]
        fn production_requires_https() {
            let result = ApiConfig::from_lookup(lookup(&[
                (ENVIRONMENT_VAR, "production"),
                (API_URL_VAR, "http://api.example.com/"),
            ]));
            assert!(matches!(result, Err(ConfigError::InsecureApiUrl(_))));
        }

        #[test]
        fn unknown_environment_is_rejected() {
            let result = ApiConfig::from_lookup(lookup(&[(ENVIRONMENT_VAR, "staging")]));
            assert!(matches!(result, Err(ConfigError::InvalidEnvironment(_))));
        }

        #[test]
        fn malformed_url_is_rejected() {
            let result = ApiConfig::from_lookup(lookup(&[(API_URL_VAR, "not a url")]));
            assert!(matches!(result, Err(ConfigError::InvalidApiUrl { .. })));
        }

        #[test]
        fn non_numeric_timeout_is_rejected() {
            let result = ApiConfig::from_lookup(lookup(&[(TIMEOUT_VAR, "ten")]));
            assert!(matches!(
                result,
                Err(ConfigError::InvalidTimeout {
                    key: TIMEOUT_VAR,
                    ..
                })
            ));
        }
    }
}
