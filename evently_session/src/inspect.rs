//! Client-side decoding of access token claims
//!
//! Nothing here verifies a signature. The server remains the authority on
//! whether a token is acceptable; the client only needs to know who the token
//! names and when it stops being worth sending.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use evently_clock::{Clock, System, UnixTime};
use serde::{de, Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Base64url, accepting payload segments with or without padding
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The token is not a well-formed, decodable credential
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The token has no payload segment
    #[error("malformed token: missing payload segment")]
    MissingPayload,
    /// The payload segment is not valid base64url
    #[error("malformed token payload encoding")]
    PayloadEncoding(#[from] base64::DecodeError),
    /// The payload does not hold a JSON claims object
    #[error("malformed token payload")]
    PayloadJson(#[from] serde_json::Error),
}

/// Identity claims carried by an access token
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Claims {
    /// The subject, usually the user's ID
    #[serde(default, deserialize_with = "string_or_number")]
    pub sub: Option<String>,
    /// When the token stops being valid
    #[serde(default, deserialize_with = "numeric_date")]
    pub exp: Option<UnixTime>,
    /// Whether the user has full administrative rights
    #[serde(default)]
    pub is_superuser: bool,
    /// The kind of account, e.g. `"admin"` or `"member"`
    #[serde(default)]
    pub user_type: Option<String>,
    /// The user's email address
    #[serde(default)]
    pub email: Option<String>,
    /// The user's display name
    #[serde(default)]
    pub username: Option<String>,
    /// Any claims not modeled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    /// Whether these claims grant access to the administration dashboard
    pub fn is_admin(&self) -> bool {
        self.is_superuser || self.user_type.as_deref() == Some("admin")
    }

    /// Signed seconds remaining before expiry as of `now`
    ///
    /// Returns `None` if the token carries no `exp` claim.
    pub fn seconds_until_expiry_at(&self, now: UnixTime) -> Option<i64> {
        self.exp.map(|exp| now.seconds_until(exp))
    }

    /// Whether the claims describe an expired token as of `now`
    ///
    /// A token is still valid at exactly its `exp` second. Claims without an
    /// `exp` are always considered expired.
    pub fn is_expired_at(&self, now: UnixTime) -> bool {
        match self.exp {
            Some(exp) => now > exp,
            None => true,
        }
    }
}

/// Decodes the claims of a token without verifying it
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let payload = token
        .split('.')
        .nth(1)
        .filter(|p| !p.is_empty())
        .ok_or(DecodeError::MissingPayload)?;

    let raw = PAYLOAD_ENGINE.decode(payload)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Whether a token is absent, undecodable, lacking an expiry, or expired
#[inline]
pub fn is_expired(token: Option<&str>) -> bool {
    is_expired_with_clock(token, &System)
}

/// Like [`is_expired`], taking the current time from `clock`
#[inline]
pub fn is_expired_with_clock<C: Clock>(token: Option<&str>, clock: &C) -> bool {
    is_expired_at(token, clock.now())
}

/// Like [`is_expired`], as of the provided time
pub fn is_expired_at(token: Option<&str>, now: UnixTime) -> bool {
    match token.map(decode) {
        Some(Ok(claims)) => claims.is_expired_at(now),
        Some(Err(error)) => {
            tracing::debug!(
                error = (&error as &dyn std::error::Error),
                "treating undecodable token as expired"
            );
            true
        }
        None => true,
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::invalid_type(
            unexpected(&other),
            &"a string or number",
        )),
    }
}

fn numeric_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<UnixTime>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(secs) = n.as_u64() {
                Ok(Some(UnixTime(secs)))
            } else if let Some(secs) = n.as_f64().filter(|s| s.is_finite() && *s >= 0.0) {
                Ok(Some(UnixTime(secs.trunc() as u64)))
            } else {
                Err(de::Error::custom("expiry must be a non-negative number of seconds"))
            }
        }
        Some(other) => Err(de::Error::invalid_type(
            unexpected(&other),
            &"a number of seconds",
        )),
    }
}

fn unexpected(value: &Value) -> de::Unexpected<'_> {
    match value {
        Value::Bool(b) => de::Unexpected::Bool(*b),
        Value::String(s) => de::Unexpected::Str(s),
        Value::Array(_) => de::Unexpected::Seq,
        Value::Object(_) => de::Unexpected::Map,
        Value::Null | Value::Number(_) => de::Unexpected::Other("value"),
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use evently_clock::TestClock;
    use serde_json::json;

    use super::*;

    const NOW: UnixTime = UnixTime(1_700_000_000);

    fn token_with(claims: Value) -> String {
        let header = PAYLOAD_ENGINE.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = PAYLOAD_ENGINE.encode(claims.to_string());
        format!("{header}.{payload}.signature")
    }

    #[test]
    fn decodes_identity_claims() -> Result<()> {
        let token = token_with(json!({
            "sub": 42,
            "exp": NOW.0,
            "is_superuser": true,
            "user_type": "admin",
            "email": "ada@example.com",
            "username": "ada",
            "points": 120,
        }));

        let claims = decode(&token)?;

        assert_eq!(claims.sub.as_deref(), Some("42"));
        assert_eq!(claims.exp, Some(NOW));
        assert!(claims.is_superuser);
        assert!(claims.is_admin());
        assert_eq!(claims.email.as_deref(), Some("ada@example.com"));
        assert_eq!(claims.username.as_deref(), Some("ada"));
        assert_eq!(claims.extra.get("points"), Some(&json!(120)));
        Ok(())
    }

    #[test]
    fn fractional_expiry_is_truncated() -> Result<()> {
        let claims = decode(&token_with(json!({ "exp": 1_700_000_000.75 })))?;
        assert_eq!(claims.exp, Some(NOW));
        Ok(())
    }

    #[test]
    fn padded_payloads_are_accepted() -> Result<()> {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(br#"{"sub":"a"}"#);
        let claims = decode(&format!("x.{payload}.y"))?;
        assert_eq!(claims.sub.as_deref(), Some("a"));
        Ok(())
    }

    #[test]
    fn member_accounts_are_not_admins() -> Result<()> {
        let claims = decode(&token_with(json!({ "user_type": "member" })))?;
        assert!(!claims.is_admin());
        Ok(())
    }

    mod when_token_is_malformed {
        use super::*;

        #[test]
        fn missing_payload_is_rejected() {
            assert!(matches!(decode("just-one-part"), Err(DecodeError::MissingPayload)));
            assert!(matches!(decode("header..sig"), Err(DecodeError::MissingPayload)));
        }

        #[test]
        fn bad_base64_is_rejected() {
            assert!(matches!(decode("a.!!!.c"), Err(DecodeError::PayloadEncoding(_))));
        }

        #[test]
        fn non_json_payload_is_rejected() {
            let payload = PAYLOAD_ENGINE.encode("not json");
            assert!(matches!(
                decode(&format!("a.{payload}.c")),
                Err(DecodeError::PayloadJson(_))
            ));
        }

        #[test]
        fn malformed_tokens_are_expired() {
            assert!(is_expired_at(Some("garbage"), NOW));
        }
    }

    mod expiry {
        use super::*;

        #[test]
        fn absent_token_is_expired() {
            assert!(is_expired_at(None, NOW));
        }

        #[test]
        fn token_without_exp_is_expired() {
            let token = token_with(json!({ "sub": "1" }));
            assert!(is_expired_at(Some(&token), NOW));
        }

        #[test]
        fn token_one_second_past_exp_is_expired() {
            let token = token_with(json!({ "exp": NOW.0 - 1 }));
            assert!(is_expired_at(Some(&token), NOW));
        }

        #[test]
        fn token_one_second_before_exp_is_valid() {
            let token = token_with(json!({ "exp": NOW.0 + 1 }));
            assert!(!is_expired_at(Some(&token), NOW));
        }

        #[test]
        fn token_exactly_at_exp_is_still_valid() {
            let token = token_with(json!({ "exp": NOW.0 }));
            assert!(!is_expired_at(Some(&token), NOW));
        }

        #[test]
        fn clock_decides_expiry() {
            let token = token_with(json!({ "exp": NOW.0 }));

            assert!(!is_expired_with_clock(Some(&token), &TestClock::new(NOW)));
            assert!(is_expired_with_clock(
                Some(&token),
                &TestClock::new(UnixTime(NOW.0 + 1))
            ));
        }

        #[test]
        fn system_clock_sees_past_and_future_tokens() {
            let now = System.now();
            let past = token_with(json!({ "exp": now.0 - 60 }));
            let future = token_with(json!({ "exp": now.0 + 3600 }));

            assert!(is_expired(Some(&past)));
            assert!(!is_expired(Some(&future)));
            assert!(is_expired(None));
        }

        #[test]
        fn seconds_until_expiry_goes_negative() -> Result<()> {
            let claims = decode(&token_with(json!({ "exp": NOW.0 - 5 })))?;
            assert_eq!(claims.seconds_until_expiry_at(NOW), Some(-5));
            Ok(())
        }
    }
}
