//! OAuth credentials as cached in memory and on disk.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::auth::oauth::TokenResponse;

/// Credentials are treated as expired this long before their real expiry.
pub const EXPIRY_MARGIN_MS: i64 = 30_000;

/// One identity's OAuth credentials.
///
/// `expiry_date` is epoch milliseconds. Credentials without an access token or
/// without an expiry are never considered valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<i64>,
}

impl Credentials {
    /// Builds credentials from a token endpoint response.
    ///
    /// Fields the response omits are carried over from `previous`, so a
    /// refresh that does not rotate the refresh token keeps the old one.
    pub fn from_token_response(response: TokenResponse, previous: Option<&Credentials>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            access_token: response.access_token.filter(|t| !t.is_empty()),
            refresh_token: response
                .refresh_token
                .filter(|t| !t.is_empty())
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            id_token: response
                .id_token
                .or_else(|| previous.and_then(|p| p.id_token.clone())),
            token_type: response
                .token_type
                .or_else(|| previous.and_then(|p| p.token_type.clone())),
            resource_url: response
                .resource_url
                .or_else(|| previous.and_then(|p| p.resource_url.clone())),
            expiry_date: response
                .expires_in
                .map(|secs| now.saturating_add(secs.saturating_mul(1000))),
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Whether the access token can still be used at `now_ms`.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        match (self.access_token(), self.expiry_date) {
            (Some(_), Some(expiry)) => now_ms < expiry.saturating_sub(EXPIRY_MARGIN_MS),
            _ => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(expiry: Option<i64>) -> Credentials {
        Credentials {
            access_token: Some("access".into()),
            refresh_token: Some("refresh".into()),
            expiry_date: expiry,
            ..Default::default()
        }
    }

    #[test]
    fn test_validity_respects_margin() {
        let now = 1_000_000;
        assert!(creds(Some(now + 60_000)).is_valid_at(now));
        assert!(!creds(Some(now + 20_000)).is_valid_at(now));
        assert!(!creds(Some(now - 1)).is_valid_at(now));
        assert!(!creds(None).is_valid_at(now));
    }

    #[test]
    fn test_extreme_expiry_does_not_overflow() {
        let json = r#"{"access_token":"a","expiry_date":-9223372036854775808}"#;
        let parsed: Credentials = serde_json::from_str(json).unwrap();
        assert!(!parsed.is_valid_at(0));
        assert!(!parsed.is_valid_at(i64::MIN));
        assert!(creds(Some(i64::MAX)).is_valid_at(0));
    }

    #[test]
    fn test_missing_access_token_never_valid() {
        let mut c = creds(Some(i64::MAX));
        c.access_token = None;
        assert!(!c.is_valid());
        c.access_token = Some(String::new());
        assert!(!c.is_valid());
    }

    #[test]
    fn test_refresh_keeps_previous_fields() {
        let previous = Credentials {
            resource_url: Some("example.com".into()),
            ..creds(Some(0))
        };
        let response = TokenResponse {
            access_token: Some("new-access".into()),
            token_type: Some("Bearer".into()),
            expires_in: Some(3600),
            ..Default::default()
        };

        let refreshed = Credentials::from_token_response(response, Some(&previous));
        assert_eq!(refreshed.access_token(), Some("new-access"));
        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(refreshed.resource_url.as_deref(), Some("example.com"));
        assert!(refreshed.is_valid());
    }

    #[test]
    fn test_file_format_round_trip_fields() {
        let json = r#"{"access_token":"a","refresh_token":"r","token_type":"Bearer","resource_url":"host/v1","expiry_date":1700000000000}"#;
        let parsed: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.expiry_date, Some(1_700_000_000_000));
        assert_eq!(parsed.id_token, None);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }
}
