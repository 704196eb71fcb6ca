// Authentication types

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// How proof of authentication travels with each request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    /// Server-side session; the cookie jar carries credentials
    CookieBased,

    /// Client-held bearer token replayed in the Authorization header
    TokenBased,
}

/// Current authentication state
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub transport_mode: TransportMode,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at_epoch_ms: Option<i64>,
    pub user_id: Option<String>,
}

impl Session {
    /// Empty session in the given mode
    pub fn anonymous(transport_mode: TransportMode) -> Self {
        Self {
            transport_mode,
            access_token: None,
            refresh_token: None,
            expires_at_epoch_ms: None,
            user_id: None,
        }
    }

    /// Whether anyone is logged in at all
    pub fn has_identity(&self) -> bool {
        self.user_id.is_some() || self.access_token.is_some()
    }
}

/// Token data from a login or refresh response
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at_epoch_ms: i64,
}

impl TokenData {
    pub fn from_expires_in(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
    ) -> Self {
        let expires_in = expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Self {
            access_token,
            refresh_token,
            expires_at_epoch_ms: Utc::now().timestamp_millis() + (expires_in as i64) * 1000,
        }
    }
}

/// Lifetime assumed when the server omits `expiresIn`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Login request
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Login response; an absent `accessToken` means cookie transport
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub user_id: String,

    /// Remaining profile fields, passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Token refresh request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Token refresh response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// What survives a process restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at_ms: Option<i64>,
    pub user_id: Option<String>,
}

impl From<&Session> for PersistedSession {
    fn from(session: &Session) -> Self {
        Self {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            expires_at_ms: session.expires_at_epoch_ms,
            user_id: session.user_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_response_without_token() {
        let resp: LoginResponse =
            serde_json::from_str(r#"{"userId": "u-1", "displayName": "Ana"}"#).unwrap();
        assert!(resp.access_token.is_none());
        assert_eq!(resp.user_id, "u-1");
        assert_eq!(resp.extra["displayName"], "Ana");
    }

    #[test]
    fn test_token_data_expiry() {
        let before = Utc::now().timestamp_millis();
        let data = TokenData::from_expires_in("a".into(), None, Some(60));
        assert!(data.expires_at_epoch_ms >= before + 60_000);
        assert!(data.expires_at_epoch_ms <= Utc::now().timestamp_millis() + 60_000);
    }

    #[test]
    fn test_has_identity() {
        let mut session = Session::anonymous(TransportMode::CookieBased);
        assert!(!session.has_identity());
        session.user_id = Some("u".into());
        assert!(session.has_identity());
    }
}
