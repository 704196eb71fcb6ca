use anyhow::Result;
use chrono::Utc;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::detect::AuthModeDetector;
use super::persist;
use super::types::{LoginResponse, PersistedSession, Session, TokenData, TransportMode};

/// Non-HttpOnly cookie echoed back as `X-CSRF-Token`
pub const CSRF_COOKIE: &str = "csrf_token";

/// Non-HttpOnly cookie carrying the cookie session's expiry (epoch ms)
pub const EXPIRY_COOKIE: &str = "auth_expires_at";

/// Session store
/// Holds the one shared authentication state: transport mode, tokens, and
/// the cookie jar that carries credentials in cookie mode
pub struct SessionStore {
    /// Current session
    session: RwLock<Session>,

    /// Cookie jar shared with the HTTP client
    cookies: Arc<Jar>,

    /// URL the API cookies are scoped to
    cookie_url: Url,

    /// Path to SQLite database (session survives restarts when set)
    db_path: Option<PathBuf>,
}

impl SessionStore {
    pub fn new(
        initial: Session,
        cookies: Arc<Jar>,
        cookie_url: Url,
        db_path: Option<PathBuf>,
    ) -> Self {
        Self {
            session: RwLock::new(initial),
            cookies,
            cookie_url,
            db_path,
        }
    }

    /// Rebuild the session from persisted evidence
    pub fn restore(
        detector: &AuthModeDetector,
        cookies: Arc<Jar>,
        cookie_url: Url,
        db_path: Option<PathBuf>,
    ) -> Result<Self> {
        let evidence = match db_path.as_deref() {
            Some(path) => {
                tracing::info!("Loading session from SQLite: {}", path.display());
                persist::load(path)?
            }
            None => PersistedSession::default(),
        };

        let mode = detector.detect(&evidence);
        let session = match mode {
            TransportMode::TokenBased => Session {
                transport_mode: mode,
                access_token: evidence.access_token,
                refresh_token: evidence.refresh_token,
                expires_at_epoch_ms: evidence.expires_at_ms,
                user_id: evidence.user_id,
            },
            TransportMode::CookieBased => Session {
                user_id: evidence.user_id,
                ..Session::anonymous(mode)
            },
        };

        Ok(Self::new(session, cookies, cookie_url, db_path))
    }

    /// Create a store for testing (in-memory, fresh jar)
    #[cfg(any(test, feature = "test-utils"))]
    pub fn new_for_testing(session: Session) -> Self {
        let url = Url::parse("http://localhost/").expect("static url");
        Self::new(session, Arc::new(Jar::default()), url, None)
    }

    pub async fn snapshot(&self) -> Session {
        self.session.read().await.clone()
    }

    pub async fn transport_mode(&self) -> TransportMode {
        self.session.read().await.transport_mode
    }

    pub async fn access_token(&self) -> Option<String> {
        self.session.read().await.access_token.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.session.read().await.refresh_token.clone()
    }

    /// Install the session described by a login response
    pub async fn establish(&self, login: &LoginResponse) {
        let session = match login.access_token.clone() {
            Some(access_token) => {
                let data = TokenData::from_expires_in(
                    access_token,
                    login.refresh_token.clone(),
                    login.expires_in,
                );
                Session {
                    transport_mode: TransportMode::TokenBased,
                    access_token: Some(data.access_token),
                    refresh_token: data.refresh_token,
                    expires_at_epoch_ms: Some(data.expires_at_epoch_ms),
                    user_id: Some(login.user_id.clone()),
                }
            }
            None => Session {
                user_id: Some(login.user_id.clone()),
                ..Session::anonymous(TransportMode::CookieBased)
            },
        };

        tracing::info!(
            user_id = %login.user_id,
            mode = ?session.transport_mode,
            "Session established"
        );

        self.persist(&session);
        *self.session.write().await = session;
    }

    /// Update stored token data in place after a successful refresh
    pub async fn apply_refresh(&self, data: TokenData) {
        let mut session = self.session.write().await;
        session.access_token = Some(data.access_token);
        session.expires_at_epoch_ms = Some(data.expires_at_epoch_ms);

        // Keep the old refresh token unless the server rotated it
        if let Some(refresh_token) = data.refresh_token {
            session.refresh_token = Some(refresh_token);
        }

        self.persist(&session);
    }

    /// Forget everything; the caller must log in again
    pub async fn clear(&self) {
        let mut session = self.session.write().await;
        let mode = session.transport_mode;
        *session = Session::anonymous(mode);
        drop(session);

        for name in [CSRF_COOKIE, EXPIRY_COOKIE] {
            self.cookies
                .add_cookie_str(&format!("{}=; Max-Age=0; Path=/", name), &self.cookie_url);
        }

        if let Some(path) = self.db_path.as_deref() {
            if let Err(e) = persist::clear(path) {
                tracing::warn!("Failed to clear persisted session: {:#}", e);
            }
        }

        tracing::info!("Session cleared");
    }

    /// Cookie jar shared with the HTTP client
    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.cookies)
    }

    /// Read one cookie value visible to the API origin
    pub fn cookie(&self, name: &str) -> Option<String> {
        let header = self.cookies.cookies(&self.cookie_url)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    pub fn csrf_token(&self) -> Option<String> {
        self.cookie(CSRF_COOKIE).filter(|v| !v.is_empty())
    }

    /// Expiry to check before a call, or `None` when nobody is logged in.
    ///
    /// Token mode uses the stored expiry. Cookie mode uses the expiry cookie;
    /// a known user without that cookie counts as already expired.
    pub async fn derived_expiry_ms(&self) -> Option<i64> {
        let session = self.session.read().await;
        match session.transport_mode {
            TransportMode::TokenBased => {
                if session.access_token.is_none() && session.refresh_token.is_none() {
                    return None;
                }
                Some(session.expires_at_epoch_ms.unwrap_or(0))
            }
            TransportMode::CookieBased => {
                session.user_id.as_ref()?;
                let cookie = self.cookie(EXPIRY_COOKIE);
                Some(cookie.and_then(|v| v.trim().parse().ok()).unwrap_or(0))
            }
        }
    }

    /// Check if credentials expire within `buffer` (or already have)
    pub async fn is_expiring_soon(&self, buffer: Duration) -> bool {
        match self.derived_expiry_ms().await {
            None => false,
            Some(exp) => {
                let threshold = Utc::now().timestamp_millis() + buffer.as_millis() as i64;
                exp <= threshold
            }
        }
    }

    /// A 401 may be healed by refreshing only in cookie mode with a known user
    pub async fn can_reactively_refresh(&self) -> bool {
        let session = self.session.read().await;
        session.transport_mode == TransportMode::CookieBased && session.user_id.is_some()
    }

    pub async fn has_identity(&self) -> bool {
        self.session.read().await.has_identity()
    }

    fn persist(&self, session: &Session) {
        let Some(path) = self.db_path.as_deref() else {
            return;
        };

        // Cookie mode keeps only the identity; tokens never exist there
        let record = match session.transport_mode {
            TransportMode::TokenBased => PersistedSession::from(session),
            TransportMode::CookieBased => PersistedSession {
                user_id: session.user_id.clone(),
                ..Default::default()
            },
        };

        if let Err(e) = persist::save(path, &record) {
            tracing::warn!("Failed to persist session: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login(access_token: Option<&str>) -> LoginResponse {
        LoginResponse {
            access_token: access_token.map(String::from),
            refresh_token: access_token.map(|_| "refresh".to_string()),
            expires_in: Some(600),
            user_id: "user-1".to_string(),
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_token_expiration_check() {
        let store = SessionStore::new_for_testing(Session::anonymous(TransportMode::CookieBased));
        store.establish(&login(Some("token"))).await;

        // Token expires in 10 minutes, buffer is 10 seconds - no refresh needed
        assert!(!store.is_expiring_soon(Duration::from_secs(10)).await);

        // Buffer wider than the remaining lifetime - refresh needed
        assert!(store.is_expiring_soon(Duration::from_secs(900)).await);
    }

    #[tokio::test]
    async fn test_cookie_login_stores_no_tokens() {
        let store = SessionStore::new_for_testing(Session::anonymous(TransportMode::TokenBased));
        store.establish(&login(None)).await;

        let session = store.snapshot().await;
        assert_eq!(session.transport_mode, TransportMode::CookieBased);
        assert!(session.access_token.is_none());
        assert!(session.refresh_token.is_none());
        assert!(session.expires_at_epoch_ms.is_none());
        assert_eq!(session.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_missing_expiry_cookie_with_identity_is_expired() {
        let store = SessionStore::new_for_testing(Session::anonymous(TransportMode::CookieBased));
        store.establish(&login(None)).await;

        assert_eq!(store.derived_expiry_ms().await, Some(0));
        assert!(store.is_expiring_soon(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_expiry_read_from_cookie() {
        let store = SessionStore::new_for_testing(Session::anonymous(TransportMode::CookieBased));
        store.establish(&login(None)).await;

        let future = Utc::now().timestamp_millis() + 3_600_000;
        store.cookie_jar().add_cookie_str(
            &format!("{}={}; Path=/", EXPIRY_COOKIE, future),
            &Url::parse("http://localhost/").unwrap(),
        );

        assert_eq!(store.derived_expiry_ms().await, Some(future));
        assert!(!store.is_expiring_soon(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_anonymous_session_never_expires() {
        let store = SessionStore::new_for_testing(Session::anonymous(TransportMode::CookieBased));
        assert_eq!(store.derived_expiry_ms().await, None);
        assert!(!store.is_expiring_soon(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_apply_refresh_keeps_refresh_token_unless_rotated() {
        let store = SessionStore::new_for_testing(Session::anonymous(TransportMode::CookieBased));
        store.establish(&login(Some("old"))).await;

        store
            .apply_refresh(TokenData {
                access_token: "new".into(),
                refresh_token: None,
                expires_at_epoch_ms: 42,
            })
            .await;

        let session = store.snapshot().await;
        assert_eq!(session.access_token.as_deref(), Some("new"));
        assert_eq!(session.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(session.expires_at_epoch_ms, Some(42));
    }

    #[tokio::test]
    async fn test_clear_drops_credentials_and_cookies() {
        let store = SessionStore::new_for_testing(Session::anonymous(TransportMode::CookieBased));
        store.establish(&login(None)).await;
        store.cookie_jar().add_cookie_str(
            &format!("{}=abc; Path=/", CSRF_COOKIE),
            &Url::parse("http://localhost/").unwrap(),
        );
        assert_eq!(store.csrf_token().as_deref(), Some("abc"));

        store.clear().await;

        assert!(!store.has_identity().await);
        assert!(store.csrf_token().is_none());
        assert!(!store.can_reactively_refresh().await);
    }

    #[tokio::test]
    async fn test_restore_from_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.sqlite3");
        persist::save(
            &path,
            &PersistedSession {
                access_token: Some("persisted".into()),
                refresh_token: Some("r".into()),
                expires_at_ms: Some(1),
                user_id: Some("u".into()),
            },
        )
        .unwrap();

        let detector = AuthModeDetector::new();
        let store = SessionStore::restore(
            &detector,
            Arc::new(Jar::default()),
            Url::parse("http://localhost/").unwrap(),
            Some(path),
        )
        .unwrap();

        let session = store.snapshot().await;
        assert_eq!(session.transport_mode, TransportMode::TokenBased);
        assert_eq!(session.access_token.as_deref(), Some("persisted"));
    }
}
