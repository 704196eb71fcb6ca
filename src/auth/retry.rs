// Reactive 401 handling: refresh once, retry once

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::refresh::TokenRefreshCoordinator;
use super::session::SessionStore;
use crate::error::ApiError;

/// Retries allowed per wrapped call unless the caller asks otherwise
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Wraps every authenticated call.
///
/// Only a 401 is recoverable here, and only in cookie mode with a known user:
/// one refresh fixes a stale cookie deterministically, so there is no backoff.
/// Every other failure is returned as-is on the first attempt.
pub struct RetryingRequestWrapper {
    session: Arc<SessionStore>,
    refresher: Arc<TokenRefreshCoordinator>,

    /// Pause after a cookie refresh before replaying the call
    settle_delay: Duration,
}

impl RetryingRequestWrapper {
    pub fn new(
        session: Arc<SessionStore>,
        refresher: Arc<TokenRefreshCoordinator>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            session,
            refresher,
            settle_delay,
        }
    }

    /// Run `request_fn`, replaying it at most `max_retries` times after a
    /// successful refresh. A 401 that survives the retry, or whose refresh
    /// fails, becomes `AuthExpired`; an ineligible 401 is returned as-is.
    pub async fn execute<F, Fut, T>(&self, mut request_fn: F, max_retries: u32) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            let err = match request_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_unauthorized() => err,
                Err(err) => return Err(err),
            };

            if attempt >= max_retries || !self.session.can_reactively_refresh().await {
                // A 401 that was never eligible for a retry is the caller's to handle
                if attempt == 0 {
                    return Err(err);
                }
                return Err(self.expire(err).await);
            }

            tracing::warn!(
                attempt = attempt + 1,
                max_retries = max_retries,
                "Received 401, refreshing session and retrying..."
            );

            if !self.refresher.refresh().await {
                tracing::error!("Session refresh after 401 failed");
                return Err(self.expire(err).await);
            }

            tokio::time::sleep(self.settle_delay).await;
            attempt += 1;
        }
    }

    /// Turn a 401 that survived recovery into `AuthExpired`, dropping whatever session is left
    async fn expire(&self, err: ApiError) -> ApiError {
        if self.session.has_identity().await {
            self.session.clear().await;
        }
        let message = match err {
            ApiError::ServerRejected { message, .. } => message,
            other => other.to_string(),
        };
        ApiError::AuthExpired(format!("Request unauthorized: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::refresh::REFRESH_COOKIE_PATH;
    use crate::auth::session::EXPIRY_COOKIE;
    use crate::auth::types::{Session, TransportMode};
    use crate::error::ErrorKind;
    use reqwest::{Client, Url};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn wrapper_for(session: Session) -> (RetryingRequestWrapper, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new_for_testing(session));
        let refresher = Arc::new(TokenRefreshCoordinator::new(
            Client::new(),
            "http://127.0.0.1:9",
            Arc::clone(&store),
        ));
        (
            RetryingRequestWrapper::new(Arc::clone(&store), refresher, Duration::ZERO),
            store,
        )
    }

    fn unauthorized() -> ApiError {
        ApiError::ServerRejected {
            status: 401,
            message: "Unauthorized".to_string(),
        }
    }

    #[tokio::test]
    async fn test_non_401_is_not_retried() {
        let (wrapper, _) = wrapper_for(Session {
            user_id: Some("u".into()),
            ..Session::anonymous(TransportMode::CookieBased)
        });
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), ApiError> = wrapper
            .execute(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::ServerRejected {
                        status: 500,
                        message: "boom".into(),
                    })
                },
                DEFAULT_MAX_RETRIES,
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::ServerRejected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_mode_401_is_not_retried() {
        let (wrapper, store) = wrapper_for(Session {
            access_token: Some("t".into()),
            refresh_token: Some("r".into()),
            expires_at_epoch_ms: Some(i64::MAX),
            user_id: Some("u".into()),
            ..Session::anonymous(TransportMode::TokenBased)
        });
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), ApiError> = wrapper
            .execute(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(unauthorized())
                },
                DEFAULT_MAX_RETRIES,
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerRejected);
        assert_eq!(err.status(), Some(401));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.has_identity().await);
    }

    #[tokio::test]
    async fn test_failed_refresh_after_401_is_auth_expired() {
        // No expiry cookie and nothing listening: the cookie refresh fails
        let (wrapper, store) = wrapper_for(Session {
            user_id: Some("u".into()),
            ..Session::anonymous(TransportMode::CookieBased)
        });
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), ApiError> = wrapper
            .execute(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(unauthorized())
                },
                DEFAULT_MAX_RETRIES,
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::AuthExpired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!store.has_identity().await);
    }

    #[tokio::test]
    async fn test_anonymous_cookie_401_is_not_retried() {
        let (wrapper, _) = wrapper_for(Session::anonymous(TransportMode::CookieBased));
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), ApiError> = wrapper
            .execute(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(unauthorized())
                },
                DEFAULT_MAX_RETRIES,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let (wrapper, _) = wrapper_for(Session::anonymous(TransportMode::CookieBased));
        let result = wrapper
            .execute(|| async { Ok::<_, ApiError>(7) }, DEFAULT_MAX_RETRIES)
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cookie_refresh_waits_settle_delay_before_retry() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", REFRESH_COOKIE_PATH)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(SessionStore::new_for_testing(Session {
            user_id: Some("u".into()),
            ..Session::anonymous(TransportMode::CookieBased)
        }));
        let expires = chrono::Utc::now().timestamp_millis() + 3_600_000;
        store.cookie_jar().add_cookie_str(
            &format!("{}={}; Path=/", EXPIRY_COOKIE, expires),
            &Url::parse("http://localhost/").unwrap(),
        );
        let refresher = Arc::new(TokenRefreshCoordinator::new(
            Client::new(),
            server.url(),
            Arc::clone(&store),
        ));
        let wrapper =
            RetryingRequestWrapper::new(Arc::clone(&store), refresher, Duration::from_millis(500));

        let calls = std::sync::Mutex::new(Vec::new());
        let log = &calls;
        let result = wrapper
            .execute(
                move || async move {
                    let mut log = log.lock().unwrap();
                    log.push(Instant::now());
                    if log.len() == 1 {
                        Err(unauthorized())
                    } else {
                        Ok("retried")
                    }
                },
                DEFAULT_MAX_RETRIES,
            )
            .await;

        assert_eq!(result.unwrap(), "retried");
        refresh.assert_async().await;
        let times = calls.lock().unwrap().clone();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_millis(500));
        assert!(store.has_identity().await);
    }
}
