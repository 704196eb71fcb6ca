// Token refresh logic
// One refresh at a time per coordinator; concurrent callers share its result

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::session::SessionStore;
use super::types::{RefreshRequest, RefreshResponse, TokenData, TransportMode};
use crate::envelope;
use crate::error::ApiError;

pub const REFRESH_PATH: &str = "/auth/refresh";
pub const REFRESH_COOKIE_PATH: &str = "/auth/refresh-cookie";

type PendingRefresh = Shared<BoxFuture<'static, bool>>;

/// Single-flight credential refresh.
///
/// The in-flight slot is the only place a pending refresh lives. It is filled
/// by the first caller and emptied by the refresh itself when it settles.
pub struct TokenRefreshCoordinator {
    /// HTTP client for refresh requests (shares the session cookie jar)
    client: Client,

    /// API base URL without trailing slash
    base_url: String,

    session: Arc<SessionStore>,

    in_flight: Arc<Mutex<Option<PendingRefresh>>>,
}

impl TokenRefreshCoordinator {
    pub fn new(client: Client, base_url: impl Into<String>, session: Arc<SessionStore>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Refresh credentials, joining the refresh already in flight if there is one.
    /// Returns whether the session is usable afterwards.
    pub async fn refresh(&self) -> bool {
        let pending = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    tracing::debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    let pending = run_refresh(
                        self.client.clone(),
                        self.base_url.clone(),
                        Arc::clone(&self.session),
                        Arc::clone(&self.in_flight),
                    )
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Whether a refresh is currently pending
    pub async fn is_in_flight(&self) -> bool {
        self.in_flight.lock().await.is_some()
    }
}

async fn run_refresh(
    client: Client,
    base_url: String,
    session: Arc<SessionStore>,
    in_flight: Arc<Mutex<Option<PendingRefresh>>>,
) -> bool {
    tracing::debug!("Refreshing session credentials...");

    let result = match session.transport_mode().await {
        TransportMode::TokenBased => refresh_token(&client, &base_url, &session).await,
        TransportMode::CookieBased => refresh_cookie(&client, &base_url, &session).await,
    };

    let ok = match result {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("Token refresh failed: {}", e);
            session.clear().await;
            false
        }
    };

    in_flight.lock().await.take();
    ok
}

/// Refresh a bearer token with the stored refresh token
async fn refresh_token(
    client: &Client,
    base_url: &str,
    session: &SessionStore,
) -> Result<(), ApiError> {
    let Some(refresh_token) = session.refresh_token().await else {
        return Err(ApiError::AuthExpired(
            "No refresh token available".to_string(),
        ));
    };

    tracing::info!("Refreshing access token...");

    let response = client
        .post(format!("{}{}", base_url, REFRESH_PATH))
        .json(&RefreshRequest {
            refresh_token: &refresh_token,
        })
        .send()
        .await
        .map_err(ApiError::from_reqwest)?;

    let status = response.status();
    let body = response.bytes().await.map_err(ApiError::from_reqwest)?;
    if !status.is_success() {
        return Err(ApiError::from_response(
            status,
            &String::from_utf8_lossy(&body),
        ));
    }

    let data: RefreshResponse = envelope::decode_bytes(&body)?;
    if data.access_token.is_empty() {
        return Err(ApiError::ProtocolViolation(
            "Refresh response does not contain accessToken".to_string(),
        ));
    }

    let token = TokenData::from_expires_in(data.access_token, data.refresh_token, data.expires_in);
    tracing::info!(
        expires_at_ms = token.expires_at_epoch_ms,
        "Access token refreshed"
    );
    session.apply_refresh(token).await;
    Ok(())
}

/// Ask the server to rewrite the session cookies, then check that it did
async fn refresh_cookie(
    client: &Client,
    base_url: &str,
    session: &SessionStore,
) -> Result<(), ApiError> {
    tracing::info!("Refreshing cookie session...");

    let response = client
        .post(format!("{}{}", base_url, REFRESH_COOKIE_PATH))
        .send()
        .await
        .map_err(ApiError::from_reqwest)?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(ApiError::from_response(status, &text));
    }

    // The new expiry cookie must be in the future, else the refresh did nothing
    let now = chrono::Utc::now().timestamp_millis();
    match session.derived_expiry_ms().await {
        Some(exp) if exp > now => {
            tracing::info!(expires_at_ms = exp, "Cookie session refreshed");
            Ok(())
        }
        other => Err(ApiError::AuthExpired(format!(
            "Cookie refresh returned {} but expiry cookie is {}",
            status,
            other.map_or_else(|| "missing".to_string(), |e| e.to_string())
        ))),
    }
}
