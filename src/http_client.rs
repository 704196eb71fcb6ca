use anyhow::Context;
use bytes::Bytes;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::multipart::Form;
use reqwest::{Client, Method};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{SessionStore, TokenRefreshCoordinator, TransportMode};
use crate::auth::{REFRESH_COOKIE_PATH, REFRESH_PATH};
use crate::error::ApiError;

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const LOGOUT_PATH: &str = "/auth/logout";

/// Endpoints that never carry session auth and never go through the 401 retry
pub const PUBLIC_PATHS: &[&str] = &[LOGIN_PATH, REFRESH_PATH, REFRESH_COOKIE_PATH, REGISTER_PATH];

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn is_public(path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    PUBLIC_PATHS.contains(&path)
}

fn is_state_changing(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::DELETE)
}

/// Which credentials a call presents
#[derive(Debug, Clone, PartialEq)]
pub enum CallAuth {
    /// Ambient session (bearer token or cookies + CSRF)
    Session,
    /// Nothing beyond what the cookie jar sends on its own
    Public,
    /// Caller-supplied bearer token, ignoring the session (shared links)
    Bearer(String),
}

pub enum CallBody {
    Empty,
    Json(Value),
    Multipart(Form),
}

/// One HTTP call, built fresh for every attempt
pub struct Call {
    pub method: Method,
    pub path: String,
    pub body: CallBody,
    pub auth: CallAuth,
}

impl Call {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let auth = if is_public(&path) {
            CallAuth::Public
        } else {
            CallAuth::Session
        };
        Self {
            method,
            path,
            body: CallBody::Empty,
            auth,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = CallBody::Json(body);
        self
    }

    pub fn multipart(mut self, form: Form) -> Self {
        self.body = CallBody::Multipart(form);
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.auth = CallAuth::Bearer(token.into());
        self
    }
}

/// Assembles headers and performs exactly one HTTP call
pub struct RequestExecutor {
    /// Shared HTTP client with connection pooling and the session cookie jar
    client: Client,

    /// API base URL without trailing slash
    base_url: String,

    session: Arc<SessionStore>,

    refresher: Arc<TokenRefreshCoordinator>,

    /// Refresh proactively when expiry is this close
    refresh_buffer: Duration,
}

impl RequestExecutor {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        session: Arc<SessionStore>,
        refresher: Arc<TokenRefreshCoordinator>,
        refresh_buffer: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            refresher,
            refresh_buffer,
        }
    }

    /// Create the pooled HTTP client bound to a cookie jar
    pub fn build_client(
        jar: Arc<Jar>,
        max_connections: usize,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Client> {
        Client::builder()
            .cookie_provider(jar)
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{}` in cookie mode, `Authorization: Bearer` in token mode
    pub async fn auth_headers(&self) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        let session = self.session.snapshot().await;

        if session.transport_mode == TransportMode::TokenBased {
            if let Some(token) = session.access_token {
                headers.insert(AUTHORIZATION, bearer_value(&token)?);
            }
        }

        Ok(headers)
    }

    /// Auth headers plus the CSRF echo for state-changing cookie-mode calls
    pub async fn secure_headers(&self, method: &Method, path: &str) -> Result<HeaderMap, ApiError> {
        let mut headers = self.auth_headers().await?;

        if is_state_changing(method)
            && !is_public(path)
            && self.session.transport_mode().await == TransportMode::CookieBased
        {
            match self.session.csrf_token() {
                Some(token) => {
                    let value = HeaderValue::from_str(&token).map_err(|e| {
                        ApiError::Internal(anyhow::anyhow!("Invalid CSRF cookie value: {}", e))
                    })?;
                    headers.insert(HeaderName::from_static(CSRF_HEADER), value);
                }
                None => tracing::debug!(path = %path, "No CSRF cookie for state-changing request"),
            }
        }

        Ok(headers)
    }

    /// Refresh ahead of time when the expiry is within the buffer.
    /// Failing here fails the call; it is not left to a later 401.
    pub async fn ensure_fresh(&self) -> Result<(), ApiError> {
        if !self.session.is_expiring_soon(self.refresh_buffer).await {
            return Ok(());
        }

        tracing::debug!("Credentials expiring soon, refreshing before request");
        if self.refresher.refresh().await {
            Ok(())
        } else {
            Err(ApiError::AuthExpired(
                "Session expired and could not be refreshed".to_string(),
            ))
        }
    }

    /// Execute one call and return the raw success body
    pub async fn execute(&self, call: Call) -> Result<Bytes, ApiError> {
        let Call {
            method,
            path,
            body,
            auth,
        } = call;

        let headers = match &auth {
            CallAuth::Session => {
                self.ensure_fresh().await?;
                self.secure_headers(&method, &path).await?
            }
            CallAuth::Public => HeaderMap::new(),
            CallAuth::Bearer(token) => {
                let mut headers = HeaderMap::new();
                headers.insert(AUTHORIZATION, bearer_value(token)?);
                headers
            }
        };

        let url = self.url(&path);
        let request_id = uuid::Uuid::new_v4().simple().to_string();

        tracing::debug!(
            method = %method,
            url = %url,
            request_id = %request_id,
            "Sending HTTP request"
        );

        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(headers)
            .header(REQUEST_ID_HEADER, request_id.as_str());

        request = match body {
            CallBody::Empty => request,
            CallBody::Json(value) => request.json(&value),
            CallBody::Multipart(form) => request.multipart(form),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let err = ApiError::from_reqwest(e);
                tracing::warn!(
                    error = %err,
                    url = %url,
                    request_id = %request_id,
                    "HTTP request error"
                );
                return Err(err);
            }
        };

        let status = response.status();
        let body = response.bytes().await.map_err(ApiError::from_reqwest)?;

        if status.is_success() {
            tracing::debug!(status = %status, request_id = %request_id, "Request successful");
            return Ok(body);
        }

        let error_text = String::from_utf8_lossy(&body);
        tracing::warn!(
            status = status.as_u16(),
            url = %url,
            request_id = %request_id,
            response_body = %error_text,
            "Received error response"
        );
        Err(ApiError::from_response(status, &error_text))
    }
}

fn bearer_value(token: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Invalid bearer token: {}", e)))
}
