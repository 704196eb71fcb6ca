use bytes::Bytes;
use reqwest::cookie::Jar;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::{
    AuthModeDetector, LoginRequest, LoginResponse, RetryingRequestWrapper, Session, SessionStore,
    TokenRefreshCoordinator, TransportMode, DEFAULT_MAX_RETRIES,
};
use crate::config::ClientConfig;
use crate::envelope;
use crate::error::ApiError;
use crate::http_client::{Call, CallAuth, RequestExecutor, LOGIN_PATH, LOGOUT_PATH, REGISTER_PATH};
use crate::retry_policy::RetryPolicy;
use crate::upload::{
    select_strategy, CancelHandle, ChunkedUploadOrchestrator, UploadObserver, UploadRequest,
    UploadState, UploadStrategy,
};

/// Single-request upload endpoint
pub const UPLOAD_PATH: &str = "/upload";

/// API client
/// The one entry point for callers: authenticated JSON calls, downloads and uploads,
/// all sharing one session, one refresh coordinator and one connection pool
pub struct ApiClient {
    executor: RequestExecutor,
    wrapper: RetryingRequestWrapper,
    session: Arc<SessionStore>,
    refresher: Arc<TokenRefreshCoordinator>,
    detector: Arc<AuthModeDetector>,

    /// Payloads above this size use a chunked session
    upload_threshold: u64,

    /// Per-chunk retry policy
    chunk_policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let cookie_url = Url::parse(&config.base_url).map_err(|e| {
            ApiError::ConfigError(format!("Invalid base URL '{}': {}", config.base_url, e))
        })?;

        let jar = Arc::new(Jar::default());
        let client = RequestExecutor::build_client(
            Arc::clone(&jar),
            config.max_connections,
            config.connect_timeout,
            config.request_timeout,
        )?;

        let detector = Arc::new(AuthModeDetector::new());
        let session = Arc::new(SessionStore::restore(
            &detector,
            jar,
            cookie_url,
            config.session_db.clone(),
        )?);

        let refresher = Arc::new(TokenRefreshCoordinator::new(
            client.clone(),
            config.base_url.clone(),
            Arc::clone(&session),
        ));

        let executor = RequestExecutor::new(
            client,
            config.base_url.clone(),
            Arc::clone(&session),
            Arc::clone(&refresher),
            config.refresh_buffer,
        );

        let wrapper = RetryingRequestWrapper::new(
            Arc::clone(&session),
            Arc::clone(&refresher),
            config.settle_delay,
        );

        tracing::debug!(
            base_url = %config.base_url,
            mode = ?detector.cached(),
            "API client initialized"
        );

        Ok(Self {
            executor,
            wrapper,
            session,
            refresher,
            detector,
            upload_threshold: config.upload_threshold,
            chunk_policy: config.chunk_retry_policy(),
        })
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    pub fn refresher(&self) -> &Arc<TokenRefreshCoordinator> {
        &self.refresher
    }

    /// Transport mode detected from persisted evidence at startup
    pub fn detected_mode(&self) -> Option<TransportMode> {
        self.detector.cached()
    }

    pub async fn transport_mode(&self) -> TransportMode {
        self.session.transport_mode().await
    }

    pub async fn current_session(&self) -> Session {
        self.session.snapshot().await
    }

    /// Log in. A body carrying `accessToken` selects token mode, otherwise the
    /// server's cookies carry the session.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        tracing::info!(email = %email, "Logging in...");

        let body = serde_json::to_value(LoginRequest { email, password })
            .map_err(|e| ApiError::Internal(e.into()))?;
        let bytes = self
            .executor
            .execute(Call::new(Method::POST, LOGIN_PATH).json(body))
            .await?;

        let login: LoginResponse = envelope::decode_bytes(&bytes)?;
        if login.user_id.is_empty() {
            return Err(ApiError::ProtocolViolation(
                "Login response does not contain userId".to_string(),
            ));
        }

        self.session.establish(&login).await;
        Ok(login)
    }

    /// Create an account. Does not log in.
    pub async fn register<T, B>(&self, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let json = to_json(body)?;
        let bytes = self
            .executor
            .execute(Call::new(Method::POST, REGISTER_PATH).json(json))
            .await?;
        envelope::decode_bytes(&bytes)
    }

    /// End the session. The server call is best-effort; local state is always cleared.
    pub async fn logout(&self) {
        if self.session.has_identity().await {
            if let Err(e) = self
                .send(|| Ok(Call::new(Method::POST, LOGOUT_PATH)))
                .await
            {
                tracing::warn!(error = %e, "Server logout failed, clearing local session anyway");
            }
        }
        self.session.clear().await;
        tracing::info!("Logged out");
    }

    /// Refresh credentials now (joins a refresh already in flight)
    pub async fn refresh(&self) -> bool {
        self.refresher.refresh().await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let bytes = self.send(|| Ok(Call::new(Method::GET, path))).await?;
        envelope::decode_bytes(&bytes)
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let json = to_json(body)?;
        let bytes = self
            .send(|| Ok(Call::new(Method::POST, path).json(json.clone())))
            .await?;
        envelope::decode_bytes(&bytes)
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let json = to_json(body)?;
        let bytes = self
            .send(|| Ok(Call::new(Method::PUT, path).json(json.clone())))
            .await?;
        envelope::decode_bytes(&bytes)
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let bytes = self.send(|| Ok(Call::new(Method::DELETE, path))).await?;
        envelope::decode_bytes(&bytes)
    }

    /// GET with a caller-supplied bearer token instead of the session (shared links)
    pub async fn get_with_token<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
    ) -> Result<T, ApiError> {
        let bytes = self
            .send(|| Ok(Call::new(Method::GET, path).bearer(token)))
            .await?;
        envelope::decode_bytes(&bytes)
    }

    /// Raw response body
    pub async fn download(&self, path: &str) -> Result<Bytes, ApiError> {
        self.send(|| Ok(Call::new(Method::GET, path))).await
    }

    /// Single multipart request: `file`, `format`, `options`
    pub async fn upload_file(&self, request: &UploadRequest) -> Result<Value, ApiError> {
        let data = request.source.read_all().await?;
        let options = serde_json::to_string(&request.options)
            .map_err(|e| ApiError::Internal(e.into()))?;

        tracing::info!(
            file = %request.file_name,
            size = data.len(),
            "Uploading file in a single request"
        );

        let bytes = self
            .send(|| {
                let part = Part::stream(data.clone()).file_name(request.file_name.clone());
                let form = Form::new()
                    .part("file", part)
                    .text("format", request.format.clone())
                    .text("options", options.clone());
                Ok(Call::new(Method::POST, UPLOAD_PATH).multipart(form))
            })
            .await?;
        envelope::decode_bytes(&bytes)
    }

    /// Upload by the size policy: chunked above the threshold, single request otherwise.
    /// Returns the job descriptor.
    pub async fn upload(
        &self,
        request: &UploadRequest,
        observers: Vec<Arc<dyn UploadObserver>>,
        cancel: CancelHandle,
    ) -> Result<Value, ApiError> {
        let size = request.source.len().await?;
        let strategy = select_strategy(size, self.upload_threshold);
        tracing::debug!(size = size, strategy = ?strategy, "Selected upload strategy");

        match strategy {
            UploadStrategy::Chunked => {
                let outcome = ChunkedUploadOrchestrator::new(self, self.chunk_policy.clone())
                    .with_observers(observers)
                    .with_cancel(cancel)
                    .run(request)
                    .await?;
                Ok(outcome.job_descriptor)
            }
            UploadStrategy::SingleRequest => {
                if cancel.is_cancelled() {
                    return Err(ApiError::Cancelled);
                }
                notify_state(&observers, UploadState::Uploading);
                match self.upload_file(request).await {
                    Ok(job) => {
                        for observer in &observers {
                            observer.on_progress(100.0);
                        }
                        notify_state(&observers, UploadState::Done);
                        Ok(job)
                    }
                    Err(e) => {
                        notify_state(&observers, UploadState::Failed);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Continue a chunked upload the server still holds. `chunk_size` is the
    /// size init returned, needed when the status endpoint omits it.
    pub async fn resume_upload(
        &self,
        upload_id: &str,
        chunk_size: Option<u64>,
        request: &UploadRequest,
        observers: Vec<Arc<dyn UploadObserver>>,
        cancel: CancelHandle,
    ) -> Result<Value, ApiError> {
        let outcome = ChunkedUploadOrchestrator::new(self, self.chunk_policy.clone())
            .with_observers(observers)
            .with_cancel(cancel)
            .resume(upload_id, chunk_size, request)
            .await?;
        Ok(outcome.job_descriptor)
    }

    /// Execute a call built by `build`. Session calls go through the 401 wrapper;
    /// public and bearer calls are sent once.
    pub(crate) async fn send<F>(&self, build: F) -> Result<Bytes, ApiError>
    where
        F: Fn() -> Result<Call, ApiError>,
    {
        let first = build()?;
        if first.auth != CallAuth::Session {
            return self.executor.execute(first).await;
        }

        let executor = &self.executor;
        let build = &build;
        let mut pending = Some(first);

        self.wrapper
            .execute(
                move || {
                    // Request bodies are consumed on send, so retries rebuild the call
                    let call = pending.take().map_or_else(build, Ok);
                    async move { executor.execute(call?).await }
                },
                DEFAULT_MAX_RETRIES,
            )
            .await
    }
}

fn to_json<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|e| ApiError::Internal(e.into()))
}

fn notify_state(observers: &[Arc<dyn UploadObserver>], state: UploadState) {
    for observer in observers {
        observer.on_state_change(state);
    }
}
