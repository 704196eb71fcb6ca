//! Chunked upload session lifecycle.
//!
//! `Idle -> Initializing -> Uploading -> Completing -> Done`, with `Aborted`
//! and `Failed` reachable from every non-terminal state. Chunks go out one at
//! a time in increasing index order; each chunk gets its own bounded backoff.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::api::{InitUploadRequest, UploadApi, UploadStatus};
use super::progress::{ProgressTracker, UploadObserver};
use super::source::{chunk_range, validate_layout};
use super::{CancelHandle, UploadRequest, UploadState};
use crate::error::ApiError;
use crate::retry_policy::RetryPolicy;

/// Result of a finished upload
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOutcome {
    pub upload_id: String,
    /// Opaque job handle returned by finalize
    pub job_descriptor: Value,
}

/// Local view of one server-side upload session
#[derive(Debug)]
struct UploadSession {
    upload_id: String,
    total_chunks: u32,
    chunk_size_bytes: u64,
    received: BTreeSet<u32>,
    expires_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    fn record(&mut self, indices: impl IntoIterator<Item = u32>) {
        let total = self.total_chunks;
        self.received
            .extend(indices.into_iter().filter(|index| *index < total));
    }

    fn missing(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.received.contains(index))
            .collect()
    }
}

/// Drives one upload from init to finalize
pub struct ChunkedUploadOrchestrator<'a, A: UploadApi> {
    api: &'a A,
    policy: RetryPolicy,
    observers: Vec<Arc<dyn UploadObserver>>,
    cancel: CancelHandle,
}

impl<'a, A: UploadApi> ChunkedUploadOrchestrator<'a, A> {
    pub fn new(api: &'a A, policy: RetryPolicy) -> Self {
        Self {
            api,
            policy,
            observers: Vec::new(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_observers(mut self, observers: Vec<Arc<dyn UploadObserver>>) -> Self {
        self.observers.extend(observers);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels this run at the next chunk or attempt boundary,
    /// or during a backoff wait
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Open a new session and upload the whole payload
    pub async fn run(&self, request: &UploadRequest) -> Result<UploadOutcome, ApiError> {
        self.set_state(UploadState::Initializing);
        if self.cancel.is_cancelled() {
            self.set_state(UploadState::Aborted);
            return Err(ApiError::Cancelled);
        }

        let file_size = match request.source.len().await {
            Ok(size) => size,
            Err(e) => return Err(self.fail(e)),
        };

        tracing::info!(
            file = %request.file_name,
            size = file_size,
            format = %request.format,
            "Initializing chunked upload"
        );

        let init = self
            .api
            .init_upload(&InitUploadRequest {
                file_name: request.file_name.clone(),
                file_size,
                format: request.format.clone(),
                options: request.options.clone(),
            })
            .await
            .map_err(|e| self.fail(e))?;

        if init.upload_id.is_empty() {
            return Err(self.fail(ApiError::ProtocolViolation(
                "Init response does not contain uploadId".to_string(),
            )));
        }

        let session = UploadSession {
            upload_id: init.upload_id,
            total_chunks: init.total_chunks,
            chunk_size_bytes: init.chunk_size_bytes,
            received: BTreeSet::new(),
            expires_at: init.expires_at,
        };

        if let Err(e) = validate_layout(file_size, session.chunk_size_bytes, session.total_chunks) {
            self.abort_quietly(&session.upload_id).await;
            return Err(self.fail(e));
        }

        tracing::info!(
            upload_id = %session.upload_id,
            total_chunks = session.total_chunks,
            chunk_size = session.chunk_size_bytes,
            expires_at = ?session.expires_at,
            "Upload session opened"
        );

        self.drive(request, file_size, session).await
    }

    /// Continue an existing session, sending only the chunks the server lacks.
    ///
    /// The chunk size comes from the status response, or from `chunk_size`
    /// (the value init returned) when status does not report it. Without
    /// either the split boundaries are unknown and resume refuses to send.
    pub async fn resume(
        &self,
        upload_id: &str,
        chunk_size: Option<u64>,
        request: &UploadRequest,
    ) -> Result<UploadOutcome, ApiError> {
        self.set_state(UploadState::Initializing);
        if self.cancel.is_cancelled() {
            self.set_state(UploadState::Aborted);
            return Err(ApiError::Cancelled);
        }

        let file_size = match request.source.len().await {
            Ok(size) => size,
            Err(e) => return Err(self.fail(e)),
        };

        // A failed status lookup leaves the server session alone so resume can be retried
        let status = self
            .api
            .upload_status(upload_id)
            .await
            .map_err(|e| self.fail(e))?;

        let chunk_size = match resumed_chunk_size(upload_id, &status, chunk_size) {
            Ok(size) => size,
            Err(e) => return Err(self.fail(e)),
        };
        let mut session = UploadSession {
            upload_id: upload_id.to_string(),
            total_chunks: status.total_chunks,
            chunk_size_bytes: chunk_size,
            received: BTreeSet::new(),
            expires_at: status.expires_at,
        };

        if let Err(e) = validate_layout(file_size, chunk_size, session.total_chunks) {
            return Err(self.fail(e));
        }

        session.record(status.received_chunks.indices());
        tracing::info!(
            upload_id = %upload_id,
            received = session.received.len(),
            total_chunks = session.total_chunks,
            "Resuming chunked upload"
        );

        self.drive(request, file_size, session).await
    }

    async fn drive(
        &self,
        request: &UploadRequest,
        file_size: u64,
        mut session: UploadSession,
    ) -> Result<UploadOutcome, ApiError> {
        self.set_state(UploadState::Uploading);

        let tracker = Arc::new(ProgressTracker::new(
            session.total_chunks,
            self.observers.clone(),
        ));
        let mut acknowledged = session.received.len() as u32;

        for index in session.missing() {
            if self.cancel.is_cancelled() {
                return Err(self.abort(&session.upload_id, ApiError::Cancelled).await);
            }

            let range = chunk_range(index, session.chunk_size_bytes, file_size);
            let data = match request.source.read_range(range).await {
                Ok(data) => data,
                Err(e) => return Err(self.abort(&session.upload_id, e).await),
            };

            let chunks_sent = session.received.len() as u32;
            let chunk_len = data.len() as u64;
            let api = self.api;
            let cancel = &self.cancel;
            let upload_id = session.upload_id.as_str();
            let chunk_tracker = Arc::clone(&tracker);

            let result = self
                .policy
                .run_until(
                    move |attempt| {
                        let data = data.clone();
                        let tracker = Arc::clone(&chunk_tracker);
                        async move {
                            if cancel.is_cancelled() {
                                return Err(ApiError::Cancelled);
                            }
                            tracing::debug!(
                                upload_id = %upload_id,
                                chunk = index,
                                attempt = attempt,
                                bytes = chunk_len,
                                "Sending chunk"
                            );
                            let on_bytes = Arc::new(move |sent: u64| {
                                tracker.chunk_bytes(chunks_sent, sent, chunk_len)
                            });
                            api.upload_chunk(upload_id, index, data, on_bytes).await
                        }
                    },
                    ApiError::is_transient,
                    |attempt, err, delay| {
                        tracing::warn!(
                            upload_id = %upload_id,
                            chunk = index,
                            attempt = attempt,
                            max_attempts = self.policy.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Chunk upload failed, retrying"
                        );
                    },
                    self.cancel.cancelled(),
                )
                .await;

            match result {
                Err(_) if self.cancel.is_cancelled() => {
                    return Err(self.abort(&session.upload_id, ApiError::Cancelled).await);
                }
                Ok(ack) => {
                    session.record([index]);
                    acknowledged = ack.received_chunks.indices().len() as u32;
                    tracker.chunk_complete(index, session.received.len() as u32);
                }
                Err(e) => {
                    tracing::error!(
                        upload_id = %session.upload_id,
                        chunk = index,
                        error = %e,
                        "Chunk upload gave up"
                    );
                    return Err(self.abort(&session.upload_id, e).await);
                }
            }
        }

        if acknowledged < session.total_chunks {
            self.reconcile(&mut session).await?;
        }

        if self.cancel.is_cancelled() {
            return Err(self.abort(&session.upload_id, ApiError::Cancelled).await);
        }

        self.set_state(UploadState::Completing);
        let complete = match self.api.complete_upload(&session.upload_id).await {
            Ok(complete) if complete.success => complete,
            Ok(_) => {
                let err = ApiError::ServerRejected {
                    status: 200,
                    message: format!("Finalize of upload {} reported failure", session.upload_id),
                };
                return Err(self.abort(&session.upload_id, err).await);
            }
            Err(e) => return Err(self.abort(&session.upload_id, e).await),
        };

        tracker.finish();
        self.set_state(UploadState::Done);
        tracing::info!(upload_id = %session.upload_id, "Upload complete");

        Ok(UploadOutcome {
            upload_id: session.upload_id,
            job_descriptor: complete.job_descriptor,
        })
    }

    /// Server acknowledged fewer chunks than it asked for: ask it once which
    async fn reconcile(&self, session: &mut UploadSession) -> Result<(), ApiError> {
        tracing::warn!(
            upload_id = %session.upload_id,
            total_chunks = session.total_chunks,
            "Server acknowledged fewer chunks than expected, checking status"
        );

        let status = match self.api.upload_status(&session.upload_id).await {
            Ok(status) => status,
            Err(e) => return Err(self.abort(&session.upload_id, e).await),
        };

        let server_has = status.received_chunks.indices();
        let missing: Vec<u32> = (0..session.total_chunks)
            .filter(|index| !server_has.contains(index))
            .collect();

        if missing.is_empty() {
            session.record(server_has);
            return Ok(());
        }

        let err = ApiError::ProtocolViolation(format!(
            "Server is missing chunks {:?} of upload {} after all were sent",
            missing, session.upload_id
        ));
        Err(self.abort(&session.upload_id, err).await)
    }

    /// Best-effort server abort, then the terminal state matching `err`
    async fn abort(&self, upload_id: &str, err: ApiError) -> ApiError {
        self.abort_quietly(upload_id).await;
        if matches!(err, ApiError::Cancelled) {
            self.set_state(UploadState::Aborted);
        } else {
            self.set_state(UploadState::Failed);
        }
        err
    }

    async fn abort_quietly(&self, upload_id: &str) {
        match self.api.abort_upload(upload_id).await {
            Ok(()) => tracing::info!(upload_id = %upload_id, "Upload session aborted"),
            Err(e) => tracing::warn!(upload_id = %upload_id, error = %e, "Failed to abort upload session"),
        }
    }

    fn fail(&self, err: ApiError) -> ApiError {
        self.set_state(UploadState::Failed);
        err
    }

    fn set_state(&self, state: UploadState) {
        tracing::debug!(state = ?state, "Upload state");
        for observer in &self.observers {
            observer.on_state_change(state);
        }
    }
}

/// Server-given chunk size for a resumed session
fn resumed_chunk_size(
    upload_id: &str,
    status: &UploadStatus,
    known: Option<u64>,
) -> Result<u64, ApiError> {
    match (status.chunk_size_bytes, known) {
        (Some(reported), Some(known)) if reported != known => Err(ApiError::ProtocolViolation(
            format!(
                "Upload {} reports chunk size {} but was opened with {}",
                upload_id, reported, known
            ),
        )),
        (Some(size), _) | (None, Some(size)) => Ok(size),
        (None, None) => Err(ApiError::ProtocolViolation(format!(
            "Status of upload {} does not report chunkSizeBytes; pass the chunk size returned at init",
            upload_id
        ))),
    }
}
