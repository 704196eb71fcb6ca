// Upload module
// Strategy selection, chunked upload sessions and progress reporting

mod api;
mod orchestrator;
mod progress;
mod source;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;

pub use api::{
    ByteProgress, ChunkAck, CompleteResponse, InitUploadRequest, InitUploadResponse,
    ReceivedChunks, UploadApi, UploadStatus, INIT_PATH,
};
pub use orchestrator::{ChunkedUploadOrchestrator, UploadOutcome};
pub use progress::{
    overall_percent, ProgressTracker, RecordingObserver, TracingObserver, UploadEvent,
    UploadObserver, TRANSFER_SHARE,
};
pub use source::{chunk_range, validate_layout, UploadSource};

/// Payloads larger than this go through a chunked session
pub const DEFAULT_CHUNKED_THRESHOLD_BYTES: u64 = 80 * 1024 * 1024;

/// Lifecycle of one upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Initializing,
    Uploading,
    Completing,
    Done,
    Aborted,
    Failed,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Done | UploadState::Aborted | UploadState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One multipart `POST /upload`
    SingleRequest,
    /// init, chunks, complete
    Chunked,
}

/// Pick the upload path for a payload of `size` bytes
pub fn select_strategy(size: u64, threshold: u64) -> UploadStrategy {
    if size > threshold {
        UploadStrategy::Chunked
    } else {
        UploadStrategy::SingleRequest
    }
}

/// Everything needed to upload one file
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub format: String,
    pub options: Value,
    pub source: UploadSource,
}

impl UploadRequest {
    /// Upload a file from disk under its own name
    pub fn from_path(path: impl Into<PathBuf>, format: impl Into<String>, options: Value) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        Self {
            file_name,
            format: format.into(),
            options,
            source: UploadSource::Path(path),
        }
    }
}

/// Cooperative cancellation flag, checked between chunks and attempts.
/// Backoff sleeps also wake on it.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<CancelInner>);

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_strategy_threshold() {
        assert_eq!(
            select_strategy(85 * MB, DEFAULT_CHUNKED_THRESHOLD_BYTES),
            UploadStrategy::Chunked
        );
        assert_eq!(
            select_strategy(50 * MB, DEFAULT_CHUNKED_THRESHOLD_BYTES),
            UploadStrategy::SingleRequest
        );
        assert_eq!(
            select_strategy(DEFAULT_CHUNKED_THRESHOLD_BYTES, DEFAULT_CHUNKED_THRESHOLD_BYTES),
            UploadStrategy::SingleRequest
        );
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());
        clone.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let handle = CancelHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };
        tokio::task::yield_now().await;
        handle.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();

        // Already cancelled: returns immediately
        handle.cancelled().await;
    }

    #[test]
    fn test_request_from_path_uses_file_name() {
        let request = UploadRequest::from_path("/tmp/data/scan.zip", "xyz", Value::Null);
        assert_eq!(request.file_name, "scan.zip");
        assert_eq!(request.format, "xyz");
    }
}
