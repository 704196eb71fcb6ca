//! Upload endpoint surface.
//!
//! The orchestrator only talks to the server through `UploadApi`, so the
//! session logic can be driven against an in-memory fake as easily as
//! against `ApiClient`.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::ApiClient;
use crate::error::ApiError;
use crate::http_client::Call;

pub const INIT_PATH: &str = "/upload/init";

/// Callback fed the cumulative number of chunk bytes handed to the transport
pub type ByteProgress = Arc<dyn Fn(u64) + Send + Sync>;

/// Slice size used when streaming a chunk body
const STREAM_SLICE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub format: String,
    pub options: Value,
}

/// Server-authoritative session layout
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub total_chunks: u32,
    pub chunk_size_bytes: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub chunk_index: u32,
    pub received_chunks: ReceivedChunks,
    pub total_chunks: u32,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub is_complete: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    #[serde(default)]
    pub job_descriptor: Value,
}

/// `receivedChunks` arrives either as the list of indices or as a count
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReceivedChunks {
    Indices(Vec<u32>),
    Count(u32),
}

impl ReceivedChunks {
    /// Indices the server holds. Chunks go out in order, so a count `n` means `0..n`.
    pub fn indices(&self) -> BTreeSet<u32> {
        match self {
            ReceivedChunks::Indices(indices) => indices.iter().copied().collect(),
            ReceivedChunks::Count(n) => (0..*n).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub received_chunks: ReceivedChunks,
    pub total_chunks: u32,
    #[serde(default)]
    pub chunk_size_bytes: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Server operations a chunked upload needs
pub trait UploadApi: Send + Sync {
    /// Open an upload session; the server decides the chunk layout.
    fn init_upload(
        &self,
        request: &InitUploadRequest,
    ) -> impl Future<Output = Result<InitUploadResponse, ApiError>> + Send;

    /// Send one chunk.
    fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        data: Bytes,
        on_bytes: ByteProgress,
    ) -> impl Future<Output = Result<ChunkAck, ApiError>> + Send;

    /// Ask the server to reassemble; yields the downstream job.
    fn complete_upload(
        &self,
        upload_id: &str,
    ) -> impl Future<Output = Result<CompleteResponse, ApiError>> + Send;

    fn upload_status(
        &self,
        upload_id: &str,
    ) -> impl Future<Output = Result<UploadStatus, ApiError>> + Send;

    /// Discard the server-side session.
    fn abort_upload(&self, upload_id: &str) -> impl Future<Output = Result<(), ApiError>> + Send;
}

pub fn chunk_path(upload_id: &str) -> String {
    format!("/upload/{}/chunk", upload_id)
}

pub fn complete_path(upload_id: &str) -> String {
    format!("/upload/{}/complete", upload_id)
}

pub fn status_path(upload_id: &str) -> String {
    format!("/upload/{}/status", upload_id)
}

pub fn session_path(upload_id: &str) -> String {
    format!("/upload/{}", upload_id)
}

/// Stream `data` in slices, reporting cumulative bytes as each slice is taken
fn counting_stream(
    data: Bytes,
    on_bytes: ByteProgress,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let slices: Vec<Bytes> = (0..data.len())
        .step_by(STREAM_SLICE_BYTES)
        .map(|start| data.slice(start..(start + STREAM_SLICE_BYTES).min(data.len())))
        .collect();

    let mut sent: u64 = 0;
    futures::stream::iter(slices).map(move |slice| {
        sent += slice.len() as u64;
        on_bytes(sent);
        Ok(slice)
    })
}

fn chunk_form(chunk_index: u32, data: Bytes, on_bytes: ByteProgress) -> Result<Form, ApiError> {
    let len = data.len() as u64;
    let body = reqwest::Body::wrap_stream(counting_stream(data, on_bytes));
    let part = Part::stream_with_length(body, len)
        .file_name(format!("chunk-{}", chunk_index))
        .mime_str("application/octet-stream")
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("MIME parse error: {}", e)))?;

    Ok(Form::new()
        .text("chunkIndex", chunk_index.to_string())
        .part("chunk", part))
}

impl UploadApi for ApiClient {
    async fn init_upload(&self, request: &InitUploadRequest) -> Result<InitUploadResponse, ApiError> {
        self.post(INIT_PATH, request).await
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        data: Bytes,
        on_bytes: ByteProgress,
    ) -> Result<ChunkAck, ApiError> {
        let path = chunk_path(upload_id);
        let body = self
            .send(|| {
                let form = chunk_form(chunk_index, data.clone(), Arc::clone(&on_bytes))?;
                Ok(Call::new(Method::POST, path.as_str()).multipart(form))
            })
            .await?;
        crate::envelope::decode_bytes(&body)
    }

    async fn complete_upload(&self, upload_id: &str) -> Result<CompleteResponse, ApiError> {
        self.post(&complete_path(upload_id), &serde_json::json!({}))
            .await
    }

    async fn upload_status(&self, upload_id: &str) -> Result<UploadStatus, ApiError> {
        self.get(&status_path(upload_id)).await
    }

    async fn abort_upload(&self, upload_id: &str) -> Result<(), ApiError> {
        let _: Value = self.delete(&session_path(upload_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_received_chunks_shapes() {
        let list: UploadStatus =
            serde_json::from_str(r#"{"receivedChunks": [0, 2], "totalChunks": 3}"#).unwrap();
        assert_eq!(list.received_chunks.indices(), BTreeSet::from([0, 2]));

        let count: UploadStatus =
            serde_json::from_str(r#"{"receivedChunks": 2, "totalChunks": 3}"#).unwrap();
        assert_eq!(count.received_chunks.indices(), BTreeSet::from([0, 1]));
    }

    #[test]
    fn test_chunk_ack_accepts_both_received_shapes() {
        let list: ChunkAck = serde_json::from_str(
            r#"{"chunkIndex": 2, "receivedChunks": [0, 1, 2], "totalChunks": 4}"#,
        )
        .unwrap();
        assert_eq!(list.received_chunks.indices().len(), 3);

        let count: ChunkAck = serde_json::from_str(
            r#"{"chunkIndex": 2, "receivedChunks": 3, "totalChunks": 4, "isComplete": false}"#,
        )
        .unwrap();
        assert_eq!(count.received_chunks.indices().len(), 3);
    }

    #[test]
    fn test_init_response_requires_upload_id() {
        let result = crate::envelope::decode::<InitUploadResponse>(
            serde_json::json!({"totalChunks": 2, "chunkSizeBytes": 10}),
        );
        assert!(matches!(result, Err(ApiError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_counting_stream_reports_cumulative_bytes() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        let data = Bytes::from(vec![7u8; STREAM_SLICE_BYTES * 2 + 10]);

        let slices: Vec<_> = counting_stream(
            data.clone(),
            Arc::new(move |n| seen_cb.store(n, Ordering::SeqCst)),
        )
        .collect()
        .await;

        assert_eq!(slices.len(), 3);
        assert_eq!(seen.load(Ordering::SeqCst), data.len() as u64);
    }
}
