//! Upload payload sources and byte-range slicing.
//!
//! Only one chunk is ever read into memory at a time.

use std::ops::Range;
use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub enum UploadSource {
    /// File on disk, read chunk by chunk
    Path(PathBuf),
    /// Payload already in memory
    Memory(Bytes),
}

impl UploadSource {
    pub async fn len(&self) -> Result<u64, ApiError> {
        match self {
            UploadSource::Path(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .with_context(|| format!("Failed to stat {}", path.display()))?;
                Ok(meta.len())
            }
            UploadSource::Memory(bytes) => Ok(bytes.len() as u64),
        }
    }

    /// Read `range` from the source
    pub async fn read_range(&self, range: Range<u64>) -> Result<Bytes, ApiError> {
        let len = range.end.saturating_sub(range.start);
        match self {
            UploadSource::Path(path) => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                file.seek(std::io::SeekFrom::Start(range.start))
                    .await
                    .context("Failed to seek to chunk offset")?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)
                    .await
                    .with_context(|| format!("Failed to read {} bytes at {}", len, range.start))?;
                Ok(Bytes::from(buf))
            }
            UploadSource::Memory(bytes) => {
                let end = (range.end as usize).min(bytes.len());
                let start = (range.start as usize).min(end);
                Ok(bytes.slice(start..end))
            }
        }
    }

    /// Whole payload, for single-request uploads
    pub async fn read_all(&self) -> Result<Bytes, ApiError> {
        match self {
            UploadSource::Path(path) => {
                let data = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Ok(Bytes::from(data))
            }
            UploadSource::Memory(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Byte range of chunk `index`: `[index*C, min(S, (index+1)*C))`
pub fn chunk_range(index: u32, chunk_size: u64, total_size: u64) -> Range<u64> {
    let start = (index as u64).saturating_mul(chunk_size).min(total_size);
    let end = start.saturating_add(chunk_size).min(total_size);
    start..end
}

/// Check that the server's split actually covers the payload
pub fn validate_layout(total_size: u64, chunk_size: u64, total_chunks: u32) -> Result<(), ApiError> {
    if chunk_size == 0 {
        return Err(ApiError::ProtocolViolation(
            "Server returned chunkSizeBytes = 0".to_string(),
        ));
    }

    let needed = total_size.div_ceil(chunk_size);
    if needed != total_chunks as u64 {
        return Err(ApiError::ProtocolViolation(format!(
            "Server split {} bytes into {} chunks of {} bytes, expected {}",
            total_size, total_chunks, chunk_size, needed
        )));
    }

    Ok(())
}
