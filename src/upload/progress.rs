//! Upload progress — overall percentage math and the observer interface.
//!
//! Chunk transfer covers 0..99%; the last 1% is only reported once the server
//! confirms reassembly, so 100 always means "done".

use std::sync::{Arc, Mutex, PoisonError};

use super::UploadState;

/// Share of the bar covered by chunk transfer
pub const TRANSFER_SHARE: f64 = 99.0;

/// Receives upload lifecycle notifications. All methods default to no-ops.
pub trait UploadObserver: Send + Sync {
    fn on_progress(&self, _percent: f64) {}

    fn on_chunk_complete(&self, _index: u32, _total: u32) {}

    fn on_state_change(&self, _state: UploadState) {}
}

/// `(sent/total)*99 + (bytes/current_size)*(99/total)`, clamped to `[0, 99]`
pub fn overall_percent(chunks_sent: u32, total_chunks: u32, bytes_sent: u64, chunk_size: u64) -> f64 {
    if total_chunks == 0 {
        return TRANSFER_SHARE;
    }
    let per_chunk = TRANSFER_SHARE / total_chunks as f64;
    let partial = if chunk_size == 0 {
        0.0
    } else {
        (bytes_sent.min(chunk_size) as f64 / chunk_size as f64) * per_chunk
    };
    ((chunks_sent as f64 / total_chunks as f64) * TRANSFER_SHARE + partial).clamp(0.0, TRANSFER_SHARE)
}

/// Fans progress out to observers, never letting the value go backwards
pub struct ProgressTracker {
    total_chunks: u32,
    observers: Vec<Arc<dyn UploadObserver>>,
    last: Mutex<f64>,
}

impl ProgressTracker {
    pub fn new(total_chunks: u32, observers: Vec<Arc<dyn UploadObserver>>) -> Self {
        Self {
            total_chunks,
            observers,
            last: Mutex::new(0.0),
        }
    }

    /// Bytes of the current chunk handed to the transport
    pub fn chunk_bytes(&self, chunks_sent: u32, bytes_sent: u64, chunk_size: u64) {
        self.report(overall_percent(
            chunks_sent,
            self.total_chunks,
            bytes_sent,
            chunk_size,
        ));
    }

    /// A chunk was acknowledged by the server
    pub fn chunk_complete(&self, index: u32, chunks_sent: u32) {
        for observer in &self.observers {
            observer.on_chunk_complete(index, self.total_chunks);
        }
        self.report(overall_percent(chunks_sent, self.total_chunks, 0, 0));
    }

    /// Finalize succeeded
    pub fn finish(&self) {
        self.report(100.0);
    }

    pub fn current(&self) -> f64 {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, percent: f64) {
        {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            if percent <= *last {
                return;
            }
            *last = percent;
        }
        for observer in &self.observers {
            observer.on_progress(percent);
        }
    }
}

/// One recorded observer notification
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress(f64),
    ChunkComplete { index: u32, total: u32 },
    State(UploadState),
}

/// Observer that keeps every notification, in order
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<UploadEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UploadEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn progress(&self) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UploadEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn completed_chunks(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UploadEvent::ChunkComplete { index, .. } => Some(index),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<UploadState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UploadEvent::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: UploadEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl UploadObserver for RecordingObserver {
    fn on_progress(&self, percent: f64) {
        self.push(UploadEvent::Progress(percent));
    }

    fn on_chunk_complete(&self, index: u32, total: u32) {
        self.push(UploadEvent::ChunkComplete { index, total });
    }

    fn on_state_change(&self, state: UploadState) {
        self.push(UploadEvent::State(state));
    }
}

/// Observer that logs through `tracing`
pub struct TracingObserver {
    pub label: String,
}

impl UploadObserver for TracingObserver {
    fn on_progress(&self, percent: f64) {
        tracing::debug!(upload = %self.label, percent = percent, "Upload progress");
    }

    fn on_chunk_complete(&self, index: u32, total: u32) {
        tracing::info!(upload = %self.label, "Chunk {}/{} acknowledged", index + 1, total);
    }

    fn on_state_change(&self, state: UploadState) {
        tracing::info!(upload = %self.label, state = ?state, "Upload state changed");
    }
}
