// Transport mode inference

use std::sync::OnceLock;

use super::types::{PersistedSession, TransportMode};

/// Infers the transport mode from persisted evidence, once.
///
/// The first answer is kept for the lifetime of the detector; one detector
/// is built per process and handed to whoever needs it.
#[derive(Debug, Default)]
pub struct AuthModeDetector {
    detected: OnceLock<TransportMode>,
}

impl AuthModeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoized detection; later calls ignore their argument
    pub fn detect(&self, evidence: &PersistedSession) -> TransportMode {
        *self.detected.get_or_init(|| {
            let mode = infer_mode(evidence);
            tracing::info!("Detected auth transport mode: {:?}", mode);
            mode
        })
    }

    /// Mode detected so far, if any
    pub fn cached(&self) -> Option<TransportMode> {
        self.detected.get().copied()
    }
}

/// Access token → TokenBased; identity without token → CookieBased; otherwise CookieBased
pub fn infer_mode(evidence: &PersistedSession) -> TransportMode {
    match (&evidence.access_token, &evidence.user_id) {
        (Some(_), _) => TransportMode::TokenBased,
        (None, Some(_)) => TransportMode::CookieBased,
        (None, None) => TransportMode::CookieBased,
    }
}
