// Authentication module
// Session state, transport detection, single-flight refresh and 401 retry

mod detect;
mod persist;
mod refresh;
mod retry;
mod session;
mod types;

pub use detect::{infer_mode, AuthModeDetector};
pub use refresh::{TokenRefreshCoordinator, REFRESH_COOKIE_PATH, REFRESH_PATH};
pub use retry::{RetryingRequestWrapper, DEFAULT_MAX_RETRIES};
pub use session::{SessionStore, CSRF_COOKIE, EXPIRY_COOKIE};
pub use types::{LoginResponse, PersistedSession, Session, TokenData, TransportMode};

pub(crate) use types::LoginRequest;
