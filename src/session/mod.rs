//! Relay session management
//!
//! This module provides the `SessionManager` that owns every live
//! `RelaySession` and enforces its lifecycle:
//!
//! ```text
//! INACTIVE --(first chunk)--> STREAMING --(stop)--> STOPPING --(drained & closed)--> INACTIVE
//! ```
//!
//! - Lazy start on the first audio chunk, at most one backend stream per session
//! - Two-phase stop that waits for the buffer to drain and the backend to close
//! - Teardown on fatal backend errors and on connection loss

mod config;
mod manager;
mod session;
mod stats;

pub use config::SessionConfig;
pub use manager::{PushReport, SessionManager, StartOutcome, StopOutcome, VadHook};
pub use session::RelaySession;
pub use stats::{SessionCounters, SessionStats};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Inactive,
    Streaming,
    Stopping,
}
