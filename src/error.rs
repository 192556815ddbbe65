//! ==============================================================================
//! error.rs - typed failures for the sensor path and the session gate
//! ==============================================================================
//!
//! purpose:
//!     anyhow covers startup. everything past startup is absorbed at a boundary
//!     and matched on, so it gets a real type here:
//!     - SensorError: absorbed by the sampler, retried next tick
//!     - Termination: why a session ended, sent to the client as the last event
//!     - GateError: admission refused (reject policy only)
//!
//! ==============================================================================

use std::time::Duration;

use serde::Serialize;

use crate::session::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    /// the hardware-reporting interface could not be read at all
    #[error("sensor source unavailable: {0}")]
    Unavailable(String),

    /// read() did not come back within the configured bound
    #[error("sensor read timed out after {0:?}")]
    Timeout(Duration),
}

/// Terminal signal for a session. Not an error from the user's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    #[error("session preempted by a newer connection")]
    Preempted,
    #[error("session stopped by client")]
    Stopped,
    #[error("session went stale")]
    Stale,
    #[error("client disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("session {0} already owns the feed")]
    Occupied(SessionId),
}
