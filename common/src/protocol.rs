use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::framing::{wire_options, FrameError};
use bincode::Options;

/// Discriminates the closed set of message types carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Handshake request/response
    Authenticate,
    /// Per-connection telemetry snapshot
    ConnectionStats,
    /// Per-process telemetry aggregate
    ProcessStats,
    /// Liveness probe
    Heartbeat,
    /// Ends the per-connection loop on the helper side
    Shutdown,
    /// Explicit failure response
    Error,
}

/// One wire frame: a type discriminator, a caller-supplied request id used
/// for request/response correlation, and a payload whose schema depends on
/// the discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind:       MessageKind,
    pub request_id: String,
    pub payload:    Vec<u8>,
}

impl WireMessage {
    /// Builds a frame with an encoded payload.
    pub fn new<P: Serialize>(
        kind: MessageKind,
        request_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, FrameError> {
        let payload = wire_options()
            .serialize(payload)
            .map_err(FrameError::from_encode)?;
        Ok(Self {
            kind,
            request_id: request_id.into(),
            payload,
        })
    }

    /// Decodes the payload into the type the discriminator implies.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P, FrameError> {
        wire_options()
            .deserialize(&self.payload)
            .map_err(FrameError::Decode)
    }
}

/// Machine-readable failure classification carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Bad signature or stale timestamp
    AuthFailed,
    /// Too many authentication attempts in the window
    AuthRateLimited,
    /// Claimed process id does not match the transport-reported caller
    IdentityMismatch,
    /// The claimed executable path could not be checked against the OS
    VerificationUnavailable,
    /// Active-session cap reached
    SessionLimit,
    /// Unknown or expired session id
    InvalidSession,
    /// Post-authentication request quota exceeded
    RateLimited,
    /// Message was malformed or not meaningful in the current state
    BadRequest,
    /// Unexpected helper-side failure
    Internal,
}

/// Payload of a `MessageKind::Error` frame, and the failure detail embedded
/// in a denied handshake response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code:    ErrorCode,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Handshake request. The signature binds `pid` and `timestamp_secs` to the
/// shared secret; the executable path is optional supporting evidence the
/// helper checks against the OS when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub pid:             u32,
    pub timestamp_secs:  u64,
    pub signature:       Vec<u8>,
    pub executable_path: Option<PathBuf>,
}

/// Handshake response. `granted == false` carries the denial reason in
/// `error`; a granted handshake carries the session id and its absolute
/// expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub granted:         bool,
    pub session_id:      Option<String>,
    pub expires_at_secs: Option<u64>,
    pub error:           Option<ErrorPayload>,
}

impl AuthResponse {
    pub fn granted(session_id: String, expires_at_secs: u64) -> Self {
        Self {
            granted:         true,
            session_id:      Some(session_id),
            expires_at_secs: Some(expires_at_secs),
            error:           None,
        }
    }

    pub fn denied(error: ErrorPayload) -> Self {
        Self {
            granted:         false,
            session_id:      None,
            expires_at_secs: None,
            error:           Some(error),
        }
    }
}

/// Session-gated request body shared by the stats, heartbeat and shutdown
/// operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

/// One live transport connection as observed by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStat {
    pub protocol:       String,
    pub local_addr:     String,
    pub remote_addr:    String,
    pub state:          String,
    pub owner_pid:      Option<u32>,
    pub bytes_sent:     u64,
    pub bytes_received: u64,
}

/// Per-process aggregate as observed by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStat {
    pub pid:              u32,
    pub name:             String,
    pub connection_count: u32,
    pub bytes_sent:       u64,
    pub bytes_received:   u64,
}

/// Collector failures travel inside the payload (`ok == false` plus a
/// message), never as transport-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatsResponse {
    pub ok:          bool,
    pub error:       Option<String>,
    pub connections: Vec<ConnectionStat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatsResponse {
    pub ok:        bool,
    pub error:     Option<String>,
    pub processes: Vec<ProcessStat>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub server_time_secs: u64,
}
