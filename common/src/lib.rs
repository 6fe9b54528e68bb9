//! Netsight IPC Common Library
//!
//! This crate provides the pieces shared by the unprivileged monitoring
//! application and the elevated helper process:
//!
//! - Wire protocol definitions and typed payloads
//! - Length-prefixed message framing with a hard size cap
//! - The shared-secret store and the HMAC authenticator built on it
//! - Platform-specific secure channels (Unix domain sockets, Windows named
//!   pipes) including peer-credential extraction
//! - Validation of the caller identity passed to the helper at startup

/// Keyed-signature creation and verification for the handshake
pub mod auth;

/// Length-prefixed message framing over any duplex byte stream
pub mod framing;

/// Caller-identity (SID) validation for the Windows secure channel
pub mod identity;

/// Platform-specific socket implementations
pub mod platform_socket;

/// Wire protocol definitions and typed payloads
pub mod protocol;

/// Shared-secret generation, persistence and destruction
pub mod secret;

// Re-export commonly used types for convenience
pub use auth::{sign, validate, AUTH_TIMESTAMP_SKEW_SECS};
pub use framing::{receive_message, send_message, FrameError, Received, MAX_MESSAGE_SIZE};
pub use platform_socket::{connect_socket, PeerCredentials, PlatformListener, PlatformStream};
pub use protocol::{ErrorCode, ErrorPayload, MessageKind, WireMessage};
pub use secret::{SecretStore, SharedSecret};

/// The endpoint the helper and its clients communicate over. On Unix this
/// names a socket file, on Windows a pipe under `\\.\pipe\`.
pub const SOCKET_NAME: &str = "netsight-helper.sock";

/// How long a blocked read may sit idle before the peer is considered
/// stalled. Applied to every accepted or connected stream.
pub const RECEIVE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
