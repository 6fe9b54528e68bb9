use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use netsight_common::auth;
use netsight_common::protocol::{
    AuthRequest, AuthResponse, ConnectionStatsResponse, ErrorPayload, HeartbeatResponse,
    MessageKind, ProcessStatsResponse, SessionRequest, WireMessage,
};
use netsight_common::{
    connect_socket, receive_message, send_message, PlatformStream, Received, SecretStore,
    RECEIVE_TIMEOUT, SOCKET_NAME,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Configuration for the helper client
#[derive(Clone)]
pub struct ClientConfig {
    /// Endpoint name to connect to
    pub socket_name: String,
    /// Bound on every send, receive and the handshake
    pub timeout:     Duration,
    /// Where to load the shared secret from; `None` uses the per-user
    /// application-data location the helper writes to
    pub secret_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_name: SOCKET_NAME.to_string(),
            timeout:     RECEIVE_TIMEOUT,
            secret_path: None,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint name
    pub fn with_socket_name<S: Into<String>>(mut self, socket_name: S) -> Self {
        self.socket_name = socket_name.into();
        self
    }

    /// Set the operation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load the shared secret from an explicit path
    pub fn with_secret_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.secret_path = Some(path.into());
        self
    }
}

/// Out-of-band notifications the application can watch on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The transport to the helper died outside an orderly disconnect.
    ConnectionLost,
}

/// The closed set of requests a client can issue after authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ConnectionStats,
    ProcessStats,
    Heartbeat,
    Shutdown,
}

impl Request {
    /// Wire discriminator for this request kind.
    fn kind(self) -> MessageKind {
        match self {
            Request::ConnectionStats => MessageKind::ConnectionStats,
            Request::ProcessStats => MessageKind::ProcessStats,
            Request::Heartbeat => MessageKind::Heartbeat,
            Request::Shutdown => MessageKind::Shutdown,
        }
    }
}

/// Client side of the helper IPC channel. One connection, one outstanding
/// request at a time.
#[derive(Debug)]
pub struct HelperClient {
    stream:          Option<PlatformStream>,
    session_id:      Option<String>,
    expires_at_secs: u64,
    events_tx:       Sender<ClientEvent>,
    events_rx:       Receiver<ClientEvent>,
}

impl HelperClient {
    /// Connects to the helper and runs the authentication handshake.
    ///
    /// Fails closed when the shared secret cannot be loaded, and reports the
    /// helper's denial reason when the handshake is rejected.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let store = match &config.secret_path {
            Some(path) => SecretStore::at(path),
            None => SecretStore::default_location()?,
        };
        let secret = store
            .load()
            .context("cannot authenticate without the shared secret")?;

        let mut stream = connect_socket(&config.socket_name, config.timeout)
            .context("failed to reach the helper")?;

        let pid = std::process::id();
        let timestamp_secs = auth::now_secs();
        let request = AuthRequest {
            pid,
            timestamp_secs,
            signature: auth::sign(pid, timestamp_secs, &secret),
            executable_path: std::env::current_exe().ok(),
        };
        tracing::debug!(fingerprint = %secret.fingerprint(), pid, "authenticating");
        drop(secret);

        let request_id = Uuid::new_v4().to_string();
        let message = WireMessage::new(MessageKind::Authenticate, &request_id, &request)?;
        send_message(&mut stream, &message).context("failed to send the handshake")?;

        let response = match receive_message(&mut stream)? {
            Received::Message(message) => message,
            Received::Closed => bail!("helper closed the connection during the handshake"),
            Received::TimedOut => bail!("helper did not answer the handshake in time"),
        };
        if response.kind != MessageKind::Authenticate || response.request_id != request_id {
            bail!("helper answered the handshake with an unexpected frame");
        }

        let response: AuthResponse = response
            .decode_payload()
            .context("undecodable handshake response")?;
        if !response.granted {
            let detail = response
                .error
                .map(|e| format!("{:?}: {}", e.code, e.message))
                .unwrap_or_else(|| "no reason given".to_string());
            bail!("helper denied authentication ({detail})");
        }

        let session_id = response
            .session_id
            .ok_or_else(|| anyhow!("granted handshake carried no session id"))?;
        let expires_at_secs = response.expires_at_secs.unwrap_or_default();
        tracing::info!(%session_id, expires_at_secs, "session established");

        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            stream: Some(stream),
            session_id: Some(session_id),
            expires_at_secs,
            events_tx,
            events_rx,
        })
    }

    /// Channel carrying out-of-band notifications, usable from any thread.
    pub fn events(&self) -> Receiver<ClientEvent> {
        self.events_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// The session granted by the handshake, while one is held.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Unix time at which the helper will stop honoring the session.
    pub fn session_expires_at_secs(&self) -> u64 {
        self.expires_at_secs
    }

    /// Snapshot of per-connection telemetry. Collector trouble comes back
    /// inside the payload (`ok == false`), not as an `Err`.
    pub fn connection_stats(&mut self) -> Result<ConnectionStatsResponse> {
        self.roundtrip(Request::ConnectionStats)
    }

    /// Per-process telemetry aggregates.
    pub fn process_stats(&mut self) -> Result<ProcessStatsResponse> {
        self.roundtrip(Request::ProcessStats)
    }

    /// Liveness probe; returns the helper's clock.
    pub fn heartbeat(&mut self) -> Result<HeartbeatResponse> {
        self.roundtrip(Request::Heartbeat)
    }

    /// Asks the helper to end this connection's loop and releases the
    /// transport. The helper itself keeps running for other clients.
    pub fn shutdown_helper(&mut self) -> Result<()> {
        let message = self.session_message(Request::Shutdown)?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("not connected to the helper"))?;
        // The helper tears the loop down without a reply; an orderly local
        // release follows immediately.
        send_message(stream, &message).context("failed to send the shutdown request")?;
        self.disconnect();
        Ok(())
    }

    /// Releases the transport and forgets the session. Safe to call any
    /// number of times.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("disconnected from the helper");
        }
        self.session_id = None;
    }

    fn session_message(&self, request: Request) -> Result<WireMessage> {
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| anyhow!("no authenticated session"))?;
        Ok(WireMessage::new(
            request.kind(),
            Uuid::new_v4().to_string(),
            &SessionRequest { session_id },
        )?)
    }

    /// Sends one request and awaits its correlated response. Any outcome
    /// other than a well-formed response frame on the open stream counts as
    /// connection loss.
    fn roundtrip<R: DeserializeOwned>(&mut self, request: Request) -> Result<R> {
        let message = self.session_message(request)?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("not connected to the helper"))?;

        if let Err(e) = send_message(stream, &message) {
            self.connection_lost();
            return Err(anyhow::Error::from(e).context("failed to send the request"));
        }

        let response = match receive_message(stream) {
            Ok(Received::Message(response)) => response,
            Ok(Received::Closed) => {
                self.connection_lost();
                bail!("helper closed the connection before responding");
            }
            Ok(Received::TimedOut) => {
                self.connection_lost();
                bail!("helper did not respond in time");
            }
            Err(e) => {
                self.connection_lost();
                return Err(anyhow::Error::from(e).context("failed to read the response"));
            }
        };

        if response.kind == MessageKind::Error {
            let detail: ErrorPayload = response
                .decode_payload()
                .unwrap_or_else(|_| ErrorPayload::new(
                    netsight_common::protocol::ErrorCode::Internal,
                    "undecodable error response",
                ));
            bail!("helper rejected the request ({:?}: {})", detail.code, detail.message);
        }

        if response.kind != request.kind() || response.request_id != message.request_id {
            // Only one request is ever outstanding, so a mismatched frame
            // means the stream is out of sync and cannot be trusted further.
            self.connection_lost();
            bail!("helper response does not correlate with the request");
        }

        match response.decode_payload() {
            Ok(payload) => Ok(payload),
            Err(e) => {
                self.connection_lost();
                Err(anyhow::Error::from(e).context("undecodable response payload"))
            }
        }
    }

    /// Drops the dead transport and tells the application about it.
    fn connection_lost(&mut self) {
        if self.stream.take().is_some() {
            tracing::warn!("connection to the helper lost");
            let _ = self.events_tx.send(ClientEvent::ConnectionLost);
        }
        self.session_id = None;
    }
}

impl Drop for HelperClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_kinds_map_onto_the_wire() {
        assert_eq!(Request::ConnectionStats.kind(), MessageKind::ConnectionStats);
        assert_eq!(Request::ProcessStats.kind(), MessageKind::ProcessStats);
        assert_eq!(Request::Heartbeat.kind(), MessageKind::Heartbeat);
        assert_eq!(Request::Shutdown.kind(), MessageKind::Shutdown);
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::new();
        assert_eq!(config.socket_name, SOCKET_NAME);
        assert_eq!(config.timeout, RECEIVE_TIMEOUT);
        assert!(config.secret_path.is_none());
    }

    #[test]
    fn connect_fails_closed_without_a_secret() {
        let dir = std::env::temp_dir().join(format!("netsight-nosecret-{}", std::process::id()));
        let config = ClientConfig::new()
            .with_secret_path(dir.join("missing.secret"))
            .with_socket_name("netsight-test-never-bound");
        let err = HelperClient::connect(config).unwrap_err();
        assert!(err.to_string().contains("shared secret"));
    }
}
