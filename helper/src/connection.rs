//! Per-connection message loop and authentication state machine.
//!
//! A connection moves `Accepted → Unauthenticated → Authenticated → Closed`.
//! Errors local to one request produce an error response and leave the
//! connection open; only transport faults, a stalled peer, or repeated
//! authentication failure tear it down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use netsight_common::auth::{self, timestamp_within_skew};
use netsight_common::protocol::{
    AuthRequest, AuthResponse, ConnectionStatsResponse, ErrorCode, ErrorPayload,
    HeartbeatResponse, MessageKind, ProcessStatsResponse, SessionRequest, WireMessage,
};
use netsight_common::{receive_message, send_message, PeerCredentials, PlatformStream, Received, SharedSecret};

use crate::collector::TelemetryCollector;
use crate::exe_verify::{verify_claimed_path, ExeVerification};
use crate::rate_limit::{AuthLimiter, RequestLimiter};
use crate::session::SessionManager;

/// Whether the loop keeps going after handling one message.
enum Flow {
    Continue,
    Close,
}

pub(crate) struct Connection {
    pub(crate) stream:          PlatformStream,
    pub(crate) peer:            PeerCredentials,
    pub(crate) client_key:      String,
    pub(crate) secret:          Arc<SharedSecret>,
    pub(crate) sessions:        Arc<SessionManager>,
    pub(crate) auth_limiter:    Arc<AuthLimiter>,
    pub(crate) request_limiter: Arc<RequestLimiter>,
    pub(crate) collector:       Arc<dyn TelemetryCollector>,
    pub(crate) running:         Arc<AtomicBool>,
    pub(crate) session_id:      Option<String>,
}

impl Connection {
    pub(crate) fn run(mut self) {
        tracing::info!(peer_pid = self.peer.pid, "connection accepted");
        if let Err(e) = self.serve() {
            tracing::warn!(peer_pid = self.peer.pid, error = %format!("{e:#}"), "connection ended");
        }
        self.teardown();
        tracing::debug!(peer_pid = self.peer.pid, "connection closed");
    }

    fn serve(&mut self) -> Result<()> {
        #[cfg(unix)]
        if let Some(uid) = self.peer.uid {
            if !peer_uid_authorized(uid) {
                anyhow::bail!("peer uid {uid} is not the expected launcher identity");
            }
        }

        loop {
            match receive_message(&mut self.stream) {
                Ok(Received::Message(message)) => match self.dispatch(message)? {
                    Flow::Continue => {}
                    Flow::Close => break,
                },
                Ok(Received::Closed) => {
                    tracing::debug!(peer_pid = self.peer.pid, "peer closed the connection");
                    break;
                }
                Ok(Received::TimedOut) => {
                    if !self.running.load(Ordering::SeqCst) {
                        // Our own shutdown, not the peer's fault.
                        break;
                    }
                    tracing::debug!(
                        peer_pid = self.peer.pid,
                        "peer stalled past the receive timeout"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        peer_pid = self.peer.pid,
                        error = %e,
                        "framing failure; closing connection"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, message: WireMessage) -> Result<Flow> {
        match self.session_id.clone() {
            None => self.dispatch_unauthenticated(message),
            Some(session_id) => self.dispatch_authenticated(&session_id, message),
        }
    }

    fn dispatch_unauthenticated(&mut self, message: WireMessage) -> Result<Flow> {
        match message.kind {
            MessageKind::Authenticate => self.handle_authenticate(message),
            kind => {
                tracing::debug!(?kind, "non-handshake message before authentication");
                self.send_error(
                    &message.request_id,
                    ErrorCode::BadRequest,
                    "authenticate before sending requests",
                )?;
                Ok(Flow::Continue)
            }
        }
    }

    fn handle_authenticate(&mut self, message: WireMessage) -> Result<Flow> {
        let request_id = message.request_id.clone();

        if !self.auth_limiter.try_acquire(&self.client_key) {
            return self.deny_auth(
                &request_id,
                ErrorCode::AuthRateLimited,
                "too many authentication attempts; slow down",
            );
        }

        let request: AuthRequest = match message.decode_payload() {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "malformed authenticate payload");
                return self.deny_auth(
                    &request_id,
                    ErrorCode::BadRequest,
                    "malformed authenticate payload",
                );
            }
        };

        if !timestamp_within_skew(request.timestamp_secs, auth::now_secs()) {
            return self.deny_auth(
                &request_id,
                ErrorCode::AuthFailed,
                "timestamp outside the accepted freshness window",
            );
        }

        if !auth::validate(
            request.pid,
            request.timestamp_secs,
            &request.signature,
            &self.secret,
        ) {
            return self.deny_auth(&request_id, ErrorCode::AuthFailed, "invalid signature");
        }

        if request.pid != self.peer.pid {
            tracing::warn!(
                claimed = request.pid,
                observed = self.peer.pid,
                "authentication pid does not match transport peer"
            );
            return self.deny_auth(
                &request_id,
                ErrorCode::IdentityMismatch,
                "claimed process id does not match the connecting process",
            );
        }

        if let Some(claimed) = &request.executable_path {
            match verify_claimed_path(request.pid, claimed) {
                ExeVerification::Match => {}
                ExeVerification::Mismatch { observed } => {
                    tracing::warn!(
                        pid = request.pid,
                        claimed = %claimed.display(),
                        observed = %observed.display(),
                        "executable path mismatch"
                    );
                    return self.deny_auth(
                        &request_id,
                        ErrorCode::AuthFailed,
                        "executable path does not match the connecting process",
                    );
                }
                ExeVerification::Unavailable { reason } => {
                    // Fails closed, but with a code the client can tell apart
                    // from a rejected credential.
                    tracing::warn!(pid = request.pid, reason = %reason, "executable verification unavailable");
                    return self.deny_auth(
                        &request_id,
                        ErrorCode::VerificationUnavailable,
                        "executable path could not be verified",
                    );
                }
            }
        }

        self.auth_limiter.record_success(&self.client_key);

        match self.sessions.create(request.pid, request.executable_path) {
            Some(session) => {
                tracing::info!(
                    session_id = %session.id,
                    pid = session.pid,
                    "session established"
                );
                let expires_at_secs = session
                    .expires_at
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                self.session_id = Some(session.id.clone());
                let response = AuthResponse::granted(session.id, expires_at_secs);
                self.send_auth_response(&request_id, &response)?;
                Ok(Flow::Continue)
            }
            None => {
                // A full session table is not an authentication failure.
                let response = AuthResponse::denied(ErrorPayload::new(
                    ErrorCode::SessionLimit,
                    "the helper has reached its concurrent-session limit",
                ));
                self.send_auth_response(&request_id, &response)?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Sends a denial and decides whether the failure streak just crossed
    /// the disconnect threshold.
    fn deny_auth(&mut self, request_id: &str, code: ErrorCode, reason: &str) -> Result<Flow> {
        let disconnect = self.auth_limiter.record_failure(&self.client_key);
        let response = AuthResponse::denied(ErrorPayload::new(code, reason));
        self.send_auth_response(request_id, &response)?;

        if disconnect {
            tracing::warn!(
                client = %self.client_key,
                "consecutive authentication failures exceeded; disconnecting"
            );
            return Ok(Flow::Close);
        }
        Ok(Flow::Continue)
    }

    fn dispatch_authenticated(&mut self, session_id: &str, message: WireMessage) -> Result<Flow> {
        let request_id = message.request_id.clone();

        match message.kind {
            MessageKind::Authenticate => {
                self.send_error(
                    &request_id,
                    ErrorCode::BadRequest,
                    "connection is already authenticated",
                )?;
                return Ok(Flow::Continue);
            }
            MessageKind::Error => {
                let detail = message
                    .decode_payload::<ErrorPayload>()
                    .map(|p| p.message)
                    .unwrap_or_else(|_| "undecodable".to_string());
                tracing::warn!(detail = %detail, "client sent an error frame");
                return Ok(Flow::Continue);
            }
            _ => {}
        }

        if !self.request_limiter.try_acquire(session_id) {
            self.send_error(
                &request_id,
                ErrorCode::RateLimited,
                "request quota exceeded for the current window",
            )?;
            return Ok(Flow::Continue);
        }

        let request: SessionRequest = match message.decode_payload() {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "malformed request payload");
                self.send_error(&request_id, ErrorCode::BadRequest, "malformed request payload")?;
                return Ok(Flow::Continue);
            }
        };

        if request.session_id != session_id {
            self.send_error(
                &request_id,
                ErrorCode::InvalidSession,
                "session id does not belong to this connection",
            )?;
            return Ok(Flow::Continue);
        }

        if self.sessions.validate(session_id).is_none() {
            // Expired mid-connection: drop back to the unauthenticated state
            // so the client can run the handshake again.
            self.session_id = None;
            self.request_limiter.remove(session_id);
            self.send_error(
                &request_id,
                ErrorCode::InvalidSession,
                "session is unknown or expired",
            )?;
            return Ok(Flow::Continue);
        }

        match message.kind {
            MessageKind::ConnectionStats => {
                let payload = match self.collector.connection_stats() {
                    Ok(connections) => ConnectionStatsResponse {
                        ok: true,
                        error: None,
                        connections,
                    },
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "connection-stats collector failed");
                        ConnectionStatsResponse {
                            ok:          false,
                            error:       Some(format!("{e:#}")),
                            connections: Vec::new(),
                        }
                    }
                };
                self.send_response(MessageKind::ConnectionStats, &request_id, &payload)?;
                Ok(Flow::Continue)
            }
            MessageKind::ProcessStats => {
                let payload = match self.collector.process_stats() {
                    Ok(processes) => ProcessStatsResponse {
                        ok: true,
                        error: None,
                        processes,
                    },
                    Err(e) => {
                        tracing::warn!(error = %format!("{e:#}"), "process-stats collector failed");
                        ProcessStatsResponse {
                            ok:        false,
                            error:     Some(format!("{e:#}")),
                            processes: Vec::new(),
                        }
                    }
                };
                self.send_response(MessageKind::ProcessStats, &request_id, &payload)?;
                Ok(Flow::Continue)
            }
            MessageKind::Heartbeat => {
                let payload = HeartbeatResponse {
                    server_time_secs: auth::now_secs(),
                };
                self.send_response(MessageKind::Heartbeat, &request_id, &payload)?;
                Ok(Flow::Continue)
            }
            MessageKind::Shutdown => {
                tracing::info!(session_id, "client requested connection shutdown");
                self.sessions.remove(session_id);
                self.request_limiter.remove(session_id);
                self.session_id = None;
                Ok(Flow::Close)
            }
            // Handled above; kept so the match stays total.
            MessageKind::Authenticate | MessageKind::Error => Ok(Flow::Continue),
        }
    }

    fn send_auth_response(&mut self, request_id: &str, response: &AuthResponse) -> Result<()> {
        let message = WireMessage::new(MessageKind::Authenticate, request_id, response)?;
        send_message(&mut self.stream, &message)?;
        Ok(())
    }

    fn send_response<P: serde::Serialize>(
        &mut self,
        kind: MessageKind,
        request_id: &str,
        payload: &P,
    ) -> Result<()> {
        let message = WireMessage::new(kind, request_id, payload)?;
        send_message(&mut self.stream, &message)?;
        Ok(())
    }

    fn send_error(&mut self, request_id: &str, code: ErrorCode, reason: &str) -> Result<()> {
        let payload = ErrorPayload::new(code, reason);
        self.send_response(MessageKind::Error, request_id, &payload)
    }

    /// Releases everything this connection holds. Safe to run on every exit
    /// path; all removals are idempotent.
    fn teardown(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            self.sessions.remove(&session_id);
            self.request_limiter.remove(&session_id);
        }
        self.auth_limiter.remove(&self.client_key);
    }
}

/// Whether the connecting uid is the identity this helper serves: the
/// helper's own user, or the original sudo user when running elevated.
#[cfg(unix)]
fn peer_uid_authorized(peer_uid: u32) -> bool {
    // SAFETY: getuid has no preconditions.
    let current = unsafe { libc::getuid() };
    if peer_uid == current {
        return true;
    }

    if current == 0 {
        if let Ok(sudo_user) = std::env::var("SUDO_USER") {
            match lookup_uid(&sudo_user) {
                Ok(uid) if uid == peer_uid => return true,
                Ok(uid) => {
                    tracing::warn!(peer_uid, sudo_uid = uid, "peer is not the sudo launcher");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to resolve SUDO_USER");
                }
            }
        }
    }
    false
}

#[cfg(unix)]
fn lookup_uid(username: &str) -> Result<u32> {
    use std::ffi::CString;

    let username = CString::new(username)?;

    // SAFETY: getpwnam takes a valid C string; the returned pointer is
    // checked for null before the uid field is read.
    unsafe {
        let passwd = libc::getpwnam(username.as_ptr());
        if passwd.is_null() {
            anyhow::bail!("user not found");
        }
        Ok((*passwd).pw_uid)
    }
}
