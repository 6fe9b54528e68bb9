//! Netsight Elevated Helper
//!
//! This crate implements the privileged side of the Netsight IPC channel:
//! a server that accepts connections over the platform secure channel,
//! authenticates clients against the shared secret, enforces session and
//! rate limits, and answers telemetry requests through a collector seam.
//!
//! The server is synchronous and thread-per-connection: one accept loop,
//! one worker thread per accepted client, strictly sequential
//! request/response on each connection. A shared shutdown flag stops the
//! accept loop and, bounded by the receive timeout, every worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use netsight_common::{PlatformListener, SharedSecret, RECEIVE_TIMEOUT, SOCKET_NAME};

/// Seam between the IPC layer and the platform telemetry source
pub mod collector;

mod connection;

/// Executable-path verification for authenticating clients
pub mod exe_verify;

/// Pre- and post-authentication rate limiting
pub mod rate_limit;

/// Authenticated-session table
pub mod session;

use collector::TelemetryCollector;
use connection::Connection;
use rate_limit::{AuthLimiter, RequestLimiter};
use session::SessionManager;

/// Default cap on concurrently authenticated sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 16;

/// How long the accept loop sleeps between polls when no client is waiting.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for the elevated helper server.
pub struct HelperConfig {
    /// Endpoint name (socket file on Unix, pipe name on Windows)
    pub socket_name:     String,
    /// Concurrent-session cap; creation beyond it fails, never evicts
    pub max_sessions:    usize,
    /// Read/write bound applied to every accepted stream
    pub receive_timeout: Duration,
    /// Launching user's SID; required on Windows, unused on Unix
    pub authorized_sid:  Option<String>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            socket_name:     SOCKET_NAME.to_string(),
            max_sessions:    DEFAULT_MAX_SESSIONS,
            receive_timeout: RECEIVE_TIMEOUT,
            authorized_sid:  None,
        }
    }
}

impl HelperConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint name
    pub fn with_socket_name<S: Into<String>>(mut self, socket_name: S) -> Self {
        self.socket_name = socket_name.into();
        self
    }

    /// Set the concurrent-session cap
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the per-stream receive timeout
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the launching user's SID for the pipe ACL
    pub fn with_authorized_sid<S: Into<String>>(mut self, sid: S) -> Self {
        self.authorized_sid = Some(sid.into());
        self
    }
}

/// The elevated IPC server. Owns the shared secret for its lifetime; the
/// in-memory key is zeroed when the last reference drops.
pub struct ElevatedServer {
    config:          HelperConfig,
    secret:          Arc<SharedSecret>,
    sessions:        Arc<SessionManager>,
    auth_limiter:    Arc<AuthLimiter>,
    request_limiter: Arc<RequestLimiter>,
    collector:       Arc<dyn TelemetryCollector>,
}

impl ElevatedServer {
    pub fn new(
        config: HelperConfig,
        secret: SharedSecret,
        collector: Arc<dyn TelemetryCollector>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(config.max_sessions));
        Self {
            config,
            secret: Arc::new(secret),
            sessions,
            auth_limiter: Arc::new(AuthLimiter::new()),
            request_limiter: Arc::new(RequestLimiter::new()),
            collector,
        }
    }

    /// Runs the accept loop until `running` is cleared. Each accepted
    /// connection gets its own worker thread; all workers are joined before
    /// this returns, bounded by the receive timeout they observe.
    pub fn run_with_shutdown(&self, running: Arc<AtomicBool>) -> Result<()> {
        let mut listener = PlatformListener::bind(
            &self.config.socket_name,
            self.config.authorized_sid.as_deref(),
            self.config.receive_timeout,
        )
        .context("failed to bind the secure channel")?;

        // Polled accept keeps the shutdown flag observable between clients.
        listener
            .set_nonblocking(true)
            .context("failed to switch the listener to polled accept")?;

        tracing::info!(
            socket = %self.config.socket_name,
            max_sessions = self.config.max_sessions,
            "elevated helper serving"
        );

        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok(stream) => {
                    let peer = match stream.peer_credentials() {
                        Ok(peer) => peer,
                        Err(e) => {
                            tracing::warn!(
                                error = %format!("{e:#}"),
                                "rejecting connection with unreadable peer credentials"
                            );
                            continue;
                        }
                    };

                    let connection = Connection {
                        stream,
                        peer,
                        client_key: client_key(&peer),
                        secret: Arc::clone(&self.secret),
                        sessions: Arc::clone(&self.sessions),
                        auth_limiter: Arc::clone(&self.auth_limiter),
                        request_limiter: Arc::clone(&self.request_limiter),
                        collector: Arc::clone(&self.collector),
                        running: Arc::clone(&running),
                        session_id: None,
                    };
                    workers.push(thread::spawn(move || connection.run()));
                }
                Err(e) if is_would_block(&e) => {
                    workers.retain(|worker| !worker.is_finished());
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    tracing::error!(error = %format!("{e:#}"), "accept failed");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        tracing::info!(workers = workers.len(), "shutting down; joining connection workers");
        for worker in workers {
            let _ = worker.join();
        }
        Ok(())
    }

    /// Currently authenticated session count.
    pub fn active_sessions(&self) -> usize {
        self.sessions.active_count()
    }
}

/// Rate-limiter key for a connection that has not authenticated yet: the
/// transport-reported identity, which the peer cannot choose freely.
fn client_key(peer: &netsight_common::PeerCredentials) -> String {
    match peer.uid {
        Some(uid) => format!("{uid}:{}", peer.pid),
        None => format!("pid:{}", peer.pid),
    }
}

fn is_would_block(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::WouldBlock)
}
