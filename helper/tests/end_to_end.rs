//! Full-stack exercises over a real Unix socket: handshake, telemetry
//! round-trips, denial paths and teardown, with a mock collector behind the
//! dispatch loop.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use netsight_client::{ClientConfig, HelperClient};
use netsight_common::protocol::{
    AuthRequest, AuthResponse, ConnectionStat, MessageKind, ProcessStat, WireMessage,
};
use netsight_common::{
    auth, connect_socket, receive_message, send_message, Received, SecretStore, SharedSecret,
};
use netsight_helper::collector::TelemetryCollector;
use netsight_helper::{ElevatedServer, HelperConfig};

struct MockCollector;

impl TelemetryCollector for MockCollector {
    fn connection_stats(&self) -> Result<Vec<ConnectionStat>> {
        Ok(vec![ConnectionStat {
            protocol:       "tcp".to_string(),
            local_addr:     "127.0.0.1:52044".to_string(),
            remote_addr:    "203.0.113.7:443".to_string(),
            state:          "ESTABLISHED".to_string(),
            owner_pid:      Some(4321),
            bytes_sent:     2048,
            bytes_received: 65536,
        }])
    }

    fn process_stats(&self) -> Result<Vec<ProcessStat>> {
        Ok(vec![ProcessStat {
            pid:              4321,
            name:             "browser".to_string(),
            connection_count: 1,
            bytes_sent:       2048,
            bytes_received:   65536,
        }])
    }
}

struct FailingCollector;

impl TelemetryCollector for FailingCollector {
    fn connection_stats(&self) -> Result<Vec<ConnectionStat>> {
        anyhow::bail!("tracing session is not running")
    }

    fn process_stats(&self) -> Result<Vec<ProcessStat>> {
        anyhow::bail!("tracing session is not running")
    }
}

struct Helper {
    server:      Arc<ElevatedServer>,
    running:     Arc<AtomicBool>,
    worker:      Option<JoinHandle<Result<()>>>,
    socket_name: String,
    secret_path: PathBuf,
    _dir:        tempfile::TempDir,
}

impl Helper {
    /// Starts a helper on its own socket with a fresh secret and waits until
    /// the socket file exists.
    fn start(tag: &str, max_sessions: usize, collector: Arc<dyn TelemetryCollector>) -> Self {
        let socket_name = format!("netsight-e2e-{tag}-{}", std::process::id());
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("helper.secret");

        let secret = SharedSecret::generate();
        SecretStore::at(&secret_path).persist(&secret).unwrap();

        let config = HelperConfig::new()
            .with_socket_name(&socket_name)
            .with_max_sessions(max_sessions)
            .with_receive_timeout(Duration::from_secs(2));
        let server = Arc::new(ElevatedServer::new(config, secret, collector));

        let running = Arc::new(AtomicBool::new(true));
        let worker = {
            let server = Arc::clone(&server);
            let running = Arc::clone(&running);
            std::thread::spawn(move || server.run_with_shutdown(running))
        };

        let socket_path = format!("/tmp/{socket_name}");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !Path::new(&socket_path).exists() {
            assert!(Instant::now() < deadline, "helper did not bind in time");
            std::thread::sleep(Duration::from_millis(10));
        }

        Self {
            server,
            running,
            worker: Some(worker),
            socket_name,
            secret_path,
            _dir: dir,
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig::new()
            .with_socket_name(&self.socket_name)
            .with_secret_path(&self.secret_path)
            .with_timeout(Duration::from_secs(5))
    }

    fn wait_for_session_count(&self, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.server.active_sessions() != expected {
            assert!(
                Instant::now() < deadline,
                "session count never reached {expected} (at {})",
                self.server.active_sessions()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[test]
fn full_scenario_connect_query_disconnect() {
    let helper = Helper::start("scenario", 4, Arc::new(MockCollector));

    let mut client = HelperClient::connect(helper.client_config()).unwrap();
    assert!(client.is_connected());
    assert!(client.session_id().is_some());

    // Expiry is the absolute 8-hour lifetime, give or take test slack.
    let lifetime = client.session_expires_at_secs() - auth::now_secs();
    assert!((8 * 60 * 60 - 60..=8 * 60 * 60).contains(&lifetime));

    let stats = client.connection_stats().unwrap();
    assert!(stats.ok);
    assert_eq!(stats.connections.len(), 1);
    assert_eq!(stats.connections[0].remote_addr, "203.0.113.7:443");

    let processes = client.process_stats().unwrap();
    assert!(processes.ok);
    assert_eq!(processes.processes[0].name, "browser");

    let heartbeat = client.heartbeat().unwrap();
    assert!(heartbeat.server_time_secs > 0);

    helper.wait_for_session_count(1);
    client.disconnect();
    client.disconnect(); // idempotent

    // The helper noticed the hangup and released the session.
    helper.wait_for_session_count(0);
}

#[test]
fn wrong_secret_is_denied() {
    let helper = Helper::start("wrongsecret", 4, Arc::new(MockCollector));

    // A client holding a different secret than the helper issued.
    let dir = tempfile::tempdir().unwrap();
    let rogue_path = dir.path().join("helper.secret");
    SecretStore::at(&rogue_path)
        .persist(&SharedSecret::generate())
        .unwrap();

    let config = helper.client_config().with_secret_path(&rogue_path);
    let err = HelperClient::connect(config).unwrap_err();
    assert!(err.to_string().contains("denied"), "got: {err:#}");

    // The legitimate client is unaffected.
    let mut client = HelperClient::connect(helper.client_config()).unwrap();
    assert!(client.heartbeat().is_ok());
}

#[test]
fn session_cap_rejects_without_evicting() {
    let helper = Helper::start("cap", 1, Arc::new(MockCollector));

    let mut first = HelperClient::connect(helper.client_config()).unwrap();
    let err = HelperClient::connect(helper.client_config()).unwrap_err();
    assert!(err.to_string().contains("SessionLimit"), "got: {err:#}");

    // The established session survived the rejected attempt.
    assert!(first.heartbeat().is_ok());

    // Releasing it frees the slot.
    first.shutdown_helper().unwrap();
    helper.wait_for_session_count(0);
    let mut second = HelperClient::connect(helper.client_config()).unwrap();
    assert!(second.heartbeat().is_ok());
}

#[test]
fn shutdown_ends_the_connection_not_the_helper() {
    let helper = Helper::start("shutdown", 4, Arc::new(MockCollector));

    let mut client = HelperClient::connect(helper.client_config()).unwrap();
    client.shutdown_helper().unwrap();
    assert!(!client.is_connected());
    helper.wait_for_session_count(0);

    // The accept loop is still alive.
    let mut next = HelperClient::connect(helper.client_config()).unwrap();
    assert!(next.heartbeat().is_ok());
}

#[test]
fn collector_failure_travels_inside_the_payload() {
    let helper = Helper::start("collectorerr", 4, Arc::new(FailingCollector));

    let mut client = HelperClient::connect(helper.client_config()).unwrap();
    let stats = client.connection_stats().unwrap();
    assert!(!stats.ok);
    assert!(stats.connections.is_empty());
    assert!(stats.error.unwrap().contains("tracing session"));

    // The connection survived the collector failure.
    assert!(client.heartbeat().is_ok());
}

#[test]
fn repeated_bad_signatures_disconnect_on_the_fifth() {
    let helper = Helper::start("bruteforce", 4, Arc::new(MockCollector));

    let mut stream = connect_socket(&helper.socket_name, Duration::from_secs(5)).unwrap();
    let pid = std::process::id();

    for attempt in 1..=5 {
        let timestamp_secs = auth::now_secs();
        let request = AuthRequest {
            pid,
            timestamp_secs,
            // Signed with a key the helper never issued.
            signature: auth::sign(pid, timestamp_secs, &SharedSecret::generate()),
            executable_path: None,
        };
        let message = WireMessage::new(
            MessageKind::Authenticate,
            format!("attempt-{attempt}"),
            &request,
        )
        .unwrap();
        send_message(&mut stream, &message).unwrap();

        match receive_message(&mut stream).unwrap() {
            Received::Message(response) => {
                let response: AuthResponse = response.decode_payload().unwrap();
                assert!(!response.granted, "attempt {attempt} must be denied");
            }
            other => panic!("attempt {attempt}: expected a denial, got {other:?}"),
        }
    }

    // The fifth failure crossed the threshold; the helper hangs up.
    assert!(matches!(
        receive_message(&mut stream).unwrap(),
        Received::Closed
    ));
}

#[test]
fn stale_timestamp_is_rejected() {
    let helper = Helper::start("staleness", 4, Arc::new(MockCollector));
    let secret = SecretStore::at(&helper.secret_path).load().unwrap();

    let mut stream = connect_socket(&helper.socket_name, Duration::from_secs(5)).unwrap();
    let pid = std::process::id();

    // Correctly signed, but an hour old: a captured handshake being replayed.
    let timestamp_secs = auth::now_secs() - 3600;
    let request = AuthRequest {
        pid,
        timestamp_secs,
        signature: auth::sign(pid, timestamp_secs, &secret),
        executable_path: None,
    };
    let message = WireMessage::new(MessageKind::Authenticate, "replay", &request).unwrap();
    send_message(&mut stream, &message).unwrap();

    match receive_message(&mut stream).unwrap() {
        Received::Message(response) => {
            let response: AuthResponse = response.decode_payload().unwrap();
            assert!(!response.granted);
        }
        other => panic!("expected a denial, got {other:?}"),
    }
}

#[test]
fn claimed_pid_must_match_the_transport_peer() {
    let helper = Helper::start("pidmismatch", 4, Arc::new(MockCollector));
    let secret = SecretStore::at(&helper.secret_path).load().unwrap();

    let mut stream = connect_socket(&helper.socket_name, Duration::from_secs(5)).unwrap();

    // A correctly signed handshake claiming somebody else's pid.
    let claimed_pid = std::process::id() + 1;
    let timestamp_secs = auth::now_secs();
    let request = AuthRequest {
        pid: claimed_pid,
        timestamp_secs,
        signature: auth::sign(claimed_pid, timestamp_secs, &secret),
        executable_path: None,
    };
    let message = WireMessage::new(MessageKind::Authenticate, "spoof", &request).unwrap();
    send_message(&mut stream, &message).unwrap();

    match receive_message(&mut stream).unwrap() {
        Received::Message(response) => {
            let response: AuthResponse = response.decode_payload().unwrap();
            assert!(!response.granted);
            assert_eq!(
                response.error.unwrap().code,
                netsight_common::protocol::ErrorCode::IdentityMismatch
            );
        }
        other => panic!("expected a denial, got {other:?}"),
    }
}

#[test]
fn wrong_executable_path_is_denied() {
    let helper = Helper::start("exemismatch", 4, Arc::new(MockCollector));
    let secret = SecretStore::at(&helper.secret_path).load().unwrap();

    let mut stream = connect_socket(&helper.socket_name, Duration::from_secs(5)).unwrap();
    let pid = std::process::id();

    // Valid signature and pid, but a claimed binary this process is not.
    let timestamp_secs = auth::now_secs();
    let request = AuthRequest {
        pid,
        timestamp_secs,
        signature: auth::sign(pid, timestamp_secs, &secret),
        executable_path: Some(PathBuf::from("/usr/bin/true")),
    };
    let message = WireMessage::new(MessageKind::Authenticate, "imposter", &request).unwrap();
    send_message(&mut stream, &message).unwrap();

    match receive_message(&mut stream).unwrap() {
        Received::Message(response) => {
            let response: AuthResponse = response.decode_payload().unwrap();
            assert!(!response.granted);
        }
        other => panic!("expected a denial, got {other:?}"),
    }
}

#[test]
fn requests_before_authentication_are_rejected() {
    let helper = Helper::start("preauth", 4, Arc::new(MockCollector));

    let mut stream = connect_socket(&helper.socket_name, Duration::from_secs(5)).unwrap();
    let message = WireMessage::new(
        MessageKind::Heartbeat,
        "too-early",
        &netsight_common::protocol::SessionRequest {
            session_id: "made-up".to_string(),
        },
    )
    .unwrap();
    send_message(&mut stream, &message).unwrap();

    match receive_message(&mut stream).unwrap() {
        Received::Message(response) => {
            assert_eq!(response.kind, MessageKind::Error);
            assert_eq!(response.request_id, "too-early");
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
}

#[test]
fn request_quota_rejects_only_the_excess() {
    let helper = Helper::start("quota", 4, Arc::new(MockCollector));

    let mut client = HelperClient::connect(helper.client_config()).unwrap();
    for _ in 0..netsight_helper::rate_limit::MAX_REQUESTS_PER_WINDOW {
        client.heartbeat().unwrap();
    }

    let err = client.heartbeat().unwrap_err();
    assert!(err.to_string().contains("RateLimited"), "got: {err:#}");

    // Throttling is an error response, not a hangup.
    assert!(client.is_connected());
}
