use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use netsight_common::identity::validate_user_sid;
use netsight_common::{SecretStore, SharedSecret, RECEIVE_TIMEOUT, SOCKET_NAME};
use netsight_helper::{ElevatedServer, HelperConfig, DEFAULT_MAX_SESSIONS};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netsight-helper")]
#[command(about = "Netsight elevated helper: authenticated telemetry IPC server")]
struct Args {
    /// Endpoint name (socket file on Unix, pipe name on Windows)
    #[arg(long, default_value = SOCKET_NAME)]
    socket_name: String,

    /// Maximum number of concurrently authenticated sessions
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,

    /// Seconds a blocked read may wait before the peer counts as stalled
    #[arg(long, default_value_t = RECEIVE_TIMEOUT.as_secs())]
    receive_timeout_secs: u64,

    /// SID of the launching user, granted access to the channel.
    /// Required on Windows; must name a concrete user account.
    #[arg(long)]
    authorized_sid: Option<String>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).context("invalid --log-level filter")?,
        )
        .init();

    // Identity argument problems are fatal before anything touches the OS.
    if let Some(sid) = &args.authorized_sid {
        validate_user_sid(sid).context("--authorized-sid is not acceptable")?;
    } else if cfg!(windows) {
        bail!("--authorized-sid is required on Windows to build the pipe ACL");
    }

    #[cfg(unix)]
    {
        // SAFETY: getuid has no preconditions.
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            tracing::warn!("helper is not running as root; collectors may see less");
        }
    }

    let secret = SharedSecret::generate();
    let store = SecretStore::default_location()?;
    store
        .persist(&secret)
        .context("failed to persist the shared secret")?;
    tracing::info!(fingerprint = %secret.fingerprint(), "shared secret issued");

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("shutdown signal received");
        flag.store(false, Ordering::SeqCst);
    })
    .context("failed to install the shutdown handler")?;

    let config = HelperConfig::new()
        .with_socket_name(&args.socket_name)
        .with_max_sessions(args.max_sessions)
        .with_receive_timeout(Duration::from_secs(args.receive_timeout_secs));
    let config = match args.authorized_sid {
        Some(sid) => config.with_authorized_sid(sid),
        None => config,
    };

    let server = ElevatedServer::new(config, secret, default_collector());
    let result = server.run_with_shutdown(running);

    // The secret outlives the server by exactly this call.
    if let Err(e) = store.destroy() {
        tracing::warn!(error = %format!("{e:#}"), "failed to destroy the secret file");
    }

    result
}

#[cfg(target_os = "linux")]
fn default_collector() -> Arc<dyn netsight_helper::collector::TelemetryCollector> {
    Arc::new(netsight_helper::collector::ProcNetCollector)
}

#[cfg(not(target_os = "linux"))]
fn default_collector() -> Arc<dyn netsight_helper::collector::TelemetryCollector> {
    Arc::new(netsight_helper::collector::UnsupportedCollector)
}
