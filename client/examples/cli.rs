use anyhow::{Context, Result};
use netsight_client::{ClientConfig, ClientEvent, HelperClient, SOCKET_NAME};

/// Interactive CLI for exercising the elevated helper
struct InteractiveCli {
    config: ClientConfig,
    client: Option<HelperClient>,
}

impl InteractiveCli {
    fn new(config: ClientConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let client = HelperClient::connect(self.config.clone())?;
        println!(
            "Connected, session {}",
            client.session_id().unwrap_or("<none>")
        );
        self.client = Some(client);
        Ok(())
    }

    fn client(&mut self) -> Result<&mut HelperClient> {
        self.client
            .as_mut()
            .filter(|c| c.is_connected())
            .context("not connected; use 'connect' first")
    }

    /// Run the interactive session
    fn run(&mut self) -> Result<()> {
        if self.client.is_none() {
            if let Err(e) = self.connect() {
                eprintln!("Initial connection failed: {e:#}");
            }
        }

        println!("Starting interactive session. Type 'help' for commands, 'quit' to exit.");
        println!();

        loop {
            print!("netsight> ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;
            let command = input.trim();

            if command.is_empty() {
                continue;
            }

            match command {
                "quit" | "exit" => {
                    println!("Goodbye!");
                    break;
                }
                "connect" => {
                    if self.client.as_ref().is_some_and(|c| c.is_connected()) {
                        println!("Already connected.");
                    } else if let Err(e) = self.connect() {
                        eprintln!("Connection failed: {e:#}");
                    }
                }
                "disconnect" => {
                    if let Some(client) = self.client.as_mut() {
                        client.disconnect();
                    }
                    println!("Disconnected. Use 'connect' to reconnect.");
                }
                "heartbeat" => match self.client().and_then(|c| c.heartbeat()) {
                    Ok(hb) => println!("Helper clock: {}", hb.server_time_secs),
                    Err(e) => eprintln!("Heartbeat failed: {e:#}"),
                },
                "conns" => match self.client().and_then(|c| c.connection_stats()) {
                    Ok(stats) if stats.ok => {
                        println!("{} connections:", stats.connections.len());
                        for conn in &stats.connections {
                            println!(
                                "  {:5} {:24} -> {:24} {:12} tx={} rx={}",
                                conn.protocol,
                                conn.local_addr,
                                conn.remote_addr,
                                conn.state,
                                conn.bytes_sent,
                                conn.bytes_received
                            );
                        }
                    }
                    Ok(stats) => println!(
                        "Collector unavailable: {}",
                        stats.error.as_deref().unwrap_or("no detail")
                    ),
                    Err(e) => eprintln!("Request failed: {e:#}"),
                },
                "procs" => match self.client().and_then(|c| c.process_stats()) {
                    Ok(stats) if stats.ok => {
                        println!("{} processes:", stats.processes.len());
                        for proc in &stats.processes {
                            println!(
                                "  pid {:6} {:24} conns={} tx={} rx={}",
                                proc.pid,
                                proc.name,
                                proc.connection_count,
                                proc.bytes_sent,
                                proc.bytes_received
                            );
                        }
                    }
                    Ok(stats) => println!(
                        "Collector unavailable: {}",
                        stats.error.as_deref().unwrap_or("no detail")
                    ),
                    Err(e) => eprintln!("Request failed: {e:#}"),
                },
                "shutdown" => match self.client().and_then(|c| c.shutdown_helper()) {
                    Ok(()) => println!("Connection shut down; the helper keeps serving others."),
                    Err(e) => eprintln!("Shutdown failed: {e:#}"),
                },
                "status" => match self.client.as_ref() {
                    Some(client) if client.is_connected() => {
                        println!("Status: connected to '{}'", self.config.socket_name);
                        println!("Session: {}", client.session_id().unwrap_or("<none>"));
                        println!(
                            "Session expires at unix time {}",
                            client.session_expires_at_secs()
                        );
                    }
                    _ => println!("Status: not connected"),
                },
                "events" => {
                    let Some(client) = self.client.as_ref() else {
                        println!("Status: not connected");
                        continue;
                    };
                    let events = client.events();
                    let mut seen = 0;
                    while let Ok(event) = events.try_recv() {
                        seen += 1;
                        match event {
                            ClientEvent::ConnectionLost => println!("! connection lost"),
                        }
                    }
                    if seen == 0 {
                        println!("No pending events.");
                    }
                }
                "help" => {
                    println!("Available commands:");
                    println!("  heartbeat    - Probe the helper and print its clock");
                    println!("  conns        - Fetch the per-connection telemetry snapshot");
                    println!("  procs        - Fetch the per-process telemetry aggregates");
                    println!("  shutdown     - End this connection on the helper side");
                    println!("  connect      - Connect and authenticate");
                    println!("  disconnect   - Release the transport");
                    println!("  status       - Show session state");
                    println!("  events       - Drain pending connection-loss events");
                    println!("  quit/exit    - Exit interactive mode");
                }
                cmd => {
                    eprintln!("Unknown command '{cmd}'. Type 'help' for the list.");
                }
            }
        }

        Ok(())
    }
}

fn main() -> Result<()> {
    println!("=== Netsight Helper Client CLI ===");

    let args: Vec<String> = std::env::args().collect();

    let config = ClientConfig::new().with_socket_name(SOCKET_NAME);

    if args.len() < 2 {
        println!("Usage:");
        println!("  {} interactive        - Start interactive session", args[0]);
        println!("  {} heartbeat          - One-shot liveness probe", args[0]);
        println!("  {} conns              - Print the connection snapshot", args[0]);
        println!("  {} procs              - Print the process aggregates", args[0]);
        return Ok(());
    }

    match args[1].as_str() {
        "interactive" => {
            println!("Starting interactive mode...");
            InteractiveCli::new(config)
                .run()
                .context("interactive session failed")?;
        }
        "heartbeat" => {
            let mut client = HelperClient::connect(config).context("failed to connect")?;
            let heartbeat = client.heartbeat().context("heartbeat failed")?;
            println!("✓ Helper answered; its clock reads {}", heartbeat.server_time_secs);
        }
        "conns" => {
            let mut client = HelperClient::connect(config).context("failed to connect")?;
            let stats = client.connection_stats().context("request failed")?;
            if stats.ok {
                for conn in &stats.connections {
                    println!(
                        "{} {} -> {} [{}]",
                        conn.protocol, conn.local_addr, conn.remote_addr, conn.state
                    );
                }
            } else {
                anyhow::bail!(
                    "collector unavailable: {}",
                    stats.error.as_deref().unwrap_or("no detail")
                );
            }
        }
        "procs" => {
            let mut client = HelperClient::connect(config).context("failed to connect")?;
            let stats = client.process_stats().context("request failed")?;
            if stats.ok {
                for proc in &stats.processes {
                    println!(
                        "pid {} {} conns={} tx={} rx={}",
                        proc.pid, proc.name, proc.connection_count, proc.bytes_sent, proc.bytes_received
                    );
                }
            } else {
                anyhow::bail!(
                    "collector unavailable: {}",
                    stats.error.as_deref().unwrap_or("no detail")
                );
            }
        }
        cmd => {
            anyhow::bail!("unknown command '{cmd}'; run without arguments for usage");
        }
    }

    Ok(())
}
