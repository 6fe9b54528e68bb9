use std::time::Duration;

use anyhow::Result;
use netsight_client::{ClientConfig, HelperClient};

fn main() -> Result<()> {
    println!("=== Netsight Helper Client Basic Example ===");

    // Example 1: Using default configuration
    println!("\n1. Using default configuration:");
    example_with_defaults()?;

    // Example 2: Using custom configuration
    println!("\n2. Using custom configuration:");
    example_with_custom_config()?;

    // Example 3: Watching for connection loss
    println!("\n3. Watching for connection loss:");
    example_with_events()?;

    println!("\n✓ All examples completed successfully!");
    Ok(())
}

fn example_with_defaults() -> Result<()> {
    println!("Connecting with default configuration...");

    let mut client = HelperClient::connect(ClientConfig::new())?;
    println!(
        "Authenticated, session {} (expires at unix time {})",
        client.session_id().unwrap_or("<none>"),
        client.session_expires_at_secs()
    );

    println!("Sending heartbeat...");
    let heartbeat = client.heartbeat()?;
    println!("Helper clock: {}", heartbeat.server_time_secs);

    println!("Disconnecting...");
    client.disconnect();

    println!("✓ Default configuration example completed");
    Ok(())
}

fn example_with_custom_config() -> Result<()> {
    println!("Connecting with custom configuration...");

    let config = ClientConfig::new()
        .with_socket_name(netsight_client::SOCKET_NAME)
        .with_timeout(Duration::from_secs(5));

    let mut client = HelperClient::connect(config)?;

    println!("Fetching connection telemetry...");
    let stats = client.connection_stats()?;
    if stats.ok {
        println!("{} connections observed", stats.connections.len());
        for conn in stats.connections.iter().take(5) {
            println!(
                "  {} {} -> {} [{}]",
                conn.protocol, conn.local_addr, conn.remote_addr, conn.state
            );
        }
    } else {
        println!(
            "Collector unavailable: {}",
            stats.error.as_deref().unwrap_or("no detail")
        );
    }

    client.disconnect();
    println!("✓ Custom configuration example completed");
    Ok(())
}

fn example_with_events() -> Result<()> {
    println!("Subscribing to client events...");

    let mut client = HelperClient::connect(ClientConfig::new())?;
    let events = client.events();

    // An orderly shutdown does not count as connection loss; only a dying
    // transport publishes an event.
    client.shutdown_helper()?;
    match events.try_recv() {
        Ok(event) => println!("Event observed: {event:?}"),
        Err(_) => println!("No loss event after an orderly shutdown, as expected"),
    }

    println!("✓ Event example completed");
    Ok(())
}
