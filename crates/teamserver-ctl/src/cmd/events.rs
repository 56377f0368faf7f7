//! Tail lifecycle events from the event bus PUB endpoint.

use anyhow::{Context, Result};

use teamserver_core::crypto::curve::public_key_from_hex;
use teamserver_core::wire::topics;
use teamserver_bus::{BusSecurity, BusSubscriber};

pub async fn cmd_events(bus_addr: &str, bus_key: Option<&str>, topic: Option<&str>) -> Result<()> {
    let security = match bus_key {
        Some(hex) => BusSecurity::Curve {
            server_public: public_key_from_hex(hex).context("--bus-key is not a 32-byte hex key")?,
        },
        None => {
            eprintln!("warning: connecting to the event bus without --bus-key (insecure)");
            BusSecurity::Insecure
        }
    };

    let mut subscriber = BusSubscriber::connect(bus_addr, security)
        .await
        .with_context(|| format!("failed to connect to event bus at {}", bus_addr))?;

    let wanted: Vec<&str> = match topic {
        Some(t) => vec![t],
        None => vec![topics::CLIENT_CONNECTED, topics::CLIENT_DISCONNECTED],
    };
    for t in &wanted {
        subscriber.subscribe(t).await?;
    }
    eprintln!("Listening on {} for: {}", bus_addr, wanted.join(", "));

    while let Some((topic, payload)) = subscriber.recv().await? {
        println!("{:<22} {}", topic, payload);
    }

    eprintln!("Event bus closed the connection.");
    Ok(())
}
