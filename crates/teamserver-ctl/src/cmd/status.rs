//! Server health command.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct HealthResponse {
    healthy: bool,
    active_sessions: usize,
    connects: u64,
    disconnects: u64,
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: HealthResponse = get_json(&format!("{}/health", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Teamserver Status");
    println!("═══════════════════════════════════════");
    println!("  Healthy          : {}", if resp.healthy { "yes" } else { "NO" });
    println!("  Active sessions  : {}", resp.active_sessions);
    println!("  Connects         : {}", resp.connects);
    println!("  Disconnects      : {}", resp.disconnects);

    Ok(())
}
