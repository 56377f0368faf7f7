//! Session listing, inspection and task result commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct SessionInfo {
    id: String,
    address: String,
    hostname: Option<String>,
    username: Option<String>,
    os: Option<String>,
    connected_at: u64,
    last_checkin: Option<u64>,
    idle_secs: u64,
}

#[derive(Deserialize)]
struct TaskResult {
    task_id: String,
    result: serde_json::Value,
    timestamp: u64,
}

fn or_dash(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("-")
}

fn short(id: &str) -> &str {
    id.get(..16).unwrap_or(id)
}

pub async fn cmd_sessions(port: u16) -> Result<()> {
    let sessions: Vec<SessionInfo> = get_json(&format!("{}/sessions", base_url(port))).await?;

    if sessions.is_empty() {
        println!("No active sessions.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Active Sessions ({})", sessions.len());
    println!("═══════════════════════════════════════");

    for s in &sessions {
        println!("  ┌─ {}", short(&s.id));
        println!("  │  address  : {}", s.address);
        println!("  │  host     : {}@{}", or_dash(&s.username), or_dash(&s.hostname));
        println!("  │  os       : {}", or_dash(&s.os));
        println!("  └─ idle     : {}s", s.idle_secs);
    }

    Ok(())
}

pub async fn cmd_session_inspect(port: u16, session_id: &str) -> Result<()> {
    let s: SessionInfo = get_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;

    println!("═══════════════════════════════════════");
    println!("  Session Details");
    println!("═══════════════════════════════════════");
    println!("  ID           : {}", s.id);
    println!("  Address      : {}", s.address);
    println!("  Hostname     : {}", or_dash(&s.hostname));
    println!("  Username     : {}", or_dash(&s.username));
    println!("  OS           : {}", or_dash(&s.os));
    println!("  Connected at : {} (unix ms)", s.connected_at);
    match s.last_checkin {
        Some(t) => println!("  Last checkin : {} (unix ms)", t),
        None => println!("  Last checkin : never"),
    }
    println!("  Idle         : {}s", s.idle_secs);

    Ok(())
}

pub async fn cmd_session_results(port: u16, session_id: &str) -> Result<()> {
    let results: Vec<TaskResult> =
        get_json(&format!("{}/sessions/{}/results", base_url(port), session_id)).await?;

    if results.is_empty() {
        println!("No task results for {}.", short(session_id));
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Task Results for {} ({})", short(session_id), results.len());
    println!("═══════════════════════════════════════");

    for r in &results {
        println!("  ┌─ {}", r.task_id);
        println!("  │  at       : {} (unix ms)", r.timestamp);
        match &r.result {
            serde_json::Value::String(text) => println!("  └─ result   : {}", text),
            other => println!("  └─ result   : {}", other),
        }
    }

    Ok(())
}
