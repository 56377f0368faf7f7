//! teamserver-ctl: command-line interface for the teamserver.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_BUS: &str = "127.0.0.1:5555";

fn print_usage() {
    println!("Usage: teamserver-ctl [options] <command>");
    println!();
    println!("Commands:");
    println!("  status              Show server health and counters");
    println!("  sessions            List active agent sessions");
    println!("  session <id>        Show one session");
    println!("  results <id>        Show task results reported by a session");
    println!("  events              Tail lifecycle events from the event bus");
    println!();
    println!("Options:");
    println!("  --port <port>       Status API port (default: {})", DEFAULT_PORT);
    println!("  --bus <addr>        Event bus PUB endpoint (default: {})", DEFAULT_BUS);
    println!("  --bus-key <hex>     Event bus public key; omit for an insecure bus");
    println!("  --topic <topic>     Only tail this topic (events)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut bus = DEFAULT_BUS.to_string();
    let mut bus_key: Option<String> = None;
    let mut topic: Option<String> = None;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--bus" => {
                i += 1;
                bus = args.get(i).context("--bus requires a value")?.clone();
            }
            "--bus-key" => {
                i += 1;
                bus_key = Some(args.get(i).context("--bus-key requires a value")?.clone());
            }
            "--topic" => {
                i += 1;
                topic = Some(args.get(i).context("--topic requires a value")?.clone());
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["sessions"] => cmd::sessions::cmd_sessions(port).await,
        ["session", id] => cmd::sessions::cmd_session_inspect(port, id).await,
        ["results", id] => cmd::sessions::cmd_session_results(port, id).await,
        ["events"] => cmd::events::cmd_events(&bus, bus_key.as_deref(), topic.as_deref()).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
