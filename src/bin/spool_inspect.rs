//! spool_inspect - List snapshots held in an uplink spool database.
//!
//! Opens the spool read-only. Payloads are shown as metadata by default; `--decode`
//! decodes each body back into a snapshot, `--raw` dumps the body as hex.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;

use crowdwatch_edge::uplink::codec;
use crowdwatch_edge::uplink::{Spool, SpoolEntry, SqliteSpool};

#[derive(Parser, Debug)]
#[command(
    name = "spool_inspect",
    about = "List snapshots held in an uplink spool database"
)]
struct Args {
    /// Spool database path
    #[arg(
        env = "CROWDWATCH_SPOOL_PATH",
        value_name = "PATH",
        default_value = "crowdwatch_spool.db"
    )]
    path: PathBuf,

    /// One JSON object per line instead of a table
    #[arg(long)]
    json: bool,

    /// Decode payloads back into snapshots
    #[arg(long)]
    decode: bool,

    /// Include the raw payload as hex
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let spool = SqliteSpool::open_read_only(&args.path)?;
    let entries = spool
        .entries()
        .with_context(|| format!("read spool {}", args.path.display()))?;

    if !args.json {
        println!("{} spooled record(s) in {}", entries.len(), args.path.display());
    }
    for entry in &entries {
        if args.json {
            println!("{}", entry_json(entry, &args));
        } else {
            print_entry(entry, &args);
        }
    }
    Ok(())
}

fn entry_json(entry: &SpoolEntry, args: &Args) -> serde_json::Value {
    let mut value = json!({
        "seq": entry.seq,
        "source_id": entry.source_id,
        "attempts": entry.attempts,
        "reason": entry.reason.as_str(),
        "spooled_at_ms": entry.spooled_at_ms,
        "last_error": entry.last_error,
        "encoding": entry.encoding.as_str(),
        "payload_bytes": entry.payload.len(),
    });
    if args.decode {
        value["snapshot"] = match codec::decode(&entry.payload, entry.encoding) {
            Ok(snapshot) => json!(snapshot),
            Err(err) => json!({ "error": format!("{:#}", err) }),
        };
    }
    if args.raw {
        value["payload_hex"] = json!(hex::encode(&entry.payload));
    }
    value
}

fn print_entry(entry: &SpoolEntry, args: &Args) {
    println!(
        "seq={:<6} source={} reason={:<9} attempts={} at={} bytes={} {}",
        entry.seq,
        entry.source_id,
        entry.reason.as_str(),
        entry.attempts,
        entry.spooled_at_ms,
        entry.payload.len(),
        entry.last_error.as_deref().unwrap_or("")
    );
    if args.decode {
        match codec::decode(&entry.payload, entry.encoding) {
            Ok(snapshot) => println!(
                "    count={} density={} anomaly={} timestamp={}",
                snapshot.count,
                snapshot.density.as_str(),
                snapshot.anomaly,
                snapshot.timestamp
            ),
            Err(err) => println!("    undecodable: {:#}", err),
        }
    }
    if args.raw {
        println!("    {}", hex::encode(&entry.payload));
    }
}
