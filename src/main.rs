//! # math-cascade: command-line front end
//!
//! Runs queries through the tiered cascade, one-shot, interactively over
//! stdin, or as an HTTP service.
//!
//! ## Usage
//!
//! ```bash
//! # One query, JSON report on stdout
//! math-cascade --query "what is 12 * 7"
//!
//! # Start at the reasoning tier
//! math-cascade --query "why is 0.999... equal to 1" --tier reasoning
//!
//! # Line-oriented session (RESET, STATS and QUIT are commands)
//! math-cascade --config cascade.toml --interactive
//!
//! # HTTP control surface
//! cargo run --features web-api -- --config cascade.toml --serve
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (overrides the config file)
//! - `RUST_LOG=info`: log level filter
//! - `WOLFRAM_APP_ID`: computational tier credentials (name configurable)

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_math_cascade::config::{self, loader, CascadeConfig};
use tokio_math_cascade::stats::ChannelSink;
use tokio_math_cascade::{
    init_tracing, metrics, CascadeOrchestrator, OrchestratorBuilder, Query, TierId,
};
use tracing::{debug, info, warn};

/// Parsed CLI arguments.
struct Args {
    /// Path to the TOML configuration file.
    config: Option<PathBuf>,
    /// One-shot query.
    query: Option<String>,
    /// Starting tier override.
    tier: Option<TierId>,
    /// Read queries from stdin.
    interactive: bool,
    /// Run the HTTP server.
    serve: bool,
    /// Print the config JSON Schema and exit.
    schema: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
///
/// # Returns
///
/// - `Ok(Args)` on success
/// - `Err(String)` with a usage message on failure
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        query: None,
        tier: None,
        interactive: false,
        serve: false,
        schema: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a value")?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--query" | "-q" => {
                i += 1;
                let value = args.get(i).ok_or("--query requires a value")?;
                parsed.query = Some(value.clone());
            }
            "--tier" | "-t" => {
                i += 1;
                let value = args.get(i).ok_or("--tier requires a value")?;
                parsed.tier = Some(value.parse().map_err(|e| format!("{e}"))?);
            }
            "--interactive" | "-i" => parsed.interactive = true,
            "--serve" => parsed.serve = true,
            "--schema" => parsed.schema = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    if parsed.query.is_none() && !parsed.interactive && !parsed.serve && !parsed.schema {
        return Err(usage());
    }
    Ok(parsed)
}

/// Print usage information.
fn usage() -> String {
    [
        "Usage: math-cascade [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   TOML configuration (defaults apply without one)",
        "  --query, -q <TEXT>    Solve one query and print the JSON report",
        "  --tier, -t <TIER>     Start at symbolic, computational or reasoning",
        "  --interactive, -i     Read queries from stdin (RESET, STATS, QUIT)",
        "  --serve               Run the HTTP API (requires feature web-api)",
        "  --schema              Print the configuration JSON Schema and exit",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    if args.schema {
        println!("{}", config::export_schema()?);
        return Ok(());
    }

    let cfg = match &args.config {
        Some(path) => match loader::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Configuration error: {e}");
                std::process::exit(1);
            }
        },
        None => CascadeConfig::default(),
    };

    // LOG_FORMAT from the environment wins over the config file
    if std::env::var_os("LOG_FORMAT").is_none() {
        std::env::set_var("LOG_FORMAT", cfg.observability.log_format.as_str());
    }
    let _ = init_tracing();
    if cfg.observability.metrics {
        metrics::init_metrics()?;
    }

    let mut builder = OrchestratorBuilder::from_config(&cfg).await?;
    if cfg.stats.log_events {
        let (sink, mut events) = ChannelSink::new(cfg.stats.event_channel_capacity);
        builder = builder.sink(Arc::new(sink));
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "cascade event");
            }
        });
    }
    let orchestrator = builder.build();
    info!(tiers = ?orchestrator.registered_tiers(), "math-cascade ready");

    if let Some(text) = args.query.clone() {
        let mut query = Query::new(text);
        if let Some(tier) = args.tier {
            query = query.with_tier(tier);
        }
        let report = orchestrator.submit(query).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        orchestrator.cache().flush().await;
    }

    if args.interactive {
        run_interactive(&orchestrator, args.tier).await?;
    }

    if args.serve {
        serve(&cfg, orchestrator).await?;
    }

    Ok(())
}

/// Line-oriented session on stdin/stdout.
async fn run_interactive(
    orchestrator: &CascadeOrchestrator,
    tier: Option<TierId>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.to_ascii_uppercase().as_str() {
            "QUIT" | "EXIT" => break,
            "RESET" => {
                orchestrator.invalidate_cache().await;
                println!("cache cleared");
            }
            "STATS" => {
                println!("{}", serde_json::to_string_pretty(&orchestrator.stats())?);
            }
            _ => {
                let mut query = Query::new(line);
                if let Some(tier) = tier {
                    query = query.with_tier(tier);
                }
                match orchestrator.submit(query).await {
                    Ok(report) => match report.answer() {
                        Some(answer) => println!("{answer}  [{}]", report.final_tier),
                        None => println!("{}", report.outcome.reason().unwrap_or_default()),
                    },
                    Err(e) => {
                        warn!(error = %e, "query aborted");
                        println!("Something went wrong with that one. Please try again.");
                    }
                }
            }
        }
    }

    orchestrator.cache().flush().await;
    Ok(())
}

#[cfg(feature = "web-api")]
async fn serve(
    cfg: &CascadeConfig,
    orchestrator: CascadeOrchestrator,
) -> Result<(), Box<dyn std::error::Error>> {
    use tokio_math_cascade::web_api::{start_server, ServerConfig};

    start_server(ServerConfig::from(&cfg.server), orchestrator)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })
}

#[cfg(not(feature = "web-api"))]
async fn serve(
    _cfg: &CascadeConfig,
    _orchestrator: CascadeOrchestrator,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("--serve requires the web-api feature".into())
}
