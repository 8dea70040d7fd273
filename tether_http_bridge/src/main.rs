use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tether_http_bridge::relay::request_timeout_secs;
use tether_http_bridge::{BridgeConfig, DEFAULT_MAX_BODY_BYTES, start_bridge};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// HTTP-to-stdio bridge for line-delimited JSON-RPC services.
///
/// Relays JSON-RPC messages received over HTTP POST to a spawned
/// subprocess over newline-delimited stdio, correlating responses back to
/// the right caller by message id.
#[derive(Parser, Debug)]
#[command(name = "tether_http_bridge")]
#[command(version, about)]
struct Args {
    /// Address to bind the HTTP server. Defaults to 127.0.0.1:3000, with
    /// the PORT environment variable overriding the port.
    #[arg(long)]
    bind_addr: Option<SocketAddr>,

    /// Command to run the subprocess. Falls back to TETHER_COMMAND.
    #[arg(long)]
    command: Option<String>,

    /// Argument to pass to the subprocess (repeatable). Falls back to
    /// TETHER_ARGS: a JSON array of strings, or a whitespace-separated
    /// string.
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// KEY=VALUE environment override for the subprocess (repeatable).
    /// Merged over TETHER_ENV (a JSON object of strings); overrides win
    /// over the inherited environment.
    #[arg(long = "env")]
    env: Vec<String>,

    /// Seconds to wait for a subprocess response before failing a request.
    /// Falls back to TETHER_REQUEST_TIMEOUT_SECS, then 15.
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Maximum accepted HTTP request body size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let command = args
        .command
        .or_else(|| std::env::var("TETHER_COMMAND").ok())
        .context("no subprocess command: pass --command or set TETHER_COMMAND")?;

    let child_args = if args.args.is_empty() {
        parse_args_value(std::env::var("TETHER_ARGS").ok().as_deref())
    } else {
        args.args
    };

    let mut env = parse_env_overlay(std::env::var("TETHER_ENV").ok().as_deref())?;
    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("invalid --env '{}', expected KEY=VALUE", pair))?;
        env.push((key.to_string(), value.to_string()));
    }

    let bind_addr = args
        .bind_addr
        .unwrap_or_else(|| bind_addr_from(std::env::var("PORT").ok().as_deref()));

    let config = BridgeConfig {
        bind_addr,
        command,
        args: child_args,
        env,
        request_timeout: Duration::from_secs(
            args.request_timeout_secs.unwrap_or_else(request_timeout_secs),
        ),
        max_body_bytes: args.max_body_bytes,
    };

    tracing::info!("Starting Tether HTTP Bridge on {}", config.bind_addr);
    tracing::info!(
        "Relaying to command: {} {}",
        config.command,
        config.args.join(" ")
    );

    start_bridge(config).await?;
    Ok(())
}

/// Resolve the default bind address; PORT selects the port on loopback.
fn bind_addr_from(port: Option<&str>) -> SocketAddr {
    let port = port.and_then(|p| p.parse().ok()).unwrap_or(3000);
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Parse TETHER_ARGS: a JSON array (elements coerced to strings), or a
/// whitespace-separated string as a fallback.
fn parse_args_value(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) {
        return items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
    }
    raw.split_whitespace().map(String::from).collect()
}

/// Parse TETHER_ENV: a JSON object of string values.
fn parse_env_overlay(raw: Option<&str>) -> anyhow::Result<Vec<(String, String)>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let map: HashMap<String, String> =
        serde_json::from_str(raw).context("TETHER_ENV must be a JSON object of string values")?;
    Ok(map.into_iter().collect())
}
