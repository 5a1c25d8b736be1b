//! Command line interface for the `queuebridge` binary.
//!
//! Parses the endpoint settings; anything not covered by a dedicated flag
//! can be passed as a raw `--set key=value` configuration entry.

use std::net::SocketAddr;

use clap::Parser;

/// Command line arguments for the `queuebridge` binary.
#[derive(Debug, Parser)]
#[command(
    name = "queuebridge",
    version,
    about = "Serve an echo engine over a message broker queue"
)]
pub struct Cli {
    /// Broker connection string, for example `amqp://localhost:5672/%2f`.
    #[arg(short, long, default_value = "memory://local")]
    pub uri: String,

    /// Queue to consume requests from.
    #[arg(short, long)]
    pub queue: String,

    /// Consumer discipline: `default` or `merging`.
    #[arg(short, long, default_value = "default")]
    pub consumer: String,

    /// Number of parallel subscriptions on the queue.
    #[arg(short, long, default_value_t = 1)]
    pub instances: usize,

    /// Extra configuration entry, repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_entry)]
    pub settings: Vec<(String, String)>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    pub metrics_listen: Option<SocketAddr>,
}

fn parse_entry(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in {raw:?}"));
    }
    Ok((key.to_owned(), value.trim().to_owned()))
}
