//! `queuebridge` binary: serves an echo engine over a broker queue.
//!
//! Every request is answered with its own body, so the binary doubles as a
//! smoke test for broker setups. Runs until Ctrl-C.

mod cli;

use std::{collections::HashMap, error::Error, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use queuebridge::{
    BackendRegistry,
    BridgeConfig,
    CallbackService,
    Endpoint,
    error::ServiceError,
    format::Format,
};
use tracing::info;

struct Echo;

#[async_trait]
impl CallbackService for Echo {
    async fn process_one(&self, request: Bytes) -> Result<Bytes, ServiceError> { Ok(request) }

    async fn process_merged(
        &self,
        requests: Vec<Bytes>,
        _format: Format,
    ) -> Result<Bytes, ServiceError> {
        Ok(Bytes::from(requests.concat()))
    }
}

fn build_config(cli: &cli::Cli) -> Result<BridgeConfig, queuebridge::error::ConfigError> {
    let mut map: HashMap<String, String> = cli.settings.iter().cloned().collect();
    map.insert("queue".into(), cli.queue.clone());
    map.insert("uri".into(), cli.uri.clone());
    map.insert("consumer".into(), cli.consumer.clone());
    map.insert("consumer.instances".into(), cli.instances.to_string());
    BridgeConfig::from_map(&map)
}

#[cfg(feature = "metrics")]
fn install_exporter(addr: std::net::SocketAddr) -> Result<(), Box<dyn Error>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(%addr, "metrics exporter listening");
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn install_exporter(addr: std::net::SocketAddr) -> Result<(), Box<dyn Error>> {
    tracing::warn!(%addr, "built without the metrics feature; ignoring --metrics-listen");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    if let Some(addr) = cli.metrics_listen {
        install_exporter(addr)?;
    }

    let config = build_config(&cli)?;
    let registry = BackendRegistry::with_defaults();
    if config.backend_name() == "memory" {
        // Nothing else publishes to a private in-process broker.
        info!("using the in-memory broker; requests can only come from this process");
    }
    let endpoint = Endpoint::start(config, &registry, Arc::new(Echo), None).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");
    endpoint.destroy().await?;
    Ok(())
}
