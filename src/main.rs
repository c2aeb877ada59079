use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use config::GatewayConfig;
use service::Service;

mod background;
mod codec;
mod config;
mod context;
mod dispatcher;
mod edge_cache;
mod error;
mod middleware;
mod mirror;
mod origin;
mod routes;
mod service;
mod tracing;
use crate::tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => GatewayConfig::from_path(&path.to_string_lossy()),
        None => GatewayConfig::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("error setting up tracing: {:#}", err);
            std::process::exit(1);
        }
    };

    let meter_provider = if config.telemetry.enable_metrics {
        match gateway_metrics::init_provider(config.telemetry.endpoint.as_deref()) {
            Ok(provider) => Some(provider),
            Err(err) => {
                error!("error setting up metrics, continuing without: {:?}", err);
                None
            }
        }
    } else {
        None
    };

    let root_span = info_span!(
        "mirror-gateway",
        env = config.env,
        "gateway-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    match Service::new(config) {
        Ok(service) => {
            if let Err(err) = service.start().await {
                error!("error running service: {:?}", err);
            }
        }
        Err(err) => error!("error creating service: {:?}", err),
    }

    if let Some(meter_provider) = meter_provider {
        if let Err(err) = meter_provider.shutdown() {
            error!("error shutting down meter provider: {:?}", err);
        }
    }
    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("error shutting down tracer provider: {:?}", err);
        }
    }
}
