//! weftd - weft overlay network node daemon

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weftd::config::Config;
use weftd::node::Node;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_level = if config.verbose { "weftd=debug,weft_net=debug" } else { "weftd=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    info!("weftd v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    let node = match Node::new(config) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("Failed to initialize node: {}", e);
            return ExitCode::FAILURE;
        }
    };

    {
        let node = node.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            node.shutdown();
        });
    }

    if let Err(e) = node.run().await {
        error!("Node error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
