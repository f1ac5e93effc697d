//! `wiregate` gateway binary.
//!
//! Accepts newline-framed peer connections, echoes requests and lets peers
//! register and close queue consumers on the in-process broker.

mod cli;

use std::{error::Error, sync::Arc};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wiregate::{
    broker::MemoryBroker,
    server::{EchoDispatcher, Gateway},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = cli::Cli::parse();
    let config = cli.gateway_config()?;
    info!(?config, "starting gateway");

    let listener = TcpListener::bind(cli.listen).await?;
    Gateway::new(Arc::new(MemoryBroker::new()), Arc::new(EchoDispatcher))
        .config(config)
        .run(listener)
        .await?;
    Ok(())
}
