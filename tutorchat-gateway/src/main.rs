//! `TutorChat` gateway: real-time messaging between students and tutors.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store on the default address 0.0.0.0:9100
//! cargo run --bin tutorchat-gateway
//!
//! # Persistent store on a custom address
//! cargo run --bin tutorchat-gateway -- --bind 127.0.0.1:8080 --store sqlite://chat.db
//! ```

use std::sync::Arc;

use clap::Parser;
use tutorchat_gateway::config::{GatewayCliArgs, GatewayConfig};
use tutorchat_gateway::gateway::GatewayState;
use tutorchat_gateway::server;
use tutorchat_gateway::store::StoreBackend;

#[tokio::main]
async fn main() {
    let cli = GatewayCliArgs::parse();

    let config = match GatewayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        store = ?config.store,
        room_access = %config.settings.room_access,
        require_token = config.settings.require_token,
        "starting tutorchat gateway"
    );

    let store = match StoreBackend::open(&config.store).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to open message store");
            std::process::exit(1);
        }
    };
    let state = Arc::new(GatewayState::new(store, config.settings));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "gateway listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "gateway server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start gateway");
            std::process::exit(1);
        }
    }
}
