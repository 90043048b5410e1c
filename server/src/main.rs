mod master;
mod registry;

use clap::Parser;
use gamemesh_shared::command::{CallBatch, CommandResults};
use gamemesh_shared::config::NetConfig;
use gamemesh_shared::random_node_id;
use gamemesh_shared::service::ServerService;
use log::info;
use master::Master;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Demo service: accepts every client and logs what arrives. A real
/// deployment injects the game-automation layer here instead.
struct LoggingService;

impl ServerService for LoggingService {
    fn register_client(&self, client_id: u64, addresses: HashMap<Ipv4Addr, Ipv4Addr>) -> bool {
        info!(
            "client {} registered with {} address(es)",
            client_id,
            addresses.len()
        );
        true
    }

    fn unregister_client(&self, client_id: u64) {
        info!("client {} left", client_id);
    }

    fn commands_from_client(&self, client_id: u64, batch: &CallBatch) -> Option<CommandResults> {
        info!("client {} sent {} command(s)", client_id, batch.len());
        Some(batch.items.iter().map(|_| None).collect())
    }
}

/// Main-method of the application.
/// Parses command-line arguments, assembles the master and runs until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// UDP port announcements are broadcast on
        #[clap(long, default_value = "47800")]
        discovery_port: u16,
        /// TCP port the RPC listeners bind
        #[clap(short, long, default_value = "47801")]
        rpc_port: u16,
        /// Disable keep-alive pings toward clients
        #[clap(long)]
        no_keep_alive: bool,
        /// Only announce/listen on these interface addresses
        #[clap(long)]
        interface: Vec<Ipv4Addr>,
    }

    env_logger::init();
    let args = Args::parse();

    let config = NetConfig {
        discovery_port: args.discovery_port,
        server_rpc_port: args.rpc_port,
        keep_alive_ping: !args.no_keep_alive,
        server_nif_allowlist: args.interface,
        ..NetConfig::default()
    };

    let node_id = random_node_id();
    let master = Master::new(node_id, Arc::new(LoggingService), config);
    master.start();
    info!("master {} running, press Ctrl+C to stop", node_id);

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down gracefully...");
    master.stop();

    Ok(())
}
