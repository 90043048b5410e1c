mod slave;

use clap::Parser;
use gamemesh_shared::command::{CallBatch, CommandResults};
use gamemesh_shared::config::NetConfig;
use gamemesh_shared::random_node_id;
use gamemesh_shared::service::ClientService;
use log::info;
use slave::Slave;
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Instance number on this machine; offsets the RPC port
    #[arg(short, long, default_value = "0")]
    instance: u16,

    /// UDP port announcements are listened on
    #[arg(long, default_value = "47800")]
    discovery_port: u16,

    /// Disable the keep-alive watchdog
    #[arg(long)]
    no_keep_alive: bool,

    /// Only listen on these interface addresses
    #[arg(long)]
    interface: Vec<Ipv4Addr>,
}

/// Demo service: logs inbound batches. A real deployment injects the
/// input-injection/screen-reading layer here instead.
struct LoggingService;

impl ClientService for LoggingService {
    fn commands_from_server(&self, batch: &CallBatch) -> Option<CommandResults> {
        info!("server sent {} command(s)", batch.len());
        Some(batch.items.iter().map(|_| None).collect())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = NetConfig {
        discovery_port: args.discovery_port,
        keep_alive_ping: !args.no_keep_alive,
        client_nif_allowlist: args.interface,
        ..NetConfig::default()
    };

    let node_id = random_node_id();
    info!("starting slave {} (instance {})...", node_id, args.instance);

    let slave = Slave::new(node_id, args.instance, Arc::new(LoggingService), config);
    slave.start();

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down gracefully...");
    slave.stop().await;

    Ok(())
}
