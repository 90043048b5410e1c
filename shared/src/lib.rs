//! Core discovery and RPC broker subsystem shared by the master (`server`)
//! and slave (`client`) roles.
//!
//! The pieces compose in a fixed direction: [`nif::NifDiscovery`] feeds
//! interface add/remove events to the node discovery services
//! ([`discovery::Announcer`] on the master, [`discovery::Listener`] on the
//! slave) and to the [`node::ExecutionNode`] RPC listeners. The listener
//! resolves announcer ids to address maps, which a [`broker::Broker`] feeds
//! into its owned [`peer::Peer`]. Outbound command batches flow
//! application → broker → peer → [`rpc::RpcConnection`]; inbound batches flow
//! listener → execution node dispatch queue → application service.

pub mod broker;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod liveness;
pub mod nif;
pub mod node;
pub mod peer;
pub mod rpc;
pub mod service;

/// First token of every discovery datagram.
pub const DISCOVERY_MAGIC: &str = "GAMEMESH";

/// Receive buffer for discovery datagrams. Announcements are three short
/// ASCII tokens; anything larger is malformed.
pub const ANNOUNCEMENT_BUFFER_SIZE: usize = 256;

/// Picks the node id for this process. Re-randomized on every restart so
/// remotes reliably detect an identity change.
pub fn random_node_id() -> u64 {
    rand::random::<u64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_differ_across_draws() {
        // Not a statistical test, just a sanity check that the id is not a
        // fixed constant.
        let a = random_node_id();
        let b = random_node_id();
        let c = random_node_id();
        assert!(a != b || b != c);
    }

    #[test]
    fn magic_fits_receive_buffer() {
        // "<MAGIC> <ipv4> <u64>" worst case stays well under the buffer.
        let worst = format!("{} 255.255.255.255 {}", DISCOVERY_MAGIC, u64::MAX);
        assert!(worst.len() < ANNOUNCEMENT_BUFFER_SIZE);
    }
}
