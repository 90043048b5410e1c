//! Addressable, reconnectable handle to exactly one remote identity.
//!
//! A peer owns the remote's address map and the active connection, if any.
//! Calls run an address-fallback loop with affinity to the last-good
//! address: the currently connected address is tried first, then every
//! other candidate in map order; a transport error tears the connection
//! down and advances to the next candidate. Only when every candidate is
//! exhausted does the failure surface to the caller.

use crate::config::NetConfig;
use crate::rpc::{RpcConnection, RpcRequest, RpcResponse};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Role seam for the client/server peer flavors: what, if anything, must be
/// sent before payload calls on a fresh or re-validated connection.
pub trait PeerRole: Send + Sync + 'static {
    /// Registration request to run ahead of the next payload call, or
    /// `None` when the role has no handshake.
    fn register_request(&self) -> Option<RpcRequest> {
        None
    }
}

/// Role for the direction that needs no handshake (master calling a slave
/// it already admitted).
pub struct NoRegistration;

impl PeerRole for NoRegistration {}

struct PeerState {
    /// Remote address -> local interface it was discovered on.
    addrs: HashMap<Ipv4Addr, Ipv4Addr>,
    conn: Option<RpcConnection>,
    needs_register: bool,
}

pub struct Peer {
    remote_id: u64,
    port: u16,
    connect_timeout: Duration,
    call_timeout: Duration,
    lock_timeout: Duration,
    role: Arc<dyn PeerRole>,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(remote_id: u64, port: u16, role: Arc<dyn PeerRole>, config: &NetConfig) -> Self {
        Self {
            remote_id,
            port,
            connect_timeout: config.connect_timeout,
            call_timeout: config.call_timeout,
            lock_timeout: config.lock_timeout,
            role,
            state: Mutex::new(PeerState {
                addrs: HashMap::new(),
                conn: None,
                needs_register: true,
            }),
        }
    }

    pub fn remote_id(&self) -> u64 {
        self.remote_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Atomically replaces the address map. The connection is torn down
    /// first when the new set invalidates it; a changed set while connected
    /// re-arms registration (the remote may have failed over mid-flight).
    pub async fn update_addresses(&self, map: HashMap<Ipv4Addr, Ipv4Addr>) {
        let mut state = self.state.lock().await;
        if let Some(conn) = &state.conn {
            if !map.contains_key(&conn.remote_addr()) {
                info!(
                    "peer {}: connected address {} vanished, dropping connection",
                    self.remote_id,
                    conn.remote_addr()
                );
                state.conn = None;
            }
        }
        if state.addrs != map {
            state.needs_register = true;
        }
        state.addrs = map;
    }

    /// Forces the role handshake to run again before the next payload call,
    /// e.g. after the locally advertised address list changed.
    pub async fn require_registration(&self) {
        self.state.lock().await.needs_register = true;
    }

    /// Address of the live connection, if one exists.
    pub async fn connected_addr(&self) -> Option<Ipv4Addr> {
        self.state
            .lock()
            .await
            .conn
            .as_ref()
            .map(|conn| conn.remote_addr())
    }

    /// Tears down the active connection; the address map survives.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.conn.take().is_some() {
            debug!("peer {}: connection closed", self.remote_id);
        }
        state.needs_register = true;
    }

    /// Runs one call with address fallback. Returns `None` when no
    /// candidate address accepted the call (including registration
    /// rejection, which is surfaced once and not retried here).
    ///
    /// The exclusive lock wait is time-bounded so callers cannot queue
    /// without limit behind a partitioned peer.
    pub async fn call(&self, request: &RpcRequest) -> Option<RpcResponse> {
        let mut state = match timeout(self.lock_timeout, self.state.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!("peer {}: gave up waiting for the peer lock", self.remote_id);
                return None;
            }
        };

        // Affinity: currently connected address first, then the rest in map
        // order. No further priority is implied by the ordering.
        let mut candidates: Vec<Ipv4Addr> = Vec::with_capacity(state.addrs.len());
        if let Some(conn) = &state.conn {
            candidates.push(conn.remote_addr());
        }
        for addr in state.addrs.keys() {
            if !candidates.contains(addr) {
                candidates.push(*addr);
            }
        }

        for addr in candidates {
            if state.conn.as_ref().map(|c| c.remote_addr()) != Some(addr) {
                match RpcConnection::connect(addr, self.port, self.connect_timeout).await {
                    Ok(conn) => {
                        debug!("peer {}: connected to {}:{}", self.remote_id, addr, self.port);
                        state.conn = Some(conn);
                        state.needs_register = true;
                    }
                    Err(e) => {
                        debug!("peer {}: connect {} failed: {}", self.remote_id, addr, e);
                        continue;
                    }
                }
            }

            if state.needs_register {
                match self.role.register_request() {
                    Some(register) => {
                        let Some(conn) = state.conn.as_mut() else { continue };
                        match conn.call(&register, self.call_timeout).await {
                            Ok(RpcResponse::Accepted(true)) => {
                                state.needs_register = false;
                            }
                            Ok(RpcResponse::Accepted(false)) => {
                                warn!("peer {}: registration rejected", self.remote_id);
                                return None;
                            }
                            Ok(other) => {
                                warn!(
                                    "peer {}: unexpected registration response: {:?}",
                                    self.remote_id, other
                                );
                                state.conn = None;
                                continue;
                            }
                            Err(e) => {
                                debug!("peer {}: registration at {} failed: {}", self.remote_id, addr, e);
                                state.conn = None;
                                continue;
                            }
                        }
                    }
                    None => state.needs_register = false,
                }
            }

            let Some(conn) = state.conn.as_mut() else { continue };
            match conn.call(request, self.call_timeout).await {
                Ok(response) => return Some(response),
                Err(e) => {
                    debug!("peer {}: call to {} failed: {}", self.remote_id, addr, e);
                    state.conn = None;
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> NetConfig {
        NetConfig {
            connect_timeout: Duration::from_millis(200),
            call_timeout: Duration::from_millis(200),
            lock_timeout: Duration::from_millis(500),
            ..NetConfig::default()
        }
    }

    #[tokio::test]
    async fn call_with_no_addresses_reports_disconnected() {
        let peer = Peer::new(9, 1, Arc::new(NoRegistration), &quick_config());
        let response = peer.call(&RpcRequest::Ping { node_id: 1 }).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn update_addresses_keeps_registration_armed() {
        let peer = Peer::new(9, 1, Arc::new(NoRegistration), &quick_config());
        let mut map = HashMap::new();
        map.insert("10.0.0.5".parse().unwrap(), "10.0.0.9".parse().unwrap());
        peer.update_addresses(map.clone()).await;
        assert!(peer.state.lock().await.needs_register);
        assert_eq!(peer.state.lock().await.addrs, map);
        assert!(peer.connected_addr().await.is_none());
    }
}
