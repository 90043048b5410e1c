//! Announcement broadcaster (master side of node discovery).

use crate::config::NetConfig;
use crate::DISCOVERY_MAGIC;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::sleep;

struct AnnounceTarget {
    broadcast: Ipv4Addr,
    consecutive_errors: u32,
}

struct AnnouncerState {
    node_id: u64,
    discovery_port: u16,
    announce_interval: Duration,
    max_consecutive_errors: u32,
    running: AtomicBool,
    targets: Mutex<HashMap<Ipv4Addr, AnnounceTarget>>,
}

/// Periodically broadcasts `"<MAGIC> <address> <node_id>"` from each
/// registered interface to its broadcast address.
///
/// An interface that fails several sends in a row is dropped (circuit
/// breaker); broadcasting continues on the rest.
pub struct Announcer {
    inner: Arc<AnnouncerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Announcer {
    pub fn new(node_id: u64, config: &NetConfig) -> Self {
        Self {
            inner: Arc::new(AnnouncerState {
                node_id,
                discovery_port: config.discovery_port,
                announce_interval: config.announce_interval,
                max_consecutive_errors: config.max_consecutive_errors,
                running: AtomicBool::new(false),
                targets: Mutex::new(HashMap::new()),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn add_nifaddr(&self, addr: Ipv4Addr, broadcast: Ipv4Addr) {
        self.inner.targets.lock().unwrap().insert(
            addr,
            AnnounceTarget {
                broadcast,
                consecutive_errors: 0,
            },
        );
    }

    pub fn remove_nifaddr(&self, addr: Ipv4Addr) {
        self.inner.targets.lock().unwrap().remove(&addr);
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.inner);
        info!("announcer started with node id {}", state.node_id);
        *handle = Some(tokio::spawn(async move {
            loop {
                if !state.running.load(Ordering::SeqCst) {
                    break;
                }
                broadcast_round(&state).await;
                sleep(state.announce_interval).await;
            }
        }));
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

async fn broadcast_round(state: &AnnouncerState) {
    let pairs: Vec<(Ipv4Addr, Ipv4Addr)> = state
        .targets
        .lock()
        .unwrap()
        .iter()
        .map(|(addr, target)| (*addr, target.broadcast))
        .collect();

    for (addr, broadcast) in pairs {
        let payload = format!("{} {} {}", DISCOVERY_MAGIC, addr, state.node_id);
        let sent = send_announcement(addr, broadcast, state.discovery_port, payload.as_bytes()).await;

        let mut targets = state.targets.lock().unwrap();
        let Some(target) = targets.get_mut(&addr) else {
            continue; // removed concurrently
        };
        if sent {
            target.consecutive_errors = 0;
        } else {
            target.consecutive_errors += 1;
            if target.consecutive_errors >= state.max_consecutive_errors {
                warn!(
                    "dropping announce interface {} after {} consecutive errors",
                    addr, target.consecutive_errors
                );
                targets.remove(&addr);
            }
        }
    }
}

async fn send_announcement(
    local: Ipv4Addr,
    broadcast: Ipv4Addr,
    port: u16,
    payload: &[u8],
) -> bool {
    let socket = match UdpSocket::bind(SocketAddr::from((local, 0))).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("announce bind on {} failed: {}", local, e);
            return false;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!("enabling broadcast on {} failed: {}", local, e);
        return false;
    }
    match socket.send_to(payload, SocketAddr::from((broadcast, port))).await {
        Ok(_) => {
            debug!("announced {} -> {}:{}", local, broadcast, port);
            true
        }
        Err(e) => {
            warn!("announce from {} to {} failed: {}", local, broadcast, e);
            false
        }
    }
}
