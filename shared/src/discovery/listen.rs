//! Announcement listener (slave side of node discovery).
//!
//! One receive task per accepted interface feeds a shared table of
//! [`RemoteLocator`]s keyed by announcer id; a sweeper task evicts stale
//! addresses. Any change to a locator's surviving-address map fires the
//! server-update observers with the full `remote -> local` map, never a
//! delta, so subscribers can always reconstruct complete state from the
//! latest event.

use super::locator::RemoteLocator;
use crate::config::NetConfig;
use crate::error::{MeshError, Result};
use crate::nif::NifAddr;
use crate::{ANNOUNCEMENT_BUFFER_SIZE, DISCOVERY_MAGIC};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Fired with the announcer id and its full surviving address map.
pub type ServerObserver = Arc<dyn Fn(u64, HashMap<Ipv4Addr, Ipv4Addr>) + Send + Sync>;

struct ListenerState {
    discovery_port: u16,
    server_lost_timeout: Duration,
    max_consecutive_errors: u32,
    running: AtomicBool,
    sockets: Mutex<HashMap<Ipv4Addr, JoinHandle<()>>>,
    locators: Mutex<HashMap<u64, RemoteLocator>>,
    observers: Mutex<Vec<ServerObserver>>,
}

pub struct Listener {
    inner: Arc<ListenerState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            inner: Arc::new(ListenerState {
                discovery_port: config.discovery_port,
                server_lost_timeout: config.server_lost_timeout,
                max_consecutive_errors: config.max_consecutive_errors,
                running: AtomicBool::new(false),
                sockets: Mutex::new(HashMap::new()),
                locators: Mutex::new(HashMap::new()),
                observers: Mutex::new(Vec::new()),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Opens a discovery socket on the interface and starts receiving.
    /// Must run inside a tokio runtime.
    pub fn add_nifaddr(&self, nif: NifAddr) {
        let mut sockets = self.inner.sockets.lock().unwrap();
        if sockets.contains_key(&nif.addr) {
            return;
        }
        let state = Arc::clone(&self.inner);
        sockets.insert(nif.addr, tokio::spawn(recv_loop(state, nif)));
    }

    pub fn remove_nifaddr(&self, addr: Ipv4Addr) {
        if let Some(handle) = self.inner.sockets.lock().unwrap().remove(&addr) {
            handle.abort();
        }
    }

    pub fn add_server_observer(
        &self,
        observer: impl Fn(u64, HashMap<Ipv4Addr, Ipv4Addr>) + Send + Sync + 'static,
    ) {
        self.inner.observers.lock().unwrap().push(Arc::new(observer));
    }

    /// Forgets every known announcer. The next announcement rebuilds the
    /// table from scratch; used when a stale cache is the suspected cause of
    /// connection trouble.
    pub fn clear_server_address_cache(&self) {
        let cleared = {
            let mut locators = self.inner.locators.lock().unwrap();
            let n = locators.len();
            locators.clear();
            n
        };
        if cleared > 0 {
            info!("cleared {} cached server locator(s)", cleared);
        }
    }

    /// Starts the staleness sweeper.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.is_some() {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.inner);
        *sweeper = Some(tokio::spawn(async move {
            loop {
                sleep(state.server_lost_timeout).await;
                if !state.running.load(Ordering::SeqCst) {
                    break;
                }
                sweep_all(&state);
            }
        }));
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        let mut sockets = self.inner.sockets.lock().unwrap();
        for (_, handle) in sockets.drain() {
            handle.abort();
        }
    }
}

/// Parses `"<MAGIC> <address> <node_id>"`.
pub fn parse_announcement(payload: &[u8]) -> Result<(Ipv4Addr, u64)> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| MeshError::Protocol("announcement is not UTF-8".into()))?;
    let mut tokens = text.split_whitespace();

    let magic = tokens
        .next()
        .ok_or_else(|| MeshError::Protocol("empty announcement".into()))?;
    if magic != DISCOVERY_MAGIC {
        return Err(MeshError::Protocol(format!("bad magic {:?}", magic)));
    }
    let addr: Ipv4Addr = tokens
        .next()
        .ok_or_else(|| MeshError::Protocol("missing announcer address".into()))?
        .parse()
        .map_err(|_| MeshError::Protocol("unparseable announcer address".into()))?;
    let node_id: u64 = tokens
        .next()
        .ok_or_else(|| MeshError::Protocol("missing announcer id".into()))?
        .parse()
        .map_err(|_| MeshError::Protocol("unparseable announcer id".into()))?;
    if tokens.next().is_some() {
        return Err(MeshError::Protocol("trailing announcement tokens".into()));
    }
    Ok((addr, node_id))
}

async fn recv_loop(state: Arc<ListenerState>, nif: NifAddr) {
    let bind = SocketAddr::from((nif.addr, state.discovery_port));
    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("discovery bind on {} failed: {}", bind, e);
            state.sockets.lock().unwrap().remove(&nif.addr);
            return;
        }
    };
    info!("listening for announcements on {}", bind);

    let mut buf = [0u8; ANNOUNCEMENT_BUFFER_SIZE];
    let mut consecutive_errors = 0u32;
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => match validate(&buf[..len], from) {
                Ok((announcer_addr, node_id)) => {
                    consecutive_errors = 0;
                    apply_announcement(&state, node_id, announcer_addr, nif.addr);
                }
                Err(e) => {
                    debug!("bad announcement from {}: {}", from, e);
                    consecutive_errors += 1;
                }
            },
            Err(e) => {
                warn!("discovery recv on {} failed: {}", nif.addr, e);
                consecutive_errors += 1;
            }
        }
        if consecutive_errors >= state.max_consecutive_errors {
            warn!(
                "dropping discovery socket on {} after {} consecutive errors",
                nif.addr, consecutive_errors
            );
            break;
        }
    }
    state.sockets.lock().unwrap().remove(&nif.addr);
}

fn validate(payload: &[u8], from: SocketAddr) -> Result<(Ipv4Addr, u64)> {
    let (addr, node_id) = parse_announcement(payload)?;
    // The claimed address must match the datagram source.
    if let IpAddr::V4(source) = from.ip() {
        if source != addr {
            return Err(MeshError::Protocol(format!(
                "announcer claims {} but sent from {}",
                addr, source
            )));
        }
    }
    Ok((addr, node_id))
}

fn apply_announcement(
    state: &ListenerState,
    node_id: u64,
    announcer_addr: Ipv4Addr,
    local_nif: Ipv4Addr,
) {
    let changed_map = {
        let mut locators = state.locators.lock().unwrap();
        let locator = locators.entry(node_id).or_insert_with(RemoteLocator::new);
        if locator.record(announcer_addr, local_nif) {
            Some(locator.address_map())
        } else {
            None
        }
    };
    if let Some(map) = changed_map {
        debug!("server {} now reachable at {} address(es)", node_id, map.len());
        notify(state, node_id, map);
    }
}

fn sweep_all(state: &ListenerState) {
    let changed: Vec<(u64, HashMap<Ipv4Addr, Ipv4Addr>)> = {
        let mut locators = state.locators.lock().unwrap();
        locators
            .iter_mut()
            .filter_map(|(id, locator)| {
                if locator.sweep(state.server_lost_timeout) {
                    Some((*id, locator.address_map()))
                } else {
                    None
                }
            })
            .collect()
    };
    for (node_id, map) in changed {
        info!(
            "server {} aged out to {} surviving address(es)",
            node_id,
            map.len()
        );
        notify(state, node_id, map);
    }
}

fn notify(state: &ListenerState, node_id: u64, map: HashMap<Ipv4Addr, Ipv4Addr>) {
    let observers = state.observers.lock().unwrap().clone();
    for observer in observers {
        observer(node_id, map.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_wellformed_announcement() {
        let payload = format!("{} 10.0.0.5 12345", DISCOVERY_MAGIC);
        let (addr, id) = parse_announcement(payload.as_bytes()).unwrap();
        assert_eq!(addr, "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(id, 12345);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        assert!(parse_announcement(b"NOTMESH 10.0.0.5 1").is_err());
    }

    #[test]
    fn parse_rejects_short_and_long_payloads() {
        let short = format!("{} 10.0.0.5", DISCOVERY_MAGIC);
        assert!(parse_announcement(short.as_bytes()).is_err());
        let long = format!("{} 10.0.0.5 1 extra", DISCOVERY_MAGIC);
        assert!(parse_announcement(long.as_bytes()).is_err());
    }

    #[test]
    fn parse_rejects_non_numeric_id() {
        let payload = format!("{} 10.0.0.5 abc", DISCOVERY_MAGIC);
        assert!(parse_announcement(payload.as_bytes()).is_err());
    }

    #[test]
    fn validate_rejects_source_mismatch() {
        let payload = format!("{} 10.0.0.5 1", DISCOVERY_MAGIC);
        let from: SocketAddr = "192.168.1.1:5000".parse().unwrap();
        assert!(validate(payload.as_bytes(), from).is_err());

        let honest: SocketAddr = "10.0.0.5:5000".parse().unwrap();
        assert!(validate(payload.as_bytes(), honest).is_ok());
    }
}
