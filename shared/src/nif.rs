//! Network interface discovery.
//!
//! Enumerates local IPv4 interfaces carrying a broadcast address on a fixed
//! period, diffs the result against the previous snapshot and fires
//! found/lost events for the deltas. Late subscribers receive a replay of
//! every currently-known address. Enumeration failures are not fatal; the
//! poll simply retries after the interval.

use log::{debug, warn};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// One local interface address together with its broadcast address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NifAddr {
    pub addr: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

impl NifAddr {
    pub fn new(addr: Ipv4Addr, broadcast: Ipv4Addr) -> Self {
        Self { addr, broadcast }
    }

    /// True when an allow-list entry selects this interface, either by its
    /// exact address or by its broadcast network.
    fn matches(&self, entry: Ipv4Addr) -> bool {
        entry == self.addr || entry == self.broadcast
    }
}

type NifObserver = Arc<dyn Fn(NifAddr) + Send + Sync>;

/// Source of interface snapshots. Injectable so the poll loop can be driven
/// by synthetic interfaces in tests.
pub type NifSource = Arc<dyn Fn() -> Vec<NifAddr> + Send + Sync>;

struct NifState {
    source: NifSource,
    allowlist: Vec<Ipv4Addr>,
    poll_interval: Duration,
    running: AtomicBool,
    known: Mutex<Vec<NifAddr>>,
    found_observers: Mutex<Vec<NifObserver>>,
    lost_observers: Mutex<Vec<NifObserver>>,
}

pub struct NifDiscovery {
    inner: Arc<NifState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NifDiscovery {
    /// Discovery over the real system interfaces.
    pub fn new(allowlist: Vec<Ipv4Addr>, poll_interval: Duration) -> Self {
        Self::with_source(Arc::new(system_nifs), allowlist, poll_interval)
    }

    /// Discovery over an injected interface source.
    pub fn with_source(
        source: NifSource,
        allowlist: Vec<Ipv4Addr>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(NifState {
                source,
                allowlist,
                poll_interval,
                running: AtomicBool::new(false),
                known: Mutex::new(Vec::new()),
                found_observers: Mutex::new(Vec::new()),
                lost_observers: Mutex::new(Vec::new()),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Subscribes to interface appearance. Already-known addresses are
    /// replayed immediately so late subscribers see complete state.
    pub fn add_network_found_observer(&self, observer: impl Fn(NifAddr) + Send + Sync + 'static) {
        let observer: NifObserver = Arc::new(observer);
        let known = self.inner.known.lock().unwrap().clone();
        for nif in known {
            observer(nif);
        }
        self.inner.found_observers.lock().unwrap().push(observer);
    }

    pub fn add_network_lost_observer(&self, observer: impl Fn(NifAddr) + Send + Sync + 'static) {
        self.inner
            .lost_observers
            .lock()
            .unwrap()
            .push(Arc::new(observer));
    }

    pub fn current_addresses(&self) -> Vec<NifAddr> {
        self.inner.known.lock().unwrap().clone()
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(async move {
            loop {
                if !state.running.load(Ordering::SeqCst) {
                    break;
                }
                poll(&state);
                sleep(state.poll_interval).await;
            }
        }));
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Runs a single enumeration pass outside the poll task.
    pub fn poll_now(&self) {
        poll(&self.inner);
    }
}

fn poll(state: &NifState) {
    let mut fresh = (state.source)();
    if !state.allowlist.is_empty() {
        fresh.retain(|nif| state.allowlist.iter().any(|&entry| nif.matches(entry)));
    }

    let (found, lost) = {
        let mut known = state.known.lock().unwrap();
        let found: Vec<NifAddr> = fresh
            .iter()
            .filter(|nif| !known.contains(nif))
            .copied()
            .collect();
        let lost: Vec<NifAddr> = known
            .iter()
            .filter(|nif| !fresh.contains(nif))
            .copied()
            .collect();
        *known = fresh;
        (found, lost)
    };

    if !found.is_empty() || !lost.is_empty() {
        debug!("nif poll: {} found, {} lost", found.len(), lost.len());
    }

    let found_observers = state.found_observers.lock().unwrap().clone();
    for nif in &found {
        for observer in &found_observers {
            observer(*nif);
        }
    }
    let lost_observers = state.lost_observers.lock().unwrap().clone();
    for nif in &lost {
        for observer in &lost_observers {
            observer(*nif);
        }
    }
}

/// Enumerates system interfaces with an assigned IPv4 broadcast address.
pub fn system_nifs() -> Vec<NifAddr> {
    match nix::ifaddrs::getifaddrs() {
        Ok(interfaces) => interfaces
            .filter_map(|ifaddr| {
                let addr = ifaddr.address.as_ref()?.as_sockaddr_in()?.ip();
                let broadcast = ifaddr.broadcast.as_ref()?.as_sockaddr_in()?.ip();
                Some(NifAddr::new(addr, broadcast))
            })
            .collect(),
        Err(e) => {
            // Not fatal; the next poll retries.
            warn!("interface enumeration failed: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn nif(addr: &str, broadcast: &str) -> NifAddr {
        NifAddr::new(addr.parse().unwrap(), broadcast.parse().unwrap())
    }

    fn source_of(snapshots: Arc<StdMutex<Vec<NifAddr>>>) -> NifSource {
        Arc::new(move || snapshots.lock().unwrap().clone())
    }

    #[test]
    fn diff_fires_found_then_lost() {
        let snapshot = Arc::new(StdMutex::new(vec![nif("10.0.0.5", "10.0.0.255")]));
        let discovery =
            NifDiscovery::with_source(source_of(Arc::clone(&snapshot)), Vec::new(), Duration::from_secs(60));

        let found = Arc::new(StdMutex::new(Vec::new()));
        let lost = Arc::new(StdMutex::new(Vec::new()));
        {
            let found = Arc::clone(&found);
            discovery.add_network_found_observer(move |n| found.lock().unwrap().push(n));
        }
        {
            let lost = Arc::clone(&lost);
            discovery.add_network_lost_observer(move |n| lost.lock().unwrap().push(n));
        }

        discovery.poll_now();
        assert_eq!(found.lock().unwrap().len(), 1);
        assert!(lost.lock().unwrap().is_empty());

        // Interface disappears on the next snapshot.
        snapshot.lock().unwrap().clear();
        discovery.poll_now();
        assert_eq!(found.lock().unwrap().len(), 1);
        assert_eq!(lost.lock().unwrap().len(), 1);
        assert!(discovery.current_addresses().is_empty());
    }

    #[test]
    fn late_subscriber_gets_replay() {
        let snapshot = Arc::new(StdMutex::new(vec![
            nif("10.0.0.5", "10.0.0.255"),
            nif("192.168.1.3", "192.168.1.255"),
        ]));
        let discovery =
            NifDiscovery::with_source(source_of(snapshot), Vec::new(), Duration::from_secs(60));
        discovery.poll_now();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        discovery.add_network_found_observer(move |n| seen_clone.lock().unwrap().push(n));

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn allowlist_filters_by_address_and_broadcast() {
        let snapshot = Arc::new(StdMutex::new(vec![
            nif("10.0.0.5", "10.0.0.255"),
            nif("192.168.1.3", "192.168.1.255"),
            nif("172.16.4.9", "172.16.255.255"),
        ]));

        // One entry names an address, the other a broadcast network.
        let allowlist = vec![
            "10.0.0.5".parse().unwrap(),
            "192.168.1.255".parse().unwrap(),
        ];
        let discovery =
            NifDiscovery::with_source(source_of(snapshot), allowlist, Duration::from_secs(60));
        discovery.poll_now();

        let current = discovery.current_addresses();
        assert_eq!(current.len(), 2);
        assert!(current.contains(&nif("10.0.0.5", "10.0.0.255")));
        assert!(current.contains(&nif("192.168.1.3", "192.168.1.255")));
    }

    #[test]
    fn repeated_poll_is_quiet() {
        let snapshot = Arc::new(StdMutex::new(vec![nif("10.0.0.5", "10.0.0.255")]));
        let discovery =
            NifDiscovery::with_source(source_of(snapshot), Vec::new(), Duration::from_secs(60));

        let found = Arc::new(StdMutex::new(0usize));
        let found_clone = Arc::clone(&found);
        discovery.add_network_found_observer(move |_| *found_clone.lock().unwrap() += 1);

        discovery.poll_now();
        discovery.poll_now();
        discovery.poll_now();
        assert_eq!(*found.lock().unwrap(), 1);
    }
}
