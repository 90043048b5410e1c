//! Per-client broker registry.
//!
//! The master keeps one broker (and therefore one peer, one dispatch task
//! and optionally one ping timer) per admitted client. Brokers are created
//! on registration, refreshed on re-registration and torn down on explicit
//! unregistration or on an async delivery failure.

use gamemesh_shared::broker::Broker;
use gamemesh_shared::command::{CallBatch, CallOutcome};
use gamemesh_shared::config::NetConfig;
use gamemesh_shared::liveness::Ping;
use gamemesh_shared::peer::{NoRegistration, Peer};
use log::{info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};

pub type ClientObserver = Arc<dyn Fn(u64) + Send + Sync>;

struct ClientEntry {
    broker: Arc<Broker>,
    ping: Option<Ping>,
}

pub struct ClientRegistry {
    local_id: u64,
    config: NetConfig,
    clients: Mutex<HashMap<u64, ClientEntry>>,
    new_client_observers: Mutex<Vec<ClientObserver>>,
    lost_client_observers: Mutex<Vec<ClientObserver>>,
}

impl ClientRegistry {
    pub fn new(local_id: u64, config: NetConfig) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            config,
            clients: Mutex::new(HashMap::new()),
            new_client_observers: Mutex::new(Vec::new()),
            lost_client_observers: Mutex::new(Vec::new()),
        })
    }

    /// Fired after a client's broker exists and is ready for sends.
    pub fn add_new_client_observer(&self, observer: impl Fn(u64) + Send + Sync + 'static) {
        self.new_client_observers.lock().unwrap().push(Arc::new(observer));
    }

    /// Fired after a client is evicted for delivery failure. Not fired on
    /// explicit unregistration.
    pub fn add_lost_client_observer(&self, observer: impl Fn(u64) + Send + Sync + 'static) {
        self.lost_client_observers.lock().unwrap().push(Arc::new(observer));
    }

    pub fn client_ids(&self) -> Vec<u64> {
        self.clients.lock().unwrap().keys().copied().collect()
    }

    pub fn contains(&self, client_id: u64) -> bool {
        self.clients.lock().unwrap().contains_key(&client_id)
    }

    /// Admits (or refreshes) a client. Re-registration with new addresses
    /// keeps the existing broker and only updates its peer; the client may
    /// simply have gained or lost an interface.
    ///
    /// Must run inside a tokio runtime.
    pub fn admit(
        self: &Arc<Self>,
        client_id: u64,
        rpc_port: u16,
        addresses: HashMap<Ipv4Addr, Ipv4Addr>,
    ) {
        let existing = {
            let clients = self.clients.lock().unwrap();
            clients.get(&client_id).map(|entry| Arc::clone(&entry.broker))
        };
        if let Some(broker) = existing {
            let peer = Arc::clone(broker.peer());
            tokio::spawn(async move { peer.update_addresses(addresses).await });
            return;
        }

        let peer = Arc::new(Peer::new(
            client_id,
            rpc_port,
            Arc::new(NoRegistration),
            &self.config,
        ));
        {
            let peer = Arc::clone(&peer);
            tokio::spawn(async move { peer.update_addresses(addresses).await });
        }

        let broker = Broker::new(self.local_id, peer, &self.config);
        let registry = Arc::downgrade(self);
        broker.observe_async_error(move |reason| {
            if let Some(registry) = Weak::upgrade(&registry) {
                registry.evict(client_id, reason);
            }
        });

        let ping = if self.config.keep_alive_ping {
            let target = Arc::downgrade(&broker);
            Some(Ping::start(
                self.config.ping_period,
                Arc::new(move || {
                    if let Some(broker) = Weak::upgrade(&target) {
                        broker.enqueue_ping();
                    }
                }),
            ))
        } else {
            None
        };

        self.clients
            .lock()
            .unwrap()
            .insert(client_id, ClientEntry { broker, ping });
        info!("client {} admitted on port {}", client_id, rpc_port);

        let observers = self.new_client_observers.lock().unwrap().clone();
        for observer in observers {
            observer(client_id);
        }
    }

    /// Explicit goodbye; quiet teardown.
    pub fn remove(&self, client_id: u64) {
        if let Some(entry) = self.clients.lock().unwrap().remove(&client_id) {
            if let Some(ping) = &entry.ping {
                ping.stop();
            }
            entry.broker.close();
            info!("client {} unregistered", client_id);
        }
    }

    /// Failure teardown; notifies lost-client observers.
    fn evict(&self, client_id: u64, reason: &str) {
        let entry = self.clients.lock().unwrap().remove(&client_id);
        let Some(entry) = entry else { return };
        if let Some(ping) = &entry.ping {
            ping.stop();
        }
        entry.broker.close();
        warn!("client {} evicted: {}", client_id, reason);

        let observers = self.lost_client_observers.lock().unwrap().clone();
        for observer in observers {
            observer(client_id);
        }
    }

    /// Sends a batch toward one client with the semantics its flags request.
    pub async fn send_to_client(&self, client_id: u64, batch: CallBatch) -> CallOutcome {
        let broker = {
            let clients = self.clients.lock().unwrap();
            clients.get(&client_id).map(|entry| Arc::clone(&entry.broker))
        };
        match broker {
            Some(broker) => broker.send_remote_call(batch).await,
            None => CallOutcome::disconnected(),
        }
    }

    /// Closes every broker. Used on shutdown.
    pub fn clear(&self) {
        let mut clients = self.clients.lock().unwrap();
        for (_, entry) in clients.drain() {
            if let Some(ping) = &entry.ping {
                ping.stop();
            }
            entry.broker.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamemesh_shared::command::{CallItem, Command};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn quick_config() -> NetConfig {
        NetConfig {
            keep_alive_ping: false,
            connect_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_millis(100),
            ..NetConfig::default()
        }
    }

    #[tokio::test]
    async fn admit_fires_new_client_observer() {
        let registry = ClientRegistry::new(1, quick_config());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        registry.add_new_client_observer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.admit(42, 47_810, HashMap::new());
        assert!(registry.contains(42));
        assert_eq!(registry.client_ids(), vec![42]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // Re-registration refreshes, it does not re-announce.
        registry.admit(42, 47_810, HashMap::new());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        registry.clear();
    }

    #[tokio::test]
    async fn send_to_unknown_client_reports_disconnected() {
        let registry = ClientRegistry::new(1, quick_config());
        let outcome = registry
            .send_to_client(99, CallBatch::single(CallItem::new(Command::Noop)))
            .await;
        assert!(!outcome.connected);
    }

    #[tokio::test]
    async fn unreachable_client_is_evicted_and_reported() {
        let registry = ClientRegistry::new(1, quick_config());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        registry.add_lost_client_observer(move |id| {
            let _ = tx.send(id);
        });

        let mut addrs = HashMap::new();
        // TEST-NET-1: guaranteed unreachable.
        addrs.insert("192.0.2.9".parse().unwrap(), Ipv4Addr::UNSPECIFIED);
        registry.admit(7, 47_810, addrs);

        registry
            .send_to_client(7, CallBatch::single(CallItem::new(Command::Noop)))
            .await;

        let lost = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("eviction should be reported")
            .expect("channel open");
        assert_eq!(lost, 7);
        assert!(!registry.contains(7));
    }
}
