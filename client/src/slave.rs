//! Slave role: discover the master, register with it, execute inbound
//! command batches and broker outbound ones.
//!
//! Exactly one server link is active at a time. When an announcement shows
//! the server restarted under a new id, the old id is blacklisted and its
//! broker discarded before a fresh link is built, so a late announcement
//! from the dead instance can never race the reconnect.

use gamemesh_shared::broker::Broker;
use gamemesh_shared::command::{CallBatch, CallOutcome};
use gamemesh_shared::config::NetConfig;
use gamemesh_shared::discovery::Listener;
use gamemesh_shared::liveness::Watchdog;
use gamemesh_shared::nif::{NifDiscovery, NifSource};
use gamemesh_shared::node::{ExecutionNode, InboundHandler};
use gamemesh_shared::peer::{Peer, PeerRole};
use gamemesh_shared::rpc::{RpcRequest, RpcResponse};
use gamemesh_shared::service::ClientService;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// Role handshake: a slave introduces itself before any payload call on a
/// fresh connection.
struct RegisterWithServer {
    node_id: u64,
    rpc_port: u16,
    local_addrs: Arc<Mutex<Vec<Ipv4Addr>>>,
}

impl PeerRole for RegisterWithServer {
    fn register_request(&self) -> Option<RpcRequest> {
        Some(RpcRequest::Register {
            node_id: self.node_id,
            rpc_port: self.rpc_port,
            addresses: self.local_addrs.lock().unwrap().clone(),
        })
    }
}

struct ServerLink {
    server_id: u64,
    broker: Arc<Broker>,
}

struct LinkState {
    link: Option<ServerLink>,
    /// Ids of dead server instances; their announcements are ignored.
    blacklist: HashSet<u64>,
}

struct SlaveShared {
    node_id: u64,
    rpc_port: u16,
    config: NetConfig,
    local_addrs: Arc<Mutex<Vec<Ipv4Addr>>>,
    listener: Listener,
    links: Mutex<LinkState>,
    watchdog: Mutex<Option<Watchdog>>,
}

impl SlaveShared {
    fn current_server_id(&self) -> Option<u64> {
        self.links
            .lock()
            .unwrap()
            .link
            .as_ref()
            .map(|link| link.server_id)
    }

    fn current_broker(&self) -> Option<Arc<Broker>> {
        self.links
            .lock()
            .unwrap()
            .link
            .as_ref()
            .map(|link| Arc::clone(&link.broker))
    }

    fn feed_watchdog(&self) {
        if let Some(watchdog) = &*self.watchdog.lock().unwrap() {
            watchdog.feed();
        }
    }

    /// The advertised address list changed; the next call on the link must
    /// repeat the registration handshake so the server learns the new set.
    fn reannounce_local_addrs(&self) {
        if let Some(broker) = self.current_broker() {
            let peer = Arc::clone(broker.peer());
            tokio::spawn(async move { peer.require_registration().await });
        }
    }

    /// Connection-level recovery: drop the link's connection and forget the
    /// cached server addresses so the next announcement rebuilds them.
    fn recover(&self, reason: &str) {
        warn!("server link trouble: {}", reason);
        if let Some(broker) = self.current_broker() {
            tokio::spawn(async move { broker.close_connection().await });
        }
        self.listener.clear_server_address_cache();
    }
}

/// Applies one server-set-changed event from the discovery listener.
fn on_server_update(shared: &Arc<SlaveShared>, server_id: u64, map: HashMap<Ipv4Addr, Ipv4Addr>) {
    let mut links = shared.links.lock().unwrap();
    if links.blacklist.contains(&server_id) {
        debug!("ignoring announcement from blacklisted server {}", server_id);
        return;
    }

    if let Some(link) = links.link.take() {
        if link.server_id == server_id {
            if map.is_empty() {
                info!("server {} aged out, dropping link", server_id);
                link.broker.close();
            } else {
                let peer = Arc::clone(link.broker.peer());
                tokio::spawn(async move { peer.update_addresses(map).await });
                links.link = Some(link);
            }
            return;
        }
        // Identity change: the server restarted with a fresh id. Blacklist
        // the old one so its lingering announcements cannot win the race.
        info!(
            "server identity changed {} -> {}, discarding old link",
            link.server_id, server_id
        );
        links.blacklist.insert(link.server_id);
        link.broker.close();
    }

    if map.is_empty() {
        return;
    }

    let role = Arc::new(RegisterWithServer {
        node_id: shared.node_id,
        rpc_port: shared.rpc_port,
        local_addrs: Arc::clone(&shared.local_addrs),
    });
    let peer = Arc::new(Peer::new(
        server_id,
        shared.config.server_rpc_port,
        role,
        &shared.config,
    ));
    {
        let peer = Arc::clone(&peer);
        tokio::spawn(async move { peer.update_addresses(map).await });
    }

    let broker = Broker::new(shared.node_id, peer, &shared.config);
    {
        let shared = Arc::clone(shared);
        broker.observe_async_error(move |reason| shared.recover(reason));
    }
    {
        let shared = Arc::clone(shared);
        broker.observe_traffic(move || shared.feed_watchdog());
    }

    info!("linked to server {}", server_id);
    links.link = Some(ServerLink {
        server_id,
        broker,
    });
}

/// Routes inbound server requests into the injected application service.
struct SlaveHandler {
    shared: Arc<SlaveShared>,
    service: Arc<dyn ClientService>,
}

impl InboundHandler for SlaveHandler {
    fn handle(&self, _from: Ipv4Addr, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Commands { node_id, batch } => {
                if self.shared.current_server_id() != Some(node_id) {
                    warn!("commands from unknown server {}", node_id);
                    return RpcResponse::Error("unknown server".into());
                }
                self.shared.feed_watchdog();
                let results = self.service.commands_from_server(&batch);
                if batch.is_sync() {
                    RpcResponse::Results(results)
                } else {
                    RpcResponse::Results(None)
                }
            }
            RpcRequest::Ping { node_id } => {
                if self.shared.current_server_id() == Some(node_id) {
                    self.shared.feed_watchdog();
                }
                RpcResponse::Pong
            }
            RpcRequest::Register { .. } | RpcRequest::Unregister { .. } => {
                RpcResponse::Error("slaves accept no registrations".into())
            }
        }
    }
}

/// The client-side facade: owns interface discovery, the announcement
/// listener, the RPC listener node and the (at most one) server link.
pub struct Slave {
    shared: Arc<SlaveShared>,
    nifs: NifDiscovery,
    node: Arc<ExecutionNode>,
}

impl Slave {
    /// Builds a slave over the real system interfaces. `instance` offsets
    /// the RPC port so several slaves can share a machine. Must run inside
    /// a tokio runtime.
    pub fn new(
        node_id: u64,
        instance: u16,
        service: Arc<dyn ClientService>,
        config: NetConfig,
    ) -> Self {
        let nifs = NifDiscovery::new(config.client_nif_allowlist.clone(), config.nif_poll_interval);
        Self::assemble(node_id, instance, service, config, nifs)
    }

    /// Builds a slave over an injected interface source (tests).
    pub fn with_nif_source(
        node_id: u64,
        instance: u16,
        service: Arc<dyn ClientService>,
        config: NetConfig,
        source: NifSource,
    ) -> Self {
        let nifs = NifDiscovery::with_source(
            source,
            config.client_nif_allowlist.clone(),
            config.nif_poll_interval,
        );
        Self::assemble(node_id, instance, service, config, nifs)
    }

    fn assemble(
        node_id: u64,
        instance: u16,
        service: Arc<dyn ClientService>,
        config: NetConfig,
        nifs: NifDiscovery,
    ) -> Self {
        let rpc_port = config.first_client_rpc_port + instance;
        let shared = Arc::new(SlaveShared {
            node_id,
            rpc_port,
            listener: Listener::new(&config),
            config,
            local_addrs: Arc::new(Mutex::new(Vec::new())),
            links: Mutex::new(LinkState {
                link: None,
                blacklist: HashSet::new(),
            }),
            watchdog: Mutex::new(None),
        });
        let handler = Arc::new(SlaveHandler {
            shared: Arc::clone(&shared),
            service,
        });
        let node = Arc::new(ExecutionNode::new(handler, rpc_port));
        Self { shared, nifs, node }
    }

    pub fn node_id(&self) -> u64 {
        self.shared.node_id
    }

    pub fn rpc_port(&self) -> u16 {
        self.shared.rpc_port
    }

    /// Id of the currently linked server, if any.
    pub fn server_id(&self) -> Option<u64> {
        self.shared.current_server_id()
    }

    /// Wires interface events into the announcement listener, the RPC
    /// listeners and the advertised local address list, arms the watchdog
    /// and starts discovering. Must run inside a tokio runtime.
    pub fn start(&self) {
        {
            let shared = Arc::clone(&self.shared);
            self.shared.listener.add_server_observer(move |server_id, map| {
                on_server_update(&shared, server_id, map);
            });
        }

        {
            let shared = Arc::clone(&self.shared);
            self.nifs.add_network_found_observer(move |nif| {
                shared.listener.add_nifaddr(nif);
                let changed = {
                    let mut addrs = shared.local_addrs.lock().unwrap();
                    if addrs.contains(&nif.addr) {
                        false
                    } else {
                        addrs.push(nif.addr);
                        true
                    }
                };
                if changed {
                    shared.reannounce_local_addrs();
                }
            });
        }
        {
            let shared = Arc::clone(&self.shared);
            self.nifs.add_network_lost_observer(move |nif| {
                shared.listener.remove_nifaddr(nif.addr);
                let changed = {
                    let mut addrs = shared.local_addrs.lock().unwrap();
                    let before = addrs.len();
                    addrs.retain(|a| *a != nif.addr);
                    addrs.len() != before
                };
                if changed {
                    shared.reannounce_local_addrs();
                }
            });
        }

        if self.shared.config.client_nif_allowlist.is_empty() {
            self.node.add_wildcard_listener();
        } else {
            let node = Arc::clone(&self.node);
            self.nifs.add_network_found_observer(move |nif| {
                node.add_listener(nif.addr);
            });
            let node = Arc::clone(&self.node);
            self.nifs.add_network_lost_observer(move |nif| {
                node.remove_listener(nif.addr);
            });
        }

        if self.shared.config.keep_alive_ping {
            let shared = Arc::clone(&self.shared);
            let watchdog = Watchdog::start(
                self.shared.config.watchdog_deadline(),
                Arc::new(move || shared.recover("keep-alive silence")),
            );
            *self.shared.watchdog.lock().unwrap() = Some(watchdog);
        }

        self.shared.listener.start();
        self.nifs.start();
        self.nifs.poll_now();
        info!("slave {} started on rpc port {}", self.shared.node_id, self.shared.rpc_port);
    }

    /// Sends a batch toward the linked server with the semantics its flags
    /// request.
    pub async fn send_to_server(&self, batch: CallBatch) -> CallOutcome {
        match self.shared.current_broker() {
            Some(broker) => broker.send_remote_call(batch).await,
            None => CallOutcome::disconnected(),
        }
    }

    /// Best-effort goodbye followed by full teardown.
    pub async fn stop(&self) {
        let link = {
            let mut links = self.shared.links.lock().unwrap();
            links.link.take()
        };
        if let Some(link) = link {
            let goodbye = RpcRequest::Unregister {
                node_id: self.shared.node_id,
            };
            let _ = link.broker.peer().call(&goodbye).await;
            link.broker.close();
        }

        if let Some(watchdog) = self.shared.watchdog.lock().unwrap().take() {
            watchdog.stop();
        }
        self.nifs.stop();
        self.shared.listener.stop();
        self.node.stop();
        info!("slave {} stopped", self.shared.node_id);
    }
}
