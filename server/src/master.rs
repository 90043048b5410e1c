//! Master role: announce presence, accept client registrations, broker
//! outbound command batches to each client.

use crate::registry::ClientRegistry;
use gamemesh_shared::command::{CallBatch, CallOutcome};
use gamemesh_shared::config::NetConfig;
use gamemesh_shared::discovery::Announcer;
use gamemesh_shared::nif::{NifDiscovery, NifSource};
use gamemesh_shared::node::{ExecutionNode, InboundHandler};
use gamemesh_shared::rpc::{RpcRequest, RpcResponse};
use gamemesh_shared::service::ServerService;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Routes inbound client requests into the registry and the injected
/// application service.
struct MasterHandler {
    registry: Arc<ClientRegistry>,
    service: Arc<dyn ServerService>,
}

impl InboundHandler for MasterHandler {
    fn handle(&self, from: Ipv4Addr, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::Register {
                node_id,
                rpc_port,
                addresses,
            } => {
                // The datagram the client discovered us through may have
                // traversed NAT-free segments only; the TCP source address
                // is always a valid way back and is added as a candidate.
                let mut map: HashMap<Ipv4Addr, Ipv4Addr> = addresses
                    .into_iter()
                    .map(|addr| (addr, Ipv4Addr::UNSPECIFIED))
                    .collect();
                map.entry(from).or_insert(Ipv4Addr::UNSPECIFIED);

                if self.service.register_client(node_id, map.clone()) {
                    self.registry.admit(node_id, rpc_port, map);
                    RpcResponse::Accepted(true)
                } else {
                    info!("registration of client {} refused by service", node_id);
                    RpcResponse::Accepted(false)
                }
            }
            RpcRequest::Unregister { node_id } => {
                self.registry.remove(node_id);
                self.service.unregister_client(node_id);
                RpcResponse::Accepted(true)
            }
            RpcRequest::Commands { node_id, batch } => {
                if !self.registry.contains(node_id) {
                    warn!("commands from unregistered client {}", node_id);
                    return RpcResponse::Error("not registered".into());
                }
                let results = self.service.commands_from_client(node_id, &batch);
                if batch.is_sync() {
                    RpcResponse::Results(results)
                } else {
                    RpcResponse::Results(None)
                }
            }
            RpcRequest::Ping { node_id } => {
                debug!("ping from client {}", node_id);
                RpcResponse::Pong
            }
        }
    }
}

/// The server-side facade: owns interface discovery, the announcer, the RPC
/// listener node and the client registry.
pub struct Master {
    node_id: u64,
    config: NetConfig,
    nifs: NifDiscovery,
    announcer: Arc<Announcer>,
    node: Arc<ExecutionNode>,
    registry: Arc<ClientRegistry>,
}

impl Master {
    /// Builds a master over the real system interfaces. Must run inside a
    /// tokio runtime.
    pub fn new(node_id: u64, service: Arc<dyn ServerService>, config: NetConfig) -> Self {
        let nifs = NifDiscovery::new(config.server_nif_allowlist.clone(), config.nif_poll_interval);
        Self::assemble(node_id, service, config, nifs)
    }

    /// Builds a master over an injected interface source (tests).
    pub fn with_nif_source(
        node_id: u64,
        service: Arc<dyn ServerService>,
        config: NetConfig,
        source: NifSource,
    ) -> Self {
        let nifs = NifDiscovery::with_source(
            source,
            config.server_nif_allowlist.clone(),
            config.nif_poll_interval,
        );
        Self::assemble(node_id, service, config, nifs)
    }

    fn assemble(
        node_id: u64,
        service: Arc<dyn ServerService>,
        config: NetConfig,
        nifs: NifDiscovery,
    ) -> Self {
        let registry = ClientRegistry::new(node_id, config.clone());
        let handler = Arc::new(MasterHandler {
            registry: Arc::clone(&registry),
            service,
        });
        let node = Arc::new(ExecutionNode::new(handler, config.server_rpc_port));
        let announcer = Arc::new(Announcer::new(node_id, &config));
        Self {
            node_id,
            config,
            nifs,
            announcer,
            node,
            registry,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Wires interface events into the announcer and the RPC listeners,
    /// then starts announcing. Must run inside a tokio runtime.
    pub fn start(&self) {
        {
            let announcer = Arc::clone(&self.announcer);
            self.nifs.add_network_found_observer(move |nif| {
                announcer.add_nifaddr(nif.addr, nif.broadcast);
            });
        }
        {
            let announcer = Arc::clone(&self.announcer);
            self.nifs.add_network_lost_observer(move |nif| {
                announcer.remove_nifaddr(nif.addr);
            });
        }

        if self.config.server_nif_allowlist.is_empty() {
            // No filter: one wildcard listener covers present and future
            // interfaces.
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

        self.announcer.start();
        self.nifs.start();
        self.nifs.poll_now();
        info!("master {} started", self.node_id);
    }

    /// Sends a batch toward one registered client.
    pub async fn send_to_client(&self, client_id: u64, batch: CallBatch) -> CallOutcome {
        self.registry.send_to_client(client_id, batch).await
    }

    pub fn stop(&self) {
        self.nifs.stop();
        self.announcer.stop();
        self.node.stop();
        self.registry.clear();
        info!("master {} stopped", self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamemesh_shared::command::{CallItem, Command, CommandResults};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingService {
        accept: bool,
        registered: Mutex<Vec<u64>>,
        unregistered: Mutex<Vec<u64>>,
    }

    impl RecordingService {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept,
                registered: Mutex::new(Vec::new()),
                unregistered: Mutex::new(Vec::new()),
            })
        }
    }

    impl ServerService for RecordingService {
        fn register_client(&self, client_id: u64, _addresses: HashMap<Ipv4Addr, Ipv4Addr>) -> bool {
            self.registered.lock().unwrap().push(client_id);
            self.accept
        }

        fn unregister_client(&self, client_id: u64) {
            self.unregistered.lock().unwrap().push(client_id);
        }

        fn commands_from_client(&self, _client_id: u64, batch: &CallBatch) -> Option<CommandResults> {
            Some(batch.items.iter().map(|_| Some(json!("ok"))).collect())
        }
    }

    fn quick_config() -> NetConfig {
        NetConfig {
            keep_alive_ping: false,
            connect_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_millis(100),
            ..NetConfig::default()
        }
    }

    fn handler(service: Arc<RecordingService>) -> (MasterHandler, Arc<ClientRegistry>) {
        let registry = ClientRegistry::new(1, quick_config());
        (
            MasterHandler {
                registry: Arc::clone(&registry),
                service,
            },
            registry,
        )
    }

    fn register_request(node_id: u64) -> RpcRequest {
        RpcRequest::Register {
            node_id,
            rpc_port: 47_810,
            addresses: vec!["10.0.0.5".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn accepted_registration_admits_client() {
        let service = RecordingService::new(true);
        let (handler, registry) = handler(Arc::clone(&service));

        let response = handler.handle("10.0.0.5".parse().unwrap(), register_request(42));
        assert!(matches!(response, RpcResponse::Accepted(true)));
        assert!(registry.contains(42));
        registry.clear();
    }

    #[tokio::test]
    async fn refused_registration_admits_nothing() {
        let service = RecordingService::new(false);
        let (handler, registry) = handler(service);

        let response = handler.handle("10.0.0.5".parse().unwrap(), register_request(42));
        assert!(matches!(response, RpcResponse::Accepted(false)));
        assert!(!registry.contains(42));
    }

    #[tokio::test]
    async fn commands_from_unregistered_client_are_refused() {
        let service = RecordingService::new(true);
        let (handler, _registry) = handler(service);

        let response = handler.handle(
            "10.0.0.5".parse().unwrap(),
            RpcRequest::Commands {
                node_id: 99,
                batch: CallBatch::single(CallItem::sync(Command::ReadStatus)),
            },
        );
        assert!(matches!(response, RpcResponse::Error(_)));
    }

    #[tokio::test]
    async fn sync_batch_returns_results_async_batch_does_not() {
        let service = RecordingService::new(true);
        let (handler, registry) = handler(service);
        handler.handle("10.0.0.5".parse().unwrap(), register_request(42));

        let sync = handler.handle(
            "10.0.0.5".parse().unwrap(),
            RpcRequest::Commands {
                node_id: 42,
                batch: CallBatch::single(CallItem::sync(Command::ReadStatus)),
            },
        );
        assert!(matches!(sync, RpcResponse::Results(Some(_))));

        let fire_and_forget = handler.handle(
            "10.0.0.5".parse().unwrap(),
            RpcRequest::Commands {
                node_id: 42,
                batch: CallBatch::single(CallItem::new(Command::Noop)),
            },
        );
        assert!(matches!(fire_and_forget, RpcResponse::Results(None)));
        registry.clear();
    }

    #[tokio::test]
    async fn unregister_notifies_service_and_registry() {
        let service = RecordingService::new(true);
        let (handler, registry) = handler(Arc::clone(&service));
        handler.handle("10.0.0.5".parse().unwrap(), register_request(42));

        handler.handle(
            "10.0.0.5".parse().unwrap(),
            RpcRequest::Unregister { node_id: 42 },
        );
        assert!(!registry.contains(42));
        assert_eq!(*service.unregistered.lock().unwrap(), vec![42]);
    }
}
