//! Inbound RPC endpoint.
//!
//! An execution node accepts TCP connections on one or more local
//! interfaces and feeds every decoded request through a single dispatch
//! task, so handlers observe requests in arrival order even when several
//! remotes are connected at once. A panicking handler is contained at the
//! dispatch boundary: the remote gets an empty result set and the node
//! keeps serving.

use crate::rpc::{read_request, write_response, RpcRequest, RpcResponse};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Application seam: turns one inbound request into its response.
///
/// Implementations run on the node's dispatch task and must not block; the
/// node serializes all inbound work through them.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, from: Ipv4Addr, request: RpcRequest) -> RpcResponse;
}

type Envelope = (Ipv4Addr, RpcRequest, oneshot::Sender<RpcResponse>);

struct NodeState {
    port: u16,
    inbound: mpsc::UnboundedSender<Envelope>,
    listeners: Mutex<HashMap<Ipv4Addr, JoinHandle<()>>>,
}

pub struct ExecutionNode {
    state: Arc<NodeState>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionNode {
    /// Creates the node and starts its dispatch task. Listeners are added
    /// separately, one per accepted interface (or one wildcard listener).
    /// Must run inside a tokio runtime.
    pub fn new(handler: Arc<dyn InboundHandler>, port: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(NodeState {
            port,
            inbound: tx,
            listeners: Mutex::new(HashMap::new()),
        });
        let dispatcher = tokio::spawn(dispatch_loop(rx, handler));
        Self {
            state,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn port(&self) -> u16 {
        self.state.port
    }

    /// Starts accepting on one local interface address.
    pub fn add_listener(&self, addr: Ipv4Addr) {
        let mut listeners = self.state.listeners.lock().unwrap();
        if listeners.contains_key(&addr) {
            return;
        }
        let state = Arc::clone(&self.state);
        listeners.insert(addr, tokio::spawn(accept_loop(state, addr)));
    }

    /// Starts one listener covering every interface.
    pub fn add_wildcard_listener(&self) {
        self.add_listener(Ipv4Addr::UNSPECIFIED);
    }

    pub fn remove_listener(&self, addr: Ipv4Addr) {
        if let Some(handle) = self.state.listeners.lock().unwrap().remove(&addr) {
            handle.abort();
        }
    }

    pub fn stop(&self) {
        let mut listeners = self.state.listeners.lock().unwrap();
        for (_, handle) in listeners.drain() {
            handle.abort();
        }
        drop(listeners);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for ExecutionNode {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Envelope>, handler: Arc<dyn InboundHandler>) {
    while let Some((from, request, reply)) = rx.recv().await {
        let response =
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(from, request))) {
                Ok(response) => response,
                Err(_) => {
                    warn!("inbound handler panicked; answering with empty results");
                    RpcResponse::Results(None)
                }
            };
        // The connection may be gone by now; nothing to do about it.
        let _ = reply.send(response);
    }
}

async fn accept_loop(state: Arc<NodeState>, addr: Ipv4Addr) {
    let bind = SocketAddr::from((addr, state.port));
    let listener = match TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("rpc bind on {} failed: {}", bind, e);
            state.listeners.lock().unwrap().remove(&addr);
            return;
        }
    };
    info!("accepting rpc connections on {}", bind);

    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!("rpc connection from {}", remote);
                let inbound = state.inbound.clone();
                tokio::spawn(serve_connection(stream, remote, inbound));
            }
            Err(e) => {
                warn!("rpc accept on {} failed: {}", bind, e);
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    let from = match remote.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => {
            warn!("rejecting non-IPv4 rpc connection from {}", remote);
            return;
        }
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request = match read_request(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("rpc connection from {} closed", remote);
                return;
            }
            Err(e) => {
                debug!("rpc read from {} failed: {}", remote, e);
                let refusal = RpcResponse::Error(format!("unreadable request: {}", e));
                let _ = write_response(&mut write_half, &refusal).await;
                return;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if inbound.send((from, request, reply_tx)).is_err() {
            // Node stopped; drop the connection.
            return;
        }
        let response = match reply_rx.await {
            Ok(response) => response,
            Err(_) => return,
        };
        if let Err(e) = write_response(&mut write_half, &response).await {
            debug!("rpc write to {} failed: {}", remote, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoHandler {
        seen: AtomicUsize,
    }

    impl InboundHandler for EchoHandler {
        fn handle(&self, _from: Ipv4Addr, request: RpcRequest) -> RpcResponse {
            self.seen.fetch_add(1, Ordering::SeqCst);
            match request {
                RpcRequest::Ping { .. } => RpcResponse::Pong,
                RpcRequest::Register { .. } => RpcResponse::Accepted(true),
                _ => RpcResponse::Results(None),
            }
        }
    }

    struct PanicHandler;

    impl InboundHandler for PanicHandler {
        fn handle(&self, _from: Ipv4Addr, _request: RpcRequest) -> RpcResponse {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn serves_requests_over_loopback() {
        let handler = Arc::new(EchoHandler {
            seen: AtomicUsize::new(0),
        });
        let node = ExecutionNode::new(handler.clone(), 48231);
        node.add_listener(Ipv4Addr::LOCALHOST);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut conn =
            RpcConnection::connect(Ipv4Addr::LOCALHOST, 48231, Duration::from_secs(1))
                .await
                .expect("connect");
        let response = conn
            .call(&RpcRequest::Ping { node_id: 7 }, Duration::from_secs(1))
            .await
            .expect("call");
        assert!(matches!(response, RpcResponse::Pong));
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
        node.stop();
    }

    #[tokio::test]
    async fn panicking_handler_yields_empty_results_and_node_survives() {
        let node = ExecutionNode::new(Arc::new(PanicHandler), 48232);
        node.add_listener(Ipv4Addr::LOCALHOST);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut conn =
            RpcConnection::connect(Ipv4Addr::LOCALHOST, 48232, Duration::from_secs(1))
                .await
                .expect("connect");
        for _ in 0..2 {
            let response = conn
                .call(&RpcRequest::Ping { node_id: 7 }, Duration::from_secs(1))
                .await
                .expect("call");
            assert!(matches!(response, RpcResponse::Results(None)));
        }
        node.stop();
    }
}
