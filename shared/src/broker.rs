//! Outbound call brokering for one peer.
//!
//! A broker owns exactly one [`Peer`] and one dispatch task. Non-blocking
//! batches go through an ordered queue and execute strictly FIFO on the
//! dispatch task, which preserves per-peer send ordering without making the
//! caller wait. A blocking batch instead waits (bounded) for the queue to
//! drain and then executes inline on the calling task, still mutually
//! exclusive with queued work through the same gate, so it is guaranteed
//! transmitted by the time the call returns.
//!
//! On any transport failure the peer connection is torn down and an
//! async-error notification is enqueued as a fresh work item; it is never
//! invoked synchronously from inside a call that already holds the broker's
//! lock.

use crate::command::{CallBatch, CallOutcome};
use crate::config::NetConfig;
use crate::peer::Peer;
use crate::rpc::{RpcRequest, RpcResponse};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

enum WorkItem {
    Batch(CallBatch),
    Ping,
    AsyncError(String),
    /// Poison item: the dispatch task stops when it sees this.
    Shutdown,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

pub type AsyncErrorObserver = Arc<dyn Fn(&str) + Send + Sync>;
pub type TrafficObserver = Arc<dyn Fn() + Send + Sync>;

pub struct Broker {
    local_id: u64,
    peer: Arc<Peer>,
    state: AtomicU8,
    queue: StdMutex<VecDeque<WorkItem>>,
    queued: Notify,
    /// Serializes dispatch-task work against inline blocking calls.
    gate: Mutex<()>,
    /// Batches queued or in flight on the dispatch task.
    pending_batches: AtomicUsize,
    drain_timeout: Duration,
    error_observers: StdMutex<Vec<AsyncErrorObserver>>,
    traffic_observers: StdMutex<Vec<TrafficObserver>>,
    dispatch: StdMutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Creates the broker and starts its dispatch task. Must run inside a
    /// tokio runtime.
    pub fn new(local_id: u64, peer: Arc<Peer>, config: &NetConfig) -> Arc<Self> {
        let broker = Arc::new(Self {
            local_id,
            peer,
            state: AtomicU8::new(OPEN),
            queue: StdMutex::new(VecDeque::new()),
            queued: Notify::new(),
            gate: Mutex::new(()),
            pending_batches: AtomicUsize::new(0),
            drain_timeout: config.drain_timeout,
            error_observers: StdMutex::new(Vec::new()),
            traffic_observers: StdMutex::new(Vec::new()),
            dispatch: StdMutex::new(None),
        });
        let handle = tokio::spawn(Self::dispatch_loop(Arc::clone(&broker)));
        *broker.dispatch.lock().unwrap() = Some(handle);
        broker
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == OPEN
    }

    /// Registers a callback for failures on the async path. Invoked from the
    /// dispatch task, never from under a caller's lock.
    pub fn observe_async_error(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.error_observers.lock().unwrap().push(Arc::new(observer));
    }

    /// Registers a callback fired after every successful exchange; feeds
    /// liveness clocks.
    pub fn observe_traffic(&self, observer: impl Fn() + Send + Sync + 'static) {
        self.traffic_observers.lock().unwrap().push(Arc::new(observer));
    }

    /// Dispatches a batch with the semantics its flags request.
    ///
    /// Non-blocking: appended to the FIFO queue, returns immediately with
    /// `(connected=true, results=None)`. Blocking: drains the queue, runs
    /// inline, and returns the transport outcome (with results when the
    /// batch is also sync).
    pub async fn send_remote_call(&self, batch: CallBatch) -> CallOutcome {
        if self.state.load(Ordering::SeqCst) != OPEN {
            return CallOutcome::disconnected();
        }

        if !batch.is_blocking() {
            self.pending_batches.fetch_add(1, Ordering::SeqCst);
            self.queue.lock().unwrap().push_back(WorkItem::Batch(batch));
            self.queued.notify_one();
            return CallOutcome::sent();
        }

        // Drain-then-run: wait (bounded) for queued and in-flight batches.
        let deadline = Instant::now() + self.drain_timeout;
        while self.pending_batches.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "broker {}: queue did not drain before blocking call",
                    self.local_id
                );
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }

        let _gate = self.gate.lock().await;
        let outcome = self.execute(&batch).await;
        if !outcome.connected {
            self.handle_transport_failure("blocking batch undeliverable").await;
        }
        outcome
    }

    /// Enqueues a keep-alive probe on the async path. Callable from sync
    /// code (timer callbacks).
    pub fn enqueue_ping(&self) {
        if self.state.load(Ordering::SeqCst) != OPEN {
            return;
        }
        self.queue.lock().unwrap().push_back(WorkItem::Ping);
        self.queued.notify_one();
    }

    /// Tears down the peer connection without closing the broker.
    pub async fn close_connection(&self) {
        self.peer.close().await;
    }

    /// OPEN -> CLOSING -> CLOSED. Pending queue items are dropped, not
    /// drained; the poison item is what the dispatch task stops on.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let dropped = self.clear_queue();
        if dropped > 0 {
            debug!("broker {}: dropped {} queued batch(es) on close", self.local_id, dropped);
        }
        self.queue.lock().unwrap().push_back(WorkItem::Shutdown);
        self.queued.notify_one();
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let item = loop {
                if let Some(item) = self.queue.lock().unwrap().pop_front() {
                    break item;
                }
                // Bounded wait, then re-check the shutdown state.
                let _ = timeout(Duration::from_millis(500), self.queued.notified()).await;
                if self.state.load(Ordering::SeqCst) == CLOSED {
                    return;
                }
            };

            match item {
                WorkItem::Shutdown => {
                    self.state.store(CLOSED, Ordering::SeqCst);
                    info!("broker {}: dispatch stopped", self.local_id);
                    return;
                }
                WorkItem::AsyncError(message) => {
                    let observers = self.error_observers.lock().unwrap().clone();
                    for observer in observers {
                        observer(&message);
                    }
                }
                WorkItem::Ping => {
                    let _gate = self.gate.lock().await;
                    let request = RpcRequest::Ping { node_id: self.local_id };
                    match self.peer.call(&request).await {
                        Some(_) => self.notify_traffic(),
                        None => self.handle_transport_failure("ping undeliverable").await,
                    }
                }
                WorkItem::Batch(batch) => {
                    {
                        let _gate = self.gate.lock().await;
                        let outcome = self.execute(&batch).await;
                        if !outcome.connected {
                            self.handle_transport_failure("async batch undeliverable").await;
                        }
                    }
                    self.pending_batches.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    async fn execute(&self, batch: &CallBatch) -> CallOutcome {
        let request = RpcRequest::Commands {
            node_id: self.local_id,
            batch: batch.clone(),
        };
        match self.peer.call(&request).await {
            Some(RpcResponse::Results(results)) => {
                self.notify_traffic();
                CallOutcome {
                    connected: true,
                    results,
                }
            }
            Some(RpcResponse::Error(message)) => {
                warn!("broker {}: remote refused batch: {}", self.local_id, message);
                self.notify_traffic();
                CallOutcome {
                    connected: true,
                    results: None,
                }
            }
            Some(other) => {
                warn!("broker {}: unexpected response: {:?}", self.local_id, other);
                self.notify_traffic();
                CallOutcome {
                    connected: true,
                    results: None,
                }
            }
            None => CallOutcome::disconnected(),
        }
    }

    /// Failure path: tear down the connection, drop queued work, and queue
    /// the async-error notification as a fresh item.
    async fn handle_transport_failure(&self, reason: &str) {
        warn!("broker {}: {}", self.local_id, reason);
        self.peer.close().await;
        let dropped = self.clear_queue();
        if dropped > 0 {
            debug!(
                "broker {}: dropped {} queued batch(es) after failure",
                self.local_id, dropped
            );
        }
        self.queue
            .lock()
            .unwrap()
            .push_back(WorkItem::AsyncError(reason.to_string()));
        self.queued.notify_one();
    }

    /// Empties the queue; returns how many batches were removed and settles
    /// their pending count.
    fn clear_queue(&self) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let batches = queue
            .iter()
            .filter(|item| matches!(item, WorkItem::Batch(_)))
            .count();
        queue.clear();
        drop(queue);
        if batches > 0 {
            self.pending_batches.fetch_sub(batches, Ordering::SeqCst);
        }
        batches
    }

    fn notify_traffic(&self) {
        let observers = self.traffic_observers.lock().unwrap().clone();
        for observer in observers {
            observer();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatch.lock().unwrap().take() {
            handle.abort();
        }
    }
}
