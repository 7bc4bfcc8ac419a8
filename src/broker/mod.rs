//! Broker core
//!
//! Owns the listeners, the subscription registry and the connection
//! map, and fans published messages out to subscriber queues. A publish
//! encodes the delivery frame once, snapshots the topic's subscribers
//! and enqueues the shared frame on each of their queues; it never
//! waits for a socket.

mod connection;
mod queue;

#[cfg(test)]
mod tests;

pub use connection::{Connection, ConnectionError};
pub use queue::{ConnectionState, DropReason, EnqueueResult, OutboundQueue};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::OverflowPolicy;
use crate::metrics::Metrics;
use crate::protocol::{encode_delivery, ConnectionId, Topic};
use crate::registry::SubscriptionRegistry;
use crate::transport::{TcpTransport, Transport, WsTransport};

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// WebSocket bind address (optional)
    pub ws_bind_addr: Option<SocketAddr>,
    /// WebSocket upgrade path
    pub ws_path: String,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum frame size in bytes
    pub max_frame_size: usize,
    /// Maximum subscriptions per connection (0 = unlimited)
    pub max_subscriptions_per_connection: usize,
    /// Outbound queue capacity per connection
    pub queue_capacity: usize,
    /// What happens when an outbound queue is full
    pub overflow: OverflowPolicy,
    /// How long a closing connection may spend flushing its queue
    pub drain_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7311".parse().unwrap(),
            ws_bind_addr: None,
            ws_path: "/ws".to_string(),
            max_connections: 10_000,
            max_frame_size: 64 * 1024,
            max_subscriptions_per_connection: 1024,
            queue_capacity: 256,
            overflow: OverflowPolicy::RejectNewest,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a single publish fan-out.
///
/// Counts cover this publish's frames only: under the drop-oldest
/// policy an eviction of an older frame shows up in the drop metrics,
/// not here. `matched` always equals `enqueued + dropped_backpressure +
/// dropped_closed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Subscribers in the snapshot
    pub matched: usize,
    /// Frames queued for delivery
    pub enqueued: usize,
    /// Frames rejected by a full queue
    pub dropped_backpressure: usize,
    /// Frames rejected by a closing or closed connection
    pub dropped_closed: usize,
}

/// Broker events
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Client connected
    Connected { id: ConnectionId },
    /// Client disconnected
    Disconnected { id: ConnectionId },
    /// Client subscribed to a topic
    Subscribed { id: ConnectionId, topic: String },
    /// Client unsubscribed from a topic
    Unsubscribed { id: ConnectionId, topic: String },
    /// A message was published
    Published { topic: String, matched: usize },
}

/// The notification broker
pub struct Broker {
    /// Configuration
    config: BrokerConfig,
    /// Topic membership
    registry: Arc<SubscriptionRegistry>,
    /// Active connections (connection id -> outbound queue)
    connections: Arc<DashMap<ConnectionId, Arc<OutboundQueue>>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    /// Event channel
    events: broadcast::Sender<BrokerEvent>,
    /// Metrics recorder
    metrics: Option<Arc<Metrics>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        Self {
            registry: Arc::new(SubscriptionRegistry::new(
                config.max_subscriptions_per_connection,
            )),
            config,
            connections: Arc::new(DashMap::new()),
            shutdown,
            events,
            metrics: None,
        }
    }

    /// Attach a metrics recorder. Call before [`run`](Self::run).
    pub fn set_metrics(&mut self, metrics: Arc<Metrics>) {
        self.metrics = Some(metrics);
    }

    /// Run the broker until [`shutdown`](Self::shutdown) is called.
    /// Returns once every connection has finished its drain (or the
    /// drain deadline passes).
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("TCP listening on {}", self.config.bind_addr);

        if let Some(ws_addr) = self.config.ws_bind_addr {
            let ws_listener = TcpListener::bind(ws_addr).await?;
            info!(
                "WebSocket listening on {} (path: {})",
                ws_addr, self.config.ws_path
            );
            self.spawn_ws_listener(ws_listener);
        }

        let mut shutdown_rx = self.shutdown.subscribe();

        debug!("Starting TCP accept loop");
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("New TCP connection from {}", addr);
                            self.handle_tcp_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Failed to accept TCP connection: {}", e);
                        }
                    }
                }
                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }

        info!(
            "Shutting down, draining {} connections",
            self.connections.len()
        );
        self.await_connections().await;
        Ok(())
    }

    /// Spawn the WebSocket accept loop. Handshakes run on the spawned
    /// connection task so a slow client cannot stall the loop.
    fn spawn_ws_listener(&self, listener: TcpListener) {
        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("New WebSocket connection from {}", addr);
                                if at_capacity(&connections, &config, metrics.as_deref()) {
                                    continue;
                                }

                                let registry = registry.clone();
                                let connections = connections.clone();
                                let config = config.clone();
                                let events = events.clone();
                                let shutdown_rx = shutdown.subscribe();
                                let metrics = metrics.clone();

                                tokio::spawn(async move {
                                    match WsTransport::accept(
                                        stream,
                                        &config.ws_path,
                                        config.max_frame_size,
                                    )
                                    .await
                                    {
                                        Ok(transport) => {
                                            debug!("WebSocket handshake complete for {}", addr);
                                            run_connection(
                                                transport, addr, "ws", registry, connections,
                                                config, events, shutdown_rx, metrics,
                                            )
                                            .await;
                                        }
                                        Err(e) => {
                                            debug!("WebSocket handshake failed for {}: {}", addr, e);
                                            if let Some(ref metrics) = metrics {
                                                metrics.connection_rejected("handshake");
                                            }
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept WebSocket connection: {}", e);
                            }
                        }
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) | Err(broadcast::error::RecvError::Closed) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }
        });
    }

    /// Handle a new TCP connection
    fn handle_tcp_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if at_capacity(&self.connections, &self.config, self.metrics.as_deref()) {
            // dropping the stream closes it
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        let transport = TcpTransport::new(stream, self.config.max_frame_size);
        let registry = self.registry.clone();
        let connections = self.connections.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let shutdown_rx = self.shutdown.subscribe();
        let metrics = self.metrics.clone();

        tokio::spawn(run_connection(
            transport, addr, "tcp", registry, connections, config, events, shutdown_rx, metrics,
        ));
    }

    /// Wait for connection tasks to finish draining, with a backstop
    /// slightly past the drain timeout.
    async fn await_connections(&self) {
        let deadline =
            tokio::time::Instant::now() + self.config.drain_timeout + Duration::from_millis(500);
        while !self.connections.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "{} connections still open at shutdown deadline",
                    self.connections.len()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Shutdown the broker
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.registry.topic_count()
    }

    /// Total number of active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.registry.subscription_count()
    }

    /// Publish a message from the server side
    pub fn publish(&self, topic: &Topic, payload: &str) -> PublishReceipt {
        dispatch_publish(
            &self.registry,
            &self.connections,
            self.metrics.as_deref(),
            &self.events,
            topic,
            payload,
        )
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// Enforce the connection cap at accept time.
fn at_capacity(
    connections: &DashMap<ConnectionId, Arc<OutboundQueue>>,
    config: &BrokerConfig,
    metrics: Option<&Metrics>,
) -> bool {
    if config.max_connections > 0 && connections.len() >= config.max_connections {
        debug!(
            "Connection rejected: {} connections at limit",
            connections.len()
        );
        if let Some(metrics) = metrics {
            metrics.connection_rejected("max_connections");
        }
        return true;
    }
    false
}

/// Register a queue for a fresh connection and drive it to completion.
#[allow(clippy::too_many_arguments)]
async fn run_connection<T: Transport + 'static>(
    transport: T,
    addr: SocketAddr,
    transport_label: &'static str,
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<DashMap<ConnectionId, Arc<OutboundQueue>>>,
    config: BrokerConfig,
    events: broadcast::Sender<BrokerEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
    metrics: Option<Arc<Metrics>>,
) {
    let id = ConnectionId::next();
    let queue = Arc::new(OutboundQueue::new(config.queue_capacity, config.overflow));
    connections.insert(id, queue.clone());

    if let Some(ref metrics) = metrics {
        metrics.client_connected(transport_label);
    }
    let _ = events.send(BrokerEvent::Connected { id });

    let mut conn = Connection::new(
        id,
        transport,
        addr,
        queue,
        registry,
        connections,
        config,
        events,
        metrics,
        transport_label,
    );
    if let Err(e) = conn.run(&mut shutdown_rx).await {
        debug!("Connection error from {}: {}", addr, e);
    }
}

/// Fan a message out to every subscriber of `topic`.
///
/// The delivery frame is encoded once and shared by every queue. The
/// subscriber set is a point-in-time snapshot: a connection that
/// subscribes after the snapshot sees nothing, and one that left since
/// counts as a closed drop.
pub(crate) fn dispatch_publish(
    registry: &SubscriptionRegistry,
    connections: &DashMap<ConnectionId, Arc<OutboundQueue>>,
    metrics: Option<&Metrics>,
    events: &broadcast::Sender<BrokerEvent>,
    topic: &Topic,
    payload: &str,
) -> PublishReceipt {
    let frame = match encode_delivery(topic, payload) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to encode delivery for '{}': {}", topic, e);
            return PublishReceipt::default();
        }
    };

    let subscribers = registry.snapshot(topic.as_str());
    let mut receipt = PublishReceipt {
        matched: subscribers.len(),
        ..PublishReceipt::default()
    };

    let now = Instant::now();
    for id in subscribers {
        let queue = match connections.get(&id) {
            Some(queue) => queue,
            None => {
                // raced with a disconnect between snapshot and enqueue
                receipt.dropped_closed += 1;
                if let Some(metrics) = metrics {
                    metrics.messages_dropped(DropReason::ConnectionClosed.as_label(), 1);
                }
                continue;
            }
        };

        match queue.enqueue(frame.clone(), now) {
            EnqueueResult::Enqueued => receipt.enqueued += 1,
            EnqueueResult::EnqueuedDroppedOldest => {
                // this frame landed, an older one was evicted
                receipt.enqueued += 1;
                if let Some(metrics) = metrics {
                    metrics.messages_dropped(DropReason::BackpressureFull.as_label(), 1);
                }
            }
            EnqueueResult::Dropped(reason) => {
                match reason {
                    DropReason::BackpressureFull => receipt.dropped_backpressure += 1,
                    DropReason::ConnectionClosed => receipt.dropped_closed += 1,
                }
                if let Some(metrics) = metrics {
                    metrics.messages_dropped(reason.as_label(), 1);
                }
            }
        }
    }

    if let Some(metrics) = metrics {
        metrics.publish_dispatched(receipt.matched, receipt.enqueued);
    }
    let _ = events.send(BrokerEvent::Published {
        topic: topic.as_str().to_owned(),
        matched: receipt.matched,
    });

    receipt
}
