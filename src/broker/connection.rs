//! Connection handler
//!
//! One task per client connection. The task owns the transport: it is
//! the only place that reads from or writes to the socket. Publishers
//! reach a connection exclusively through its outbound queue, and the
//! teardown path (seal the queue, leave every topic, drop out of the
//! connection map) runs exactly once, here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::timeout_at;
use tracing::{debug, trace, warn};

use crate::broker::queue::{EnqueueResult, OutboundQueue};
use crate::broker::{dispatch_publish, BrokerConfig, BrokerEvent};
use crate::metrics::Metrics;
use crate::protocol::{reason, ClientFrame, ConnectionId, ServerFrame, Topic};
use crate::registry::{SubscribeOutcome, SubscriptionRegistry};
use crate::transport::{Transport, TransportError};

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Transport(TransportError),
    Encode(serde_json::Error),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Transport(e) => write!(f, "transport error: {}", e),
            ConnectionError::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        ConnectionError::Transport(e)
    }
}

impl From<serde_json::Error> for ConnectionError {
    fn from(e: serde_json::Error) -> Self {
        ConnectionError::Encode(e)
    }
}

/// Connection handler - generic over the transport
pub struct Connection<T> {
    id: ConnectionId,
    transport: T,
    addr: SocketAddr,
    queue: Arc<OutboundQueue>,
    registry: Arc<SubscriptionRegistry>,
    connections: Arc<DashMap<ConnectionId, Arc<OutboundQueue>>>,
    config: BrokerConfig,
    events: broadcast::Sender<BrokerEvent>,
    metrics: Option<Arc<Metrics>>,
    transport_label: &'static str,
}

impl<T> Connection<T>
where
    T: Transport,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ConnectionId,
        transport: T,
        addr: SocketAddr,
        queue: Arc<OutboundQueue>,
        registry: Arc<SubscriptionRegistry>,
        connections: Arc<DashMap<ConnectionId, Arc<OutboundQueue>>>,
        config: BrokerConfig,
        events: broadcast::Sender<BrokerEvent>,
        metrics: Option<Arc<Metrics>>,
        transport_label: &'static str,
    ) -> Self {
        Self {
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
        }
    }

    /// Run the connection handler until the peer leaves, the transport
    /// fails, or the broker shuts down.
    pub async fn run(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        self.queue.activate();
        debug!("Connection {} active from {}", self.id, self.addr);

        match self.serve(shutdown).await {
            Ok(()) => {
                self.drain_then_close().await;
                Ok(())
            }
            Err(e) => {
                // the transport is gone; whatever is queued is discarded
                debug!("Connection {} failed: {}", self.id, e);
                self.finish();
                Err(e)
            }
        }
    }

    /// Main loop: incoming frames, outbound queue wakeups, shutdown.
    async fn serve(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                // Read the next frame from the client
                result = self.transport.recv() => {
                    match result? {
                        Some(raw) => self.handle_frame(&raw),
                        None => {
                            debug!("Connection {} closed by peer", self.id);
                            return Ok(());
                        }
                    }
                }

                // Drain the outbound queue to the socket
                _ = self.queue.notified() => {
                    self.flush().await?;
                }

                // Broker shutdown
                result = shutdown.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            debug!("Connection {} shutting down", self.id);
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, raw: &[u8]) {
        let frame = match ClientFrame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Connection {} sent a malformed frame: {}", self.id, e);
                if let Some(ref metrics) = self.metrics {
                    metrics.frame_rejected(reason::MALFORMED_FRAME);
                }
                self.queue_error(reason::MALFORMED_FRAME, &e.to_string());
                return;
            }
        };

        match frame {
            ClientFrame::Subscribe { topic } => self.handle_subscribe(&topic),
            ClientFrame::Unsubscribe { topic } => self.handle_unsubscribe(&topic),
            ClientFrame::Publish { topic, payload } => self.handle_publish(&topic, &payload),
        }
    }

    fn handle_subscribe(&mut self, raw_topic: &str) {
        let topic = match Topic::parse(raw_topic) {
            Ok(topic) => topic,
            Err(e) => {
                debug!("Connection {} subscribe rejected: {}", self.id, e);
                if let Some(ref metrics) = self.metrics {
                    metrics.frame_rejected(reason::INVALID_TOPIC);
                }
                self.queue_error(reason::INVALID_TOPIC, &e.to_string());
                return;
            }
        };

        match self.registry.subscribe(&topic, self.id) {
            SubscribeOutcome::Added => {
                debug!("Connection {} subscribed to '{}'", self.id, topic);
                if let Some(ref metrics) = self.metrics {
                    metrics.subscription_added();
                    metrics.set_topics_current(self.registry.topic_count());
                }
                let _ = self.events.send(BrokerEvent::Subscribed {
                    id: self.id,
                    topic: topic.as_str().to_owned(),
                });
            }
            SubscribeOutcome::AlreadySubscribed => {
                trace!("Connection {} already subscribed to '{}'", self.id, topic);
            }
            SubscribeOutcome::LimitExceeded => {
                debug!("Connection {} hit the subscription limit", self.id);
                if let Some(ref metrics) = self.metrics {
                    metrics.frame_rejected(reason::SUBSCRIPTION_LIMIT);
                }
                self.queue_error(reason::SUBSCRIPTION_LIMIT, "subscription limit reached");
            }
        }
    }

    fn handle_unsubscribe(&mut self, raw_topic: &str) {
        // no topic validation: an invalid name simply is not subscribed
        if self.registry.unsubscribe(raw_topic, self.id) {
            debug!("Connection {} unsubscribed from '{}'", self.id, raw_topic);
            if let Some(ref metrics) = self.metrics {
                metrics.subscription_removed(1);
                metrics.set_topics_current(self.registry.topic_count());
            }
            let _ = self.events.send(BrokerEvent::Unsubscribed {
                id: self.id,
                topic: raw_topic.to_owned(),
            });
        } else {
            trace!("Connection {} was not subscribed to '{}'", self.id, raw_topic);
        }
    }

    fn handle_publish(&mut self, raw_topic: &str, payload: &str) {
        let topic = match Topic::parse(raw_topic) {
            Ok(topic) => topic,
            Err(e) => {
                debug!("Connection {} publish rejected: {}", self.id, e);
                if let Some(ref metrics) = self.metrics {
                    metrics.frame_rejected(reason::INVALID_TOPIC);
                }
                self.queue_error(reason::INVALID_TOPIC, &e.to_string());
                return;
            }
        };

        let receipt = dispatch_publish(
            &self.registry,
            &self.connections,
            self.metrics.as_deref(),
            &self.events,
            &topic,
            payload,
        );
        trace!(
            "Connection {} published to '{}': {} matched, {} enqueued",
            self.id,
            topic,
            receipt.matched,
            receipt.enqueued
        );
    }

    /// Queue an error frame for this client. Error frames ride the same
    /// outbound queue as deliveries so the client sees them in order.
    fn queue_error(&self, reason: &'static str, detail: &str) {
        let frame = match ServerFrame::error(reason, detail).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode error frame: {}", e);
                return;
            }
        };
        if let EnqueueResult::Dropped(drop_reason) = self.queue.enqueue(frame, Instant::now()) {
            trace!("Error frame for {} dropped: {:?}", self.id, drop_reason);
        }
    }

    /// Write everything currently queued to the transport.
    async fn flush(&mut self) -> Result<(), ConnectionError> {
        while let Some(message) = self.queue.pop() {
            let len = message.frame.len();
            self.transport.send(message.frame).await?;
            if let Some(ref metrics) = self.metrics {
                metrics.message_written(len, message.enqueued_at.elapsed());
            }
        }
        Ok(())
    }

    /// Graceful teardown: stop accepting frames, flush what is already
    /// queued within the drain timeout, then finish.
    async fn drain_then_close(&mut self) {
        self.queue.begin_close();
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;

        while let Some(message) = self.queue.pop() {
            let len = message.frame.len();
            match timeout_at(deadline, self.transport.send(message.frame)).await {
                Ok(Ok(())) => {
                    if let Some(ref metrics) = self.metrics {
                        metrics.message_written(len, message.enqueued_at.elapsed());
                    }
                }
                Ok(Err(e)) => {
                    debug!("Drain write to {} failed: {}", self.id, e);
                    break;
                }
                Err(_) => {
                    debug!("Drain of connection {} timed out", self.id);
                    break;
                }
            }
        }

        let _ = self.transport.close().await;
        self.finish();
    }

    /// Runs exactly once per connection: seal the queue, leave every
    /// topic, drop out of the connection map. Only this task calls it.
    fn finish(&mut self) {
        let discarded = self.queue.finish_close();
        if discarded > 0 {
            debug!(
                "Connection {} discarded {} queued frames",
                self.id, discarded
            );
        }
        let removed = self.registry.unsubscribe_all(self.id);
        self.connections.remove(&self.id);

        if let Some(ref metrics) = self.metrics {
            if discarded > 0 {
                metrics.messages_dropped("connection_closed", discarded as u64);
            }
            if removed > 0 {
                metrics.subscription_removed(removed);
            }
            metrics.set_topics_current(self.registry.topic_count());
            metrics.client_disconnected(self.transport_label);
        }

        let _ = self.events.send(BrokerEvent::Disconnected { id: self.id });
        debug!(
            "Connection {} finished ({} subscriptions removed)",
            self.id, removed
        );
    }
}
