use bytes::Bytes;
use pretty_assertions::assert_eq;

use crate::protocol::ServerFrame;

use super::*;

fn topic(name: &str) -> Topic {
    Topic::parse(name).unwrap()
}

struct Fixture {
    registry: SubscriptionRegistry,
    connections: DashMap<ConnectionId, Arc<OutboundQueue>>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Fixture {
    fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            registry: SubscriptionRegistry::new(0),
            connections: DashMap::new(),
            events,
        }
    }

    fn connect(&self, capacity: usize, policy: OverflowPolicy) -> (ConnectionId, Arc<OutboundQueue>) {
        let id = ConnectionId::next();
        let queue = Arc::new(OutboundQueue::new(capacity, policy));
        queue.activate();
        self.connections.insert(id, queue.clone());
        (id, queue)
    }

    fn subscribe(&self, name: &str, id: ConnectionId) {
        self.registry.subscribe(&topic(name), id);
    }

    fn publish(&self, name: &str, payload: &str) -> PublishReceipt {
        dispatch_publish(
            &self.registry,
            &self.connections,
            None,
            &self.events,
            &topic(name),
            payload,
        )
    }
}

fn payload_of(frame: &Bytes) -> String {
    match serde_json::from_slice::<ServerFrame>(frame).unwrap() {
        ServerFrame::Message { payload, .. } => payload,
        other => panic!("expected a message frame, got {:?}", other),
    }
}

#[test]
fn publish_reaches_every_subscriber() {
    let fx = Fixture::new();
    let mut queues = Vec::new();
    for _ in 0..3 {
        let (id, queue) = fx.connect(8, OverflowPolicy::RejectNewest);
        fx.subscribe("news", id);
        queues.push(queue);
    }

    let receipt = fx.publish("news", "breaking");

    assert_eq!(
        receipt,
        PublishReceipt {
            matched: 3,
            enqueued: 3,
            dropped_backpressure: 0,
            dropped_closed: 0,
        }
    );
    for queue in &queues {
        let message = queue.pop().unwrap();
        assert_eq!(payload_of(&message.frame), "breaking");
        assert!(queue.pop().is_none());
    }
}

#[test]
fn publish_without_subscribers_succeeds() {
    let fx = Fixture::new();

    let receipt = fx.publish("nobody-listens", "hello?");

    assert_eq!(receipt, PublishReceipt::default());
}

#[test]
fn unsubscribed_connection_receives_nothing() {
    let fx = Fixture::new();
    let (a, queue_a) = fx.connect(8, OverflowPolicy::RejectNewest);
    let (b, queue_b) = fx.connect(8, OverflowPolicy::RejectNewest);
    fx.subscribe("news", a);
    fx.subscribe("news", b);
    fx.registry.unsubscribe("news", b);

    let receipt = fx.publish("news", "for a only");

    assert_eq!(receipt.matched, 1);
    assert_eq!(receipt.enqueued, 1);
    assert_eq!(queue_a.len(), 1);
    assert_eq!(queue_b.len(), 0);
}

#[test]
fn saturated_queue_rejects_exactly_the_overflow() {
    let fx = Fixture::new();
    let (id, queue) = fx.connect(2, OverflowPolicy::RejectNewest);
    fx.subscribe("firehose", id);

    assert_eq!(fx.publish("firehose", "m0").enqueued, 1);
    assert_eq!(fx.publish("firehose", "m1").enqueued, 1);

    let third = fx.publish("firehose", "m2");
    assert_eq!(
        third,
        PublishReceipt {
            matched: 1,
            enqueued: 0,
            dropped_backpressure: 1,
            dropped_closed: 0,
        }
    );

    // the queue still holds exactly the first two, in order
    assert_eq!(queue.len(), 2);
    assert_eq!(payload_of(&queue.pop().unwrap().frame), "m0");
    assert_eq!(payload_of(&queue.pop().unwrap().frame), "m1");
}

#[test]
fn drop_oldest_keeps_the_newest() {
    let fx = Fixture::new();
    let (id, queue) = fx.connect(1, OverflowPolicy::DropOldest);
    fx.subscribe("ticker", id);

    assert_eq!(fx.publish("ticker", "stale").enqueued, 1);

    let second = fx.publish("ticker", "fresh");
    assert_eq!(second.enqueued, 1);
    assert_eq!(second.dropped_backpressure, 0);

    assert_eq!(queue.len(), 1);
    assert_eq!(payload_of(&queue.pop().unwrap().frame), "fresh");
}

#[test]
fn closing_connection_counts_as_closed_drop() {
    let fx = Fixture::new();
    let (id, queue) = fx.connect(8, OverflowPolicy::RejectNewest);
    fx.subscribe("news", id);
    queue.begin_close();

    let receipt = fx.publish("news", "too late");

    assert_eq!(receipt.matched, 1);
    assert_eq!(receipt.enqueued, 0);
    assert_eq!(receipt.dropped_closed, 1);
}

#[test]
fn vanished_connection_counts_as_closed_drop() {
    let fx = Fixture::new();
    let (id, _queue) = fx.connect(8, OverflowPolicy::RejectNewest);
    fx.subscribe("news", id);
    // simulate a disconnect that raced the publish
    fx.connections.remove(&id);

    let receipt = fx.publish("news", "gone");

    assert_eq!(receipt.matched, 1);
    assert_eq!(receipt.dropped_closed, 1);
}

#[test]
fn delivery_frame_is_shared_across_queues() {
    let fx = Fixture::new();
    let (a, queue_a) = fx.connect(8, OverflowPolicy::RejectNewest);
    let (b, queue_b) = fx.connect(8, OverflowPolicy::RejectNewest);
    fx.subscribe("news", a);
    fx.subscribe("news", b);

    fx.publish("news", "encoded once");

    let frame_a = queue_a.pop().unwrap().frame;
    let frame_b = queue_b.pop().unwrap().frame;
    assert_eq!(frame_a, frame_b);
    // both handles point into the same buffer
    assert_eq!(frame_a.as_ptr(), frame_b.as_ptr());
}

#[test]
fn deliveries_stay_in_publish_order() {
    let fx = Fixture::new();
    let (id, queue) = fx.connect(8, OverflowPolicy::RejectNewest);
    fx.subscribe("ordered", id);

    fx.publish("ordered", "first");
    fx.publish("ordered", "second");
    fx.publish("ordered", "third");

    assert_eq!(payload_of(&queue.pop().unwrap().frame), "first");
    assert_eq!(payload_of(&queue.pop().unwrap().frame), "second");
    assert_eq!(payload_of(&queue.pop().unwrap().frame), "third");
}

#[test]
fn publish_emits_an_event() {
    let fx = Fixture::new();
    let (id, _queue) = fx.connect(8, OverflowPolicy::RejectNewest);
    fx.subscribe("news", id);
    let mut rx = fx.events.subscribe();

    fx.publish("news", "observable");

    match rx.try_recv().unwrap() {
        BrokerEvent::Published { topic, matched } => {
            assert_eq!(topic, "news");
            assert_eq!(matched, 1);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}
