use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::*;

fn topic(name: &str) -> Topic {
    Topic::parse(name).unwrap()
}

#[test]
fn subscribe_then_snapshot() {
    let registry = SubscriptionRegistry::new(0);
    let id = ConnectionId::next();

    assert_eq!(registry.subscribe(&topic("news"), id), SubscribeOutcome::Added);

    let subs = registry.snapshot("news");
    assert_eq!(subs.len(), 1);
    assert!(subs.contains(&id));
}

#[test]
fn subscribe_is_idempotent() {
    let registry = SubscriptionRegistry::new(0);
    let id = ConnectionId::next();
    let news = topic("news");

    assert_eq!(registry.subscribe(&news, id), SubscribeOutcome::Added);
    assert_eq!(
        registry.subscribe(&news, id),
        SubscribeOutcome::AlreadySubscribed
    );

    assert_eq!(registry.snapshot("news").len(), 1);
    assert_eq!(registry.subscription_count(), 1);
}

#[test]
fn unsubscribe_removes_membership() {
    let registry = SubscriptionRegistry::new(0);
    let id = ConnectionId::next();
    registry.subscribe(&topic("news"), id);

    assert!(registry.unsubscribe("news", id));
    assert!(registry.snapshot("news").is_empty());

    // second call is a no-op
    assert!(!registry.unsubscribe("news", id));
}

#[test]
fn unsubscribe_unknown_topic_is_noop() {
    let registry = SubscriptionRegistry::new(0);
    let id = ConnectionId::next();

    assert!(!registry.unsubscribe("never-subscribed", id));
}

#[test]
fn unsubscribe_keeps_other_subscribers() {
    let registry = SubscriptionRegistry::new(0);
    let a = ConnectionId::next();
    let b = ConnectionId::next();
    let news = topic("news");

    registry.subscribe(&news, a);
    registry.subscribe(&news, b);
    registry.unsubscribe("news", a);

    let subs = registry.snapshot("news");
    assert_eq!(subs.len(), 1);
    assert!(subs.contains(&b));
}

#[test]
fn empty_topics_are_evicted() {
    let registry = SubscriptionRegistry::new(0);
    let id = ConnectionId::next();

    registry.subscribe(&topic("news"), id);
    assert_eq!(registry.topic_count(), 1);

    registry.unsubscribe("news", id);
    assert_eq!(registry.topic_count(), 0);
}

#[test]
fn unsubscribe_all_leaves_every_topic() {
    let registry = SubscriptionRegistry::new(0);
    let a = ConnectionId::next();
    let b = ConnectionId::next();

    registry.subscribe(&topic("news"), a);
    registry.subscribe(&topic("sports"), a);
    registry.subscribe(&topic("weather"), a);
    registry.subscribe(&topic("news"), b);

    assert_eq!(registry.unsubscribe_all(a), 3);

    // a is gone everywhere, b is untouched
    assert!(!registry.snapshot("news").contains(&a));
    assert!(registry.snapshot("sports").is_empty());
    assert!(registry.snapshot("weather").is_empty());
    assert_eq!(registry.snapshot("news").len(), 1);

    // only news retains a subscriber
    assert_eq!(registry.topic_count(), 1);
    assert_eq!(registry.subscription_count(), 1);
}

#[test]
fn unsubscribe_all_without_subscriptions_returns_zero() {
    let registry = SubscriptionRegistry::new(0);
    assert_eq!(registry.unsubscribe_all(ConnectionId::next()), 0);
}

#[test]
fn snapshot_is_point_in_time() {
    let registry = SubscriptionRegistry::new(0);
    let a = ConnectionId::next();
    let b = ConnectionId::next();
    let news = topic("news");

    registry.subscribe(&news, a);
    registry.subscribe(&news, b);

    let before = registry.snapshot("news");
    registry.unsubscribe("news", a);
    let after = registry.snapshot("news");

    assert_eq!(before.len(), 2);
    assert_eq!(after.len(), 1);
    assert!(before.contains(&a));
}

#[test]
fn subscription_limit_is_enforced() {
    let registry = SubscriptionRegistry::new(2);
    let id = ConnectionId::next();

    assert_eq!(registry.subscribe(&topic("a"), id), SubscribeOutcome::Added);
    assert_eq!(registry.subscribe(&topic("b"), id), SubscribeOutcome::Added);
    assert_eq!(
        registry.subscribe(&topic("c"), id),
        SubscribeOutcome::LimitExceeded
    );

    // re-subscribing an existing topic does not count against the limit
    assert_eq!(
        registry.subscribe(&topic("a"), id),
        SubscribeOutcome::AlreadySubscribed
    );

    // dropping one frees a slot
    registry.unsubscribe("a", id);
    assert_eq!(registry.subscribe(&topic("c"), id), SubscribeOutcome::Added);
}

#[test]
fn limit_zero_means_unlimited() {
    let registry = SubscriptionRegistry::new(0);
    let id = ConnectionId::next();

    for i in 0..100 {
        let outcome = registry.subscribe(&topic(&format!("topic-{i}")), id);
        assert_eq!(outcome, SubscribeOutcome::Added);
    }
    assert_eq!(registry.subscription_count(), 100);
}

#[test]
fn concurrent_churn_settles_empty() {
    let registry = Arc::new(SubscriptionRegistry::new(0));
    let mut handles = Vec::new();

    for t in 0..8 {
        let registry = Arc::clone(&registry);
        handles.push(std::thread::spawn(move || {
            let id = ConnectionId::next();
            for i in 0..50 {
                let name = format!("churn/{}/{}", t, i % 5);
                registry.subscribe(&topic(&name), id);
            }
            registry.unsubscribe_all(id)
        }));
    }

    let mut removed = 0;
    for handle in handles {
        removed += handle.join().unwrap();
    }

    // each thread held 5 distinct topics at the end
    assert_eq!(removed, 8 * 5);
    assert_eq!(registry.topic_count(), 0);
    assert_eq!(registry.subscription_count(), 0);
}
