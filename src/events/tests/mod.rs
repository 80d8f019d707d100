#![cfg(test)]

use crate::events::Broadcaster;
use crate::protocol::{EventKind, EventRecord};

fn event(path: &str) -> EventRecord {
    EventRecord::new(EventKind::Modified, path)
}

#[tokio::test]
async fn test_fanout_to_all_subscribers() {
    let hub = Broadcaster::default();
    let a = hub.subscribe();
    let b = hub.subscribe();

    hub.publish(&event("/x"));

    assert_eq!(a.recv().await.unwrap().path, "/x");
    assert_eq!(b.recv().await.unwrap().path, "/x");
}

#[tokio::test]
async fn test_full_mailbox_drops_instead_of_blocking() {
    let hub = Broadcaster::new(1);
    let sub = hub.subscribe();

    hub.publish(&event("/1"));
    hub.publish(&event("/2"));
    hub.publish(&event("/3"));

    // only the first event fit; the subscriber survives the overflow
    assert_eq!(sub.try_recv().unwrap().path, "/1");
    assert!(sub.try_recv().is_none());
    assert_eq!(hub.subscriber_count(), 1);
}

#[tokio::test]
async fn test_dropped_subscription_is_pruned() {
    let hub = Broadcaster::default();
    let a = hub.subscribe();
    drop(hub.subscribe());

    hub.publish(&event("/x"));
    assert_eq!(hub.subscriber_count(), 1);
    assert_eq!(a.recv().await.unwrap().path, "/x");
}
