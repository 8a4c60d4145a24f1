//! Integration tests for live token fan-out

use blueprint::stream::{StreamConfig, StreamHub, Terminal};
use std::time::Duration;

#[tokio::test]
async fn test_late_subscriber_sees_full_history_in_order() {
    let hub = StreamHub::new(&StreamConfig::default());
    let publisher = hub.open("run/design").unwrap();
    publisher.publish("Hello");
    publisher.publish(", ");

    let early = hub.subscribe("run/design").unwrap();
    publisher.publish("world");
    let late = hub.subscribe("run/design").unwrap();
    publisher.close(Terminal::Ok);

    let (early_text, early_terminal) = early.collect_text().await;
    let (late_text, late_terminal) = late.collect_text().await;
    assert_eq!(early_text, "Hello, world");
    assert_eq!(late_text, "Hello, world");
    assert_eq!(early_terminal, Some(Terminal::Ok));
    assert_eq!(late_terminal, Some(Terminal::Ok));
    assert!(!hub.is_open("run/design"));
}

#[tokio::test]
async fn test_sequence_numbers_are_gapless_per_unit() {
    let hub = StreamHub::new(&StreamConfig::default());
    let a = hub.open("a").unwrap();
    let b = hub.open("b").unwrap();
    let mut sub_a = hub.subscribe("a").unwrap();
    for i in 0..5 {
        a.publish(format!("a{}", i));
        b.publish(format!("b{}", i));
    }
    a.close(Terminal::Ok);
    b.close(Terminal::Ok);

    let mut expected = 1;
    while let Some(event) = sub_a.next().await {
        assert_eq!(event.unit_id, "a");
        assert_eq!(event.seq, expected);
        expected += 1;
    }
    assert_eq!(expected, 7);
    assert!(hub.subscribe("a").is_err());
}

#[tokio::test]
async fn test_slow_subscriber_is_dropped_without_blocking_producer() {
    let hub = StreamHub::new(&StreamConfig {
        subscriber_buffer: 2,
    });
    let publisher = hub.open("u").unwrap();
    let mut slow = hub.subscribe("u").unwrap();
    let fast = hub.subscribe("u").unwrap();
    let reader = tokio::spawn(fast.collect_text());
    tokio::task::yield_now().await;

    for i in 0..50 {
        publisher.publish(format!("{} ", i));
        if i % 5 == 0 {
            tokio::task::yield_now().await;
        }
    }
    publisher.close(Terminal::Ok);

    let mut last = None;
    while let Some(event) = slow.next().await {
        last = event.terminal;
    }
    assert_eq!(last, Some(Terminal::Overflow));
    assert!(hub.dropped_subscribers() >= 1);

    let (text, terminal) = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .unwrap()
        .unwrap();
    if terminal == Some(Terminal::Ok) {
        assert!(text.ends_with("49 "));
    }
}

#[tokio::test]
async fn test_tap_receives_units_opened_afterwards() {
    let hub = StreamHub::new(&StreamConfig::default());
    let mut tap = hub.tap();
    let publisher = hub.open("tapped").unwrap();
    publisher.begin_attempt(2);
    publisher.publish("retry text");
    publisher.close(Terminal::Error("quota: exhausted".to_string()));

    let subscription = tap.recv().await.unwrap();
    assert_eq!(subscription.unit_id(), "tapped");
    let (text, terminal) = subscription.collect_text().await;
    assert_eq!(text, "retry text");
    assert_eq!(terminal, Some(Terminal::Error("quota: exhausted".to_string())));
}
