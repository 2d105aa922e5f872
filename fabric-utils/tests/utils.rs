//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::time::Duration;

use fabric_utils::backoff::ExponentialBackoff;
use fabric_utils::ip::IpNetworkExt;
use fabric_utils::kv::{KeyFilter, Value};
use fabric_utils::mpls::{Label, MplsAction};
use fabric_utils::queue::ReplicateQueue;
use fabric_utils::rib::NextHop;
use ipnetwork::IpNetwork;

fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

fn addr(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn network_covers() {
    assert!(net("192.168.0.0/16").covers(&net("192.168.20.16/28")));
    assert!(net("192.168.0.0/16").covers(&net("192.168.0.0/16")));
    assert!(!net("192.168.0.0/16").covers(&net("192.168.0.0/14")));
    assert!(!net("192.168.0.0/24").covers(&net("192.168.20.19/32")));
    assert!(net("::/0").covers(&net("fe80::1/128")));
    // No cross-family coverage.
    assert!(!net("::/0").covers(&net("192.168.0.0/16")));
}

#[test]
fn nexthop_equality_ignores_metric() {
    let nh1 = NextHop::new(addr("fe80::2"), "iface_1_2_1".to_owned(), 1, None, 10);
    let nh2 = NextHop::new(addr("fe80::2"), "iface_1_2_1".to_owned(), 1, None, 20);
    assert_eq!(nh1, nh2);

    let mut set = std::collections::BTreeSet::new();
    set.insert(nh1);
    set.insert(nh2);
    assert_eq!(set.len(), 1);

    // A different MPLS action is a different next-hop.
    let nh3 = NextHop::new(
        addr("fe80::2"),
        "iface_1_2_1".to_owned(),
        1,
        Some(MplsAction::Swap(Label::new(2))),
        10,
    );
    set.insert(nh3);
    assert_eq!(set.len(), 2);
}

#[test]
fn mpls_action_prepend() {
    let prepend = Label::new(60000);
    let segment = Label::new(102);

    let action = MplsAction::prepend(None, prepend);
    assert_eq!(action, MplsAction::Push(vec![prepend]));

    let action = MplsAction::prepend(
        Some(MplsAction::Push(vec![segment])),
        prepend,
    );
    assert_eq!(action, MplsAction::Push(vec![prepend, segment]));
}

#[test]
fn value_ordering() {
    let value = |version, originator: &str, ttl_version| {
        Value::new(version, originator.to_owned(), None, 3600_000, ttl_version)
    };

    // Higher version wins regardless of originator.
    assert!(
        value(2, "a", 0).cmp_versions(&value(1, "z", 9))
            == std::cmp::Ordering::Greater
    );
    // Same version: higher originator wins.
    assert!(
        value(1, "b", 0).cmp_versions(&value(1, "a", 9))
            == std::cmp::Ordering::Greater
    );
    // Same version and originator: ttl-version decides.
    assert!(
        value(1, "a", 2).cmp_versions(&value(1, "a", 1))
            == std::cmp::Ordering::Greater
    );
}

#[test]
fn key_filter() {
    let filter = KeyFilter::new(vec!["adj:".to_owned(), "prefix:".to_owned()]);
    assert!(filter.matches("adj:node1"));
    assert!(filter.matches("prefix:node2"));
    assert!(!filter.matches("fib-synced:node1"));

    // An empty filter matches everything.
    assert!(KeyFilter::default().matches("anything"));
}

#[test]
fn replicate_queue_fanout_and_pruning() {
    let mut queue = ReplicateQueue::<u32>::default();
    let mut rx1 = queue.subscribe();
    let rx2 = queue.subscribe();
    assert_eq!(queue.subscriber_count(), 2);

    queue.publish(7);
    assert_eq!(rx1.try_recv().unwrap(), 7);

    // Dropped subscribers are pruned on the next publish.
    drop(rx2);
    queue.publish(8);
    assert_eq!(queue.subscriber_count(), 1);
    assert_eq!(rx1.try_recv().unwrap(), 8);
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_and_resets() {
    let mut backoff = ExponentialBackoff::new(
        Duration::from_millis(100),
        Duration::from_millis(400),
    );
    assert!(backoff.can_try_now());

    backoff.report_error();
    assert!(!backoff.can_try_now());
    assert_eq!(
        backoff.time_remaining_until_retry(),
        Duration::from_millis(100)
    );

    // Second consecutive error doubles the window.
    backoff.report_error();
    assert_eq!(
        backoff.time_remaining_until_retry(),
        Duration::from_millis(200)
    );

    // The window is capped.
    backoff.report_error();
    backoff.report_error();
    assert_eq!(
        backoff.time_remaining_until_retry(),
        Duration::from_millis(400)
    );

    // Waiting out the window re-allows attempts.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(backoff.can_try_now());

    backoff.report_success();
    backoff.report_error();
    assert_eq!(
        backoff.time_remaining_until_retry(),
        Duration::from_millis(100)
    );
}
