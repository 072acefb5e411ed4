// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use mqtt_broker_mio::packet::{Qos, SubscriptionOptions};
use mqtt_broker_mio::subscription_store::{topic_matches_filter, SubscriptionStore};

fn opts(qos: Qos) -> SubscriptionOptions {
    SubscriptionOptions {
        qos,
        ..SubscriptionOptions::default()
    }
}

fn client_ids(store: &SubscriptionStore, topic: &str) -> Vec<String> {
    let mut ids: Vec<String> = store
        .find_subscribers(topic)
        .into_iter()
        .map(|m| m.client_id)
        .collect();
    ids.sort();
    ids
}

#[test]
fn exact_match() {
    let mut store = SubscriptionStore::new();
    store
        .subscribe("c1", "sport/tennis/score", opts(Qos::AtMostOnce), None)
        .unwrap();
    assert_eq!(client_ids(&store, "sport/tennis/score"), vec!["c1"]);
    assert!(client_ids(&store, "sport/tennis").is_empty());
    assert!(client_ids(&store, "sport/tennis/score/set").is_empty());
}

#[test]
fn single_level_wildcard() {
    let mut store = SubscriptionStore::new();
    store
        .subscribe("c1", "sport/+/score", opts(Qos::AtMostOnce), None)
        .unwrap();
    assert_eq!(client_ids(&store, "sport/tennis/score"), vec!["c1"]);
    assert_eq!(client_ids(&store, "sport/golf/score"), vec!["c1"]);
    assert!(client_ids(&store, "sport/tennis/player1").is_empty());
    assert!(client_ids(&store, "sport/score").is_empty());
}

#[test]
fn multi_level_wildcard_matches_empty_suffix() {
    let mut store = SubscriptionStore::new();
    store
        .subscribe("c1", "sport/#", opts(Qos::AtMostOnce), None)
        .unwrap();
    assert_eq!(client_ids(&store, "sport"), vec!["c1"]);
    assert_eq!(client_ids(&store, "sport/tennis"), vec!["c1"]);
    assert_eq!(client_ids(&store, "sport/tennis/score/set"), vec!["c1"]);
    assert!(client_ids(&store, "other").is_empty());
}

#[test]
fn root_wildcards_skip_dollar_topics() {
    let mut store = SubscriptionStore::new();
    store.subscribe("all", "#", opts(Qos::AtMostOnce), None).unwrap();
    store
        .subscribe("plus", "+/monitor", opts(Qos::AtMostOnce), None)
        .unwrap();
    store
        .subscribe("sys", "$SYS/#", opts(Qos::AtMostOnce), None)
        .unwrap();

    assert_eq!(client_ids(&store, "$SYS/broker/clients"), vec!["sys"]);
    assert!(!client_ids(&store, "$SYS/monitor").contains(&"plus".to_string()));
    assert_eq!(client_ids(&store, "normal/topic"), vec!["all"]);
}

#[test]
fn overlapping_filters_both_match() {
    let mut store = SubscriptionStore::new();
    store
        .subscribe("c1", "a/b", opts(Qos::AtMostOnce), None)
        .unwrap();
    store
        .subscribe("c2", "a/+", opts(Qos::AtLeastOnce), None)
        .unwrap();
    store
        .subscribe("c3", "a/#", opts(Qos::ExactlyOnce), None)
        .unwrap();
    assert_eq!(client_ids(&store, "a/b"), vec!["c1", "c2", "c3"]);
}

#[test]
fn upsert_reports_is_new() {
    let mut store = SubscriptionStore::new();
    assert!(store
        .subscribe("c1", "a/b", opts(Qos::AtMostOnce), None)
        .unwrap());
    // Same client and filter: update, not new.
    assert!(!store
        .subscribe("c1", "a/b", opts(Qos::AtLeastOnce), Some(3))
        .unwrap());
    let matched = store.find_subscribers("a/b");
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].options.qos, Qos::AtLeastOnce);
    assert_eq!(matched[0].sub_id, Some(3));
}

#[test]
fn unsubscribe_and_unsubscribe_all() {
    let mut store = SubscriptionStore::new();
    store.subscribe("c1", "a/b", opts(Qos::AtMostOnce), None).unwrap();
    store.subscribe("c1", "x/+", opts(Qos::AtMostOnce), None).unwrap();
    store.subscribe("c2", "a/b", opts(Qos::AtMostOnce), None).unwrap();

    assert!(store.unsubscribe("c1", "a/b").unwrap());
    assert!(!store.unsubscribe("c1", "a/b").unwrap());
    assert_eq!(client_ids(&store, "a/b"), vec!["c2"]);

    store.unsubscribe_all("c1");
    assert!(client_ids(&store, "x/y").is_empty());
    assert_eq!(client_ids(&store, "a/b"), vec!["c2"]);
}

#[test]
fn client_subscriptions_lists_all_filters() {
    let mut store = SubscriptionStore::new();
    store.subscribe("c1", "a/b", opts(Qos::AtMostOnce), None).unwrap();
    store.subscribe("c1", "x/+", opts(Qos::AtMostOnce), None).unwrap();
    store.subscribe("c1", "y/#", opts(Qos::AtMostOnce), None).unwrap();
    let mut filters: Vec<String> = store
        .client_subscriptions("c1")
        .into_iter()
        .map(|s| s.topic_filter)
        .collect();
    filters.sort();
    assert_eq!(filters, vec!["a/b", "x/+", "y/#"]);
}

#[test]
fn filter_validation() {
    assert!(SubscriptionStore::validate_topic_filter("sport/+/score").is_ok());
    assert!(SubscriptionStore::validate_topic_filter("#").is_ok());
    assert!(SubscriptionStore::validate_topic_filter("sport/#").is_ok());
    assert!(SubscriptionStore::validate_topic_filter("").is_err());
    assert!(SubscriptionStore::validate_topic_filter("sport/#/more").is_err());
    assert!(SubscriptionStore::validate_topic_filter("sport/ten+nis").is_err());
    assert!(SubscriptionStore::validate_topic_filter("sport/ten#nis").is_err());
}

#[test]
fn matcher_agrees_with_spec_rules() {
    assert!(topic_matches_filter("sport/tennis/#", "sport/tennis"));
    assert!(topic_matches_filter("sport/tennis/#", "sport/tennis/score/set"));
    assert!(topic_matches_filter("sport/+/score", "sport/tennis/score"));
    assert!(!topic_matches_filter("sport/+/score", "sport/tennis/player1"));
    assert!(!topic_matches_filter("sport/+", "sport/tennis/score"));
    assert!(topic_matches_filter("#", "anything/at/all"));
    assert!(!topic_matches_filter("#", "$SYS/broker"));
    assert!(!topic_matches_filter("+/monitor", "$SYS/monitor"));
    assert!(topic_matches_filter("$SYS/#", "$SYS/broker"));
}
