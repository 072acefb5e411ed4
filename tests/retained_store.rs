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

use std::time::{Duration, Instant};

use bytes::Bytes;

use mqtt_broker_mio::packet::property::Property;
use mqtt_broker_mio::packet::Qos;
use mqtt_broker_mio::retained_store::RetainedStore;

#[test]
fn store_and_retrieve_exact_match() {
    let mut store = RetainedStore::new();
    let now = Instant::now();

    store.store(
        "sport/tennis/score",
        Qos::AtLeastOnce,
        Bytes::from_static(b"15-30"),
        vec![],
        now,
    );

    let messages = store.get_matching("sport/tennis/score", now);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic_name, "sport/tennis/score");
    assert_eq!(messages[0].qos, Qos::AtLeastOnce);
    assert_eq!(messages[0].payload.as_ref(), b"15-30");
}

#[test]
fn store_overwrite() {
    let mut store = RetainedStore::new();
    let now = Instant::now();

    store.store(
        "topic/test",
        Qos::AtMostOnce,
        Bytes::from_static(b"first"),
        vec![],
        now,
    );
    store.store(
        "topic/test",
        Qos::ExactlyOnce,
        Bytes::from_static(b"second"),
        vec![],
        now,
    );

    let messages = store.get_matching("topic/test", now);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload.as_ref(), b"second");
    assert_eq!(messages[0].qos, Qos::ExactlyOnce);
}

#[test]
fn remove_message() {
    let mut store = RetainedStore::new();
    let now = Instant::now();

    store.store(
        "topic/remove",
        Qos::AtMostOnce,
        Bytes::from_static(b"data"),
        vec![],
        now,
    );
    assert!(store.remove("topic/remove"));
    assert!(!store.remove("topic/remove"));
    assert!(store.get_matching("topic/remove", now).is_empty());
}

#[test]
fn wildcard_collection() {
    let mut store = RetainedStore::new();
    let now = Instant::now();

    store.store("sport/tennis/score", Qos::AtMostOnce, Bytes::from_static(b"a"), vec![], now);
    store.store("sport/golf/score", Qos::AtMostOnce, Bytes::from_static(b"b"), vec![], now);
    store.store("sport/golf/player", Qos::AtMostOnce, Bytes::from_static(b"c"), vec![], now);

    let mut topics: Vec<&str> = store
        .get_matching("sport/+/score", now)
        .into_iter()
        .map(|m| m.topic_name.as_str())
        .collect();
    topics.sort();
    assert_eq!(topics, vec!["sport/golf/score", "sport/tennis/score"]);

    assert_eq!(store.get_matching("sport/#", now).len(), 3);
    assert_eq!(store.get_matching("#", now).len(), 3);
}

#[test]
fn root_wildcards_skip_dollar_topics() {
    let mut store = RetainedStore::new();
    let now = Instant::now();

    store.store("$SYS/broker/uptime", Qos::AtMostOnce, Bytes::from_static(b"1"), vec![], now);
    store.store("normal", Qos::AtMostOnce, Bytes::from_static(b"2"), vec![], now);

    assert_eq!(store.get_matching("#", now).len(), 1);
    assert!(store.get_matching("+/broker/uptime", now).is_empty());
    assert_eq!(store.get_matching("$SYS/#", now).len(), 1);
}

#[test]
fn message_expiry_skips_and_prunes() {
    let mut store = RetainedStore::new();
    let now = Instant::now();

    store.store(
        "ttl/topic",
        Qos::AtMostOnce,
        Bytes::from_static(b"soon gone"),
        vec![Property::MessageExpiryInterval(10)],
        now,
    );
    store.store(
        "keep/topic",
        Qos::AtMostOnce,
        Bytes::from_static(b"stays"),
        vec![],
        now,
    );

    // Within the window the entry is visible.
    assert_eq!(store.get_matching("ttl/topic", now).len(), 1);

    // Past the deadline it is skipped on read and removed by pruning.
    let later = now + Duration::from_secs(11);
    assert!(store.get_matching("ttl/topic", later).is_empty());
    store.prune_expired(later);
    assert!(store.get_matching("ttl/topic", later).is_empty());
    assert_eq!(store.get_matching("keep/topic", later).len(), 1);
}
