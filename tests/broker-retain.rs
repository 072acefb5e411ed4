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

mod common;

use std::time::Duration;

use common::{opts_with_retain_handling, TestBroker, TestClient};
use mqtt_broker_mio::packet::{Qos, RetainHandling, SubscriptionOptions};

#[test]
fn retained_message_delivered_to_new_subscriber() {
    let broker = TestBroker::start();

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("status/device1", b"online", true);

    // Give the single-threaded loop a moment to store the message.
    std::thread::sleep(Duration::from_millis(100));

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.subscribe("status/+", Qos::AtMostOnce);

    let publish = subscriber.recv_publish();
    assert_eq!(publish.topic, "status/device1");
    assert_eq!(publish.payload.as_ref(), b"online");
    assert!(publish.retain, "retained replay carries retain=1");
}

#[test]
fn retained_message_replaced_by_newer_publish() {
    let broker = TestBroker::start();

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("status/x", b"first", true);
    publisher.publish_qos0("status/x", b"second", true);
    std::thread::sleep(Duration::from_millis(100));

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.subscribe("status/x", Qos::AtMostOnce);

    assert_eq!(subscriber.recv_publish().payload.as_ref(), b"second");
    assert!(subscriber.try_recv(Duration::from_millis(300)).is_none());
}

#[test]
fn empty_retained_payload_clears_the_store() {
    let broker = TestBroker::start();

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("gone/topic", b"was here", true);
    std::thread::sleep(Duration::from_millis(100));
    publisher.publish_qos0("gone/topic", b"", true);
    std::thread::sleep(Duration::from_millis(100));

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.subscribe("gone/topic", Qos::AtMostOnce);

    assert!(
        subscriber.try_recv(Duration::from_millis(300)).is_none(),
        "tombstone removes the retained entry"
    );
}

#[test]
fn retain_handling_do_not_send() {
    let broker = TestBroker::start();

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("rh/topic", b"retained", true);
    std::thread::sleep(Duration::from_millis(100));

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.subscribe_opts(
        "rh/topic",
        opts_with_retain_handling(Qos::AtMostOnce, RetainHandling::DoNotSend),
    );
    assert!(subscriber.try_recv(Duration::from_millis(300)).is_none());
}

#[test]
fn retain_handling_send_if_new_skips_existing_subscription() {
    let broker = TestBroker::start();

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("rh/new", b"retained", true);
    std::thread::sleep(Duration::from_millis(100));

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);

    // First subscribe: new, replayed.
    subscriber.subscribe_opts(
        "rh/new",
        opts_with_retain_handling(Qos::AtMostOnce, RetainHandling::SendIfNew),
    );
    assert_eq!(subscriber.recv_publish().payload.as_ref(), b"retained");

    // Second subscribe to the same filter: not new, not replayed.
    subscriber.subscribe_opts(
        "rh/new",
        opts_with_retain_handling(Qos::AtMostOnce, RetainHandling::SendIfNew),
    );
    assert!(subscriber.try_recv(Duration::from_millis(300)).is_none());
}

#[test]
fn live_publish_clears_retain_flag_unless_retain_as_published() {
    let broker = TestBroker::start();

    let mut plain = TestClient::connect_tcp(broker.addr);
    plain.mqtt_connect("plain", true);
    plain.subscribe("rap/topic", Qos::AtMostOnce);

    let mut rap = TestClient::connect_tcp(broker.addr);
    rap.mqtt_connect("rap", true);
    rap.subscribe_opts(
        "rap/topic",
        SubscriptionOptions {
            qos: Qos::AtMostOnce,
            retain_as_published: true,
            ..SubscriptionOptions::default()
        },
    );

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("rap/topic", b"flagged", true);

    assert!(!plain.recv_publish().retain, "retain cleared without RAP");
    assert!(rap.recv_publish().retain, "retain kept with RAP");
}
