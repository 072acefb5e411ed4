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

use bytes::Bytes;
use common::{TestBroker, TestClient};
use mqtt_broker_mio::packet::{Packet, PubResp, Publish, Qos, SubscriptionOptions};
use mqtt_broker_mio::reason_code::ReasonCode;

#[test]
fn wildcard_routing_delivers_exactly_one() {
    let broker = TestBroker::start();

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    let suback = subscriber.subscribe("sport/+/score", Qos::AtMostOnce);
    assert_eq!(suback.reason_codes, vec![ReasonCode::GRANTED_QOS_0]);

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("sport/tennis/score", b"40-15", false);

    let publish = subscriber.recv_publish();
    assert_eq!(publish.topic, "sport/tennis/score");
    assert_eq!(publish.payload.as_ref(), b"40-15");
    assert_eq!(publish.qos, Qos::AtMostOnce);
    assert!(!publish.retain);

    // A sibling topic does not match the filter.
    publisher.publish_qos0("sport/tennis/player1", b"x", false);
    assert!(subscriber.try_recv(Duration::from_millis(300)).is_none());
}

#[test]
fn publisher_receives_own_publish_unless_no_local() {
    let broker = TestBroker::start();

    let mut a = TestClient::connect_tcp(broker.addr);
    a.mqtt_connect("client-a", true);
    a.subscribe("room/1", Qos::AtMostOnce);

    let mut b = TestClient::connect_tcp(broker.addr);
    b.mqtt_connect("client-b", true);
    b.subscribe("room/1", Qos::AtMostOnce);

    a.publish_qos0("room/1", b"hello", false);
    assert_eq!(b.recv_publish().payload.as_ref(), b"hello");
    assert_eq!(a.recv_publish().payload.as_ref(), b"hello");

    // Re-subscribe with no-local: the publisher no longer hears itself.
    a.subscribe_opts(
        "room/1",
        SubscriptionOptions {
            qos: Qos::AtMostOnce,
            no_local: true,
            ..SubscriptionOptions::default()
        },
    );
    a.publish_qos0("room/1", b"again", false);
    assert_eq!(b.recv_publish().payload.as_ref(), b"again");
    assert!(a.try_recv(Duration::from_millis(300)).is_none());
}

#[test]
fn qos_downgrades_to_subscription_maximum() {
    let broker = TestBroker::start();

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.subscribe("t/qos", Qos::AtMostOnce);

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    let puback = publisher.publish_qos1("t/qos", b"downgraded", 21);
    assert_eq!(puback.reason_code, ReasonCode::Success);

    let publish = subscriber.recv_publish();
    assert_eq!(publish.qos, Qos::AtMostOnce);
    assert!(publish.packet_id.is_none());
}

#[test]
fn qos1_delivery_carries_packet_id() {
    let broker = TestBroker::start();

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.subscribe("t/ack", Qos::AtLeastOnce);

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos1("t/ack", b"payload", 7);

    let publish = subscriber.recv_publish();
    assert_eq!(publish.qos, Qos::AtLeastOnce);
    assert!(publish.packet_id.is_some());
    assert_eq!(publish.payload.as_ref(), b"payload");
}

#[test]
fn puback_reports_no_matching_subscribers() {
    let broker = TestBroker::start();
    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("lonely", true);
    let puback = publisher.publish_qos1("nobody/listens", b"void", 3);
    assert_eq!(puback.reason_code, ReasonCode::NoMatchingSubscribers);
}

#[test]
fn qos2_exactly_once_with_duplicate_publish() {
    let broker = TestBroker::start();

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.subscribe("t/once", Qos::ExactlyOnce);

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);

    let publish = Publish {
        dup: false,
        qos: Qos::ExactlyOnce,
        retain: false,
        topic: "t/once".to_string(),
        packet_id: Some(42),
        properties: Vec::new(),
        payload: Bytes::from_static(b"exactly once"),
    };
    publisher.send(&Packet::Publish(publish.clone()));
    match publisher.recv() {
        Packet::Pubrec(resp) => assert_eq!(resp.packet_id, 42),
        other => panic!("expected PUBREC, got {other:?}"),
    }

    // Delivery is deferred until the release.
    assert!(subscriber.try_recv(Duration::from_millis(300)).is_none());

    // A duplicate before PUBREL is acknowledged but not stored again.
    publisher.send(&Packet::Publish(Publish {
        dup: true,
        ..publish
    }));
    match publisher.recv() {
        Packet::Pubrec(resp) => assert_eq!(resp.packet_id, 42),
        other => panic!("expected PUBREC for duplicate, got {other:?}"),
    }

    publisher.send(&Packet::Pubrel(PubResp::new(42, ReasonCode::Success)));
    match publisher.recv() {
        Packet::Pubcomp(resp) => assert_eq!(resp.packet_id, 42),
        other => panic!("expected PUBCOMP, got {other:?}"),
    }

    // Exactly one delivery reaches the subscriber.
    let received = subscriber.recv();
    let Packet::Publish(received) = received else {
        panic!("expected PUBLISH");
    };
    assert_eq!(received.payload.as_ref(), b"exactly once");
    let pid = received.packet_id.expect("QoS2 delivery carries a packet id");
    subscriber.send(&Packet::Pubrec(PubResp::new(pid, ReasonCode::Success)));
    match subscriber.recv() {
        Packet::Pubrel(resp) => assert_eq!(resp.packet_id, pid),
        other => panic!("expected PUBREL, got {other:?}"),
    }
    subscriber.send(&Packet::Pubcomp(PubResp::new(pid, ReasonCode::Success)));

    assert!(subscriber.try_recv(Duration::from_millis(300)).is_none());
}

#[test]
fn unknown_pubrel_gets_packet_identifier_not_found() {
    let broker = TestBroker::start();
    let mut client = TestClient::connect_tcp(broker.addr);
    client.mqtt_connect("release-nothing", true);
    client.send(&Packet::Pubrel(PubResp::new(99, ReasonCode::Success)));
    match client.recv() {
        Packet::Pubcomp(resp) => {
            assert_eq!(resp.packet_id, 99);
            assert_eq!(resp.reason_code, ReasonCode::PacketIdentifierNotFound);
        }
        other => panic!("expected PUBCOMP, got {other:?}"),
    }
}

#[test]
fn unsubscribe_stops_delivery() {
    let broker = TestBroker::start();

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.subscribe("t/stop", Qos::AtMostOnce);

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("t/stop", b"one", false);
    assert_eq!(subscriber.recv_publish().payload.as_ref(), b"one");

    subscriber.send(&Packet::Unsubscribe(mqtt_broker_mio::packet::Unsubscribe {
        packet_id: 2,
        properties: Vec::new(),
        filters: vec!["t/stop".to_string()],
    }));
    match subscriber.recv() {
        Packet::Unsuback(unsuback) => {
            assert_eq!(unsuback.reason_codes, vec![ReasonCode::Success]);
        }
        other => panic!("expected UNSUBACK, got {other:?}"),
    }

    publisher.publish_qos0("t/stop", b"two", false);
    assert!(subscriber.try_recv(Duration::from_millis(300)).is_none());
}
