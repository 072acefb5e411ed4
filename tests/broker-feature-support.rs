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

use common::{TestBroker, TestClient};
use mqtt_broker_mio::config::BrokerConfig;
use mqtt_broker_mio::packet::{Packet, Qos, Subscribe, SubscriptionOptions};
use mqtt_broker_mio::reason_code::ReasonCode;

#[test]
fn subscription_qos_capped_at_maximum_qos() {
    let config = BrokerConfig {
        maximum_qos: Qos::AtLeastOnce,
        ..Default::default()
    };
    let broker = TestBroker::start_with(config);

    let mut client = TestClient::connect_tcp(broker.addr);
    client.mqtt_connect("capped", true);
    let suback = client.subscribe("t", Qos::ExactlyOnce);
    assert_eq!(suback.reason_codes, vec![ReasonCode::GrantedQos1]);
}

#[test]
fn publish_above_maximum_qos_is_disconnected() {
    let config = BrokerConfig {
        maximum_qos: Qos::AtMostOnce,
        ..Default::default()
    };
    let broker = TestBroker::start_with(config);

    let mut client = TestClient::connect_tcp(broker.addr);
    client.mqtt_connect("pushy", true);
    let _ = client.publish_qos1_no_wait("t", b"too much", 1);
    match client.recv() {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code, ReasonCode::QosNotSupported);
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
}

#[test]
fn wildcard_subscriptions_can_be_disabled() {
    let config = BrokerConfig {
        wildcard_subscription_available: false,
        ..Default::default()
    };
    let broker = TestBroker::start_with(config);

    let mut client = TestClient::connect_tcp(broker.addr);
    client.mqtt_connect("nowild", true);
    let suback = client.subscribe("a/+/b", Qos::AtMostOnce);
    assert_eq!(
        suback.reason_codes,
        vec![ReasonCode::WildcardSubscriptionsNotSupported]
    );
    // Plain filters still subscribe.
    let suback = client.subscribe("a/b", Qos::AtMostOnce);
    assert_eq!(suback.reason_codes, vec![ReasonCode::GRANTED_QOS_0]);
}

#[test]
fn shared_subscriptions_can_be_disabled() {
    let config = BrokerConfig {
        shared_subscription_available: false,
        ..Default::default()
    };
    let broker = TestBroker::start_with(config);

    let mut client = TestClient::connect_tcp(broker.addr);
    client.mqtt_connect("noshare", true);
    let suback = client.subscribe("$share/g/t", Qos::AtMostOnce);
    assert_eq!(
        suback.reason_codes,
        vec![ReasonCode::SharedSubscriptionsNotSupported]
    );
}

#[test]
fn retained_publish_rejected_when_retain_unavailable() {
    let config = BrokerConfig {
        retain_available: false,
        ..Default::default()
    };
    let broker = TestBroker::start_with(config);

    let mut client = TestClient::connect_tcp(broker.addr);
    client.mqtt_connect("noretain", true);
    client.publish_qos0("t", b"keep me", true);
    match client.recv() {
        Packet::Disconnect(disconnect) => {
            assert_eq!(disconnect.reason_code, ReasonCode::RetainNotSupported);
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
}

#[test]
fn subscription_identifier_rejected_when_unavailable() {
    let config = BrokerConfig {
        subscription_identifier_available: false,
        ..Default::default()
    };
    let broker = TestBroker::start_with(config);

    let mut client = TestClient::connect_tcp(broker.addr);
    client.mqtt_connect("noids", true);
    client.send(&Packet::Subscribe(Subscribe {
        packet_id: 1,
        properties: vec![mqtt_broker_mio::packet::Property::SubscriptionIdentifier(5)],
        filters: vec![("t".to_string(), SubscriptionOptions::default())],
    }));
    match client.recv() {
        Packet::Disconnect(disconnect) => {
            assert_eq!(
                disconnect.reason_code,
                ReasonCode::SubscriptionIdentifiersNotSupported
            );
        }
        other => panic!("expected DISCONNECT, got {other:?}"),
    }
}

#[test]
fn subscription_identifier_echoed_on_delivery() {
    let broker = TestBroker::start();

    let mut subscriber = TestClient::connect_tcp(broker.addr);
    subscriber.mqtt_connect("sub", true);
    subscriber.send(&Packet::Subscribe(Subscribe {
        packet_id: 1,
        properties: vec![mqtt_broker_mio::packet::Property::SubscriptionIdentifier(42)],
        filters: vec![("ids/topic".to_string(), SubscriptionOptions::default())],
    }));
    match subscriber.recv() {
        Packet::Suback(_) => {}
        other => panic!("expected SUBACK, got {other:?}"),
    }

    let mut publisher = TestClient::connect_tcp(broker.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("ids/topic", b"tagged", false);

    let publish = subscriber.recv_publish();
    assert!(publish
        .properties
        .contains(&mqtt_broker_mio::packet::Property::SubscriptionIdentifier(42)));
}

#[test]
fn inbound_packet_too_large_is_rejected() {
    let config = BrokerConfig {
        maximum_packet_size: Some(64),
        ..Default::default()
    };
    let broker = TestBroker::start_with(config);

    let mut client = TestClient::connect_tcp(broker.addr);
    let connack = client.mqtt_connect("tiny", true);
    assert!(connack
        .properties
        .contains(&mqtt_broker_mio::packet::Property::MaximumPacketSize(64)));

    client.publish_qos0("big/topic", &[0u8; 256], false);
    match client.try_recv(Duration::from_secs(2)) {
        Some(Packet::Disconnect(disconnect)) => {
            assert_eq!(disconnect.reason_code, ReasonCode::PacketTooLarge);
        }
        Some(other) => panic!("expected DISCONNECT, got {other:?}"),
        None => panic!("oversize packet must disconnect"),
    }
}
