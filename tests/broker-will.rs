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

use common::{connect_with_will, TestBroker, TestClient};
use mqtt_broker_mio::packet::property::Property;
use mqtt_broker_mio::packet::{Connect, Disconnect, Packet, Qos};
use mqtt_broker_mio::reason_code::ReasonCode;

#[test]
fn will_published_on_ungraceful_close() {
    let broker = TestBroker::start();

    let mut watcher = TestClient::connect_tcp(broker.addr);
    watcher.mqtt_connect("watcher", true);
    watcher.subscribe("wills/device", Qos::AtMostOnce);

    let mut doomed = TestClient::connect_tcp(broker.addr);
    doomed.mqtt_connect_with(connect_with_will("doomed", "wills/device", b"it died", None));

    // Dropping the socket without DISCONNECT is an ungraceful end.
    drop(doomed);

    let publish = watcher.recv_publish();
    assert_eq!(publish.topic, "wills/device");
    assert_eq!(publish.payload.as_ref(), b"it died");
}

#[test]
fn normal_disconnect_discards_the_will() {
    let broker = TestBroker::start();

    let mut watcher = TestClient::connect_tcp(broker.addr);
    watcher.mqtt_connect("watcher", true);
    watcher.subscribe("wills/polite", Qos::AtMostOnce);

    let mut polite = TestClient::connect_tcp(broker.addr);
    polite.mqtt_connect_with(connect_with_will("polite", "wills/polite", b"never", None));
    polite.send(&Packet::Disconnect(Disconnect::new(
        ReasonCode::NORMAL_DISCONNECTION,
    )));

    assert!(watcher.try_recv(Duration::from_secs(1)).is_none());
}

#[test]
fn disconnect_with_will_keeps_the_will() {
    let broker = TestBroker::start();

    let mut watcher = TestClient::connect_tcp(broker.addr);
    watcher.mqtt_connect("watcher", true);
    watcher.subscribe("wills/explicit", Qos::AtMostOnce);

    let mut leaver = TestClient::connect_tcp(broker.addr);
    leaver.mqtt_connect_with(connect_with_will(
        "leaver",
        "wills/explicit",
        b"on purpose",
        None,
    ));
    leaver.send(&Packet::Disconnect(Disconnect::new(
        ReasonCode::DisconnectWithWill,
    )));

    let publish = watcher.recv_publish();
    assert_eq!(publish.payload.as_ref(), b"on purpose");
}

#[test]
fn will_delay_postpones_delivery() {
    let broker = TestBroker::start();

    let mut watcher = TestClient::connect_tcp(broker.addr);
    watcher.mqtt_connect("watcher", true);
    watcher.subscribe("wills/delayed", Qos::AtMostOnce);

    let mut doomed = TestClient::connect_tcp(broker.addr);
    let mut connect = connect_with_will("delayed", "wills/delayed", b"late news", Some(1));
    // Retention is required for the delay window to exist.
    connect
        .properties
        .push(Property::SessionExpiryInterval(30));
    doomed.mqtt_connect_with(connect);
    drop(doomed);

    assert!(
        watcher.try_recv(Duration::from_millis(500)).is_none(),
        "will must wait out its delay"
    );
    let publish = watcher.recv_publish();
    assert_eq!(publish.payload.as_ref(), b"late news");
}

#[test]
fn reconnect_within_delay_cancels_the_will() {
    let broker = TestBroker::start();

    let mut watcher = TestClient::connect_tcp(broker.addr);
    watcher.mqtt_connect("watcher", true);
    watcher.subscribe("wills/cancelled", Qos::AtMostOnce);

    let mut doomed = TestClient::connect_tcp(broker.addr);
    let mut connect = connect_with_will("phoenix", "wills/cancelled", b"not yet", Some(2));
    connect.clean_start = false;
    connect
        .properties
        .push(Property::SessionExpiryInterval(30));
    doomed.mqtt_connect_with(connect);
    drop(doomed);

    // Resume before the delay elapses; the pending will is dropped.
    std::thread::sleep(Duration::from_millis(300));
    let mut revived = TestClient::connect_tcp(broker.addr);
    let connack = revived.mqtt_connect_session("phoenix", false, 30);
    assert!(connack.session_present);

    assert!(
        watcher.try_recv(Duration::from_secs(3)).is_none(),
        "cancelled will must not be published"
    );
}

#[test]
fn will_qos_above_broker_maximum_is_rejected() {
    let config = mqtt_broker_mio::config::BrokerConfig {
        maximum_qos: Qos::AtMostOnce,
        ..Default::default()
    };
    let broker = TestBroker::start_with(config);

    let mut client = TestClient::connect_tcp(broker.addr);
    let mut connect: Connect = connect_with_will("greedy", "w", b"x", None);
    connect.will.as_mut().expect("will present").qos = Qos::ExactlyOnce;
    let connack = client.mqtt_connect_with(connect);
    assert_eq!(connack.reason_code, ReasonCode::QosNotSupported);
}
