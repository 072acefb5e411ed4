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

use bytes::{Bytes, BytesMut};
use common::{TestBroker, TestClient};
use mqtt_broker_mio::cluster::{take_frames, PeerFrame};
use mqtt_broker_mio::packet::property::Property;
use mqtt_broker_mio::packet::Qos;
use uuid::Uuid;

#[test]
fn peer_frames_round_trip() {
    let frames = vec![
        PeerFrame::Hello {
            node_id: Uuid::new_v4(),
        },
        PeerFrame::SubAdd {
            filter: "sport/+/score".to_string(),
        },
        PeerFrame::SubRemove {
            filter: "sport/+/score".to_string(),
        },
        PeerFrame::Forward {
            origin: Uuid::new_v4(),
            topic: "a/b".to_string(),
            qos: Qos::AtLeastOnce,
            retain: true,
            properties: vec![Property::MessageExpiryInterval(9)],
            payload: Bytes::from_static(b"forwarded"),
        },
    ];

    let mut buf = BytesMut::new();
    for frame in &frames {
        buf.extend_from_slice(&frame.encode());
    }
    let decoded = take_frames(&mut buf).expect("frames decode");
    assert_eq!(decoded, frames);
    assert!(buf.is_empty());
}

#[test]
fn partial_peer_frame_waits_for_more_bytes() {
    let frame = PeerFrame::SubAdd {
        filter: "x/y".to_string(),
    }
    .encode();
    for cut in 0..frame.len() {
        let mut buf = BytesMut::from(&frame[..cut]);
        let decoded = take_frames(&mut buf).expect("prefix never errors");
        assert!(decoded.is_empty(), "cut={cut}");
    }
}

#[test]
fn publish_crosses_the_cluster_to_remote_subscriber() {
    // Broker A hosts the subscriber; broker B dials A at startup and
    // forwards publishes matching A's replayed interest.
    let a = TestBroker::start_clustered(None);
    let b = TestBroker::start_clustered(a.cluster_addr);

    let mut subscriber = TestClient::connect_tcp(a.addr);
    subscriber.mqtt_connect("remote-sub", true);
    subscriber.subscribe("bridge/news", Qos::AtMostOnce);

    // Let the interest propagate over the peer link.
    std::thread::sleep(Duration::from_millis(300));

    let mut publisher = TestClient::connect_tcp(b.addr);
    publisher.mqtt_connect("local-pub", true);
    publisher.publish_qos0("bridge/news", b"across nodes", false);

    let publish = subscriber.recv_publish();
    assert_eq!(publish.topic, "bridge/news");
    assert_eq!(publish.payload.as_ref(), b"across nodes");

    // A topic nobody on A subscribed to is not forwarded back.
    publisher.publish_qos0("bridge/ignored", b"stays local", false);
    assert!(subscriber.try_recv(Duration::from_millis(400)).is_none());
}

#[test]
fn unsubscribe_withdraws_cluster_interest() {
    let a = TestBroker::start_clustered(None);
    let b = TestBroker::start_clustered(a.cluster_addr);

    let mut subscriber = TestClient::connect_tcp(a.addr);
    subscriber.mqtt_connect("fickle", true);
    subscriber.subscribe("with/drawn", Qos::AtMostOnce);
    std::thread::sleep(Duration::from_millis(300));

    subscriber.send(&mqtt_broker_mio::packet::Packet::Unsubscribe(
        mqtt_broker_mio::packet::Unsubscribe {
            packet_id: 2,
            properties: Vec::new(),
            filters: vec!["with/drawn".to_string()],
        },
    ));
    let _ = subscriber.recv();
    std::thread::sleep(Duration::from_millis(300));

    let mut publisher = TestClient::connect_tcp(b.addr);
    publisher.mqtt_connect("pub", true);
    publisher.publish_qos0("with/drawn", b"nobody home", false);
    assert!(subscriber.try_recv(Duration::from_millis(400)).is_none());
}
