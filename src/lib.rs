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

//! A single-process MQTT v5 broker: one thread multiplexes listener, client
//! and cluster peer sockets through readiness selection, drives the packet
//! codec and per-connection state machines, and owns all routing state.

pub mod auth_impl;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod packet;
pub mod reason_code;
pub mod retained_store;
pub mod server;
pub mod session_store;
pub mod shared_subscription_manager;
pub mod storage;
pub mod subscription_store;
pub mod tracing_setup;

pub use auth_impl::{AllowAll, AuthDecision, Authenticator, Security};
pub use broker::{Broker, Origin};
pub use config::{BrokerConfig, ClusterSettings, TlsSettings};
pub use error::{MqttError, Result};
pub use reason_code::ReasonCode;
pub use server::Server;
pub use storage::{DirStorage, NoopStorage, SessionStorage};
