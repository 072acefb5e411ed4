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

use thiserror::Error;

use crate::reason_code::ReasonCode;

/// Broker error taxonomy.
///
/// `Protocol` and `Resource` carry the MQTT v5 reason code that the
/// connection layer turns into a DISCONNECT-and-close decision. `Transport`
/// closes the socket without a DISCONNECT. `Internal` maps to
/// ImplementationSpecificError; the offending connection is closed and the
/// process stays live.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("protocol violation: {0:?}")]
    Protocol(ReasonCode),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("resource limit exceeded: {0:?}")]
    Resource(ReasonCode),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MqttError>;

impl MqttError {
    pub fn malformed() -> Self {
        MqttError::Protocol(ReasonCode::MalformedPacket)
    }

    pub fn protocol() -> Self {
        MqttError::Protocol(ReasonCode::ProtocolError)
    }

    /// Reason code to put in the DISCONNECT sent before closing.
    pub fn reason(&self) -> ReasonCode {
        match self {
            MqttError::Protocol(rc) | MqttError::Resource(rc) => *rc,
            MqttError::Transport(_) => ReasonCode::UnspecifiedError,
            MqttError::Internal(_) => ReasonCode::ImplementationSpecificError,
        }
    }

    /// Transport failures close the socket without a DISCONNECT.
    pub fn send_disconnect(&self) -> bool {
        !matches!(self, MqttError::Transport(_))
    }
}
