// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event channels and the events they carry.
//!
//! Every event kind gets its own multi-subscriber channel. Emitting never
//! blocks and never fails: an event with no subscriber is dropped.

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::trace;

use crate::bluetooth::{BluetoothSocket, Device, SocketKey};

/// Multi-subscriber channel for one event kind.
#[derive(Debug)]
pub struct EventChannel<T: Clone> {
    name: &'static str,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + std::fmt::Debug> EventChannel<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { name, tx }
    }

    /// Register a new subscriber. It sees events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: T) {
        trace!("{} <- {:?}", self.name, event);
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Why a socket reached CLOSED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller invoked `close`.
    Requested,
    /// The read loop hit a disconnect or I/O failure.
    TransportError { cause: String },
}

impl CloseReason {
    pub fn has_error(&self) -> bool {
        matches!(self, CloseReason::TransportError { .. })
    }
}

/// Events for a single client or accepted socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Socket reached OPENED.
    Connected { socket_key: SocketKey, address: String },
    /// One framed message arrived.
    DataReceived { socket_key: SocketKey, data: Vec<u8> },
    /// Unsolicited failure with no caller waiting on it.
    Error { socket_key: SocketKey, message: String },
    /// Socket reached CLOSED.
    Closed { socket_key: SocketKey, reason: CloseReason },
}

impl SocketEvent {
    pub fn socket_key(&self) -> &SocketKey {
        match self {
            Self::Connected { socket_key, .. }
            | Self::DataReceived { socket_key, .. }
            | Self::Error { socket_key, .. }
            | Self::Closed { socket_key, .. } => socket_key,
        }
    }

    /// Payload in the shape dispatched across the RPC boundary.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Connected {
                socket_key,
                address,
            } => json!({
                "type": "Connected",
                "socketKey": socket_key.as_str(),
                "address": address,
            }),
            Self::DataReceived { socket_key, data } => json!({
                "type": "DataReceived",
                "socketKey": socket_key.as_str(),
                "data": data,
            }),
            Self::Error {
                socket_key,
                message,
            } => json!({
                "type": "Error",
                "socketKey": socket_key.as_str(),
                "errorMessage": message,
            }),
            Self::Closed { socket_key, reason } => json!({
                "type": "Close",
                "socketKey": socket_key.as_str(),
                "hasError": reason.has_error(),
            }),
        }
    }
}

/// Events for a listening server socket.
#[derive(Debug, Clone)]
pub enum ServerSocketEvent {
    /// An inbound connection was accepted; the child is already OPENED.
    Connected {
        server_socket_key: SocketKey,
        socket: BluetoothSocket,
        address: String,
        name: String,
    },
    /// The server reached STOPPED.
    Stopped {
        server_socket_key: SocketKey,
        has_error: bool,
    },
}

impl ServerSocketEvent {
    pub fn server_socket_key(&self) -> &SocketKey {
        match self {
            Self::Connected {
                server_socket_key, ..
            }
            | Self::Stopped {
                server_socket_key, ..
            } => server_socket_key,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Connected {
                server_socket_key,
                socket,
                address,
                name,
            } => json!({
                "type": "Connected",
                "serverSocketKey": server_socket_key.as_str(),
                "socketKey": socket.key().as_str(),
                "address": address,
                "name": name,
            }),
            Self::Stopped {
                server_socket_key,
                has_error,
            } => json!({
                "type": "Stopped",
                "serverSocketKey": server_socket_key.as_str(),
                "hasError": has_error,
            }),
        }
    }
}

/// Reconciled discovery feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Discovered(Device),
    Gone(Device),
}

impl DiscoveryEvent {
    pub fn device(&self) -> &Device {
        match self {
            Self::Discovered(device) | Self::Gone(device) => device,
        }
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_event() {
        let channel: EventChannel<u32> = EventChannel::new("test", 8);
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        channel.emit(7);

        assert_eq!(first.recv().await.unwrap(), 7);
        assert_eq!(second.recv().await.unwrap(), 7);
        assert_eq!(channel.subscriber_count(), 2);
    }

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let channel: EventChannel<u32> = EventChannel::new("test", 8);
        channel.emit(1);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn test_close_wire_shape() {
        let key = SocketKey::from("k1");
        let requested = SocketEvent::Closed {
            socket_key: key.clone(),
            reason: CloseReason::Requested,
        };
        let failed = SocketEvent::Closed {
            socket_key: key,
            reason: CloseReason::TransportError {
                cause: "reset".to_string(),
            },
        };

        assert_eq!(requested.to_json()["type"], "Close");
        assert_eq!(requested.to_json()["hasError"], false);
        assert_eq!(failed.to_json()["hasError"], true);
        assert_eq!(failed.to_json()["socketKey"], "k1");
    }

    #[test]
    fn test_data_wire_shape() {
        let event = SocketEvent::DataReceived {
            socket_key: SocketKey::from("k1"),
            data: vec![1, 2, 3],
        };
        assert_eq!(event.to_json()["data"], json!([1, 2, 3]));
    }
}
