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

//! Client-visible RFCOMM socket.

use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use super::registry::SocketRegistry;
use crate::error::Result;
use crate::events::SocketEvent;

/// Identifier of a socket or server socket across the native boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketKey(String);

impl SocketKey {
    /// Fresh random key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SocketKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for SocketKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one connection.
///
/// ```text
/// CLOSED -> OPENING -> OPENED -> CLOSING -> CLOSED
///              |          |
///              +-> CLOSED +-> CLOSED (transport error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    #[default]
    Closed,
    Opening,
    Opened,
    Closing,
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Closed => "CLOSED",
            SocketState::Opening => "OPENING",
            SocketState::Opened => "OPENED",
            SocketState::Closing => "CLOSING",
        }
    }
}

/// Handle to one keyed socket.
///
/// The handle holds no state of its own; every call goes through the shared
/// registry, so clones of a handle always agree.
#[derive(Clone)]
pub struct BluetoothSocket {
    key: SocketKey,
    registry: Arc<SocketRegistry>,
}

impl BluetoothSocket {
    pub(crate) fn new(key: SocketKey, registry: Arc<SocketRegistry>) -> Self {
        Self { key, registry }
    }

    pub fn key(&self) -> &SocketKey {
        &self.key
    }

    pub fn state(&self) -> SocketState {
        self.registry.state(&self.key)
    }

    /// Remote address while the socket is open.
    pub fn peer_address(&self) -> Option<String> {
        self.registry.peer_address(&self.key)
    }

    /// Connect to `address`. Only valid from CLOSED.
    pub async fn open(&self, address: &str) -> Result<()> {
        self.registry.open(&self.key, address).await
    }

    /// Send one message. Only valid in OPENED.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.registry.write(&self.key, data).await
    }

    /// Half-close the write direction. Only valid in OPENED.
    pub async fn shutdown_write(&self) -> Result<()> {
        self.registry.shutdown_write(&self.key).await
    }

    /// Close the socket. Only valid in OPENED.
    pub async fn close(&self) -> Result<()> {
        self.registry.close(&self.key).await
    }

    /// Events addressed to this socket.
    pub fn subscribe(&self) -> SocketEvents {
        SocketEvents {
            key: self.key.clone(),
            rx: self.registry.subscribe(),
        }
    }
}

impl fmt::Debug for BluetoothSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluetoothSocket")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Event feed filtered to one socket key.
pub struct SocketEvents {
    key: SocketKey,
    rx: broadcast::Receiver<SocketEvent>,
}

impl SocketEvents {
    /// Next event for this socket, `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.socket_key() == &self.key => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Socket {} subscriber lagged by {} events", self.key, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<SocketEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.socket_key() == &self.key => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
