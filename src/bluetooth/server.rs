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

//! Listening RFCOMM server sockets.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::platform::{ListenOptions, StreamListener, Transport};
use super::registry::SocketRegistry;
use super::socket::{SocketKey, SocketState};
use crate::error::{BluetoothError, Result};
use crate::events::{EventChannel, ServerSocketEvent};
use crate::state::AdapterStatus;

/// Lifecycle of a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerSocketState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ServerSocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerSocketState::Stopped => "STOPPED",
            ServerSocketState::Starting => "STARTING",
            ServerSocketState::Started => "STARTED",
            ServerSocketState::Stopping => "STOPPING",
        }
    }
}

struct ServerRecord {
    state: ServerSocketState,
    stop: Arc<Notify>,
    accept: Option<JoinHandle<()>>,
}

/// Process-wide table of server sockets.
///
/// Accepted connections are handed to the shared [`SocketRegistry`] under a
/// fresh random key, already OPENED.
pub struct ServerRegistry {
    records: Mutex<HashMap<SocketKey, ServerRecord>>,
    transport: Arc<dyn Transport>,
    status: Arc<AdapterStatus>,
    sockets: Arc<SocketRegistry>,
    events: EventChannel<ServerSocketEvent>,
}

impl ServerRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        status: Arc<AdapterStatus>,
        sockets: Arc<SocketRegistry>,
        capacity: usize,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            transport,
            status,
            sockets,
            events: EventChannel::new("server-socket", capacity),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerSocketEvent> {
        self.events.subscribe()
    }

    pub fn state(&self, key: &SocketKey) -> ServerSocketState {
        self.records
            .lock()
            .get(key)
            .map(|record| record.state)
            .unwrap_or(ServerSocketState::Stopped)
    }

    /// STOPPED -> STARTING -> STARTED.
    pub async fn start(self: &Arc<Self>, key: &SocketKey, options: &ListenOptions) -> Result<()> {
        {
            let mut records = self.records.lock();
            if let Some(record) = records.get(key) {
                return Err(BluetoothError::InvalidState {
                    state: record.state.as_str(),
                });
            }
            let client = self.sockets.state(key);
            if client != SocketState::Closed {
                warn!("Cannot listen on {} while it is connected", key);
                return Err(BluetoothError::InvalidState {
                    state: client.as_str(),
                });
            }
            records.insert(
                key.clone(),
                ServerRecord {
                    state: ServerSocketState::Starting,
                    stop: Arc::new(Notify::new()),
                    accept: None,
                },
            );
        }

        if !self.status.is_enabled() {
            self.records.lock().remove(key);
            return Err(BluetoothError::NotEnabled);
        }

        let listener = match self.transport.listen(options).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Failed to listen on {}: {}", key, e);
                self.records.lock().remove(key);
                return Err(e);
            }
        };

        let stop = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(key) else {
                return Ok(());
            };
            record.state = ServerSocketState::Started;
            Arc::clone(&record.stop)
        };
        info!(
            "Server {} listening for {} ({})",
            key, options.service_name, options.service_uuid
        );

        let task = tokio::spawn(Arc::clone(self).accept_loop(key.clone(), listener, stop));
        if let Some(record) = self.records.lock().get_mut(key) {
            record.accept = Some(task);
        }
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        key: SocketKey,
        mut listener: Box<dyn StreamListener>,
        stop: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                _ = stop.notified() => {
                    debug!("Accept loop for {} stopped", key);
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, device)) => {
                        info!(
                            "Server {} accepted connection from {} ({})",
                            key, device.address, device.name
                        );
                        match self.sockets.adopt(SocketKey::generate(), &device.address, stream) {
                            Ok(socket) => self.events.emit(ServerSocketEvent::Connected {
                                server_socket_key: key.clone(),
                                socket,
                                address: device.address,
                                name: device.name,
                            }),
                            Err(e) => warn!("Dropping connection from {}: {}", device.address, e),
                        }
                    }
                    Err(e) => {
                        error!("Accept on {} failed: {}", key, e);
                        self.fail(&key);
                        return;
                    }
                },
            }
        }
    }

    fn fail(&self, key: &SocketKey) {
        let removed = {
            let mut records = self.records.lock();
            match records.get(key) {
                Some(record) if record.state == ServerSocketState::Started => records.remove(key),
                _ => None,
            }
        };
        if removed.is_some() {
            self.events.emit(ServerSocketEvent::Stopped {
                server_socket_key: key.clone(),
                has_error: true,
            });
        }
    }

    /// STARTED -> STOPPING -> STOPPED. Accepted sockets stay open.
    pub async fn stop(&self, key: &SocketKey) -> Result<()> {
        let (stop, accept) = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(key) else {
                return Err(BluetoothError::InvalidState {
                    state: ServerSocketState::Stopped.as_str(),
                });
            };
            if record.state != ServerSocketState::Started {
                return Err(BluetoothError::InvalidState {
                    state: record.state.as_str(),
                });
            }
            record.state = ServerSocketState::Stopping;
            (Arc::clone(&record.stop), record.accept.take())
        };

        stop.notify_one();
        if let Some(accept) = accept {
            if let Err(e) = accept.await {
                warn!("Accept loop for {} ended abnormally: {}", key, e);
            }
        }

        self.records.lock().remove(key);
        info!("Server {} stopped", key);
        self.events.emit(ServerSocketEvent::Stopped {
            server_socket_key: key.clone(),
            has_error: false,
        });
        Ok(())
    }
}

/// Handle to one keyed server socket.
#[derive(Clone)]
pub struct BluetoothServerSocket {
    key: SocketKey,
    registry: Arc<ServerRegistry>,
}

impl BluetoothServerSocket {
    pub(crate) fn new(key: SocketKey, registry: Arc<ServerRegistry>) -> Self {
        Self { key, registry }
    }

    pub fn key(&self) -> &SocketKey {
        &self.key
    }

    pub fn state(&self) -> ServerSocketState {
        self.registry.state(&self.key)
    }

    pub async fn start(&self, options: &ListenOptions) -> Result<()> {
        self.registry.start(&self.key, options).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.registry.stop(&self.key).await
    }

    /// Events addressed to this server socket.
    pub fn subscribe(&self) -> ServerSocketEvents {
        ServerSocketEvents {
            key: self.key.clone(),
            rx: self.registry.subscribe(),
        }
    }
}

impl fmt::Debug for BluetoothServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BluetoothServerSocket")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Event feed filtered to one server socket key.
pub struct ServerSocketEvents {
    key: SocketKey,
    rx: broadcast::Receiver<ServerSocketEvent>,
}

impl ServerSocketEvents {
    pub async fn recv(&mut self) -> Option<ServerSocketEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.server_socket_key() == &self.key => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Server {} subscriber lagged by {} events", self.key, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
