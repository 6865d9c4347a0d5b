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

//! Keyed socket records and their read loops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::framing::{Framing, MessageReader};
use super::platform::{ByteStream, ServiceRecord, Transport};
use super::socket::{BluetoothSocket, SocketKey, SocketState};
use crate::error::{BluetoothError, Result};
use crate::events::{CloseReason, EventChannel, SocketEvent};
use crate::state::AdapterStatus;

type StreamWriter = Arc<AsyncMutex<WriteHalf<Box<dyn ByteStream>>>>;

/// Everything held for one non-CLOSED socket.
///
/// A key without a record is CLOSED; dropping the record releases the
/// writer, and the read loop owns the reader.
struct SocketRecord {
    state: SocketState,
    address: String,
    service: Option<ServiceRecord>,
    writer: Option<StreamWriter>,
    stop: Arc<Notify>,
    reader: Option<JoinHandle<()>>,
}

impl SocketRecord {
    fn opening(address: &str) -> Self {
        Self {
            state: SocketState::Opening,
            address: address.to_string(),
            service: None,
            writer: None,
            stop: Arc::new(Notify::new()),
            reader: None,
        }
    }
}

/// Process-wide table of client and accepted sockets.
pub struct SocketRegistry {
    records: Mutex<HashMap<SocketKey, SocketRecord>>,
    transport: Arc<dyn Transport>,
    status: Arc<AdapterStatus>,
    framing: Framing,
    chunk_size: usize,
    events: EventChannel<SocketEvent>,
}

impl SocketRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        status: Arc<AdapterStatus>,
        framing: Framing,
        chunk_size: usize,
        capacity: usize,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            transport,
            status,
            framing,
            chunk_size,
            events: EventChannel::new("socket", capacity),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.events.subscribe()
    }

    pub fn state(&self, key: &SocketKey) -> SocketState {
        self.records
            .lock()
            .get(key)
            .map(|record| record.state)
            .unwrap_or(SocketState::Closed)
    }

    pub fn peer_address(&self, key: &SocketKey) -> Option<String> {
        self.records.lock().get(key).map(|record| record.address.clone())
    }

    /// Service the socket was connected through, if it was opened locally.
    pub fn service(&self, key: &SocketKey) -> Option<ServiceRecord> {
        self.records
            .lock()
            .get(key)
            .and_then(|record| record.service.clone())
    }

    /// Number of sockets not in CLOSED.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &SocketKey) -> bool {
        self.records.lock().contains_key(key)
    }

    /// Connect `key` to `address`.
    pub async fn open(self: &Arc<Self>, key: &SocketKey, address: &str) -> Result<()> {
        {
            let mut records = self.records.lock();
            if let Some(record) = records.get(key) {
                return Err(BluetoothError::InvalidState {
                    state: record.state.as_str(),
                });
            }
            records.insert(key.clone(), SocketRecord::opening(address));
        }

        if !self.status.is_enabled() {
            self.records.lock().remove(key);
            return Err(BluetoothError::NotEnabled);
        }

        info!("Opening socket {} to {}", key, address);
        match self.connect(address).await {
            Ok((service, stream)) => {
                self.attach(key, Some(service), stream);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open socket {}: {}", key, e);
                self.records.lock().remove(key);
                Err(e)
            }
        }
    }

    /// Resolve the service, pairing first if it is not reachable yet.
    async fn connect(&self, address: &str) -> Result<(ServiceRecord, Box<dyn ByteStream>)> {
        let service = match self.transport.find_service(address).await? {
            Some(service) => service,
            None => {
                debug!("No service on {} yet, pairing", address);
                if !self.transport.find_device(address).await? {
                    return Err(BluetoothError::DeviceNotFound(address.to_string()));
                }
                if !self.transport.pair(address).await? {
                    return Err(BluetoothError::PairingFailed(address.to_string()));
                }
                self.transport
                    .find_service(address)
                    .await?
                    .ok_or_else(|| BluetoothError::ServiceNotFound(address.to_string()))?
            }
        };

        let stream = self.transport.connect(&service).await?;
        Ok((service, stream))
    }

    /// Register an inbound connection as an already OPENED socket.
    pub fn adopt(
        self: &Arc<Self>,
        key: SocketKey,
        address: &str,
        stream: Box<dyn ByteStream>,
    ) -> Result<BluetoothSocket> {
        {
            let mut records = self.records.lock();
            if let Some(record) = records.get(&key) {
                return Err(BluetoothError::InvalidState {
                    state: record.state.as_str(),
                });
            }
            records.insert(key.clone(), SocketRecord::opening(address));
        }
        self.attach(&key, None, stream);
        Ok(BluetoothSocket::new(key, Arc::clone(self)))
    }

    fn attach(
        self: &Arc<Self>,
        key: &SocketKey,
        service: Option<ServiceRecord>,
        stream: Box<dyn ByteStream>,
    ) {
        let (reader, writer) = tokio::io::split(stream);
        let stop = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(key) else {
                return;
            };
            record.state = SocketState::Opened;
            record.service = service;
            record.writer = Some(Arc::new(AsyncMutex::new(writer)));
            Arc::clone(&record.stop)
        };

        let address = self.peer_address(key).unwrap_or_default();
        info!("Socket {} opened to {}", key, address);
        self.events.emit(SocketEvent::Connected {
            socket_key: key.clone(),
            address,
        });

        let task = tokio::spawn(Arc::clone(self).read_loop(key.clone(), reader, stop));
        if let Some(record) = self.records.lock().get_mut(key) {
            record.reader = Some(task);
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        key: SocketKey,
        reader: ReadHalf<Box<dyn ByteStream>>,
        stop: Arc<Notify>,
    ) {
        let mut messages = MessageReader::new(reader, self.framing, self.chunk_size);
        loop {
            tokio::select! {
                _ = stop.notified() => {
                    debug!("Read loop for {} stopped", key);
                    return;
                }
                result = messages.read_message() => match result {
                    Ok(data) => {
                        debug!("Socket {} received {} bytes", key, data.len());
                        self.events.emit(SocketEvent::DataReceived {
                            socket_key: key.clone(),
                            data,
                        });
                    }
                    Err(e) => {
                        self.fail(&key, e);
                        return;
                    }
                },
            }
        }
    }

    /// Force an OPENED socket to CLOSED after a read failure.
    fn fail(&self, key: &SocketKey, cause: BluetoothError) {
        let removed = {
            let mut records = self.records.lock();
            match records.get(key) {
                Some(record) if record.state == SocketState::Opened => records.remove(key),
                // CLOSING: `close` owns the transition.
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }

        if matches!(cause, BluetoothError::ClientDisconnected) {
            info!("Socket {} closed by peer", key);
        } else {
            error!("Socket {} read failed: {}", key, cause);
            self.events.emit(SocketEvent::Error {
                socket_key: key.clone(),
                message: cause.to_string(),
            });
        }
        self.events.emit(SocketEvent::Closed {
            socket_key: key.clone(),
            reason: CloseReason::TransportError {
                cause: cause.to_string(),
            },
        });
    }

    fn writer(&self, key: &SocketKey) -> Result<StreamWriter> {
        let records = self.records.lock();
        match records.get(key) {
            Some(record) if record.state == SocketState::Opened => {
                record.writer.clone().ok_or(BluetoothError::InvalidState {
                    state: record.state.as_str(),
                })
            }
            Some(record) => Err(BluetoothError::InvalidState {
                state: record.state.as_str(),
            }),
            None => Err(BluetoothError::InvalidState {
                state: SocketState::Closed.as_str(),
            }),
        }
    }

    /// Write one framed message. A failed write leaves the state as is.
    pub async fn write(&self, key: &SocketKey, data: &[u8]) -> Result<()> {
        let writer = self.writer(key)?;
        let bytes = self.framing.encode(data);
        let mut writer = writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        debug!("Socket {} wrote {} bytes", key, bytes.len());
        Ok(())
    }

    pub async fn shutdown_write(&self, key: &SocketKey) -> Result<()> {
        let writer = self.writer(key)?;
        writer.lock().await.shutdown().await?;
        debug!("Socket {} write side shut down", key);
        Ok(())
    }

    /// OPENED -> CLOSING -> CLOSED.
    ///
    /// The pending read is cancelled and the read loop joined before the
    /// record goes away, so nothing is delivered for the key after `Closed`.
    pub async fn close(&self, key: &SocketKey) -> Result<()> {
        let (writer, stop, reader) = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(key) else {
                return Err(BluetoothError::InvalidState {
                    state: SocketState::Closed.as_str(),
                });
            };
            if record.state != SocketState::Opened {
                return Err(BluetoothError::InvalidState {
                    state: record.state.as_str(),
                });
            }
            record.state = SocketState::Closing;
            (
                record.writer.take(),
                Arc::clone(&record.stop),
                record.reader.take(),
            )
        };

        stop.notify_one();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!("Read loop for {} ended abnormally: {}", key, e);
            }
        }
        if let Some(writer) = writer {
            if let Err(e) = writer.lock().await.shutdown().await {
                debug!("Shutdown of {} failed: {}", key, e);
            }
        }

        self.records.lock().remove(key);
        info!("Socket {} closed", key);
        self.events.emit(SocketEvent::Closed {
            socket_key: key.clone(),
            reason: CloseReason::Requested,
        });
        Ok(())
    }
}
