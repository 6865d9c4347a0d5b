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

//! Native collaborators the state machines drive.
//!
//! Radio queries, device enumeration and byte transport are platform
//! specific. The core only sees the traits below; see `bluez` for the Linux
//! implementation and `fake` for the in-memory one.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{BluetoothError, Result, DISCOVERABLE_UNSUPPORTED, LISTENING_UNSUPPORTED};
use crate::state::RadioState;

/// Name reported for devices that do not advertise one.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";

/// A remote device sighting. The address is the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub name: String,
    pub address: String,
    pub paired: bool,
}

impl Device {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        let name = name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string());
        Self {
            name,
            address: address.into(),
            paired: false,
        }
    }

    pub fn paired(mut self) -> Self {
        self.paired = true;
        self
    }

    /// Record shape of the raw feed, without the paired flag.
    pub fn to_raw_json(&self) -> Value {
        json!({ "name": self.name, "address": self.address })
    }
}

/// Adapter state as the native layer reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeRadioState {
    Unknown,
    Disabled,
    Off,
    TurningOn,
    On,
    TurningOff,
}

impl NativeRadioState {
    pub fn translate(self) -> RadioState {
        match self {
            NativeRadioState::Unknown | NativeRadioState::Disabled | NativeRadioState::Off => {
                RadioState::Off
            }
            NativeRadioState::TurningOn => RadioState::TurningOn,
            NativeRadioState::On => RadioState::On,
            NativeRadioState::TurningOff => RadioState::TurningOff,
        }
    }
}

/// Pushed adapter property changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterNotification {
    State(NativeRadioState),
    Discoverable(bool),
}

/// Raw notifications from a native device-enumeration watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Added(Device),
    Updated { address: String, name: Option<String> },
    Removed { address: String },
    EnumerationCompleted,
    Stopped,
}

/// Resolved RFCOMM service on a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub id: String,
    pub address: String,
    pub channel: Option<u8>,
}

/// Parameters for a listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    pub service_uuid: Uuid,
    pub service_name: String,
    pub channel: u8,
}

impl ListenOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_uuid: config.bluetooth.service_uuid,
            service_name: config.bluetooth.service_name.clone(),
            channel: config.bluetooth.rfcomm_channel,
        }
    }
}

/// Bidirectional byte stream of one connection.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Adapter presence, power and pairing.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Current native state, `None` when no adapter is present.
    async fn radio_state(&self) -> Result<Option<NativeRadioState>>;

    async fn request_enable(&self) -> Result<()>;

    async fn enable(&self) -> Result<()>;

    async fn disable(&self) -> Result<()>;

    async fn paired_devices(&self) -> Result<Vec<Device>>;

    /// Feed of adapter notifications, `None` where the platform only supports
    /// polling.
    async fn notifications(&self) -> Result<Option<mpsc::Receiver<AdapterNotification>>> {
        Ok(None)
    }

    async fn is_discoverable(&self) -> Result<bool> {
        Ok(false)
    }

    async fn make_discoverable(&self) -> Result<()> {
        Err(BluetoothError::Unsupported(DISCOVERABLE_UNSUPPORTED))
    }
}

/// Native device-enumeration primitive. Selects unpaired devices only.
#[async_trait]
pub trait DeviceWatcher: Send + Sync {
    /// Start one enumeration pass and return its notification feed.
    async fn start(&self) -> Result<mpsc::Receiver<WatcherEvent>>;

    async fn stop(&self) -> Result<()>;
}

/// Connection establishment.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn find_service(&self, address: &str) -> Result<Option<ServiceRecord>>;

    async fn find_device(&self, address: &str) -> Result<bool>;

    /// Pair with the device. `Ok(false)` when pairing was refused.
    async fn pair(&self, address: &str) -> Result<bool>;

    async fn connect(&self, service: &ServiceRecord) -> Result<Box<dyn ByteStream>>;

    async fn listen(&self, _options: &ListenOptions) -> Result<Box<dyn StreamListener>> {
        Err(BluetoothError::Unsupported(LISTENING_UNSUPPORTED))
    }
}

/// Accepting side of a listening socket.
#[async_trait]
pub trait StreamListener: Send {
    /// Wait for the next inbound connection and its peer.
    async fn accept(&mut self) -> Result<(Box<dyn ByteStream>, Device)>;
}

/// The native collaborators of one process.
#[derive(Clone)]
pub struct Platform {
    pub radio: Arc<dyn RadioAdapter>,
    pub watcher: Arc<dyn DeviceWatcher>,
    pub transport: Arc<dyn Transport>,
}
