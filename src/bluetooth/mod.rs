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

//! Bluetooth communication module.
//!
//! RFCOMM socket and server-socket state machines, radio tracking and
//! discovery reconciliation on top of a pluggable native platform.

#[cfg(feature = "bluez")]
pub mod bluez;
mod discovery;
pub mod fake;
mod framing;
mod manager;
mod platform;
mod radio;
mod registry;
mod server;
mod socket;
mod watcher;

pub use discovery::{DiscoveryService, DiscoverySession};
pub use framing::{Framing, MessageReader};
pub use manager::{init, BluetoothManager};
pub use platform::{
    AdapterNotification, ByteStream, Device, DeviceWatcher, ListenOptions, NativeRadioState,
    Platform, RadioAdapter, ServiceRecord, StreamListener, Transport, WatcherEvent,
    UNKNOWN_DEVICE_NAME,
};
pub use radio::RadioTracker;
pub use registry::SocketRegistry;
pub use server::{BluetoothServerSocket, ServerRegistry, ServerSocketEvents, ServerSocketState};
pub use socket::{BluetoothSocket, SocketEvents, SocketKey, SocketState};
pub use watcher::{DiscoveryWatcher, ScanCycle, WatcherCycle, WatcherOutput};
