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

//! In-memory platform for tests and demos.
//!
//! Remote peers are `tokio::io::duplex` pipes: the crate gets one end, the
//! test takes the other with [`FakePlatform::take_peer`] or
//! [`FakePlatform::incoming`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::platform::{
    AdapterNotification, ByteStream, Device, DeviceWatcher, ListenOptions, NativeRadioState,
    Platform, RadioAdapter, ServiceRecord, StreamListener, Transport, WatcherEvent,
};
use crate::error::{BluetoothError, Result, DISCOVERABLE_UNSUPPORTED, LISTENING_UNSUPPORTED};

const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = std::result::Result<(DuplexStream, Device), String>;

#[derive(Debug, Clone, Copy)]
struct Remote {
    service_visible: bool,
    pairable: bool,
    service_after_pairing: bool,
}

#[derive(Default)]
struct FakeState {
    radio: Option<NativeRadioState>,
    paired: Vec<Device>,
    remotes: HashMap<String, Remote>,
    peers: HashMap<String, DuplexStream>,
    refuse_connect: bool,
    listening_unsupported: bool,
    discoverable_supported: bool,
    discoverable: bool,
    listener: Option<mpsc::UnboundedSender<Incoming>>,
    watcher: Option<mpsc::Sender<WatcherEvent>>,
    notifier: Option<mpsc::Sender<AdapterNotification>>,
}

struct FakeBackend {
    state: Mutex<FakeState>,
    /// `connect` and `listen` wait while this is `false`.
    gate: watch::Sender<bool>,
    transport_calls: AtomicUsize,
    watcher_starts: AtomicUsize,
    enable_requests: AtomicUsize,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            gate: watch::Sender::new(true),
            transport_calls: AtomicUsize::new(0),
            watcher_starts: AtomicUsize::new(0),
            enable_requests: AtomicUsize::new(0),
        }
    }
}

impl FakeBackend {
    async fn pass_gate(&self) {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }
}

/// Scriptable stand-in for the native Bluetooth stack.
#[derive(Clone, Default)]
pub struct FakePlatform {
    backend: Arc<FakeBackend>,
}

impl FakePlatform {
    /// No adapter, no devices.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn radio(&self) -> Arc<dyn RadioAdapter> {
        self.backend.clone()
    }

    pub fn watcher(&self) -> Arc<dyn DeviceWatcher> {
        self.backend.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.backend.clone()
    }

    pub fn platform(&self) -> Platform {
        Platform {
            radio: self.radio(),
            watcher: self.watcher(),
            transport: self.transport(),
        }
    }

    /// `None` removes the adapter.
    pub fn set_radio(&self, state: Option<NativeRadioState>) {
        self.backend.state.lock().radio = state;
    }

    pub fn set_paired(&self, devices: Vec<Device>) {
        self.backend.state.lock().paired = devices;
    }

    /// A device whose service is reachable without pairing.
    pub fn add_service(&self, address: &str) {
        self.backend.state.lock().remotes.insert(
            address.to_string(),
            Remote {
                service_visible: true,
                pairable: true,
                service_after_pairing: true,
            },
        );
    }

    /// A device that must be paired before its service shows up.
    pub fn add_device(&self, address: &str, pairable: bool, service_after_pairing: bool) {
        self.backend.state.lock().remotes.insert(
            address.to_string(),
            Remote {
                service_visible: false,
                pairable,
                service_after_pairing,
            },
        );
    }

    /// Make every `connect` fail with a transport error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.backend.state.lock().refuse_connect = refuse;
    }

    pub fn set_listening_supported(&self, supported: bool) {
        self.backend.state.lock().listening_unsupported = !supported;
    }

    /// Park `connect` and `listen` until released with `hold_transport(false)`.
    pub fn hold_transport(&self, hold: bool) {
        self.backend.gate.send_replace(!hold);
    }

    pub fn set_discoverable_supported(&self, supported: bool) {
        self.backend.state.lock().discoverable_supported = supported;
    }

    fn notify(&self, notification: AdapterNotification) -> bool {
        let state = self.backend.state.lock();
        match state.notifier.as_ref() {
            Some(tx) => tx.try_send(notification).is_ok(),
            None => false,
        }
    }

    /// Change the radio and push the change to the notification feed.
    pub fn notify_state(&self, native: NativeRadioState) -> bool {
        self.backend.state.lock().radio = Some(native);
        self.notify(AdapterNotification::State(native))
    }

    pub fn notify_discoverable(&self, discoverable: bool) -> bool {
        self.backend.state.lock().discoverable = discoverable;
        self.notify(AdapterNotification::Discoverable(discoverable))
    }

    /// Remote end of the last connection opened to `address`.
    pub fn take_peer(&self, address: &str) -> Option<DuplexStream> {
        self.backend.state.lock().peers.remove(address)
    }

    /// Deliver an inbound connection to the listening socket. Returns the
    /// remote end, or `None` when nothing is listening. Paired devices keep
    /// their name, anything else is reported as unknown.
    pub fn incoming(&self, address: &str) -> Option<DuplexStream> {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let state = self.backend.state.lock();
        let device = state
            .paired
            .iter()
            .find(|device| device.address == address)
            .map(|device| Device::new(address, Some(device.name.clone())))
            .unwrap_or_else(|| Device::new(address, None));
        let listener = state.listener.as_ref()?;
        listener.send(Ok((local, device))).ok()?;
        Some(remote)
    }

    /// Make the listening socket's next accept fail.
    pub fn fail_accept(&self) {
        if let Some(listener) = self.backend.state.lock().listener.take() {
            let _ = listener.send(Err("accept failed".to_string()));
        }
    }

    fn push(&self, event: WatcherEvent) -> bool {
        let state = self.backend.state.lock();
        match state.watcher.as_ref() {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Report a device to the running watcher. Paired devices are filtered
    /// out here, as the native selector does.
    pub fn sight(&self, device: Device) -> bool {
        if device.paired {
            return false;
        }
        self.push(WatcherEvent::Added(device))
    }

    pub fn update(&self, address: &str, name: Option<&str>) -> bool {
        self.push(WatcherEvent::Updated {
            address: address.to_string(),
            name: name.map(str::to_string),
        })
    }

    pub fn remove(&self, address: &str) -> bool {
        self.push(WatcherEvent::Removed {
            address: address.to_string(),
        })
    }

    pub fn complete_enumeration(&self) -> bool {
        self.push(WatcherEvent::EnumerationCompleted)
    }

    pub fn is_watching(&self) -> bool {
        self.backend.state.lock().watcher.is_some()
    }

    pub fn watcher_starts(&self) -> usize {
        self.backend.watcher_starts.load(Ordering::SeqCst)
    }

    /// Wait until the watcher has been started `count` times and is running.
    pub async fn wait_for_starts(&self, count: usize) -> bool {
        for _ in 0..200 {
            if self.watcher_starts() >= count && self.is_watching() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    /// Calls made on the transport so far.
    pub fn transport_calls(&self) -> usize {
        self.backend.transport_calls.load(Ordering::SeqCst)
    }

    pub fn enable_requests(&self) -> usize {
        self.backend.enable_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioAdapter for FakeBackend {
    async fn radio_state(&self) -> Result<Option<NativeRadioState>> {
        Ok(self.state.lock().radio)
    }

    async fn request_enable(&self) -> Result<()> {
        self.enable_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.radio.is_none() {
            return Err(BluetoothError::NotSupported);
        }
        state.radio = Some(NativeRadioState::On);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.radio.is_none() {
            return Err(BluetoothError::NotSupported);
        }
        state.radio = Some(NativeRadioState::Off);
        Ok(())
    }

    async fn paired_devices(&self) -> Result<Vec<Device>> {
        Ok(self.state.lock().paired.clone())
    }

    async fn is_discoverable(&self) -> Result<bool> {
        Ok(self.state.lock().discoverable)
    }

    async fn make_discoverable(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.discoverable_supported {
            return Err(BluetoothError::Unsupported(DISCOVERABLE_UNSUPPORTED));
        }
        state.discoverable = true;
        Ok(())
    }

    async fn notifications(&self) -> Result<Option<mpsc::Receiver<AdapterNotification>>> {
        let (tx, rx) = mpsc::channel(16);
        self.state.lock().notifier = Some(tx);
        Ok(Some(rx))
    }
}

#[async_trait]
impl DeviceWatcher for FakeBackend {
    async fn start(&self) -> Result<mpsc::Receiver<WatcherEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().watcher = Some(tx);
        self.watcher_starts.fetch_add(1, Ordering::SeqCst);
        debug!("Fake watcher started");
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        self.state.lock().watcher = None;
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn find_service(&self, address: &str) -> Result<Option<ServiceRecord>> {
        self.transport_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(state
            .remotes
            .get(address)
            .filter(|remote| remote.service_visible)
            .map(|_| ServiceRecord {
                id: format!("{}#rfcomm", address),
                address: address.to_string(),
                channel: Some(1),
            }))
    }

    async fn find_device(&self, address: &str) -> Result<bool> {
        self.transport_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().remotes.contains_key(address))
    }

    async fn pair(&self, address: &str) -> Result<bool> {
        self.transport_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let Some(remote) = state.remotes.get_mut(address) else {
            return Ok(false);
        };
        if !remote.pairable {
            return Ok(false);
        }
        remote.service_visible = remote.service_after_pairing;
        Ok(true)
    }

    async fn connect(&self, service: &ServiceRecord) -> Result<Box<dyn ByteStream>> {
        self.transport_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        let mut state = self.state.lock();
        if state.refuse_connect {
            return Err(BluetoothError::Transport("connection refused".to_string()));
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        state.peers.insert(service.address.clone(), remote);
        Ok(Box::new(local))
    }

    async fn listen(&self, _options: &ListenOptions) -> Result<Box<dyn StreamListener>> {
        self.transport_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        let mut state = self.state.lock();
        if state.listening_unsupported {
            return Err(BluetoothError::Unsupported(LISTENING_UNSUPPORTED));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.listener = Some(tx);
        Ok(Box::new(FakeListener { rx }))
    }
}

struct FakeListener {
    rx: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl StreamListener for FakeListener {
    async fn accept(&mut self) -> Result<(Box<dyn ByteStream>, Device)> {
        match self.rx.recv().await {
            Some(Ok((stream, device))) => Ok((Box::new(stream), device)),
            Some(Err(message)) => Err(BluetoothError::Transport(message)),
            None => Err(BluetoothError::Transport("listener closed".to_string())),
        }
    }
}
