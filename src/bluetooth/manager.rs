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

//! Public operation surface.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::discovery::DiscoveryService;
use super::platform::{
    AdapterNotification, Device, ListenOptions, NativeRadioState, Platform, RadioAdapter,
};
use super::radio::RadioTracker;
use super::registry::SocketRegistry;
use super::server::{BluetoothServerSocket, ServerRegistry, ServerSocketState};
use super::socket::{BluetoothSocket, SocketKey, SocketState};
use super::watcher::DiscoveryWatcher;
use crate::config::Config;
use crate::error::{BluetoothError, Result};
use crate::events::{ServerSocketEvent, SocketEvent};
use crate::state::{AdapterStatus, RadioState};

/// Process-scoped Bluetooth context.
///
/// Built once at startup from a [`Platform`] and handed to whoever needs it.
/// Clones share all state.
#[derive(Clone)]
pub struct BluetoothManager {
    config: Arc<Config>,
    status: Arc<AdapterStatus>,
    radio: Arc<dyn RadioAdapter>,
    tracker: Arc<RadioTracker>,
    discovery: DiscoveryService,
    sockets: Arc<SocketRegistry>,
    servers: Arc<ServerRegistry>,
}

impl BluetoothManager {
    pub fn new(platform: Platform, config: Config) -> Self {
        let capacity = config.events.channel_capacity;
        let status = Arc::new(AdapterStatus::new());

        let tracker = Arc::new(RadioTracker::new(
            Arc::clone(&platform.radio),
            Arc::clone(&status),
            capacity,
        ));
        let discovery = DiscoveryService::new(
            Arc::clone(&platform.radio),
            DiscoveryWatcher::new(platform.watcher),
            Arc::clone(&status),
            capacity,
        );
        let sockets = Arc::new(SocketRegistry::new(
            Arc::clone(&platform.transport),
            Arc::clone(&status),
            config.socket.framing,
            config.socket.chunk_size,
            capacity,
        ));
        let servers = Arc::new(ServerRegistry::new(
            platform.transport,
            Arc::clone(&status),
            Arc::clone(&sockets),
            capacity,
        ));

        Self {
            config: Arc::new(config),
            status,
            radio: platform.radio,
            tracker,
            discovery,
            sockets,
            servers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Radio

    pub fn get_supported(&self) -> bool {
        self.tracker.is_supported()
    }

    pub fn get_state(&self) -> RadioState {
        self.tracker.current_state()
    }

    /// Ask the user to turn the radio on. Completion shows up as a state change.
    pub async fn request_enable(&self) -> Result<()> {
        self.require_supported()?;
        self.radio.request_enable().await
    }

    pub async fn enable(&self) -> Result<()> {
        self.require_supported()?;
        self.radio.enable().await?;
        self.refresh_adapter().await?;
        Ok(())
    }

    pub async fn disable(&self) -> Result<()> {
        self.require_supported()?;
        self.radio.disable().await?;
        self.refresh_adapter().await?;
        Ok(())
    }

    pub async fn list_paired_devices(&self) -> Result<Vec<Device>> {
        let devices = self.radio.paired_devices().await?;
        Ok(devices.into_iter().map(Device::paired).collect())
    }

    pub async fn enable_discovery(&self) -> Result<()> {
        self.radio.make_discoverable().await?;
        self.tracker.set_discoverable(true);
        Ok(())
    }

    pub async fn get_discoverable(&self) -> Result<bool> {
        let discoverable = self.radio.is_discoverable().await?;
        if self.status.is_supported() {
            self.tracker.set_discoverable(discoverable);
        }
        Ok(discoverable)
    }

    /// Re-query the adapter and let discovery follow the radio.
    pub async fn refresh_adapter(&self) -> Result<Option<RadioState>> {
        let changed = self.tracker.refresh().await?;
        if let Some(state) = changed {
            self.discovery.on_radio_state(state).await;
        }
        Ok(changed)
    }

    /// Feed a native state-changed notification.
    pub async fn handle_native_state(&self, native: NativeRadioState) -> Option<RadioState> {
        self.handle_notification(AdapterNotification::State(native)).await
    }

    pub async fn handle_notification(
        &self,
        notification: AdapterNotification,
    ) -> Option<RadioState> {
        let changed = self.tracker.handle_notification(notification);
        if let Some(state) = changed {
            self.discovery.on_radio_state(state).await;
        }
        changed
    }

    /// Forward the platform's adapter notifications until the feed closes.
    ///
    /// Returns `None` when the platform has no feed; polling alone then
    /// tracks the radio.
    pub async fn spawn_notifications(&self) -> Result<Option<JoinHandle<()>>> {
        let Some(mut rx) = self.radio.notifications().await? else {
            debug!("No adapter notification feed, relying on polling");
            return Ok(None);
        };
        let manager = self.clone();
        Ok(Some(tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                debug!("Adapter notification: {:?}", notification);
                manager.handle_notification(notification).await;
            }
            debug!("Adapter notification feed closed");
        })))
    }

    /// Poll the adapter at the configured interval until the task is aborted.
    pub fn spawn_polling(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.config.radio.poll_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = manager.refresh_adapter().await {
                    warn!("Adapter refresh failed: {}", e);
                }
            }
        })
    }

    fn require_supported(&self) -> Result<()> {
        if self.status.is_supported() {
            Ok(())
        } else {
            Err(BluetoothError::NotSupported)
        }
    }

    // Discovery

    pub async fn start_discovery(&self) -> Result<()> {
        self.discovery.start_discovery().await
    }

    pub async fn cancel_discovery(&self) -> Result<()> {
        self.discovery.cancel_discovery().await
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.is_discovering()
    }

    // Sockets

    pub fn socket(&self, key: impl Into<SocketKey>) -> BluetoothSocket {
        BluetoothSocket::new(key.into(), Arc::clone(&self.sockets))
    }

    pub fn socket_state(&self, key: &SocketKey) -> SocketState {
        self.sockets.state(key)
    }

    pub async fn open(&self, key: &SocketKey, address: &str) -> Result<()> {
        self.sockets.open(key, address).await
    }

    pub async fn close(&self, key: &SocketKey) -> Result<()> {
        self.sockets.close(key).await
    }

    pub async fn write(&self, key: &SocketKey, data: &[u8]) -> Result<()> {
        self.sockets.write(key, data).await
    }

    pub async fn shutdown_write(&self, key: &SocketKey) -> Result<()> {
        self.sockets.shutdown_write(key).await
    }

    // Server sockets

    pub fn server_socket(&self, key: impl Into<SocketKey>) -> BluetoothServerSocket {
        BluetoothServerSocket::new(key.into(), Arc::clone(&self.servers))
    }

    pub fn server_state(&self, key: &SocketKey) -> ServerSocketState {
        self.servers.state(key)
    }

    /// Listen with the configured service record.
    pub async fn start_server(&self, key: &SocketKey) -> Result<()> {
        let options = ListenOptions::from_config(&self.config);
        self.start_server_with(key, &options).await
    }

    pub async fn start_server_with(&self, key: &SocketKey, options: &ListenOptions) -> Result<()> {
        debug!("Starting server {} on channel {}", key, options.channel);
        self.servers.start(key, options).await
    }

    pub async fn stop_server(&self, key: &SocketKey) -> Result<()> {
        self.servers.stop(key).await
    }

    // Subscriptions

    pub fn subscribe_supported(&self) -> broadcast::Receiver<bool> {
        self.tracker.subscribe_supported()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<RadioState> {
        self.tracker.subscribe_state()
    }

    pub fn subscribe_discoverable(&self) -> broadcast::Receiver<bool> {
        self.tracker.subscribe_discoverable()
    }

    pub fn subscribe_discovering(&self) -> broadcast::Receiver<bool> {
        self.discovery.subscribe_discovering()
    }

    pub fn subscribe_discovered(&self) -> broadcast::Receiver<Device> {
        self.discovery.subscribe_discovered()
    }

    pub fn subscribe_gone(&self) -> broadcast::Receiver<Device> {
        self.discovery.subscribe_gone()
    }

    pub fn subscribe_sockets(&self) -> broadcast::Receiver<SocketEvent> {
        self.sockets.subscribe()
    }

    pub fn subscribe_servers(&self) -> broadcast::Receiver<ServerSocketEvent> {
        self.servers.subscribe()
    }
}

impl std::fmt::Debug for BluetoothManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluetoothManager")
            .field("supported", &self.get_supported())
            .field("state", &self.get_state())
            .field("discovering", &self.is_discovering())
            .field("sockets", &self.sockets.len())
            .finish()
    }
}

/// Startup helper: build the manager and take the first adapter reading.
pub async fn init(platform: Platform, config: Config) -> Result<BluetoothManager> {
    let manager = BluetoothManager::new(platform, config);
    manager.refresh_adapter().await?;
    info!(
        "Bluetooth manager ready (supported: {}, state: {})",
        manager.get_supported(),
        manager.get_state().as_str()
    );
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::fake::FakePlatform;
    use crate::error::ErrorKind;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn manager(fake: &FakePlatform) -> BluetoothManager {
        BluetoothManager::new(fake.platform(), Config::default())
    }

    #[tokio::test]
    async fn test_unsupported_until_adapter_found() {
        let fake = FakePlatform::new();
        let manager = manager(&fake);

        assert!(!manager.get_supported());
        assert!(matches!(
            manager.enable().await,
            Err(BluetoothError::NotSupported)
        ));

        fake.set_radio(Some(NativeRadioState::Off));
        manager.refresh_adapter().await.unwrap();
        assert!(manager.get_supported());
        assert_eq!(manager.get_state(), RadioState::Off);
    }

    #[tokio::test]
    async fn test_enable_and_disable_follow_radio() {
        let fake = FakePlatform::new();
        fake.set_radio(Some(NativeRadioState::Off));
        let manager = manager(&fake);
        manager.refresh_adapter().await.unwrap();

        manager.enable().await.unwrap();
        assert_eq!(manager.get_state(), RadioState::On);

        manager.disable().await.unwrap();
        assert_eq!(manager.get_state(), RadioState::Off);
    }

    #[tokio::test]
    async fn test_request_enable_delegates() {
        let fake = FakePlatform::new();
        fake.set_radio(Some(NativeRadioState::Off));
        let manager = manager(&fake);
        manager.refresh_adapter().await.unwrap();

        manager.request_enable().await.unwrap();
        assert_eq!(fake.enable_requests(), 1);
        assert_eq!(manager.get_state(), RadioState::Off);
    }

    #[tokio::test]
    async fn test_discoverable_is_unsupported() {
        let fake = FakePlatform::new();
        let manager = manager(&fake);

        let err = manager.enable_discovery().await.unwrap_err();
        assert_eq!(err.to_string(), "Discoverable mode is not supported");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(!manager.get_discoverable().await.unwrap());
    }

    #[tokio::test]
    async fn test_discoverable_channel() {
        let fake = FakePlatform::new();
        fake.set_radio(Some(NativeRadioState::On));
        fake.set_discoverable_supported(true);
        let manager = manager(&fake);
        manager.refresh_adapter().await.unwrap();
        let forwarder = manager.spawn_notifications().await.unwrap().unwrap();
        let mut discoverable = manager.subscribe_discoverable();

        manager.enable_discovery().await.unwrap();
        assert!(recv(&mut discoverable).await);
        assert!(manager.get_discoverable().await.unwrap());

        assert!(fake.notify_discoverable(false));
        assert!(!recv(&mut discoverable).await);
        forwarder.abort();
    }

    #[tokio::test]
    async fn test_pushed_state_reaches_subscribers_once() {
        let fake = FakePlatform::new();
        fake.set_radio(Some(NativeRadioState::On));
        let manager = manager(&fake);
        manager.refresh_adapter().await.unwrap();
        let forwarder = manager.spawn_notifications().await.unwrap().unwrap();
        let mut states = manager.subscribe_state();

        assert!(fake.notify_state(NativeRadioState::TurningOff));
        assert!(fake.notify_state(NativeRadioState::TurningOff));
        assert!(fake.notify_state(NativeRadioState::Off));

        assert_eq!(recv(&mut states).await, RadioState::TurningOff);
        assert_eq!(recv(&mut states).await, RadioState::Off);
        assert!(states.try_recv().is_err());
        assert_eq!(manager.get_state(), RadioState::Off);
        forwarder.abort();
    }

    #[tokio::test]
    async fn test_pushed_radio_off_suspends_discovery() {
        let fake = FakePlatform::new();
        fake.set_radio(Some(NativeRadioState::On));
        let manager = manager(&fake);
        manager.refresh_adapter().await.unwrap();
        let forwarder = manager.spawn_notifications().await.unwrap().unwrap();
        let mut discovering = manager.subscribe_discovering();

        manager.start_discovery().await.unwrap();
        assert!(recv(&mut discovering).await);

        assert!(fake.notify_state(NativeRadioState::TurningOff));
        assert!(!recv(&mut discovering).await);
        forwarder.abort();
    }

    #[tokio::test]
    async fn test_paired_listing_is_flagged() {
        let fake = FakePlatform::new();
        fake.set_paired(vec![Device::new("A", Some("X".into()))]);
        let manager = manager(&fake);

        let devices = manager.list_paired_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].paired);
    }

    #[tokio::test]
    async fn test_server_refused_while_key_is_connected() {
        let fake = FakePlatform::new();
        fake.set_radio(Some(NativeRadioState::On));
        fake.add_service("A");
        let manager = manager(&fake);
        manager.refresh_adapter().await.unwrap();
        let key = SocketKey::from("k1");
        manager.open(&key, "A").await.unwrap();

        let err = manager.start_server(&key).await.unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(manager.server_state(&key), ServerSocketState::Stopped);
    }

    #[tokio::test]
    async fn test_server_refused_with_radio_off() {
        let fake = FakePlatform::new();
        fake.set_radio(Some(NativeRadioState::Off));
        let manager = manager(&fake);
        manager.refresh_adapter().await.unwrap();

        assert!(matches!(
            manager.start_server(&SocketKey::from("s1")).await,
            Err(BluetoothError::NotEnabled)
        ));
    }
}
