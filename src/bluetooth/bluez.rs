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

//! BlueZ backend (Linux) built on bluer.

use async_trait::async_trait;
use bluer::rfcomm::{Listener, SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Session};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::platform::{
    AdapterNotification, ByteStream, Device, DeviceWatcher, ListenOptions, NativeRadioState,
    Platform, RadioAdapter, ServiceRecord, StreamListener, Transport, WatcherEvent,
};
use crate::config::Config;
use crate::error::{BluetoothError, Result};

impl From<bluer::Error> for BluetoothError {
    fn from(e: bluer::Error) -> Self {
        BluetoothError::Transport(e.to_string())
    }
}

/// Native collaborators backed by the system `bluetoothd`.
pub struct BluezBackend {
    session: Session,
    service_uuid: Uuid,
    channel: u8,
    scan_window: Duration,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl BluezBackend {
    pub async fn new(config: &Config) -> Result<Self> {
        let session = Session::new().await?;
        info!("BlueZ session created");
        Ok(Self {
            session,
            service_uuid: config.bluetooth.service_uuid,
            channel: config.bluetooth.rfcomm_channel,
            scan_window: config.discovery.scan_window(),
            scan: Mutex::new(None),
        })
    }

    /// Wire one backend into every platform seam.
    pub async fn platform(config: &Config) -> Result<Platform> {
        let backend = Arc::new(Self::new(config).await?);
        Ok(Platform {
            radio: backend.clone(),
            watcher: backend.clone(),
            transport: backend,
        })
    }

    /// The default adapter, if one is plugged in.
    async fn adapter(&self) -> Result<Option<Adapter>> {
        if self.session.adapter_names().await?.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.session.default_adapter().await?))
    }

    async fn require_adapter(&self) -> Result<Adapter> {
        self.adapter().await?.ok_or(BluetoothError::NotSupported)
    }
}

fn parse_address(address: &str) -> Result<Address> {
    address
        .parse()
        .map_err(|_| BluetoothError::DeviceNotFound(address.to_string()))
}

#[async_trait]
impl RadioAdapter for BluezBackend {
    async fn radio_state(&self) -> Result<Option<NativeRadioState>> {
        let Some(adapter) = self.adapter().await? else {
            return Ok(None);
        };
        let state = if adapter.is_powered().await? {
            NativeRadioState::On
        } else {
            NativeRadioState::Off
        };
        Ok(Some(state))
    }

    async fn request_enable(&self) -> Result<()> {
        // No settings dialog to hand off to on Linux; power on directly.
        self.enable().await
    }

    async fn enable(&self) -> Result<()> {
        let adapter = self.require_adapter().await?;
        info!("Powering on Bluetooth adapter {}", adapter.name());
        adapter.set_powered(true).await?;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        let adapter = self.require_adapter().await?;
        info!("Powering off Bluetooth adapter {}", adapter.name());
        adapter.set_powered(false).await?;
        Ok(())
    }

    async fn paired_devices(&self) -> Result<Vec<Device>> {
        let adapter = self.require_adapter().await?;
        let mut devices = Vec::new();
        for addr in adapter.device_addresses().await? {
            let device = adapter.device(addr)?;
            if device.is_paired().await? {
                let name = device.alias().await.ok();
                devices.push(Device::new(addr.to_string(), name).paired());
            }
        }
        Ok(devices)
    }

    async fn is_discoverable(&self) -> Result<bool> {
        let adapter = self.require_adapter().await?;
        Ok(adapter.is_discoverable().await?)
    }

    async fn make_discoverable(&self) -> Result<()> {
        let adapter = self.require_adapter().await?;
        adapter.set_discoverable(true).await?;
        info!("Adapter {} is discoverable", adapter.name());
        Ok(())
    }

    /// `Powered` and `Discoverable` property changes of the default adapter.
    /// BlueZ reports power as a flag, so only ON and OFF come through here.
    async fn notifications(&self) -> Result<Option<mpsc::Receiver<AdapterNotification>>> {
        let Some(adapter) = self.adapter().await? else {
            return Ok(None);
        };
        let events = adapter.events().await?;
        let (tx, rx) = mpsc::channel(16);
        let name = adapter.name().to_string();

        tokio::spawn(async move {
            pin_mut!(events);
            while let Some(event) = events.next().await {
                let notification = match event {
                    AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                        AdapterNotification::State(if powered {
                            NativeRadioState::On
                        } else {
                            NativeRadioState::Off
                        })
                    }
                    AdapterEvent::PropertyChanged(AdapterProperty::Discoverable(discoverable)) => {
                        AdapterNotification::Discoverable(discoverable)
                    }
                    _ => continue,
                };
                if tx.send(notification).await.is_err() {
                    return;
                }
            }
            debug!("Event stream for adapter {} ended", name);
        });
        Ok(Some(rx))
    }
}

#[async_trait]
impl DeviceWatcher for BluezBackend {
    async fn start(&self) -> Result<mpsc::Receiver<WatcherEvent>> {
        let adapter = self.require_adapter().await?;
        let (tx, rx) = mpsc::channel(64);
        let window = self.scan_window;

        let task = tokio::spawn(async move {
            let events = match adapter.discover_devices().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Failed to start device discovery: {}", e);
                    let _ = tx.send(WatcherEvent::Stopped).await;
                    return;
                }
            };
            pin_mut!(events);

            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::DeviceAdded(addr)) => {
                            let Ok(device) = adapter.device(addr) else { continue };
                            // Paired devices come from the paired listing instead.
                            if device.is_paired().await.unwrap_or(false) {
                                continue;
                            }
                            let name = device.name().await.ok().flatten();
                            let sighting = Device::new(addr.to_string(), name);
                            if tx.send(WatcherEvent::Added(sighting)).await.is_err() {
                                return;
                            }
                        }
                        Some(AdapterEvent::DeviceRemoved(addr)) => {
                            let removed = WatcherEvent::Removed { address: addr.to_string() };
                            if tx.send(removed).await.is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("Scan window elapsed");
            let _ = tx.send(WatcherEvent::EnumerationCompleted).await;
        });

        if let Some(previous) = self.scan.lock().replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(task) = self.scan.lock().take() {
            task.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for BluezBackend {
    async fn find_service(&self, address: &str) -> Result<Option<ServiceRecord>> {
        let adapter = self.require_adapter().await?;
        let device = adapter.device(parse_address(address)?)?;
        let uuids = match device.uuids().await {
            Ok(uuids) => uuids.unwrap_or_default(),
            Err(e) => {
                debug!("No service records for {}: {}", address, e);
                return Ok(None);
            }
        };
        if !uuids.contains(&self.service_uuid) {
            return Ok(None);
        }
        Ok(Some(ServiceRecord {
            id: self.service_uuid.to_string(),
            address: address.to_string(),
            channel: Some(self.channel),
        }))
    }

    async fn find_device(&self, address: &str) -> Result<bool> {
        let adapter = self.require_adapter().await?;
        let addr = parse_address(address)?;
        Ok(adapter.device_addresses().await?.contains(&addr))
    }

    async fn pair(&self, address: &str) -> Result<bool> {
        let adapter = self.require_adapter().await?;
        let device = adapter.device(parse_address(address)?)?;
        if device.is_paired().await? {
            return Ok(true);
        }
        match device.pair().await {
            Ok(()) => {
                info!("Paired with {}", address);
                Ok(true)
            }
            Err(e) => {
                warn!("Pairing with {} failed: {}", address, e);
                Ok(false)
            }
        }
    }

    async fn connect(&self, service: &ServiceRecord) -> Result<Box<dyn ByteStream>> {
        let addr = parse_address(&service.address)?;
        let channel = service.channel.unwrap_or(self.channel);
        let stream = Stream::connect(SocketAddr::new(addr, channel)).await?;
        info!("RFCOMM connected to {} on channel {}", service.address, channel);
        Ok(Box::new(stream))
    }

    async fn listen(&self, options: &ListenOptions) -> Result<Box<dyn StreamListener>> {
        let local_addr = SocketAddr::new(Address::any(), options.channel);
        let listener = Listener::bind(local_addr).await?;
        info!("RFCOMM server listening on channel {}", options.channel);
        let adapter = self.adapter().await?;
        Ok(Box::new(BluezListener { listener, adapter }))
    }
}

struct BluezListener {
    listener: Listener,
    adapter: Option<Adapter>,
}

impl BluezListener {
    async fn alias(&self, addr: Address) -> Option<String> {
        let device = self.adapter.as_ref()?.device(addr).ok()?;
        device.alias().await.ok()
    }
}

#[async_trait]
impl StreamListener for BluezListener {
    async fn accept(&mut self) -> Result<(Box<dyn ByteStream>, Device)> {
        let (stream, remote) = self.listener.accept().await?;
        let name = self.alias(remote.addr).await;
        Ok((Box::new(stream), Device::new(remote.addr.to_string(), name)))
    }
}
