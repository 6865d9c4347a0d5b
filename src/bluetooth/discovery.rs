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

//! Discovery reconciliation.
//!
//! Native scans run in short cycles and report every visible device again on
//! each pass. The reconciler turns that into a continuous feed: a device is
//! reported once when it shows up and once when it is no longer seen.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use super::platform::{Device, RadioAdapter};
use super::watcher::{DiscoveryWatcher, ScanCycle, WatcherOutput};
use crate::error::{BluetoothError, Result};
use crate::events::{DiscoveryEvent, EventChannel};
use crate::state::{AdapterStatus, RadioState};

/// Reconciliation state of one discovery session.
///
/// Every scan cycle belongs to a generation. Cancelling, suspending or
/// restarting bumps it, which makes results of older cycles stale.
#[derive(Debug, Default)]
pub struct DiscoverySession {
    active: bool,
    suspended: bool,
    generation: u64,
    paired: HashMap<String, Device>,
    current: HashMap<String, Device>,
    previous: HashMap<String, Device>,
}

impl DiscoverySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the caller wants discovery, even while the radio is off.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether cycles of `generation` may still report.
    pub fn is_current(&self, generation: u64) -> bool {
        self.active && !self.suspended && self.generation == generation
    }

    /// Start a session.
    ///
    /// Returns `None` when discovery is wanted but suspended by the radio;
    /// it resumes on its own once the radio is back.
    pub fn begin(&mut self) -> Result<Option<u64>> {
        if self.active {
            if self.suspended {
                return Ok(None);
            }
            return Err(BluetoothError::AlreadyDiscovering);
        }
        self.clear();
        self.active = true;
        self.suspended = false;
        self.generation += 1;
        Ok(Some(self.generation))
    }

    /// Report the paired listing at the start of a session.
    pub fn add_paired(&mut self, generation: u64, devices: Vec<Device>) -> Vec<DiscoveryEvent> {
        if !self.is_current(generation) {
            return Vec::new();
        }
        let mut events = Vec::new();
        for device in devices {
            let device = device.paired();
            if self.paired.contains_key(&device.address) {
                continue;
            }
            self.paired.insert(device.address.clone(), device.clone());
            events.push(DiscoveryEvent::Discovered(device));
        }
        events
    }

    /// Fold one watcher sighting into the current cycle.
    pub fn on_sighting(&mut self, generation: u64, device: Device) -> Vec<DiscoveryEvent> {
        if !self.is_current(generation) || self.paired.contains_key(&device.address) {
            return Vec::new();
        }

        let address = device.address.clone();
        if let Some(old) = self.current.insert(address.clone(), device.clone()) {
            // Already seen this cycle: report the rename as gone + rediscovered.
            return vec![DiscoveryEvent::Gone(old), DiscoveryEvent::Discovered(device)];
        }

        match self.previous.get(&address) {
            Some(prev) if prev.name == device.name => Vec::new(),
            Some(prev) => vec![
                DiscoveryEvent::Gone(prev.clone()),
                DiscoveryEvent::Discovered(device),
            ],
            None => vec![DiscoveryEvent::Discovered(device)],
        }
    }

    /// Close the current cycle and report devices that were not seen again.
    ///
    /// Returns `None` when the cycle is stale and must not continue.
    pub fn complete_cycle(&mut self, generation: u64) -> Option<Vec<DiscoveryEvent>> {
        if !self.is_current(generation) {
            return None;
        }
        let previous = std::mem::take(&mut self.previous);
        let current = &self.current;
        let mut gone: Vec<Device> = previous
            .into_values()
            .filter(|device| !current.contains_key(&device.address))
            .collect();
        gone.sort_by(|a, b| a.address.cmp(&b.address));
        self.previous = std::mem::take(&mut self.current);
        Some(gone.into_iter().map(DiscoveryEvent::Gone).collect())
    }

    pub fn cancel(&mut self) -> Result<()> {
        if !self.active {
            return Err(BluetoothError::NotDiscovering);
        }
        self.active = false;
        self.suspended = false;
        self.generation += 1;
        self.clear();
        Ok(())
    }

    /// Give up on a session whose start failed.
    pub fn abort(&mut self, generation: u64) {
        if self.generation == generation {
            self.active = false;
            self.generation += 1;
            self.clear();
        }
    }

    /// Hard reset on radio loss. No gone events are produced.
    ///
    /// Returns whether a cycle was running.
    pub fn suspend(&mut self) -> bool {
        if !self.active || self.suspended {
            return false;
        }
        self.suspended = true;
        self.generation += 1;
        self.clear();
        true
    }

    /// Resume a suspended session with a fresh generation.
    pub fn resume(&mut self) -> Option<u64> {
        if !self.active || !self.suspended {
            return None;
        }
        self.suspended = false;
        self.generation += 1;
        Some(self.generation)
    }

    fn clear(&mut self) {
        self.paired.clear();
        self.current.clear();
        self.previous.clear();
    }
}

struct Inner {
    radio: Arc<dyn RadioAdapter>,
    watcher: AsyncMutex<DiscoveryWatcher>,
    status: Arc<AdapterStatus>,
    session: Mutex<DiscoverySession>,
    discovering: EventChannel<bool>,
    discovered: EventChannel<Device>,
    gone: EventChannel<Device>,
}

/// Drives watcher cycles through a [`DiscoverySession`].
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

impl DiscoveryService {
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        watcher: DiscoveryWatcher,
        status: Arc<AdapterStatus>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                radio,
                watcher: AsyncMutex::new(watcher),
                status,
                session: Mutex::new(DiscoverySession::new()),
                discovering: EventChannel::new("discovering-changed", capacity),
                discovered: EventChannel::new("device-discovered", capacity),
                gone: EventChannel::new("device-gone", capacity),
            }),
        }
    }

    pub fn subscribe_discovering(&self) -> broadcast::Receiver<bool> {
        self.inner.discovering.subscribe()
    }

    pub fn subscribe_discovered(&self) -> broadcast::Receiver<Device> {
        self.inner.discovered.subscribe()
    }

    pub fn subscribe_gone(&self) -> broadcast::Receiver<Device> {
        self.inner.gone.subscribe()
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.status.is_discovering()
    }

    pub async fn start_discovery(&self) -> Result<()> {
        let begun = {
            let mut session = self.inner.session.lock();
            if !session.is_active() && !self.inner.status.is_enabled() {
                return Err(BluetoothError::NotEnabled);
            }
            session.begin()?
        };
        // `None`: suspended by the radio, resumes when the radio is back.
        let Some(generation) = begun else {
            return Ok(());
        };
        info!("Discovery started");
        self.run(generation).await
    }

    pub async fn cancel_discovery(&self) -> Result<()> {
        self.inner.session.lock().cancel()?;
        info!("Discovery cancelled");
        let watcher = self.inner.watcher.lock().await;
        if let Err(e) = watcher.stop().await {
            warn!("Failed to stop watcher: {}", e);
        }
        drop(watcher);
        self.set_discovering(false);
        Ok(())
    }

    /// React to a radio transition.
    pub async fn on_radio_state(&self, state: RadioState) {
        if state == RadioState::On {
            let generation = self.inner.session.lock().resume();
            if let Some(generation) = generation {
                info!("Radio back on, resuming discovery");
                if let Err(e) = self.run(generation).await {
                    error!("Failed to resume discovery: {}", e);
                }
            }
            return;
        }

        let was_running = self.inner.session.lock().suspend();
        if was_running {
            info!("Radio {}, discovery suspended", state.as_str());
            let watcher = self.inner.watcher.lock().await;
            if let Err(e) = watcher.stop().await {
                debug!("Failed to stop watcher after radio loss: {}", e);
            }
            drop(watcher);
            self.set_discovering(false);
        }
    }

    async fn run(&self, generation: u64) -> Result<()> {
        let paired = match self.inner.radio.paired_devices().await {
            Ok(paired) => paired,
            Err(e) => {
                self.inner.session.lock().abort(generation);
                return Err(e);
            }
        };
        let events = self.inner.session.lock().add_paired(generation, paired);
        self.dispatch(events);

        let scan = match self.start_cycle(generation).await {
            Ok(Some(scan)) => scan,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.inner.session.lock().abort(generation);
                self.set_discovering(false);
                return Err(e);
            }
        };
        self.set_discovering(true);

        let service = self.clone();
        tokio::spawn(async move {
            service.pump(scan, generation).await;
        });
        Ok(())
    }

    /// Start a cycle if `generation` is still current.
    async fn start_cycle(&self, generation: u64) -> Result<Option<ScanCycle>> {
        let watcher = self.inner.watcher.lock().await;
        if !self.inner.session.lock().is_current(generation) {
            return Ok(None);
        }
        watcher.start().await.map(Some)
    }

    async fn pump(&self, mut scan: ScanCycle, generation: u64) {
        loop {
            match scan.next().await {
                WatcherOutput::Sighted(device) => {
                    let events = self.inner.session.lock().on_sighting(generation, device);
                    self.dispatch(events);
                }
                WatcherOutput::CycleComplete => {
                    let watcher = self.inner.watcher.lock().await;
                    let events = self.inner.session.lock().complete_cycle(generation);
                    let Some(events) = events else {
                        debug!("Stale scan cycle finished");
                        return;
                    };
                    if let Err(e) = watcher.stop().await {
                        debug!("Failed to stop finished watcher: {}", e);
                    }
                    drop(watcher);

                    debug!("Scan cycle complete, {} gone", events.len());
                    self.dispatch(events);

                    match self.start_cycle(generation).await {
                        Ok(Some(next)) => scan = next,
                        Ok(None) => return,
                        Err(e) => {
                            error!("Failed to restart watcher: {}", e);
                            self.inner.session.lock().abort(generation);
                            self.set_discovering(false);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, events: Vec<DiscoveryEvent>) {
        for event in events {
            match event {
                DiscoveryEvent::Discovered(device) => {
                    debug!("Discovered {} ({})", device.address, device.name);
                    self.inner.discovered.emit(device);
                }
                DiscoveryEvent::Gone(device) => {
                    debug!("Gone {}", device.address);
                    self.inner.gone.emit(device);
                }
            }
        }
    }

    fn set_discovering(&self, discovering: bool) {
        if self.inner.status.set_discovering(discovering) {
            self.inner.discovering.emit(discovering);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(address: &str, name: &str) -> Device {
        Device::new(address, Some(name.to_string()))
    }

    fn addresses(events: &[DiscoveryEvent], gone: bool) -> Vec<String> {
        events
            .iter()
            .filter(|event| event.is_gone() == gone)
            .map(|event| event.device().address.clone())
            .collect()
    }

    #[test]
    fn test_duplicate_start_is_error() {
        let mut session = DiscoverySession::new();
        session.begin().unwrap();
        assert!(matches!(
            session.begin(),
            Err(BluetoothError::AlreadyDiscovering)
        ));
    }

    #[test]
    fn test_cancel_while_inactive_is_error() {
        let mut session = DiscoverySession::new();
        assert!(matches!(
            session.cancel(),
            Err(BluetoothError::NotDiscovering)
        ));
    }

    #[test]
    fn test_paired_reported_once() {
        let mut session = DiscoverySession::new();
        let generation = session.begin().unwrap().unwrap();
        let events = session.add_paired(
            generation,
            vec![device("A", "X"), device("A", "X"), device("B", "Y")],
        );
        assert_eq!(addresses(&events, false), vec!["A", "B"]);
        assert!(events.iter().all(|event| event.device().paired));

        // The watcher never reports paired devices, but if it did they stay quiet.
        assert!(session.on_sighting(generation, device("A", "X")).is_empty());
        assert_eq!(session.complete_cycle(generation), Some(vec![]));
    }

    #[test]
    fn test_new_sighting_is_discovered() {
        let mut session = DiscoverySession::new();
        let generation = session.begin().unwrap().unwrap();
        let events = session.on_sighting(generation, device("C", "Z"));
        assert_eq!(events, vec![DiscoveryEvent::Discovered(device("C", "Z"))]);
    }

    #[test]
    fn test_update_within_cycle_is_gone_then_discovered() {
        let mut session = DiscoverySession::new();
        let generation = session.begin().unwrap().unwrap();
        session.on_sighting(generation, device("C", "Z"));

        let events = session.on_sighting(generation, device("C", "Renamed"));
        assert_eq!(
            events,
            vec![
                DiscoveryEvent::Gone(device("C", "Z")),
                DiscoveryEvent::Discovered(device("C", "Renamed")),
            ]
        );
    }

    #[test]
    fn test_disjoint_cycles_report_gone() {
        let mut session = DiscoverySession::new();
        let generation = session.begin().unwrap().unwrap();
        session.on_sighting(generation, device("S1a", "1"));
        session.on_sighting(generation, device("S1b", "2"));
        assert_eq!(session.complete_cycle(generation), Some(vec![]));

        let events = session.on_sighting(generation, device("S2a", "3"));
        assert_eq!(addresses(&events, false), vec!["S2a"]);

        let gone = session.complete_cycle(generation).unwrap();
        assert_eq!(addresses(&gone, true), vec!["S1a", "S1b"]);
    }

    #[test]
    fn test_device_seen_again_is_suppressed() {
        let mut session = DiscoverySession::new();
        let generation = session.begin().unwrap().unwrap();
        session.on_sighting(generation, device("A", "X"));
        session.complete_cycle(generation);

        assert!(session.on_sighting(generation, device("A", "X")).is_empty());
        assert_eq!(session.complete_cycle(generation), Some(vec![]));

        // Third cycle without A.
        let gone = session.complete_cycle(generation).unwrap();
        assert_eq!(addresses(&gone, true), vec!["A"]);
    }

    #[test]
    fn test_rename_across_cycles() {
        let mut session = DiscoverySession::new();
        let generation = session.begin().unwrap().unwrap();
        session.on_sighting(generation, device("A", "X"));
        session.complete_cycle(generation);

        let events = session.on_sighting(generation, device("A", "Y"));
        assert_eq!(
            events,
            vec![
                DiscoveryEvent::Gone(device("A", "X")),
                DiscoveryEvent::Discovered(device("A", "Y")),
            ]
        );
    }

    #[test]
    fn test_suspend_clears_without_gone() {
        let mut session = DiscoverySession::new();
        let generation = session.begin().unwrap().unwrap();
        session.on_sighting(generation, device("A", "X"));
        session.complete_cycle(generation);

        assert!(session.suspend());
        assert_eq!(session.complete_cycle(generation), None);
        assert!(session.is_active());

        // Starting again while suspended is accepted as a no-op.
        assert!(session.begin().unwrap().is_none());

        let resumed = session.resume().unwrap();
        assert!(session.complete_cycle(resumed).unwrap().is_empty());
        // A is new again after the hard reset.
        let events = session.on_sighting(resumed, device("A", "X"));
        assert_eq!(addresses(&events, false), vec!["A"]);
    }

    #[test]
    fn test_cancel_makes_cycle_stale() {
        let mut session = DiscoverySession::new();
        let generation = session.begin().unwrap().unwrap();
        session.cancel().unwrap();

        assert!(session.on_sighting(generation, device("A", "X")).is_empty());
        assert_eq!(session.complete_cycle(generation), None);
    }
}
