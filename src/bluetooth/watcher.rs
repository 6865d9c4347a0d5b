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

//! One scan cycle of the native device watcher.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::platform::{Device, DeviceWatcher, WatcherEvent};
use crate::error::Result;

/// What a scan cycle reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherOutput {
    /// A device was seen for the first time or its record changed.
    Sighted(Device),
    /// Enumeration finished; the cycle is over.
    CycleComplete,
}

/// Devices visible during the current cycle.
#[derive(Debug, Default)]
pub struct WatcherCycle {
    visible: HashMap<String, Device>,
    completed: bool,
}

impl WatcherCycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visible(&self) -> usize {
        self.visible.len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Fold one native notification into the cycle.
    pub fn handle(&mut self, event: WatcherEvent) -> Option<WatcherOutput> {
        if self.completed {
            return None;
        }

        match event {
            WatcherEvent::Added(device) => {
                if device.paired {
                    return None;
                }
                self.visible.insert(device.address.clone(), device.clone());
                Some(WatcherOutput::Sighted(device))
            }
            WatcherEvent::Updated { address, name } => {
                let device = self.visible.get_mut(&address)?;
                if let Some(name) = name.filter(|name| !name.is_empty()) {
                    device.name = name;
                }
                Some(WatcherOutput::Sighted(device.clone()))
            }
            WatcherEvent::Removed { address } => {
                self.visible.remove(&address);
                None
            }
            WatcherEvent::EnumerationCompleted | WatcherEvent::Stopped => {
                self.completed = true;
                Some(WatcherOutput::CycleComplete)
            }
        }
    }
}

/// Wrapper around the native enumeration primitive.
///
/// The watcher never restarts itself; whoever consumes the cycle decides
/// whether another one follows.
#[derive(Clone)]
pub struct DiscoveryWatcher {
    native: Arc<dyn DeviceWatcher>,
}

impl DiscoveryWatcher {
    pub fn new(native: Arc<dyn DeviceWatcher>) -> Self {
        Self { native }
    }

    /// Start one scan cycle.
    pub async fn start(&self) -> Result<ScanCycle> {
        let rx = self.native.start().await?;
        debug!("Scan cycle started");
        Ok(ScanCycle {
            rx,
            cycle: WatcherCycle::new(),
        })
    }

    /// Stop the native primitive.
    pub async fn stop(&self) -> Result<()> {
        self.native.stop().await
    }
}

/// A running scan cycle.
pub struct ScanCycle {
    rx: mpsc::Receiver<WatcherEvent>,
    cycle: WatcherCycle,
}

impl ScanCycle {
    /// Wait for the next sighting or the end of the cycle.
    ///
    /// A native feed that closes without completing ends the cycle too.
    pub async fn next(&mut self) -> WatcherOutput {
        if self.cycle.is_completed() {
            return WatcherOutput::CycleComplete;
        }
        while let Some(event) = self.rx.recv().await {
            if let Some(output) = self.cycle.handle(event) {
                return output;
            }
        }
        warn!("Watcher feed closed before enumeration completed");
        self.cycle.handle(WatcherEvent::Stopped);
        WatcherOutput::CycleComplete
    }

    pub fn visible(&self) -> usize {
        self.cycle.visible()
    }
}
