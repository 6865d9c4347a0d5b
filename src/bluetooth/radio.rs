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

//! Adapter presence and radio state tracking.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::platform::{AdapterNotification, NativeRadioState, RadioAdapter};
use crate::error::Result;
use crate::events::EventChannel;
use crate::state::{AdapterStatus, RadioState};

/// Tracks whether an adapter exists and what state its radio is in.
///
/// Adapter add/remove is only observed by polling (`refresh`); state changes
/// of a known adapter also arrive as native notifications
/// (`handle_notification`). Both paths funnel through the same deduplicating
/// setters, so subscribers see one event per real transition.
pub struct RadioTracker {
    adapter: Arc<dyn RadioAdapter>,
    status: Arc<AdapterStatus>,
    supported_changed: EventChannel<bool>,
    state_changed: EventChannel<RadioState>,
    discoverable_changed: EventChannel<bool>,
}

impl RadioTracker {
    pub fn new(adapter: Arc<dyn RadioAdapter>, status: Arc<AdapterStatus>, capacity: usize) -> Self {
        Self {
            adapter,
            status,
            supported_changed: EventChannel::new("supported-changed", capacity),
            state_changed: EventChannel::new("state-changed", capacity),
            discoverable_changed: EventChannel::new("discoverable-changed", capacity),
        }
    }

    pub fn current_state(&self) -> RadioState {
        self.status.radio_state()
    }

    pub fn is_supported(&self) -> bool {
        self.status.is_supported()
    }

    pub fn subscribe_supported(&self) -> broadcast::Receiver<bool> {
        self.supported_changed.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<RadioState> {
        self.state_changed.subscribe()
    }

    pub fn is_discoverable(&self) -> bool {
        self.status.is_discoverable()
    }

    pub fn subscribe_discoverable(&self) -> broadcast::Receiver<bool> {
        self.discoverable_changed.subscribe()
    }

    /// Record the adapter's discoverable mode. Returns whether it changed.
    pub fn set_discoverable(&self, discoverable: bool) -> bool {
        if !self.status.set_discoverable(discoverable) {
            return false;
        }
        info!("Discoverable: {}", discoverable);
        self.discoverable_changed.emit(discoverable);
        true
    }

    /// Apply one pushed notification. Returns the new radio state if it changed.
    pub fn handle_notification(&self, notification: AdapterNotification) -> Option<RadioState> {
        match notification {
            AdapterNotification::State(native) => self.handle_native_state(native),
            AdapterNotification::Discoverable(discoverable) => {
                if self.status.is_supported() {
                    self.set_discoverable(discoverable);
                }
                None
            }
        }
    }

    /// Re-query the adapter. Returns the new state if it changed.
    pub async fn refresh(&self) -> Result<Option<RadioState>> {
        let native = self.adapter.radio_state().await?;
        Ok(self.apply(native))
    }

    /// Apply a state-changed notification for the known adapter.
    pub fn handle_native_state(&self, native: NativeRadioState) -> Option<RadioState> {
        if !self.status.is_supported() {
            debug!("Ignoring radio notification without a known adapter");
            return None;
        }
        self.set_state(native.translate())
    }

    fn apply(&self, native: Option<NativeRadioState>) -> Option<RadioState> {
        match native {
            Some(native) => {
                if self.status.set_supported(true) {
                    info!("Bluetooth adapter found");
                    self.supported_changed.emit(true);
                }
                self.set_state(native.translate())
            }
            None => {
                if self.status.set_supported(false) {
                    info!("Bluetooth adapter removed");
                    self.supported_changed.emit(false);
                }
                self.set_discoverable(false);
                self.set_state(RadioState::Off)
            }
        }
    }

    fn set_state(&self, state: RadioState) -> Option<RadioState> {
        if !self.status.set_radio_state(state) {
            return None;
        }
        info!("Radio state: {}", state.as_str());
        self.state_changed.emit(state);
        Some(state)
    }
}
