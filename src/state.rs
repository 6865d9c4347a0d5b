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

//! Shared adapter status.

use parking_lot::RwLock;
use serde::{Serialize, Serializer};

/// Radio enable state, as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RadioState {
    #[default]
    Off,
    TurningOn,
    On,
    TurningOff,
}

impl RadioState {
    /// Integer constant used on the wire.
    pub fn code(&self) -> i32 {
        match self {
            RadioState::Off => 10,
            RadioState::TurningOn => 11,
            RadioState::On => 12,
            RadioState::TurningOff => 13,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            10 => Some(RadioState::Off),
            11 => Some(RadioState::TurningOn),
            12 => Some(RadioState::On),
            13 => Some(RadioState::TurningOff),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RadioState::Off => "OFF",
            RadioState::TurningOn => "TURNING_ON",
            RadioState::On => "ON",
            RadioState::TurningOff => "TURNING_OFF",
        }
    }
}

impl Serialize for RadioState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

/// Last reported adapter values.
///
/// Setters return `true` only when the stored value changed, so callers emit
/// a change event exactly once per transition.
#[derive(Debug, Default)]
pub struct AdapterStatus {
    supported: RwLock<bool>,
    radio_state: RwLock<RadioState>,
    discovering: RwLock<bool>,
    discoverable: RwLock<bool>,
}

impl AdapterStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_supported(&self) -> bool {
        *self.supported.read()
    }

    pub fn set_supported(&self, supported: bool) -> bool {
        let mut current = self.supported.write();
        if *current == supported {
            return false;
        }
        *current = supported;
        true
    }

    pub fn radio_state(&self) -> RadioState {
        *self.radio_state.read()
    }

    pub fn set_radio_state(&self, state: RadioState) -> bool {
        let mut current = self.radio_state.write();
        if *current == state {
            return false;
        }
        *current = state;
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.radio_state() == RadioState::On
    }

    pub fn is_discovering(&self) -> bool {
        *self.discovering.read()
    }

    pub fn set_discovering(&self, discovering: bool) -> bool {
        let mut current = self.discovering.write();
        if *current == discovering {
            return false;
        }
        *current = discovering;
        true
    }

    pub fn is_discoverable(&self) -> bool {
        *self.discoverable.read()
    }

    pub fn set_discoverable(&self, discoverable: bool) -> bool {
        let mut current = self.discoverable.write();
        if *current == discoverable {
            return false;
        }
        *current = discoverable;
        true
    }
}
