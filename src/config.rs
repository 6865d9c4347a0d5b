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

//! Configuration management.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::Framing;

/// RFCOMM service UUID announced and looked up by default.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0x995f40e0_ce68_4d24_8f68_f49d2b9d661f);

/// Read buffer size for chunked framing.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service and channel settings.
    pub bluetooth: BluetoothConfig,

    /// Adapter polling.
    pub radio: RadioConfig,

    /// Scan cycle settings.
    pub discovery: DiscoveryConfig,

    /// Socket framing.
    pub socket: SocketConfig,

    /// Event channel sizing.
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// UUID of the RFCOMM service we connect to and listen on.
    pub service_uuid: Uuid,

    /// SDP service name used when listening.
    pub service_name: String,

    /// RFCOMM channel used when the service record carries none.
    pub rfcomm_channel: u8,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            service_uuid: DEFAULT_SERVICE_UUID,
            service_name: "RFCOMM Sockets".to_string(),
            rfcomm_channel: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Interval between adapter presence checks in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl RadioConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Length of one scan cycle on backends without an enumeration-completed signal.
    pub scan_window_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_window_secs: 10,
        }
    }
}

impl DiscoveryConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_window_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Message framing on the byte stream.
    pub framing: Framing,

    /// Read buffer size for chunked framing.
    pub chunk_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            framing: Framing::Chunked,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Buffered events per subscriber before lagging.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rfcomm-sockets")
        .join("config.toml")
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load configuration from an explicit path, writing defaults if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
