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

//! Error types shared by every Bluetooth component.

use thiserror::Error;

/// Fixed message for platforms without discoverable mode.
pub const DISCOVERABLE_UNSUPPORTED: &str = "Discoverable mode is not supported";

/// Fixed message for platforms without listening sockets.
pub const LISTENING_UNSUPPORTED: &str = "Listening mode is not supported";

/// Errors reported by the socket, server and discovery state machines.
#[derive(Error, Debug)]
pub enum BluetoothError {
    /// Operation invoked in a state that forbids it.
    #[error("Invalid operation for this socket state: {state}")]
    InvalidState { state: &'static str },

    #[error("Bluetooth is not supported")]
    NotSupported,

    #[error("Bluetooth is not enabled")]
    NotEnabled,

    /// Operation the platform never implements.
    #[error("{0}")]
    Unsupported(&'static str),

    #[error("Already discovering")]
    AlreadyDiscovering,

    #[error("Not discovering")]
    NotDiscovering,

    #[error("Failed to find a device with id: {0}")]
    DeviceNotFound(String),

    #[error("Failed to pair devices")]
    PairingFailed(String),

    #[error("Failed to pair and then connect")]
    ServiceNotFound(String),

    /// Peer went away before a complete message arrived.
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`BluetoothError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The state machine rejected the call.
    InvalidState,
    /// Native I/O failed.
    Transport,
    /// The platform never supports the operation.
    Unsupported,
    /// A device or service could not be resolved.
    NotFound,
}

impl BluetoothError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } | Self::AlreadyDiscovering | Self::NotDiscovering => {
                ErrorKind::InvalidState
            }
            Self::Unsupported(_) | Self::NotSupported => ErrorKind::Unsupported,
            Self::DeviceNotFound(_) | Self::PairingFailed(_) | Self::ServiceNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::NotEnabled | Self::ClientDisconnected | Self::Transport(_) | Self::Io(_) => {
                ErrorKind::Transport
            }
        }
    }

    /// Whether the error came from the state guard rather than the platform.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BluetoothError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_names_state() {
        let err = BluetoothError::InvalidState { state: "OPENED" };
        assert_eq!(
            err.to_string(),
            "Invalid operation for this socket state: OPENED"
        );
        assert!(err.is_invalid_state());
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_connect_failures_are_distinct() {
        let device = BluetoothError::DeviceNotFound("A".to_string());
        let pairing = BluetoothError::PairingFailed("A".to_string());
        let service = BluetoothError::ServiceNotFound("A".to_string());

        assert_eq!(device.to_string(), "Failed to find a device with id: A");
        assert_ne!(device.to_string(), pairing.to_string());
        assert_ne!(pairing.to_string(), service.to_string());
        assert_eq!(service.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_unsupported_messages() {
        let err = BluetoothError::Unsupported(LISTENING_UNSUPPORTED);
        assert_eq!(err.to_string(), "Listening mode is not supported");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
