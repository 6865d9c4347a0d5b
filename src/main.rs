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

//! RFCOMM socket daemon: listens on the configured service and logs every
//! event the state machines produce.

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rfcomm_sockets::bluetooth::{self, bluez::BluezBackend};
use rfcomm_sockets::{Config, RadioState, ServerSocketEvent, SocketEvent, SocketKey};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rfcomm_sockets=info".parse()?),
        )
        .init();

    info!("Starting rfcomm-sockets v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded");

    let platform = BluezBackend::platform(&config).await?;
    let manager = bluetooth::init(platform, config).await?;
    let poller = manager.spawn_polling();
    let notifier = manager.spawn_notifications().await?;

    let mut states = manager.subscribe_state();
    let mut supported = manager.subscribe_supported();
    let mut discoverable = manager.subscribe_discoverable();
    let mut sockets = manager.subscribe_sockets();
    let mut servers = manager.subscribe_servers();

    let server_key = SocketKey::generate();
    if manager.get_state() == RadioState::On {
        if let Err(e) = manager.start_server(&server_key).await {
            warn!("Server not started: {}", e);
        }
    } else {
        warn!("Radio is {}, server not started", manager.get_state().as_str());
    }

    loop {
        tokio::select! {
            Ok(state) = states.recv() => {
                info!("Radio state changed: {}", state.as_str());
            }
            Ok(present) = supported.recv() => {
                info!("Adapter present: {}", present);
            }
            Ok(visible) = discoverable.recv() => {
                info!("Adapter discoverable: {}", visible);
            }
            Ok(event) = sockets.recv() => match &event {
                SocketEvent::DataReceived { socket_key, data } => {
                    info!("{}: {}", socket_key, String::from_utf8_lossy(data));
                    // Echo back, as a quick end-to-end check.
                    if let Err(e) = manager.write(socket_key, data).await {
                        error!("Echo to {} failed: {}", socket_key, e);
                    }
                }
                other => info!("Socket event: {}", other.to_json()),
            },
            Ok(event) = servers.recv() => {
                info!("Server event: {}", event.to_json());
                if let ServerSocketEvent::Stopped { has_error: true, .. } = event {
                    error!("Server stopped after an accept failure");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Quit requested");
                break;
            }
        }
    }

    if manager.server_state(&server_key) == bluetooth::ServerSocketState::Started {
        if let Err(e) = manager.stop_server(&server_key).await {
            warn!("Failed to stop server: {}", e);
        }
    }
    poller.abort();
    if let Some(notifier) = notifier {
        notifier.abort();
    }
    info!("Goodbye");
    Ok(())
}
