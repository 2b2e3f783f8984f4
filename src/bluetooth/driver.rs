// Copyright 2026 NudgeLink Contributors
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

//! Radio driver task.
//!
//! Owns the BlueZ adapter and both radio roles. The pairing engine talks to
//! it exclusively through typed command/event channels, so every hardware
//! callback reaches the engine as an ordered event rather than a direct
//! mutation.

use anyhow::Result;
use bluer::{Adapter, AdapterEvent, AdapterProperty};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::advertiser::{self, AdvertiserHandle};
use super::scanner::{self, LinkHandle, ScanTask};

/// The two simultaneous radio roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Peripheral: advertises the pairing service and serves the token
    /// characteristic.
    Advertiser,
    /// Central: scans for the pairing service and connects on request.
    Scanner,
}

/// Hardware readiness of one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareState {
    Ready,
    PoweredOff,
    Unavailable,
}

impl HardwareState {
    pub fn is_ready(&self) -> bool {
        matches!(self, HardwareState::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareState::Ready => "Bluetooth ready",
            HardwareState::PoweredOff => "Bluetooth is off",
            HardwareState::Unavailable => "Bluetooth unavailable",
        }
    }
}

/// A peer seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Hardware address, used as the stable peer identifier.
    pub address: String,
    /// Advertised name, if any.
    pub name: Option<String>,
}

impl DiscoveredPeer {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Device")
    }
}

/// Commands from the pairing engine to the driver.
#[derive(Debug, Clone)]
pub enum RadioCommand {
    /// Tear down any previous advertisement cycle and re-register the GATT
    /// service with the given token as the characteristic value.
    SetupAdvertiser { token: String },
    /// Begin filtered discovery.
    StartScan,
    /// Stop scanning and connect to a discovered peer.
    Connect { address: String },
    /// Push the local token over the active outbound channel.
    SendToken { token: String },
    /// Halt both roles and release any open connection. Idempotent.
    Stop,
}

/// Events from the driver to the pairing engine.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// Hardware readiness changed for one role.
    AdapterState { role: Role, state: HardwareState },
    /// The advertisement cycle is live.
    AdvertisingStarted,
    /// The GATT service could not be registered or advertised.
    AdvertiseFailed(String),
    /// A peer advertising the pairing service was seen.
    PeerDiscovered(DiscoveredPeer),
    /// A radio link exists, via the given local role.
    Linked { role: Role },
    /// The central role found the writable token characteristic.
    OutboundReady,
    /// The peer's token value arrived (write, read response or notify).
    TokenArrived(Vec<u8>),
    /// An outbound token write failed.
    SendFailed(String),
    /// The connection attempt failed.
    LinkFailed(String),
    /// The active link dropped.
    Disconnected,
}

/// Create the BlueZ session and spawn the driver task.
///
/// Returns the command sender and the event receiver the engine consumes.
pub async fn spawn_radio(
    device_name: &str,
) -> Result<(mpsc::Sender<RadioCommand>, mpsc::Receiver<RadioEvent>)> {
    info!("Initializing BLE radio...");

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    info!("Using Bluetooth adapter: {}", adapter.name());

    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        adapter.set_powered(true).await?;
    }

    adapter.set_alias(device_name.to_string()).await?;
    info!("Bluetooth name set to: {}", device_name);

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);

    let driver = RadioDriver {
        adapter,
        device_name: device_name.to_string(),
        event_tx,
        local_token: Arc::new(parking_lot::RwLock::new(String::new())),
        advertiser: None,
        scan: None,
        link: None,
    };

    tokio::spawn(driver.run(cmd_rx));

    Ok((cmd_tx, event_rx))
}

/// Driver state, owned by the driver task.
struct RadioDriver {
    adapter: Adapter,
    device_name: String,
    event_tx: mpsc::Sender<RadioEvent>,
    /// Current local token, shared with the GATT characteristic closures so
    /// read requests always answer with the live value.
    local_token: Arc<parking_lot::RwLock<String>>,
    advertiser: Option<AdvertiserHandle>,
    scan: Option<ScanTask>,
    link: Option<LinkHandle>,
}

impl RadioDriver {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RadioCommand>) {
        let powered = self.adapter.is_powered().await.unwrap_or(false);
        self.report_power(powered).await;

        let adapter_events = match self.adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot monitor adapter state: {}", e);
                self.report_unavailable().await;
                return;
            }
        };
        futures::pin_mut!(adapter_events);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                Some(event) = adapter_events.next() => {
                    if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                        info!("Adapter power changed: {}", powered);
                        self.report_power(powered).await;
                        if !powered {
                            self.teardown().await;
                        }
                    }
                }
            }
        }

        self.teardown().await;
        debug!("Radio driver exited");
    }

    async fn handle_command(&mut self, cmd: RadioCommand) {
        match cmd {
            RadioCommand::SetupAdvertiser { token } => self.setup_advertiser(token).await,
            RadioCommand::StartScan => self.start_scan().await,
            RadioCommand::Connect { address } => self.connect(address).await,
            RadioCommand::SendToken { token } => self.send_token(token).await,
            RadioCommand::Stop => self.teardown().await,
        }
    }

    /// Register the GATT application and start advertising. Any previous
    /// cycle is dropped first so no stale characteristic value survives.
    async fn setup_advertiser(&mut self, token: String) {
        *self.local_token.write() = token;
        self.advertiser = None;

        if !self.powered().await {
            warn!("Advertiser start requested while hardware is not ready");
            return;
        }

        match advertiser::register(
            &self.adapter,
            self.device_name.clone(),
            self.local_token.clone(),
            self.event_tx.clone(),
        )
        .await
        {
            Ok(handle) => {
                self.advertiser = Some(handle);
                self.emit(RadioEvent::AdvertisingStarted).await;
            }
            Err(e) => {
                warn!("Failed to start advertising: {}", e);
                self.emit(RadioEvent::AdvertiseFailed(e.to_string())).await;
            }
        }
    }

    async fn start_scan(&mut self) {
        if self.scan.is_some() {
            debug!("Scan already running");
            return;
        }
        if !self.powered().await {
            warn!("Scan requested while hardware is not ready");
            return;
        }
        self.scan = Some(scanner::start(
            self.adapter.clone(),
            self.event_tx.clone(),
        ));
    }

    async fn connect(&mut self, address: String) {
        self.stop_scan().await;

        let addr = match address.parse::<bluer::Address>() {
            Ok(addr) => addr,
            Err(e) => {
                self.emit(RadioEvent::LinkFailed(format!(
                    "invalid address {}: {}",
                    address, e
                )))
                .await;
                return;
            }
        };

        match scanner::establish_link(&self.adapter, addr, self.event_tx.clone()).await {
            Ok(link) => self.link = Some(link),
            Err(e) => {
                self.emit(RadioEvent::LinkFailed(e.to_string())).await;
            }
        }
    }

    /// Outbound token push. A central link writes the characteristic; with
    /// only the peripheral role linked, the subscribed peer is notified.
    async fn send_token(&mut self, token: String) {
        if let Some(link) = &self.link {
            if let Err(e) = link.write_token(token.as_bytes()).await {
                self.emit(RadioEvent::SendFailed(e.to_string())).await;
            }
        } else if let Some(advertiser) = &self.advertiser {
            advertiser.notify_token(token.into_bytes()).await;
        } else {
            self.emit(RadioEvent::SendFailed("no active link".to_string()))
                .await;
        }
    }

    async fn stop_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.stop().await;
        }
    }

    async fn teardown(&mut self) {
        self.stop_scan().await;
        self.advertiser = None;
        if let Some(link) = self.link.take() {
            link.disconnect().await;
        }
        self.local_token.write().clear();
    }

    async fn powered(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }

    async fn report_power(&self, powered: bool) {
        let state = if powered {
            HardwareState::Ready
        } else {
            HardwareState::PoweredOff
        };
        for role in [Role::Advertiser, Role::Scanner] {
            self.emit(RadioEvent::AdapterState { role, state }).await;
        }
    }

    async fn report_unavailable(&self) {
        for role in [Role::Advertiser, Role::Scanner] {
            self.emit(RadioEvent::AdapterState {
                role,
                state: HardwareState::Unavailable,
            })
            .await;
        }
    }

    async fn emit(&self, event: RadioEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("Radio event receiver dropped");
        }
    }
}
