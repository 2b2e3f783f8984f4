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

//! Central role: filtered discovery and the remote token link.

use anyhow::{anyhow, bail, Context, Result};
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::{CharacteristicFlags, WriteOp};
use bluer::{Adapter, AdapterEvent, Address, Device};
use futures::StreamExt;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ble_constants::{SERVICE_UUID, TOKEN_CHARACTERISTIC_UUID};
use super::driver::{DiscoveredPeer, RadioEvent, Role};

/// How long to wait for BlueZ to resolve remote services after connecting.
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Running discovery. Stopping (or dropping) it ends the scan.
pub struct ScanTask {
    stop_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ScanTask {
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for ScanTask {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Start filtered discovery for the pairing service.
///
/// Peers advertising the service UUID are forwarded as `PeerDiscovered`;
/// everything else is ignored. Deduplication by address happens here as well
/// as in the session, since BlueZ can report a known device again.
pub fn start(adapter: Adapter, event_tx: mpsc::Sender<RadioEvent>) -> ScanTask {
    let (stop_tx, mut stop_rx) = oneshot::channel();

    let join = tokio::spawn(async move {
        let discovery = match adapter.discover_devices().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start discovery: {}", e);
                return;
            }
        };
        futures::pin_mut!(discovery);
        info!("Scanning for devices...");

        let mut seen: HashSet<Address> = HashSet::new();

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                event = discovery.next() => {
                    match event {
                        Some(AdapterEvent::DeviceAdded(addr)) => {
                            if !seen.insert(addr) {
                                continue;
                            }
                            match probe(&adapter, addr).await {
                                Ok(Some(peer)) => {
                                    debug!("Discovered peer {} ({})", peer.address, peer.display_name());
                                    let _ = event_tx.send(RadioEvent::PeerDiscovered(peer)).await;
                                }
                                Ok(None) => {}
                                Err(e) => debug!("Probe of {} failed: {}", addr, e),
                            }
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
        debug!("Discovery stopped");
    });

    ScanTask {
        stop_tx: Some(stop_tx),
        join: Some(join),
    }
}

async fn probe(adapter: &Adapter, addr: Address) -> bluer::Result<Option<DiscoveredPeer>> {
    let device = adapter.device(addr)?;
    let uuids = device.uuids().await?.unwrap_or_default();
    if !uuids.contains(&SERVICE_UUID) {
        return Ok(None);
    }
    let name = device.name().await?;
    Ok(Some(DiscoveredPeer {
        address: addr.to_string(),
        name,
    }))
}

/// An established central-role link to the peer's token characteristic.
pub struct LinkHandle {
    device: Device,
    token_char: Characteristic,
    flags: CharacteristicFlags,
    notify_task: Option<JoinHandle<()>>,
}

impl LinkHandle {
    /// Write the local token to the peer, with response when supported.
    pub async fn write_token(&self, data: &[u8]) -> Result<()> {
        if self.flags.write {
            self.token_char
                .write_ext(
                    data,
                    &CharacteristicWriteRequest {
                        op_type: WriteOp::Request,
                        ..Default::default()
                    },
                )
                .await
                .context("token write failed")?;
        } else if self.flags.write_without_response {
            self.token_char
                .write_ext(
                    data,
                    &CharacteristicWriteRequest {
                        op_type: WriteOp::Command,
                        ..Default::default()
                    },
                )
                .await
                .context("token write failed")?;
        } else {
            bail!("token characteristic is not writable");
        }
        debug!("Token written to peer ({} bytes)", data.len());
        Ok(())
    }

    pub async fn disconnect(self) {
        if let Some(task) = self.notify_task {
            task.abort();
        }
        let _ = self.device.disconnect().await;
    }
}

/// Connect to a selected peer and wire up the token characteristic.
///
/// Emits `Linked` once the transport connects, subscribes to notifications,
/// issues an initial read, and reports `OutboundReady` so the engine can
/// push the local token.
pub async fn establish_link(
    adapter: &Adapter,
    addr: Address,
    event_tx: mpsc::Sender<RadioEvent>,
) -> Result<LinkHandle> {
    let device = adapter.device(addr)?;

    if !device.is_connected().await? {
        info!("Connecting to {}...", addr);
        device.connect().await.context("connect failed")?;
    }

    let _ = event_tx.send(RadioEvent::Linked { role: Role::Scanner }).await;

    wait_for_services(&device).await?;

    let token_char = find_token_characteristic(&device)
        .await?
        .ok_or_else(|| anyhow!("peer does not expose the token characteristic"))?;
    let flags = token_char.flags().await?;

    // Subscribe first so a notify-only peer can still deliver its token.
    let notify_task = if flags.notify {
        let stream = token_char.notify().await.context("subscribe failed")?;
        let event_tx = event_tx.clone();
        Some(tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(value) = stream.next().await {
                if value.is_empty() {
                    continue;
                }
                let _ = event_tx.send(RadioEvent::TokenArrived(value)).await;
            }
            // Stream end means the link is gone.
            let _ = event_tx.send(RadioEvent::Disconnected).await;
        }))
    } else {
        None
    };

    let _ = event_tx.send(RadioEvent::OutboundReady).await;

    if flags.read {
        match token_char.read().await {
            Ok(value) if !value.is_empty() => {
                let _ = event_tx.send(RadioEvent::TokenArrived(value)).await;
            }
            Ok(_) => debug!("Peer token read returned empty value"),
            Err(e) => warn!("Peer token read failed: {}", e),
        }
    }

    Ok(LinkHandle {
        device,
        token_char,
        flags,
        notify_task,
    })
}

async fn wait_for_services(device: &Device) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SERVICE_RESOLVE_TIMEOUT;
    while !device.is_services_resolved().await? {
        if tokio::time::Instant::now() >= deadline {
            bail!("service discovery timed out");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(())
}

async fn find_token_characteristic(device: &Device) -> Result<Option<Characteristic>> {
    for service in device.services().await? {
        if service.uuid().await? != SERVICE_UUID {
            continue;
        }
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == TOKEN_CHARACTERISTIC_UUID {
                return Ok(Some(characteristic));
            }
        }
    }
    Ok(None)
}
