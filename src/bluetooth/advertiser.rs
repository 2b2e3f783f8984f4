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

//! Peripheral role: GATT token service and advertisement.
//!
//! Serves one characteristic that answers reads with the current local
//! token, accepts the peer's token as a write, and pushes the local token to
//! a subscribing peer. Dropping the returned handle unregisters both the
//! service and the advertisement, which is how each new pairing cycle starts
//! from a clean slate.

use anyhow::Result;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::Adapter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use super::ble_constants::{SERVICE_UUID, TOKEN_CHARACTERISTIC_UUID};
use super::driver::{RadioEvent, Role};

/// Live advertisement cycle. Dropping it tears the service down.
pub struct AdvertiserHandle {
    notify_tx: mpsc::Sender<Vec<u8>>,
    _app_handle: ApplicationHandle,
    _adv_handle: AdvertisementHandle,
}

impl AdvertiserHandle {
    /// Queue a token push to the subscribed peer, if any.
    pub async fn notify_token(&self, token: Vec<u8>) {
        if self.notify_tx.send(token).await.is_err() {
            debug!("No active notification subscriber");
        }
    }
}

/// Register the GATT application and start advertising.
pub async fn register(
    adapter: &Adapter,
    local_name: String,
    token: Arc<parking_lot::RwLock<String>>,
    event_tx: mpsc::Sender<RadioEvent>,
) -> Result<AdvertiserHandle> {
    // One flag per cycle: the first central interaction of any kind counts
    // as the link coming up.
    let linked = Arc::new(AtomicBool::new(false));

    let read_char = {
        let token = token.clone();
        let event_tx = event_tx.clone();
        let linked = linked.clone();

        CharacteristicRead {
            read: true,
            fun: Box::new(move |_req: CharacteristicReadRequest| {
                let token = token.clone();
                let event_tx = event_tx.clone();
                let linked = linked.clone();
                Box::pin(async move {
                    mark_linked(&linked, &event_tx).await;
                    let value = token.read().clone();
                    if value.is_empty() {
                        return Err(ReqError::Failed);
                    }
                    debug!("Answering token read ({} bytes)", value.len());
                    Ok(value.into_bytes())
                })
            }),
            ..Default::default()
        }
    };

    let write_char = {
        let event_tx = event_tx.clone();
        let linked = linked.clone();

        CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |data: Vec<u8>, _req: CharacteristicWriteRequest| {
                    let event_tx = event_tx.clone();
                    let linked = linked.clone();
                    Box::pin(async move {
                        mark_linked(&linked, &event_tx).await;
                        debug!("Token write received ({} bytes)", data.len());
                        let _ = event_tx.send(RadioEvent::TokenArrived(data)).await;
                        Ok(())
                    })
                },
            )),
            ..Default::default()
        }
    };

    let (notify_tx, notify_rx) = mpsc::channel::<Vec<u8>>(8);
    let notify_rx = Arc::new(Mutex::new(notify_rx));

    let notify_char = {
        let token = token.clone();
        let event_tx = event_tx.clone();
        let linked = linked.clone();

        CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                let token = token.clone();
                let event_tx = event_tx.clone();
                let linked = linked.clone();
                let notify_rx = notify_rx.clone();

                Box::pin(async move {
                    mark_linked(&linked, &event_tx).await;

                    // Peer subscribed: push our token right away.
                    let value = token.read().clone();
                    if !value.is_empty() {
                        if let Err(e) = notifier.notify(value.into_bytes()).await {
                            error!("Failed to notify token on subscribe: {}", e);
                            return;
                        }
                    }

                    loop {
                        let data = {
                            let mut rx = notify_rx.lock().await;
                            rx.recv().await
                        };

                        match data {
                            Some(data) => {
                                if let Err(e) = notifier.notify(data).await {
                                    error!("Failed to send token notification: {}", e);
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    debug!("Token notification loop exited");
                })
            })),
            ..Default::default()
        }
    };

    let service = Service {
        uuid: SERVICE_UUID,
        primary: true,
        characteristics: vec![Characteristic {
            uuid: TOKEN_CHARACTERISTIC_UUID,
            read: Some(read_char),
            write: Some(write_char),
            notify: Some(notify_char),
            ..Default::default()
        }],
        ..Default::default()
    };

    let app = Application {
        services: vec![service],
        ..Default::default()
    };

    let app_handle = adapter.serve_gatt_application(app).await?;

    let advertisement = Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_uuids: vec![SERVICE_UUID].into_iter().collect(),
        discoverable: Some(true),
        local_name: Some(local_name),
        ..Default::default()
    };
    let adv_handle = adapter.advertise(advertisement).await?;

    info!("GATT token service registered and advertising");

    Ok(AdvertiserHandle {
        notify_tx,
        _app_handle: app_handle,
        _adv_handle: adv_handle,
    })
}

async fn mark_linked(linked: &AtomicBool, event_tx: &mpsc::Sender<RadioEvent>) {
    if !linked.swap(true, Ordering::SeqCst) {
        let _ = event_tx
            .send(RadioEvent::Linked {
                role: Role::Advertiser,
            })
            .await;
    }
}
