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

//! NudgeLink Desktop Application

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nudgelink_desktop::bluetooth;
use nudgelink_desktop::config::Config;
use nudgelink_desktop::identity::DeviceIdentity;
use nudgelink_desktop::pairing::{self, EngineConfig, EngineHandle, PairingEngine};
use nudgelink_desktop::relay::RelayClient;
use nudgelink_desktop::state::AppState;
use nudgelink_desktop::storage::{DocumentStore, FirestoreStore, MemoryStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nudgelink_desktop=info".parse().unwrap()),
        )
        .init();

    info!(
        "Starting NudgeLink Desktop v{}...",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Load the local identity and messaging token
    let identity = DeviceIdentity::load(&config.data_dir)?;

    // Pick the document store backend
    let store: Arc<dyn DocumentStore> = match config.store.backend.as_str() {
        "firestore" => {
            if config.store.project_id.is_empty() {
                anyhow::bail!("store.backend is \"firestore\" but store.project_id is empty");
            }
            info!("Using Firestore project {}", config.store.project_id);
            Arc::new(FirestoreStore::new(
                config.store.project_id.clone(),
                config.store.bearer_token.clone(),
            ))
        }
        other => {
            if other != "memory" {
                warn!("Unknown store backend {:?}, falling back to memory", other);
            }
            info!("Using in-memory document store");
            Arc::new(MemoryStore::new())
        }
    };

    // Push-token registration: keep our user record's token current
    if let Err(e) = store
        .upsert_user(identity.user_id(), identity.messaging_token())
        .await
    {
        warn!("Token sync failed: {}", e);
    }

    let relay = RelayClient::new(
        config.relay.base_url.clone(),
        config.relay.bearer_token.clone(),
    );

    // Start the radio driver and the pairing engine
    let state = AppState::new();
    let (radio_tx, radio_rx) = bluetooth::spawn_radio(&config.bluetooth.device_name).await?;
    let engine = PairingEngine::spawn(
        store.clone(),
        Some(identity.user_id().to_string()),
        EngineConfig::from(&config.pairing),
        radio_tx,
        radio_rx,
        state.clone(),
    );
    info!("Pairing engine ready");

    // Surface the current pairing, if any
    match pairing::pair_status(store.as_ref(), identity.user_id()).await {
        Ok(Some(partner)) => {
            info!("Currently paired with {}", partner);
            state.set_partner(Some(partner));
        }
        Ok(None) => info!("Not paired yet"),
        Err(e) => warn!("Pair status check failed: {}", e),
    }

    // Push-style status updates for the console
    let mut status_rx = engine.status_updates();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            info!("Pairing status: {}", status);
        }
    });

    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_line(
                            line.trim(),
                            &engine,
                            &identity,
                            store.as_ref(),
                            &relay,
                            &config,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    let _ = engine.cancel().await;
    info!("NudgeLink Desktop stopped");
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  pair            start pairing with the nearby partner device");
    println!("  devices         list discovered devices");
    println!("  select <n>      connect to a discovered device by number or address");
    println!("  cancel          stop the current pairing session");
    println!("  status          show session, hardware and pairing state");
    println!("  send [message]  nudge the paired partner");
    println!("  unpair          dissolve the current pairing");
    println!("  quit            exit");
}

/// Dispatch one console line. Returns false when the app should exit.
async fn handle_line(
    line: &str,
    engine: &EngineHandle,
    identity: &DeviceIdentity,
    store: &dyn DocumentStore,
    relay: &RelayClient,
    config: &Config,
) -> bool {
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "help" => print_help(),
        "pair" => {
            if let Err(e) = engine.begin(identity.messaging_token()).await {
                println!("Cannot start pairing: {e}");
            }
        }
        "devices" => {
            let peers = engine.state().peers();
            if peers.is_empty() {
                println!("No devices discovered yet");
            }
            for (index, peer) in peers.iter().enumerate() {
                println!("  {}. {} [{}]", index + 1, peer.display_name(), peer.address);
            }
        }
        "select" => {
            let peers = engine.state().peers();
            let address = match rest.parse::<usize>() {
                Ok(number) if number >= 1 && number <= peers.len() => {
                    peers[number - 1].address.clone()
                }
                _ => rest.to_string(),
            };
            if let Err(e) = engine.select(&address).await {
                println!("Cannot connect: {e}");
            }
        }
        "cancel" => {
            let _ = engine.cancel().await;
        }
        "status" => {
            let state = engine.state();
            println!("Session:  {}", state.status());
            println!("Hardware: {}", state.hardware());
            println!("Exchanging: {}", state.is_exchanging());
            match state.partner() {
                Some(partner) => println!("Paired with: {partner}"),
                None => println!("Not paired"),
            }
        }
        "send" => {
            if !relay.is_configured() {
                println!("Relay is not configured (set relay.base_url)");
                return true;
            }
            let body = if rest.is_empty() { "Thinking of you!" } else { rest };
            match relay
                .send_notification(&config.relay.default_title, body)
                .await
            {
                Ok(_) => println!("Notification sent"),
                Err(e) => {
                    error!("Notification failed: {}", e);
                    println!("Notification failed: {e}");
                }
            }
        }
        "unpair" => match pairing::unpair(store, identity.user_id()).await {
            Ok(()) => {
                engine.state().set_partner(None);
                println!("Pairing removed");
            }
            Err(e) => println!("Unpair failed: {e}"),
        },
        "quit" | "exit" => return false,
        other => println!("Unknown command: {other} (try \"help\")"),
    }

    true
}
