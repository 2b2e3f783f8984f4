//! Integration tests for the full pairing flow.
//!
//! Two engines share one document store while the test plays the part of
//! both radios, delivering the hardware events a real exchange produces.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use nudgelink_desktop::bluetooth::{
    DiscoveredPeer, HardwareState, RadioCommand, RadioEvent, Role,
};
use nudgelink_desktop::pairing::{
    self, EngineConfig, EngineHandle, FailureReason, PairingEngine, SessionStatus,
};
use nudgelink_desktop::state::AppState;
use nudgelink_desktop::storage::{DocumentStore, MemoryStore};

const ADDR_B: &str = "F0:0D:CA:FE:00:02";

struct TestDevice {
    handle: EngineHandle,
    commands: mpsc::Receiver<RadioCommand>,
    events: mpsc::Sender<RadioEvent>,
    status: watch::Receiver<SessionStatus>,
    state: Arc<AppState>,
}

fn spawn_device(store: Arc<dyn DocumentStore>, user_id: &str) -> TestDevice {
    let (radio_tx, commands) = mpsc::channel(64);
    let (events, radio_rx) = mpsc::channel(64);
    let state = AppState::new();
    let handle = PairingEngine::spawn(
        store,
        Some(user_id.to_string()),
        EngineConfig::default(),
        radio_tx,
        radio_rx,
        state.clone(),
    );
    let status = handle.status_updates();
    TestDevice {
        handle,
        commands,
        events,
        status,
        state,
    }
}

async fn both_roles_ready(device: &TestDevice) {
    for role in [Role::Advertiser, Role::Scanner] {
        device
            .events
            .send(RadioEvent::AdapterState {
                role,
                state: HardwareState::Ready,
            })
            .await
            .unwrap();
    }
}

async fn next_command(device: &mut TestDevice) -> RadioCommand {
    tokio::time::timeout(Duration::from_secs(2), device.commands.recv())
        .await
        .expect("timed out waiting for a radio command")
        .expect("command channel closed")
}

/// Drain the three session start commands, returning the advertised token.
async fn drain_session_start(device: &mut TestDevice) -> String {
    assert!(matches!(next_command(device).await, RadioCommand::Stop));
    let token = match next_command(device).await {
        RadioCommand::SetupAdvertiser { token } => token,
        other => panic!("expected advertiser setup, got {other:?}"),
    };
    assert!(matches!(next_command(device).await, RadioCommand::StartScan));
    token
}

async fn wait_status(
    device: &mut TestDevice,
    predicate: impl FnMut(&SessionStatus) -> bool,
) -> SessionStatus {
    tokio::time::timeout(Duration::from_secs(2), device.status.wait_for(predicate))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed")
        .clone()
}

/// Play both radios through a full exchange: A scans, selects B, tokens
/// cross, B finalizes first, then A. Returns after both report `Paired`.
async fn run_exchange(device_a: &mut TestDevice, device_b: &mut TestDevice) {
    both_roles_ready(device_a).await;
    both_roles_ready(device_b).await;

    device_a.handle.begin("tok-a").await.unwrap();
    device_b.handle.begin("tok-b").await.unwrap();

    let token_a = drain_session_start(device_a).await;
    let token_b = drain_session_start(device_b).await;
    assert_eq!(token_a, "tok-a");
    assert_eq!(token_b, "tok-b");

    // A discovers B and the user picks it.
    device_a
        .events
        .send(RadioEvent::PeerDiscovered(DiscoveredPeer {
            address: ADDR_B.to_string(),
            name: Some("NudgeLink".to_string()),
        }))
        .await
        .unwrap();
    for _ in 0..200 {
        if device_a.state.has_peer(ADDR_B) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    device_a.handle.select(ADDR_B).await.unwrap();
    assert!(matches!(
        next_command(device_a).await,
        RadioCommand::Connect { .. }
    ));

    // The link comes up on both sides.
    device_a
        .events
        .send(RadioEvent::Linked { role: Role::Scanner })
        .await
        .unwrap();
    device_b
        .events
        .send(RadioEvent::Linked {
            role: Role::Advertiser,
        })
        .await
        .unwrap();

    // A finds the writable characteristic and pushes its token, which the
    // peripheral side receives as a write.
    device_a.events.send(RadioEvent::OutboundReady).await.unwrap();
    let sent = match next_command(device_a).await {
        RadioCommand::SendToken { token } => token,
        other => panic!("expected token send, got {other:?}"),
    };
    device_b
        .events
        .send(RadioEvent::TokenArrived(sent.into_bytes()))
        .await
        .unwrap();

    wait_status(device_b, |s| matches!(s, SessionStatus::Paired { .. })).await;

    // B's token reaches A as the read response.
    device_a
        .events
        .send(RadioEvent::TokenArrived(token_b.into_bytes()))
        .await
        .unwrap();
    wait_status(device_a, |s| matches!(s, SessionStatus::Paired { .. })).await;
}

async fn registered_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.upsert_user("user-a", "tok-a").await.unwrap();
    store.upsert_user("user-b", "tok-b").await.unwrap();
    store
}

#[tokio::test]
async fn two_devices_pair_and_cross_reference() {
    let store = registered_store().await;
    let mut device_a = spawn_device(Arc::new(store.clone()), "user-a");
    let mut device_b = spawn_device(Arc::new(store.clone()), "user-b");

    run_exchange(&mut device_a, &mut device_b).await;

    assert_eq!(
        device_a.state.status(),
        SessionStatus::Paired {
            partner_id: "user-b".into()
        }
    );
    assert_eq!(
        device_b.state.status(),
        SessionStatus::Paired {
            partner_id: "user-a".into()
        }
    );

    let user_a = store.get_user("user-a").await.unwrap().unwrap();
    let user_b = store.get_user("user-b").await.unwrap().unwrap();
    assert_eq!(user_a.paired_with, "user-b");
    assert_eq!(user_b.paired_with, "user-a");

    // Exactly one pair record survives, referencing both participants.
    let pairs = store.pairs();
    assert_eq!(pairs.len(), 1);
    assert!(pairs[0].1.references("user-a"));
    assert!(pairs[0].1.references("user-b"));
}

#[tokio::test]
async fn repairing_supersedes_the_previous_partner() {
    let store = registered_store().await;
    store.upsert_user("user-c", "tok-c").await.unwrap();

    let mut device_a = spawn_device(Arc::new(store.clone()), "user-a");
    let mut device_b = spawn_device(Arc::new(store.clone()), "user-b");
    run_exchange(&mut device_a, &mut device_b).await;

    // A pairs again, this time with C. The A-B record must be gone.
    let outcome = pairing::finalize(&store, Some("user-c"), "tok-a").await;
    assert!(matches!(outcome, pairing::PairingOutcome::Paired { .. }));

    let pairs = store.pairs();
    assert_eq!(pairs.len(), 1);
    assert!(pairs[0].1.references("user-a"));
    assert!(pairs[0].1.references("user-c"));

    let user_b = store.get_user("user-b").await.unwrap().unwrap();
    assert_eq!(user_b.paired_with, "user-a");
    // B still points at A until it refreshes its own status; the pair
    // record is the source of truth and no longer references B.
    assert!(!pairs[0].1.references("user-b"));
}

#[tokio::test]
async fn commit_failure_surfaces_and_recovers() {
    let store = registered_store().await;
    let mut device_a = spawn_device(Arc::new(store.clone()), "user-a");

    both_roles_ready(&device_a).await;
    device_a.handle.begin("tok-a").await.unwrap();
    drain_session_start(&mut device_a).await;

    store.fail_next_commit();
    device_a
        .events
        .send(RadioEvent::TokenArrived(b"tok-b".to_vec()))
        .await
        .unwrap();

    wait_status(&mut device_a, |s| {
        matches!(s, SessionStatus::Failed(FailureReason::CommitFailed))
    })
    .await;

    // No dangling partner pointers.
    let user_a = store.get_user("user-a").await.unwrap().unwrap();
    let user_b = store.get_user("user-b").await.unwrap().unwrap();
    assert!(!user_a.is_paired());
    assert!(!user_b.is_paired());
    assert!(store.pairs().is_empty());

    // A duplicate delivery retries and succeeds.
    device_a
        .events
        .send(RadioEvent::TokenArrived(b"tok-b".to_vec()))
        .await
        .unwrap();
    wait_status(&mut device_a, |s| matches!(s, SessionStatus::Paired { .. })).await;
}

#[tokio::test]
async fn unpair_dissolves_a_completed_pairing() {
    let store = registered_store().await;
    let mut device_a = spawn_device(Arc::new(store.clone()), "user-a");
    let mut device_b = spawn_device(Arc::new(store.clone()), "user-b");
    run_exchange(&mut device_a, &mut device_b).await;

    pairing::unpair(&store, "user-a").await.unwrap();

    assert_eq!(pairing::pair_status(&store, "user-a").await.unwrap(), None);
    assert_eq!(pairing::pair_status(&store, "user-b").await.unwrap(), None);
    assert!(store.pairs().is_empty());
}
