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

//! Token exchange engine.
//!
//! One task owns all session state. User intents, radio events and store
//! completions arrive on channels and are applied in order, so no two
//! transitions ever interleave. Completions carry the session epoch they
//! were started under and are discarded if the session has since changed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::finalizer::{self, PairingOutcome};
use super::session::{FailureReason, PairingSession, SessionStatus};
use crate::bluetooth::{HardwareState, RadioCommand, RadioEvent, Role};
use crate::config::PairingConfig;
use crate::error::PairingError;
use crate::state::AppState;
use crate::storage::DocumentStore;

/// Process-wide hardware readiness, one flag per role. Never reset by a
/// session.
#[derive(Debug, Clone, Copy, Default)]
pub struct RadioReadiness {
    pub advertiser: bool,
    pub scanner: bool,
}

impl RadioReadiness {
    fn set(&mut self, role: Role, ready: bool) {
        match role {
            Role::Advertiser => self.advertiser = ready,
            Role::Scanner => self.scanner = ready,
        }
    }

    fn any(&self) -> bool {
        self.advertiser || self.scanner
    }
}

/// Engine tuning, taken from the config file.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry_backoff: Duration,
    pub max_retries: u32,
    pub exchange_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(2),
            max_retries: 3,
            exchange_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&PairingConfig> for EngineConfig {
    fn from(config: &PairingConfig) -> Self {
        Self {
            retry_backoff: Duration::from_secs(config.retry_backoff_secs),
            max_retries: config.max_retries,
            exchange_timeout: Duration::from_secs(config.exchange_timeout_secs),
        }
    }
}

/// User intents accepted by the engine.
#[derive(Debug)]
enum Intent {
    Begin { token: String },
    Select { address: String },
    Cancel,
}

/// Everything the engine task reacts to.
#[derive(Debug)]
enum EngineEvent {
    Intent(Intent),
    Finalized { epoch: u64, outcome: PairingOutcome },
    RetryScan { epoch: u64 },
    SessionTimeout { epoch: u64 },
}

/// Cheap cloneable handle for issuing intents and watching status.
#[derive(Clone)]
pub struct EngineHandle {
    event_tx: mpsc::Sender<EngineEvent>,
    status_rx: watch::Receiver<SessionStatus>,
    state: Arc<AppState>,
}

impl EngineHandle {
    /// Start a pairing session with the local messaging token.
    ///
    /// An empty token is a validation error and starts nothing.
    pub async fn begin(&self, token: &str) -> Result<(), PairingError> {
        if token.trim().is_empty() {
            return Err(PairingError::EmptyToken);
        }
        self.send(Intent::Begin {
            token: token.to_string(),
        })
        .await
    }

    /// Connect to a previously discovered peer.
    pub async fn select(&self, address: &str) -> Result<(), PairingError> {
        if !self.state.has_peer(address) {
            return Err(PairingError::UnknownPeer(address.to_string()));
        }
        self.send(Intent::Select {
            address: address.to_string(),
        })
        .await
    }

    /// Stop the session. Safe from any state.
    pub async fn cancel(&self) -> Result<(), PairingError> {
        self.send(Intent::Cancel).await
    }

    /// Push-style status updates.
    pub fn status_updates(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    async fn send(&self, intent: Intent) -> Result<(), PairingError> {
        self.event_tx
            .send(EngineEvent::Intent(intent))
            .await
            .map_err(|_| PairingError::EngineClosed)
    }
}

/// The engine task state. Constructed and consumed by [`PairingEngine::spawn`].
pub struct PairingEngine {
    store: Arc<dyn DocumentStore>,
    local_user_id: Option<String>,
    config: EngineConfig,
    state: Arc<AppState>,
    radio_tx: mpsc::Sender<RadioCommand>,
    event_tx: mpsc::Sender<EngineEvent>,
    status_tx: watch::Sender<SessionStatus>,
    session: PairingSession,
    readiness: RadioReadiness,
    epoch: u64,
    retries_left: u32,
}

impl PairingEngine {
    /// Spawn the engine task and return its handle.
    pub fn spawn(
        store: Arc<dyn DocumentStore>,
        local_user_id: Option<String>,
        config: EngineConfig,
        radio_tx: mpsc::Sender<RadioCommand>,
        radio_rx: mpsc::Receiver<RadioEvent>,
        state: Arc<AppState>,
    ) -> EngineHandle {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);

        let engine = PairingEngine {
            store,
            local_user_id,
            config,
            state: state.clone(),
            radio_tx,
            event_tx: event_tx.clone(),
            status_tx,
            session: PairingSession::default(),
            readiness: RadioReadiness::default(),
            epoch: 0,
            retries_left: 0,
        };

        tokio::spawn(engine.run(event_rx, radio_rx));

        EngineHandle {
            event_tx,
            status_rx,
            state,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<EngineEvent>,
        mut radio: mpsc::Receiver<RadioEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(event) = radio.recv() => self.handle_radio(event).await,
                else => break,
            }
        }
        debug!("Pairing engine exited");
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Intent(Intent::Begin { token }) => self.begin(token).await,
            EngineEvent::Intent(Intent::Select { address }) => self.select(address).await,
            EngineEvent::Intent(Intent::Cancel) => self.cancel().await,
            EngineEvent::Finalized { epoch, outcome } => self.on_finalized(epoch, outcome).await,
            EngineEvent::RetryScan { epoch } => self.on_retry_scan(epoch).await,
            EngineEvent::SessionTimeout { epoch } => self.on_session_timeout(epoch).await,
        }
    }

    /// Start a new session. Any previous session is abandoned
    /// unconditionally.
    async fn begin(&mut self, token: String) {
        if token.trim().is_empty() {
            warn!("Pairing requested without a notification token");
            self.set_status(SessionStatus::Failed(FailureReason::Validation));
            return;
        }

        self.epoch += 1;
        self.retries_left = self.config.max_retries;
        self.send_radio(RadioCommand::Stop).await;

        self.session.reset(token);
        self.state.clear_peers();
        self.state.set_partner(None);
        self.set_status(SessionStatus::Initializing);

        self.start_ready_roles().await;
        self.arm_session_timeout();
    }

    async fn select(&mut self, address: String) {
        if !self.session.has_peer(&address) {
            warn!("Select for unknown peer {}", address);
            return;
        }
        info!("Connecting to {}", address);
        self.session.selected = Some(address.clone());
        self.set_status(SessionStatus::Connecting);
        self.send_radio(RadioCommand::Connect { address }).await;
    }

    async fn cancel(&mut self) {
        self.epoch += 1;
        self.send_radio(RadioCommand::Stop).await;
        self.session.reset(String::new());
        self.state.clear_peers();
        self.set_status(SessionStatus::Idle);
        info!("Pairing stopped");
    }

    async fn handle_radio(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::AdapterState { role, state } => self.on_adapter_state(role, state).await,
            RadioEvent::AdvertisingStarted => {
                debug!("Advertising cycle live");
                if self.session.status == SessionStatus::Initializing {
                    self.set_status(SessionStatus::Searching);
                }
            }
            RadioEvent::AdvertiseFailed(reason) => {
                warn!("Advertising failed: {}", reason);
                if self.session.status.is_active() {
                    self.set_status(SessionStatus::Failed(FailureReason::HardwareUnavailable));
                }
            }
            RadioEvent::PeerDiscovered(peer) => {
                if !self.session.status.is_active() {
                    return;
                }
                if self.session.add_peer(peer.clone()) {
                    info!("Discovered {} ({})", peer.address, peer.display_name());
                    self.state.push_peer(peer);
                }
            }
            RadioEvent::Linked { role } => {
                debug!("Link established via {:?} role", role);
                self.set_status(SessionStatus::LinkEstablished);
            }
            RadioEvent::OutboundReady => {
                self.session.outbound_ready = true;
                if !self.session.token_sent {
                    self.send_token().await;
                }
            }
            RadioEvent::TokenArrived(bytes) => self.process_received_token(bytes).await,
            RadioEvent::SendFailed(reason) => {
                warn!("Token send failed: {}", reason);
                self.session.token_sent = false;
            }
            RadioEvent::LinkFailed(reason) => {
                warn!("Connection failed: {}", reason);
                self.on_connection_failure().await;
            }
            RadioEvent::Disconnected => {
                if self.session.status.is_paired() {
                    return;
                }
                debug!("Link dropped before pairing completed");
                self.on_connection_failure().await;
            }
        }
    }

    async fn on_adapter_state(&mut self, role: Role, state: HardwareState) {
        let ready = state.is_ready();
        self.readiness.set(role, ready);
        self.state.set_hardware(state.as_str());

        if ready {
            // A role that comes up while a token is pending joins the
            // session, mirroring the hardware-state callbacks.
            if self.session.is_pending() {
                match role {
                    Role::Advertiser => {
                        let token = self.session.local_token.clone();
                        self.send_radio(RadioCommand::SetupAdvertiser { token }).await;
                    }
                    Role::Scanner => self.send_radio(RadioCommand::StartScan).await,
                }
                if self.session.status == SessionStatus::Initializing {
                    self.set_status(SessionStatus::Searching);
                }
            }
        } else if self.session.status.is_active() {
            self.set_status(SessionStatus::Failed(FailureReason::HardwareUnavailable));
        }
    }

    /// Begin whatever roles the hardware already confirmed.
    async fn start_ready_roles(&mut self) {
        if self.readiness.advertiser {
            let token = self.session.local_token.clone();
            self.send_radio(RadioCommand::SetupAdvertiser { token }).await;
        }
        if self.readiness.scanner {
            self.send_radio(RadioCommand::StartScan).await;
        }
        if self.readiness.any() {
            self.set_status(SessionStatus::Searching);
        }
    }

    /// Store the peer's token and arm finalization. Duplicate deliveries
    /// (read response plus notify) are absorbed by the exchange flag.
    async fn process_received_token(&mut self, bytes: Vec<u8>) {
        let Ok(token) = String::from_utf8(bytes) else {
            debug!("Ignoring undecodable token payload");
            return;
        };
        if token.is_empty() {
            return;
        }

        self.session.remote_token = Some(token);

        // Data can beat the outbound channel; send our token now if we
        // have not yet on this link.
        if !self.session.token_sent && self.session.outbound_ready {
            self.send_token().await;
        }

        self.try_finalize().await;
    }

    async fn send_token(&mut self) {
        if self.session.local_token.is_empty() {
            return;
        }
        self.session.token_sent = true;
        self.set_status(SessionStatus::Exchanging);
        let token = self.session.local_token.clone();
        self.send_radio(RadioCommand::SendToken { token }).await;
    }

    /// Kick off finalization at most once per session.
    async fn try_finalize(&mut self) {
        if self.session.exchange_completed || !self.session.tokens_known() {
            return;
        }
        let Some(remote) = self.session.remote_token.clone() else {
            return;
        };
        self.session.exchange_completed = true;
        self.set_status(SessionStatus::Finalizing);

        let store = self.store.clone();
        let local_id = self.local_user_id.clone();
        let epoch = self.epoch;
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let outcome = finalizer::finalize(store.as_ref(), local_id.as_deref(), &remote).await;
            let _ = event_tx.send(EngineEvent::Finalized { epoch, outcome }).await;
        });
    }

    async fn on_finalized(&mut self, epoch: u64, outcome: PairingOutcome) {
        if epoch != self.epoch {
            debug!("Discarding finalize result from a previous session");
            return;
        }

        match outcome {
            PairingOutcome::Paired { partner_id } => {
                self.state.set_partner(Some(partner_id.clone()));
                self.set_status(SessionStatus::Paired { partner_id });
                self.send_radio(RadioCommand::Stop).await;
            }
            PairingOutcome::PartnerNotFound => {
                // Re-arm so another delivery can retry the lookup.
                self.session.exchange_completed = false;
                self.set_status(SessionStatus::Failed(FailureReason::PartnerNotFound));
            }
            PairingOutcome::LocalIdentityUnavailable => {
                self.set_status(SessionStatus::Failed(
                    FailureReason::LocalIdentityUnavailable,
                ));
                self.send_radio(RadioCommand::Stop).await;
            }
            PairingOutcome::CommitFailed(reason) => {
                warn!("Pairing commit failed: {}", reason);
                self.session.exchange_completed = false;
                self.set_status(SessionStatus::Failed(FailureReason::CommitFailed));
            }
        }
    }

    /// Bounded retry: re-scan after a fixed backoff while the scanner role
    /// is ready and a token is still pending.
    async fn on_connection_failure(&mut self) {
        self.session.clear_link();

        if self.session.is_pending() && self.readiness.scanner && self.retries_left > 0 {
            self.retries_left -= 1;
            self.set_status(SessionStatus::Failed(FailureReason::ConnectionFailed));

            let event_tx = self.event_tx.clone();
            let epoch = self.epoch;
            let backoff = self.config.retry_backoff;
            tokio::spawn(async move {
                tokio::time::sleep(backoff).await;
                let _ = event_tx.send(EngineEvent::RetryScan { epoch }).await;
            });
        } else if self.session.status.is_active() {
            self.set_status(SessionStatus::Failed(FailureReason::ConnectionFailed));
        }
    }

    async fn on_retry_scan(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        if self.session.is_pending() && self.readiness.scanner {
            info!("Retrying scan after connection failure");
            self.send_radio(RadioCommand::StartScan).await;
            self.set_status(SessionStatus::Searching);
        }
    }

    async fn on_session_timeout(&mut self, epoch: u64) {
        if epoch != self.epoch {
            return;
        }
        if self.session.status.is_paired() || self.session.status == SessionStatus::Idle {
            return;
        }
        warn!("Pairing session timed out");
        self.send_radio(RadioCommand::Stop).await;
        self.session.clear_link();
        self.session.exchange_completed = false;
        self.set_status(SessionStatus::Failed(FailureReason::Timeout));
    }

    fn arm_session_timeout(&self) {
        let event_tx = self.event_tx.clone();
        let epoch = self.epoch;
        let timeout = self.config.exchange_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = event_tx.send(EngineEvent::SessionTimeout { epoch }).await;
        });
    }

    fn set_status(&mut self, status: SessionStatus) {
        debug!("Status: {}", status.as_str());
        self.session.status = status.clone();
        self.state.set_status(status.clone());
        let _ = self.status_tx.send(status);
    }

    async fn send_radio(&self, command: RadioCommand) {
        if self.radio_tx.send(command).await.is_err() {
            warn!("Radio driver is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::DiscoveredPeer;
    use crate::error::StoreError;
    use crate::storage::{MemoryStore, UserRecord, WriteBatch};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Memory store that counts partner lookups.
    #[derive(Clone)]
    struct CountingStore {
        inner: MemoryStore,
        lookups: Arc<AtomicUsize>,
    }

    impl CountingStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                lookups: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for CountingStore {
        async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
            self.inner.get_user(user_id).await
        }

        async fn upsert_user(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
            self.inner.upsert_user(user_id, token).await
        }

        async fn find_users_by_token(
            &self,
            token: &str,
        ) -> Result<Vec<(String, UserRecord)>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_users_by_token(token).await
        }

        async fn find_pairs_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
            self.inner.find_pairs_for_user(user_id).await
        }

        async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
            self.inner.commit(batch).await
        }
    }

    /// Memory store with an artificial lookup delay.
    #[derive(Clone)]
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
            self.inner.get_user(user_id).await
        }

        async fn upsert_user(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
            self.inner.upsert_user(user_id, token).await
        }

        async fn find_users_by_token(
            &self,
            token: &str,
        ) -> Result<Vec<(String, UserRecord)>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.find_users_by_token(token).await
        }

        async fn find_pairs_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
            self.inner.find_pairs_for_user(user_id).await
        }

        async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
            self.inner.commit(batch).await
        }
    }

    struct Harness {
        handle: EngineHandle,
        commands: mpsc::Receiver<RadioCommand>,
        radio: mpsc::Sender<RadioEvent>,
        status: watch::Receiver<SessionStatus>,
        state: Arc<AppState>,
    }

    fn spawn_harness(store: Arc<dyn DocumentStore>, config: EngineConfig) -> Harness {
        let (radio_tx, commands) = mpsc::channel(64);
        let (radio_event_tx, radio_event_rx) = mpsc::channel(64);
        let state = AppState::new();
        let handle = PairingEngine::spawn(
            store,
            Some("user-a".to_string()),
            config,
            radio_tx,
            radio_event_rx,
            state.clone(),
        );
        let status = handle.status_updates();
        Harness {
            handle,
            commands,
            radio: radio_event_tx,
            status,
            state,
        }
    }

    async fn next_command(harness: &mut Harness) -> RadioCommand {
        tokio::time::timeout(Duration::from_secs(2), harness.commands.recv())
            .await
            .expect("timed out waiting for a radio command")
            .expect("command channel closed")
    }

    async fn expect_no_command(harness: &mut Harness, wait: Duration) {
        let result = tokio::time::timeout(wait, harness.commands.recv()).await;
        assert!(result.is_err(), "unexpected radio command: {result:?}");
    }

    async fn wait_status(
        harness: &mut Harness,
        predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> SessionStatus {
        let changed = tokio::time::timeout(
            Duration::from_secs(2),
            harness.status.wait_for(predicate),
        )
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed");
        changed.clone()
    }

    async fn both_roles_ready(harness: &Harness) {
        for role in [Role::Advertiser, Role::Scanner] {
            harness
                .radio
                .send(RadioEvent::AdapterState {
                    role,
                    state: HardwareState::Ready,
                })
                .await
                .unwrap();
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    fn peer(address: &str) -> DiscoveredPeer {
        DiscoveredPeer {
            address: address.to_string(),
            name: Some("Partner phone".to_string()),
        }
    }

    async fn seeded_memory() -> MemoryStore {
        let store = MemoryStore::new();
        store.upsert_user("user-a", "tok-a").await.unwrap();
        store.upsert_user("user-b", "tok-b").await.unwrap();
        store
    }

    #[tokio::test]
    async fn empty_token_starts_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut harness = spawn_harness(store, EngineConfig::default());
        both_roles_ready(&harness).await;

        let err = harness.handle.begin("   ").await.unwrap_err();
        assert!(matches!(err, PairingError::EmptyToken));

        expect_no_command(&mut harness, Duration::from_millis(100)).await;
        assert_eq!(harness.state.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn full_exchange_finalizes_exactly_once() {
        let counting = CountingStore::new(seeded_memory().await);
        let lookups = counting.lookups.clone();
        let memory = counting.inner.clone();
        let mut harness = spawn_harness(Arc::new(counting), EngineConfig::default());

        both_roles_ready(&harness).await;
        harness.handle.begin("tok-a").await.unwrap();

        assert!(matches!(next_command(&mut harness).await, RadioCommand::Stop));
        match next_command(&mut harness).await {
            RadioCommand::SetupAdvertiser { token } => assert_eq!(token, "tok-a"),
            other => panic!("expected advertiser setup, got {other:?}"),
        }
        assert!(matches!(
            next_command(&mut harness).await,
            RadioCommand::StartScan
        ));

        harness
            .radio
            .send(RadioEvent::PeerDiscovered(peer("AA:BB:CC:DD:EE:FF")))
            .await
            .unwrap();
        let state = harness.state.clone();
        wait_until(move || state.has_peer("AA:BB:CC:DD:EE:FF")).await;

        harness.handle.select("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert!(matches!(
            next_command(&mut harness).await,
            RadioCommand::Connect { .. }
        ));

        harness
            .radio
            .send(RadioEvent::Linked { role: Role::Scanner })
            .await
            .unwrap();
        harness.radio.send(RadioEvent::OutboundReady).await.unwrap();
        match next_command(&mut harness).await {
            RadioCommand::SendToken { token } => assert_eq!(token, "tok-a"),
            other => panic!("expected token send, got {other:?}"),
        }

        // Read response and notify deliver the same value twice.
        for _ in 0..2 {
            harness
                .radio
                .send(RadioEvent::TokenArrived(b"tok-b".to_vec()))
                .await
                .unwrap();
        }

        let status = wait_status(&mut harness, |s| {
            matches!(s, SessionStatus::Paired { .. } | SessionStatus::Failed(_))
        })
        .await;
        assert_eq!(
            status,
            SessionStatus::Paired {
                partner_id: "user-b".into()
            }
        );

        assert_eq!(lookups.load(Ordering::SeqCst), 1);
        assert_eq!(memory.pairs().len(), 1);
        assert_eq!(harness.state.partner().as_deref(), Some("user-b"));

        // Radio is released once paired.
        assert!(matches!(next_command(&mut harness).await, RadioCommand::Stop));
    }

    #[tokio::test]
    async fn begin_clears_previous_session_state() {
        let store = Arc::new(seeded_memory().await);
        let mut harness = spawn_harness(store, EngineConfig::default());

        both_roles_ready(&harness).await;
        harness.handle.begin("tok-a").await.unwrap();
        harness
            .radio
            .send(RadioEvent::PeerDiscovered(peer("AA:BB:CC:DD:EE:FF")))
            .await
            .unwrap();
        let state = harness.state.clone();
        wait_until(move || state.has_peer("AA:BB:CC:DD:EE:FF")).await;

        harness.handle.begin("tok-a2").await.unwrap();
        let state = harness.state.clone();
        wait_until(move || !state.has_peer("AA:BB:CC:DD:EE:FF")).await;
        assert!(harness.state.peers().is_empty());
    }

    #[tokio::test]
    async fn unknown_select_is_rejected_without_radio_traffic() {
        let store = Arc::new(seeded_memory().await);
        let mut harness = spawn_harness(store, EngineConfig::default());

        both_roles_ready(&harness).await;
        harness.handle.begin("tok-a").await.unwrap();

        // Drain the session start commands.
        for _ in 0..3 {
            next_command(&mut harness).await;
        }

        let err = harness.handle.select("11:22:33:44:55:66").await.unwrap_err();
        assert!(matches!(err, PairingError::UnknownPeer(_)));
        expect_no_command(&mut harness, Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn connection_failure_retries_scan_with_backoff() {
        let store = Arc::new(seeded_memory().await);
        let config = EngineConfig {
            retry_backoff: Duration::from_millis(20),
            max_retries: 1,
            exchange_timeout: Duration::from_secs(60),
        };
        let mut harness = spawn_harness(store, config);

        both_roles_ready(&harness).await;
        harness.handle.begin("tok-a").await.unwrap();
        for _ in 0..3 {
            next_command(&mut harness).await;
        }

        harness
            .radio
            .send(RadioEvent::LinkFailed("peer unreachable".into()))
            .await
            .unwrap();
        wait_status(&mut harness, |s| {
            matches!(s, SessionStatus::Failed(FailureReason::ConnectionFailed))
        })
        .await;

        // One bounded retry fires after the backoff...
        assert!(matches!(
            next_command(&mut harness).await,
            RadioCommand::StartScan
        ));

        // ...and a second failure is surfaced without another retry.
        harness
            .radio
            .send(RadioEvent::LinkFailed("peer unreachable".into()))
            .await
            .unwrap();
        expect_no_command(&mut harness, Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn partner_not_found_rearms_the_exchange() {
        let store = MemoryStore::new();
        store.upsert_user("user-a", "tok-a").await.unwrap();
        let shared = store.clone();
        let mut harness = spawn_harness(Arc::new(store), EngineConfig::default());

        both_roles_ready(&harness).await;
        harness.handle.begin("tok-a").await.unwrap();
        for _ in 0..3 {
            next_command(&mut harness).await;
        }

        harness
            .radio
            .send(RadioEvent::TokenArrived(b"tok-b".to_vec()))
            .await
            .unwrap();
        wait_status(&mut harness, |s| {
            matches!(s, SessionStatus::Failed(FailureReason::PartnerNotFound))
        })
        .await;

        // The partner registers; a duplicate delivery now succeeds because
        // the exchange flag was re-armed.
        shared.upsert_user("user-b", "tok-b").await.unwrap();
        harness
            .radio
            .send(RadioEvent::TokenArrived(b"tok-b".to_vec()))
            .await
            .unwrap();

        let status = wait_status(&mut harness, |s| matches!(s, SessionStatus::Paired { .. })).await;
        assert_eq!(
            status,
            SessionStatus::Paired {
                partner_id: "user-b".into()
            }
        );
    }

    #[tokio::test]
    async fn session_times_out_into_a_retriable_failure() {
        let store = Arc::new(seeded_memory().await);
        let config = EngineConfig {
            retry_backoff: Duration::from_secs(2),
            max_retries: 3,
            exchange_timeout: Duration::from_millis(50),
        };
        let mut harness = spawn_harness(store, config);

        both_roles_ready(&harness).await;
        harness.handle.begin("tok-a").await.unwrap();

        wait_status(&mut harness, |s| {
            matches!(s, SessionStatus::Failed(FailureReason::Timeout))
        })
        .await;
    }

    #[tokio::test]
    async fn cancel_discards_in_flight_finalization() {
        let slow = SlowStore {
            inner: seeded_memory().await,
            delay: Duration::from_millis(100),
        };
        let mut harness = spawn_harness(Arc::new(slow), EngineConfig::default());

        both_roles_ready(&harness).await;
        harness.handle.begin("tok-a").await.unwrap();
        for _ in 0..3 {
            next_command(&mut harness).await;
        }

        harness
            .radio
            .send(RadioEvent::TokenArrived(b"tok-b".to_vec()))
            .await
            .unwrap();
        wait_status(&mut harness, |s| matches!(s, SessionStatus::Finalizing)).await;

        harness.handle.cancel().await.unwrap();
        wait_status(&mut harness, |s| matches!(s, SessionStatus::Idle)).await;

        // The lookup finishes after cancellation; its result must not
        // resurrect the session.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(harness.state.status(), SessionStatus::Idle);
        assert!(harness.state.partner().is_none());
    }
}
