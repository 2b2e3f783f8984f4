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

//! Pairing session state.

use crate::bluetooth::DiscoveredPeer;

/// Why a session ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Empty local token; the session never started.
    Validation,
    /// Radio powered off or unavailable.
    HardwareUnavailable,
    /// No user record resolves to the received token. Retryable.
    PartnerNotFound,
    /// No stable local identity. Fatal to the session.
    LocalIdentityUnavailable,
    /// The pairing batch did not commit. Retryable.
    CommitFailed,
    /// The radio link dropped or the connection attempt failed.
    ConnectionFailed,
    /// The exchange did not finish within the session window.
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Validation => "Notification token is missing",
            FailureReason::HardwareUnavailable => "Bluetooth unavailable",
            FailureReason::PartnerNotFound => "Failed to find partner user",
            FailureReason::LocalIdentityUnavailable => "Local identity unavailable",
            FailureReason::CommitFailed => "Error completing pairing",
            FailureReason::ConnectionFailed => "Connection failed",
            FailureReason::Timeout => "Pairing timed out",
        }
    }

    /// Whether a fresh attempt can reasonably succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::PartnerNotFound
                | FailureReason::CommitFailed
                | FailureReason::ConnectionFailed
                | FailureReason::Timeout
        )
    }
}

/// Session status, surfaced verbatim to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Initializing,
    Searching,
    Connecting,
    LinkEstablished,
    Exchanging,
    Finalizing,
    Paired { partner_id: String },
    Failed(FailureReason),
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "Not connected",
            SessionStatus::Initializing => "Initializing...",
            SessionStatus::Searching => "Scanning for devices...",
            SessionStatus::Connecting => "Connecting...",
            SessionStatus::LinkEstablished => "Connected, discovering services...",
            SessionStatus::Exchanging => "Exchanging tokens...",
            SessionStatus::Finalizing => "Processing pairing...",
            SessionStatus::Paired { .. } => "Successfully paired!",
            SessionStatus::Failed(reason) => reason.as_str(),
        }
    }

    /// True while an exchange is underway.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Initializing
                | SessionStatus::Searching
                | SessionStatus::Connecting
                | SessionStatus::LinkEstablished
                | SessionStatus::Exchanging
                | SessionStatus::Finalizing
        )
    }

    pub fn is_paired(&self) -> bool {
        matches!(self, SessionStatus::Paired { .. })
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient state of one "start pairing" invocation.
#[derive(Debug, Default)]
pub struct PairingSession {
    pub local_token: String,
    pub remote_token: Option<String>,
    /// Finalization guard: set at most once per session, re-armed only on a
    /// retryable finalize failure.
    pub exchange_completed: bool,
    pub status: SessionStatus,
    /// Address of the peer a connection was requested to.
    pub selected: Option<String>,
    /// Central-role writable channel exists.
    pub outbound_ready: bool,
    /// Local token was pushed on this link.
    pub token_sent: bool,
    peers: Vec<DiscoveredPeer>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Idle
    }
}

impl PairingSession {
    /// Reset for a new session with the given local token. Discovered peers,
    /// the remote token and the exchange flag are always cleared.
    pub fn reset(&mut self, local_token: String) {
        *self = PairingSession {
            local_token,
            ..PairingSession::default()
        };
    }

    /// Append a peer unless its address is already known. Insertion order is
    /// preserved for display.
    pub fn add_peer(&mut self, peer: DiscoveredPeer) -> bool {
        if self.peers.iter().any(|p| p.address == peer.address) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn has_peer(&self, address: &str) -> bool {
        self.peers.iter().any(|p| p.address == address)
    }

    pub fn peers(&self) -> &[DiscoveredPeer] {
        &self.peers
    }

    /// A token is loaded and the session has not reached a terminal state;
    /// newly ready roles should join in.
    pub fn is_pending(&self) -> bool {
        !self.local_token.is_empty() && !self.status.is_paired()
    }

    /// Both tokens are known, so finalization can be attempted.
    pub fn tokens_known(&self) -> bool {
        !self.local_token.is_empty() && self.remote_token.is_some()
    }

    /// Drop connection-scoped state after a link failure, keeping the token
    /// and the discovered peers so a retry can proceed.
    pub fn clear_link(&mut self) {
        self.selected = None;
        self.outbound_ready = false;
        self.token_sent = false;
    }
}
