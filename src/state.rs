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

//! Application state management.
//!
//! The surface the presentation layer reads: session status, discovered
//! peers and the current partner. Written only by the pairing engine task.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::DiscoveredPeer;
use crate::pairing::SessionStatus;

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Current session status.
    status: RwLock<SessionStatus>,

    /// Last reported hardware status line.
    hardware: RwLock<String>,

    /// Discovered peers, insertion-ordered for display.
    peers: RwLock<Vec<DiscoveredPeer>>,

    /// Paired partner user id, if any.
    partner: RwLock<Option<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            status: RwLock::new(SessionStatus::Idle),
            hardware: RwLock::new(String::new()),
            peers: RwLock::new(Vec::new()),
            partner: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.write() = status;
    }

    pub fn status(&self) -> SessionStatus {
        self.status.read().clone()
    }

    /// Whether a token exchange is currently underway.
    pub fn is_exchanging(&self) -> bool {
        self.status.read().is_active()
    }

    pub fn set_hardware(&self, text: impl Into<String>) {
        *self.hardware.write() = text.into();
    }

    pub fn hardware(&self) -> String {
        self.hardware.read().clone()
    }

    pub fn clear_peers(&self) {
        self.peers.write().clear();
    }

    pub fn push_peer(&self, peer: DiscoveredPeer) {
        self.peers.write().push(peer);
    }

    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().clone()
    }

    pub fn has_peer(&self, address: &str) -> bool {
        self.peers.read().iter().any(|p| p.address == address)
    }

    pub fn set_partner(&self, partner: Option<String>) {
        *self.partner.write() = partner;
    }

    pub fn partner(&self) -> Option<String> {
        self.partner.read().clone()
    }
}
