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

//! Local device identity.
//!
//! The auth provider is a black box from the pairing core's point of view:
//! all it has to produce is a stable user id and, optionally, a bearer
//! credential. Here the id and the messaging token are generated once and
//! persisted in the data directory; the token is a stand-in for the external
//! push-registration service and is opaque to everything downstream.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Stable local identity plus the current messaging token.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    user_id: String,
    messaging_token: String,
}

impl DeviceIdentity {
    /// Load the identity from the data directory, generating and persisting
    /// any missing piece.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let user_id = load_or_create(data_dir, "device_id")?;
        let messaging_token = load_or_create(data_dir, "notify_token")?;
        info!("Local user id: {}", user_id);
        Ok(Self {
            user_id,
            messaging_token,
        })
    }

    /// Stable user identifier, used as the document key in the store.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current push-messaging token. Opaque; exchanged during pairing.
    pub fn messaging_token(&self) -> &str {
        &self.messaging_token
    }
}

fn load_or_create(data_dir: &Path, file_name: &str) -> Result<String> {
    let path = data_dir.join(file_name);
    if path.exists() {
        let value = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {path:?}"))?;
        let value = value.trim().to_string();
        if !value.is_empty() {
            return Ok(value);
        }
    }

    let value = Uuid::new_v4().to_string();
    std::fs::write(&path, &value).with_context(|| format!("failed to write {path:?}"))?;
    Ok(value)
}
