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

//! Pairing finalization.
//!
//! Turns a completed token exchange into a persisted mutual pairing: the
//! received token is resolved to a partner id, every stale pair record
//! referencing either participant is superseded, and the new record plus
//! both partner pointers commit as one atomic batch.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::storage::{DocumentStore, PairRecord, WriteBatch};

/// Result of one finalization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// The pairing is persisted.
    Paired { partner_id: String },
    /// No user record resolves to the received token. Retryable.
    PartnerNotFound,
    /// No stable local identity. Fatal to the session.
    LocalIdentityUnavailable,
    /// The atomic batch did not commit. Retryable.
    CommitFailed(String),
}

/// Resolve the remote token and persist the mutual pairing.
pub async fn finalize(
    store: &dyn DocumentStore,
    local_id: Option<&str>,
    remote_token: &str,
) -> PairingOutcome {
    let matches = match store.find_users_by_token(remote_token).await {
        Ok(matches) => matches,
        Err(e) => {
            // Lookup trouble lands on the retryable not-found path.
            warn!("Partner lookup failed: {}", e);
            return PairingOutcome::PartnerNotFound;
        }
    };

    let Some((partner_id, _)) = matches.first() else {
        info!("No user record matches the received token");
        return PairingOutcome::PartnerNotFound;
    };
    if matches.len() > 1 {
        // Data-integrity risk: messaging tokens should be unique per user.
        warn!(
            "{} user records share the received token; taking the first match",
            matches.len()
        );
    }
    let partner_id = partner_id.clone();

    let Some(local_id) = local_id else {
        warn!("No local identity available; cannot finalize pairing");
        return PairingOutcome::LocalIdentityUnavailable;
    };

    // Supersede: every record referencing either side goes away in the same
    // batch that writes the new one, so there is never a window with two
    // live pairings for one user.
    let mut stale = match store.find_pairs_for_user(local_id).await {
        Ok(ids) => ids,
        Err(e) => return PairingOutcome::CommitFailed(e.to_string()),
    };
    match store.find_pairs_for_user(&partner_id).await {
        Ok(ids) => {
            for id in ids {
                if !stale.contains(&id) {
                    stale.push(id);
                }
            }
        }
        Err(e) => return PairingOutcome::CommitFailed(e.to_string()),
    }

    let pair_id = Uuid::new_v4().to_string();
    let mut batch = WriteBatch::new();
    for id in stale {
        batch = batch.delete_pair(id);
    }
    batch = batch
        .create_pair(
            pair_id,
            PairRecord {
                first: local_id.to_string(),
                second: partner_id.clone(),
                created_at: Utc::now(),
            },
        )
        .set_partner(local_id, partner_id.clone())
        .set_partner(partner_id.clone(), local_id);

    match store.commit(batch).await {
        Ok(()) => {
            info!("Paired with {}", partner_id);
            PairingOutcome::Paired { partner_id }
        }
        Err(e) => {
            warn!("Pairing batch failed: {}", e);
            PairingOutcome::CommitFailed(e.to_string())
        }
    }
}

/// Dissolve the current pairing: clear both partner pointers and delete
/// every pair record referencing the local user, atomically.
pub async fn unpair(store: &dyn DocumentStore, local_id: &str) -> Result<(), StoreError> {
    let Some(user) = store.get_user(local_id).await? else {
        return Ok(());
    };

    let mut batch = WriteBatch::new().set_partner(local_id, "");
    if user.is_paired() {
        batch = batch.set_partner(user.paired_with.clone(), "");
    }
    for pair_id in store.find_pairs_for_user(local_id).await? {
        batch = batch.delete_pair(pair_id);
    }

    store.commit(batch).await?;
    info!("Pairing removed");
    Ok(())
}

/// Current partner of the local user, if any.
pub async fn pair_status(
    store: &dyn DocumentStore,
    local_id: &str,
) -> Result<Option<String>, StoreError> {
    Ok(store
        .get_user(local_id)
        .await?
        .filter(|user| user.is_paired())
        .map(|user| user.paired_with))
}
