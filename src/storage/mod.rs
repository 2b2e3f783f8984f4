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

//! Document store abstraction.
//!
//! The pairing core only needs a handful of operations against the external
//! key-document store, so they are expressed as a trait with swappable
//! backends: an in-process memory store and a Firestore REST backend.

mod firestore;
mod memory;

pub use firestore::FirestoreStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A user document: `users/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Current push-messaging token. Opaque to the pairing logic.
    pub token: String,
    /// Partner user id; empty string means unpaired.
    pub paired_with: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn is_paired(&self) -> bool {
        !self.paired_with.is_empty()
    }
}

/// A pairing document: `pairs/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRecord {
    pub first: String,
    pub second: String,
    pub created_at: DateTime<Utc>,
}

impl PairRecord {
    /// Whether the record references the given user on either side.
    pub fn references(&self, user_id: &str) -> bool {
        self.first == user_id || self.second == user_id
    }
}

/// One write in an atomic batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create `pairs/{pair_id}`.
    CreatePair {
        pair_id: String,
        record: PairRecord,
    },
    /// Set `users/{user_id}.paired_with` (empty string unpairs) and refresh
    /// the update timestamp.
    SetPartner {
        user_id: String,
        partner_id: String,
    },
    /// Delete `pairs/{pair_id}`.
    DeletePair { pair_id: String },
}

/// An all-or-nothing batch of writes.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_pair(mut self, pair_id: impl Into<String>, record: PairRecord) -> Self {
        self.ops.push(WriteOp::CreatePair {
            pair_id: pair_id.into(),
            record,
        });
        self
    }

    pub fn set_partner(
        mut self,
        user_id: impl Into<String>,
        partner_id: impl Into<String>,
    ) -> Self {
        self.ops.push(WriteOp::SetPartner {
            user_id: user_id.into(),
            partner_id: partner_id.into(),
        });
        self
    }

    pub fn delete_pair(mut self, pair_id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::DeletePair {
            pair_id: pair_id.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// The operations the pairing core needs from the external store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a user document by id.
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Insert or update a user's messaging token. Inserts stamp
    /// `created_at`; every call refreshes `updated_at`.
    async fn upsert_user(&self, user_id: &str, token: &str) -> Result<(), StoreError>;

    /// All users whose token field equals `token`, with their ids.
    /// More than one match is possible and is the caller's problem to flag.
    async fn find_users_by_token(
        &self,
        token: &str,
    ) -> Result<Vec<(String, UserRecord)>, StoreError>;

    /// Ids of all pair records referencing the user on either side.
    async fn find_pairs_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError>;

    /// Commit a batch atomically: either every op applies or none does.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_builder_preserves_order() {
        let batch = WriteBatch::new()
            .delete_pair("old")
            .create_pair(
                "new",
                PairRecord {
                    first: "a".into(),
                    second: "b".into(),
                    created_at: Utc::now(),
                },
            )
            .set_partner("a", "b");

        assert_eq!(batch.ops().len(), 3);
        assert!(matches!(batch.ops()[0], WriteOp::DeletePair { .. }));
        assert!(matches!(batch.ops()[1], WriteOp::CreatePair { .. }));
        assert!(matches!(batch.ops()[2], WriteOp::SetPartner { .. }));
    }

    #[test]
    fn pair_record_references_either_side() {
        let record = PairRecord {
            first: "a".into(),
            second: "b".into(),
            created_at: Utc::now(),
        };
        assert!(record.references("a"));
        assert!(record.references("b"));
        assert!(!record.references("c"));
    }
}
