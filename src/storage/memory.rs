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

//! In-process document store, useful for tests and offline runs.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{DocumentStore, PairRecord, UserRecord, WriteBatch, WriteOp};
use crate::error::StoreError;

/// Memory-backed store. Cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    users: RwLock<HashMap<String, UserRecord>>,
    pairs: RwLock<HashMap<String, PairRecord>>,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit` fail, for exercising failure paths.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Snapshot of all pair records, for assertions.
    pub fn pairs(&self) -> Vec<(String, PairRecord)> {
        self.inner
            .pairs
            .read()
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.inner.users.read().get(user_id).cloned())
    }

    async fn upsert_user(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut users = self.inner.users.write();
        match users.get_mut(user_id) {
            Some(user) => {
                user.token = token.to_string();
                user.updated_at = now;
            }
            None => {
                users.insert(
                    user_id.to_string(),
                    UserRecord {
                        token: token.to_string(),
                        paired_with: String::new(),
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn find_users_by_token(
        &self,
        token: &str,
    ) -> Result<Vec<(String, UserRecord)>, StoreError> {
        let mut matches: Vec<(String, UserRecord)> = self
            .inner
            .users
            .read()
            .iter()
            .filter(|(_, user)| user.token == token)
            .map(|(id, user)| (id.clone(), user.clone()))
            .collect();
        // Stable order so "first match" is deterministic.
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }

    async fn find_pairs_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .pairs
            .read()
            .iter()
            .filter(|(_, record)| record.references(user_id))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.inner.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::CommitFailed("injected failure".to_string()));
        }

        // Apply to copies, then swap, so a batch is all-or-nothing even if
        // an op is rejected partway through.
        let mut users = self.inner.users.read().clone();
        let mut pairs = self.inner.pairs.read().clone();
        let now = Utc::now();

        for op in batch.ops() {
            match op {
                WriteOp::CreatePair { pair_id, record } => {
                    pairs.insert(pair_id.clone(), record.clone());
                }
                WriteOp::SetPartner {
                    user_id,
                    partner_id,
                } => {
                    let user = users.get_mut(user_id).ok_or_else(|| {
                        StoreError::CommitFailed(format!("no such user: {user_id}"))
                    })?;
                    user.paired_with = partner_id.clone();
                    user.updated_at = now;
                }
                WriteOp::DeletePair { pair_id } => {
                    pairs.remove(pair_id);
                }
            }
        }

        *self.inner.users.write() = users;
        *self.inner.pairs.write() = pairs;
        Ok(())
    }
}
