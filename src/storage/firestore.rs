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

//! Firestore REST backend for the document store.
//!
//! Speaks the Firestore v1 REST API: document GET/PATCH, `:runQuery` for
//! field-equality lookups and `:commit` for atomic batches. Wire field names
//! follow the deployed schema (`pairedWith`, `createdAt`, `updatedAt`,
//! `first`/`second`); the legacy `user1`/`user2` pair spelling is still
//! queried so stale records from old clients get superseded too.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use super::{DocumentStore, UserRecord, WriteBatch, WriteOp};
use crate::error::StoreError;

const FIRESTORE_BASE: &str = "https://firestore.googleapis.com/v1";

/// Pair-record fields that may reference a participant, including the
/// legacy spelling.
const PAIR_REF_FIELDS: [&str; 4] = ["first", "second", "user1", "user2"];

/// Firestore-backed document store.
pub struct FirestoreStore {
    client: Client,
    project_id: String,
    bearer_token: Option<String>,
}

impl FirestoreStore {
    pub fn new(project_id: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            project_id: project_id.into(),
            bearer_token,
        }
    }

    /// `projects/{p}/databases/(default)/documents`
    fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/(default)/documents",
            self.project_id
        )
    }

    fn doc_url(&self, collection: &str, id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            FIRESTORE_BASE,
            self.documents_root(),
            collection,
            id
        )
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<Value, StoreError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    async fn run_query(&self, query: Value) -> Result<Vec<Value>, StoreError> {
        let url = format!("{}/{}:runQuery", FIRESTORE_BASE, self.documents_root());
        let response = self
            .request(self.client.post(&url))
            .json(&json!({ "structuredQuery": query }))
            .send()
            .await?;
        let body = self.check(response).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| StoreError::Malformed("runQuery did not return an array".into()))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("document").cloned())
            .collect())
    }

    fn equality_query(collection: &str, field: &str, value: &str) -> Value {
        json!({
            "from": [{ "collectionId": collection }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": field },
                    "op": "EQUAL",
                    "value": { "stringValue": value }
                }
            }
        })
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, StoreError> {
        let response = self
            .request(self.client.get(self.doc_url("users", user_id)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc = self.check(response).await?;
        Ok(Some(decode_user(&doc)?))
    }

    async fn upsert_user(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        let existing = self.get_user(user_id).await?;
        let now = Utc::now();

        // PATCH creates the document when it does not exist; created_at is
        // only written on insert.
        let (fields, mask) = match existing {
            Some(_) => (
                json!({
                    "token": { "stringValue": token },
                    "updatedAt": { "timestampValue": timestamp(now) },
                }),
                vec!["token", "updatedAt"],
            ),
            None => (
                json!({
                    "token": { "stringValue": token },
                    "pairedWith": { "stringValue": "" },
                    "createdAt": { "timestampValue": timestamp(now) },
                    "updatedAt": { "timestampValue": timestamp(now) },
                }),
                vec!["token", "pairedWith", "createdAt", "updatedAt"],
            ),
        };

        let mut url = format!("{}?", self.doc_url("users", user_id));
        for field in mask {
            url.push_str(&format!("updateMask.fieldPaths={field}&"));
        }

        let response = self
            .request(self.client.patch(&url))
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        self.check(response).await?;
        debug!("Synced token for user {}", user_id);
        Ok(())
    }

    async fn find_users_by_token(
        &self,
        token: &str,
    ) -> Result<Vec<(String, UserRecord)>, StoreError> {
        let docs = self
            .run_query(Self::equality_query("users", "token", token))
            .await?;
        let mut matches = Vec::with_capacity(docs.len());
        for doc in &docs {
            matches.push((doc_id(doc)?, decode_user(doc)?));
        }
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }

    async fn find_pairs_for_user(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for field in PAIR_REF_FIELDS {
            let docs = self
                .run_query(Self::equality_query("pairs", field, user_id))
                .await?;
            for doc in &docs {
                let id = doc_id(doc)?;
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let root = self.documents_root();
        let writes: Vec<Value> = batch
            .ops()
            .iter()
            .map(|op| encode_write(&root, op))
            .collect();

        let url = format!(
            "{}/projects/{}/databases/(default)/documents:commit",
            FIRESTORE_BASE, self.project_id
        );
        let response = self
            .request(self.client.post(&url))
            .json(&json!({ "writes": writes }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::CommitFailed(format!(
                "status {}: {}",
                status.as_u16(),
                message
            )));
        }
        Ok(())
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Extract the document id from a full resource name,
/// `projects/.../documents/users/{id}`.
fn doc_id(doc: &Value) -> Result<String, StoreError> {
    doc.get("name")
        .and_then(Value::as_str)
        .and_then(|name| name.rsplit('/').next())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Malformed("document without a name".into()))
}

fn string_field(fields: &Value, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(|v| v.get("stringValue"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn timestamp_field(fields: &Value, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| v.get("timestampValue"))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

fn decode_user(doc: &Value) -> Result<UserRecord, StoreError> {
    let fields = doc
        .get("fields")
        .ok_or_else(|| StoreError::Malformed("user document without fields".into()))?;
    let token = string_field(fields, "token")
        .ok_or_else(|| StoreError::Malformed("user document without token".into()))?;
    Ok(UserRecord {
        token,
        paired_with: string_field(fields, "pairedWith").unwrap_or_default(),
        created_at: timestamp_field(fields, "createdAt").unwrap_or_else(Utc::now),
        updated_at: timestamp_field(fields, "updatedAt").unwrap_or_else(Utc::now),
    })
}

fn encode_write(root: &str, op: &WriteOp) -> Value {
    match op {
        WriteOp::CreatePair { pair_id, record } => json!({
            "update": {
                "name": format!("{root}/pairs/{pair_id}"),
                "fields": {
                    "first": { "stringValue": record.first },
                    "second": { "stringValue": record.second },
                    "createdAt": { "timestampValue": timestamp(record.created_at) },
                }
            },
            // Creation only: fail the batch if the id already exists.
            "currentDocument": { "exists": false }
        }),
        WriteOp::SetPartner {
            user_id,
            partner_id,
        } => json!({
            "update": {
                "name": format!("{root}/users/{user_id}"),
                "fields": {
                    "pairedWith": { "stringValue": partner_id },
                    "updatedAt": { "timestampValue": timestamp(Utc::now()) },
                }
            },
            "updateMask": { "fieldPaths": ["pairedWith", "updatedAt"] }
        }),
        WriteOp::DeletePair { pair_id } => json!({
            "delete": format!("{root}/pairs/{pair_id}")
        }),
    }
}
