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

//! Error types for pairing intents and the external collaborators.

use thiserror::Error;

/// Errors surfaced to the caller of a pairing intent.
#[derive(Debug, Error)]
pub enum PairingError {
    /// The local notification token is empty; the session is not started.
    #[error("local notification token is empty")]
    EmptyToken,

    /// `select` named an address that is not in the discovered set.
    #[error("no discovered device with address {0}")]
    UnknownPeer(String),

    /// The engine task has shut down and can no longer accept intents.
    #[error("pairing engine is not running")]
    EngineClosed,
}

/// Errors from the document store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store rejected a request (non-success HTTP status).
    #[error("store request failed with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Transport-level failure reaching the store.
    #[error("store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A document could not be encoded or decoded.
    #[error("malformed store document: {0}")]
    Malformed(String),

    /// Injected or backend-internal commit failure.
    #[error("batch commit failed: {0}")]
    CommitFailed(String),
}

/// Errors from the notification relay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay answered with a non-success status and an error body.
    #[error("relay rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Transport-level failure reaching the relay.
    #[error("relay transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The relay answered 200 but the body was not the expected shape.
    #[error("unexpected relay response: {0}")]
    InvalidResponse(String),
}
