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

//! Notification relay client.
//!
//! The relay is a small stateless HTTP service that resolves the sender to
//! their paired partner and dispatches the actual push message. This side
//! only makes the one call.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RelayError;

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    success: bool,
    #[serde(default)]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Client for the notification relay.
pub struct RelayClient {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            bearer_token,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }

    /// Send a notification to the paired partner.
    ///
    /// Returns the relay's downstream delivery id on success.
    pub async fn send_notification(
        &self,
        title: &str,
        body: &str,
    ) -> Result<Option<String>, RelayError> {
        let url = format!(
            "{}/sendNotification",
            self.base_url.trim_end_matches('/')
        );

        let mut request = self
            .client
            .post(&url)
            .json(&SendRequest { title, body });
        if let Some(token) = &self.bearer_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        let result = parse_response(status.as_u16(), &text)?;
        info!("Notification accepted by relay");
        Ok(result)
    }
}

/// Map the relay's wire contract to a typed result.
///
/// 200 carries `{success, response}`; everything else carries `{error}`
/// (401 unauthenticated, 404 unknown sender/partner, 400 unpaired or
/// tokenless partner, 500 downstream delivery failure).
fn parse_response(status: u16, body: &str) -> Result<Option<String>, RelayError> {
    if status == 200 {
        let parsed: SendResponse = serde_json::from_str(body)
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))?;
        if !parsed.success {
            return Err(RelayError::InvalidResponse(
                "relay reported success=false".to_string(),
            ));
        }
        return Ok(parsed.response);
    }

    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| body.to_string());
    Err(RelayError::Rejected { status, message })
}
