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

//! Pairing module.
//!
//! The token exchange engine, its session state and the finalizer that
//! turns a completed exchange into a persisted pairing.

mod engine;
mod finalizer;
mod session;

pub use engine::{EngineConfig, EngineHandle, PairingEngine, RadioReadiness};
pub use finalizer::{finalize, pair_status, unpair, PairingOutcome};
pub use session::{FailureReason, PairingSession, SessionStatus};
