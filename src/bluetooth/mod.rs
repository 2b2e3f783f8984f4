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

//! Bluetooth radio module.
//!
//! Runs both BLE roles at once: the advertiser serves the token
//! characteristic, the scanner discovers and connects to peers advertising
//! the same service. Note that nothing here authenticates the peer. Any
//! device speaking the fixed service UUID can take part in an exchange;
//! proximity is the only gate.

pub mod ble_constants;

mod advertiser;
mod driver;
mod scanner;

pub use driver::{
    spawn_radio, DiscoveredPeer, HardwareState, RadioCommand, RadioEvent, Role,
};
