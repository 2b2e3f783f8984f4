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

//! BLE service and characteristic UUIDs for NudgeLink.

use uuid::Uuid;

/// NudgeLink pairing GATT service UUID. Both devices advertise and scan for
/// this one fixed service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x3d6a4f2e_9c1b_4e8d_a57f_6b21d08f35c4);

/// Token exchange characteristic UUID.
/// Properties: Read, Write, Write Without Response, Notify
pub const TOKEN_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x7f9c2b41_85d3_4a6e_b9f0_1c47e6a2d598);

/// Local name carried in the advertisement.
pub const ADVERTISED_NAME: &str = "NudgeLink";
