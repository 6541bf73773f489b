// Copyright 2020 Zero Go Authors
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

#[macro_use] extern crate lazy_static;

pub mod config;
pub mod sync;

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the number of seconds since the unix epoch.
pub fn sec_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns a compact `YYYYMMDD-HHMMSS`-ish signature derived from the unix
/// epoch, suitable for tagging file names produced by one server run.
pub fn time_signature() -> String {
    format!("{}", sec_since_epoch())
}

/// Returns the smallest of the two given values.
pub fn min<T: PartialOrd>(a: T, b: T) -> T {
    if a < b { a } else { b }
}

/// Returns the largest of the two given values.
pub fn max<T: PartialOrd>(a: T, b: T) -> T {
    if a > b { a } else { b }
}
