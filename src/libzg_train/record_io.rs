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

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::record::{Record, Records};

/// Accumulates records and flushes them to disk as self-contained JSON
/// payloads, one file per flush, named
/// `{prefix}-{counter}.json`. With an empty directory the buffer only
/// accumulates, which is what tests want.
pub struct RecordBuffer {
    dir: String,
    prefix: String,
    records: Vec<Record>,
    save_counter: usize
}

impl RecordBuffer {
    /// # Arguments
    ///
    /// * `dir` - target directory, empty to disable persistence
    /// * `prefix` - encodes game kind, server id and version pair
    ///
    pub fn new(dir: &str, prefix: &str) -> Self {
        Self {
            dir: dir.to_string(),
            prefix: prefix.to_string(),
            records: vec! [],
            save_counter: 0
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn feed(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Serialize the buffered records into one `Records` payload and
    /// append it to disk. Returns the path written, if any.
    pub fn save_current(&mut self) -> Option<PathBuf> {
        if self.dir.is_empty() || self.records.is_empty() {
            return None;
        }

        let payload = Records {
            identity: self.prefix.clone(),
            records: self.records.clone(),
            states: vec! []
        };
        let path = PathBuf::from(&self.dir)
            .join(format!("{}-{}.json", self.prefix, self.save_counter));

        self.save_counter += 1;

        if let Err(reason) = self.write_to(&path, &payload) {
            warn!("could not persist {} records to {:?}: {}", self.records.len(), path, reason);
            return None;
        }

        debug!("persisted {} records to {:?}", self.records.len(), path);
        Some(path)
    }

    fn write_to(&self, path: &PathBuf, payload: &Records) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let body = serde_json::to_vec(payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = fs::File::create(path)?;

        file.write_all(&body)
    }
}

/// Read one persisted payload back.
///
/// # Arguments
///
/// * `path` -
///
pub fn load_records(path: &Path) -> io::Result<Records> {
    let body = fs::read(path)?;

    serde_json::from_slice(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
