// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! In-memory datastore for signed records.
//!
//! Every record in here has already passed its namespace validator; the
//! store only handles retention. Expiry is lazy on read and eager via the
//! node's sweeper task.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use kad_protocol::Record;

/// Default record lifetime.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(36 * 60 * 60);

#[derive(Clone, Debug)]
struct StoredRecord {
    record: Record,
    received: Instant,
}

/// In-memory map of record key to signed record, with TTL.
#[derive(Debug)]
pub struct RecordStore {
    ttl: Duration,
    records: HashMap<Bytes, StoredRecord>,
}

impl RecordStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: HashMap::new(),
        }
    }

    /// Store a validated record, replacing any previous one under the key.
    pub fn put(&mut self, record: Record) {
        let key = record.key.clone();
        self.records.insert(
            key,
            StoredRecord {
                record,
                received: Instant::now(),
            },
        );
    }

    /// Fetch a record, dropping it if its TTL has lapsed.
    pub fn get(&mut self, key: &[u8]) -> Option<Record> {
        let stored = self.records.get(key)?;
        if stored.received.elapsed() > self.ttl {
            self.records.remove(key);
            return None;
        }
        Some(stored.record.clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.records
            .get(key)
            .map(|s| s.received.elapsed() <= self.ttl)
            .unwrap_or(false)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Record> {
        self.records.remove(key).map(|s| s.record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Purge expired records. Returns how many were dropped.
    pub fn sweep(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.records.len();
        self.records.retain(|_, s| s.received.elapsed() <= ttl);
        let removed = before - self.records.len();
        if removed > 0 {
            debug!(removed, "swept expired records");
        }
        removed
    }
}
