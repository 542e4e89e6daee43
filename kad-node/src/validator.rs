// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Namespaced record validation and selection.
//!
//! A record key `/<namespace>/<suffix>` routes to the validator registered
//! for its namespace. Validators answer two questions: is this record
//! acceptable at all, and which of several acceptable records under the
//! same key is the one to keep.
//!
//! Built-in namespaces:
//! - `pk`: public-key records; the suffix must be the SHA-256 of the value.
//! - `name`: naming records published under the author's own id, ordered by
//!   an explicit big-endian u64 sequence prefix in the value.
//! - `v`: generic records; callers order candidates newest-first and the
//!   freshest acceptable one wins.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use kad_protocol::{split_record_key, Record};

use crate::error::{DhtError, Result};
use crate::host::Host;

/// Validation and selection for one record namespace.
pub trait RecordValidator: Send + Sync {
    /// Accept or reject a record whose key carries this namespace.
    fn validate(&self, key: &[u8], record: &Record) -> Result<()>;

    /// Pick the best record among `candidates` (non-empty, all previously
    /// validated). Returns an index into the slice.
    fn select(&self, key: &[u8], candidates: &[Record]) -> usize;
}

/// Registry mapping namespace prefixes to validators.
///
/// Signature verification is common to all namespaces and happens here,
/// before namespace-specific rules: a record must carry a valid signature
/// by its author over `key || value`.
pub struct ValidatorRegistry {
    host: Arc<dyn Host>,
    validators: HashMap<String, Arc<dyn RecordValidator>>,
}

impl ValidatorRegistry {
    /// Registry with the built-in namespaces.
    pub fn with_defaults(host: Arc<dyn Host>) -> Self {
        let mut validators: HashMap<String, Arc<dyn RecordValidator>> = HashMap::new();
        validators.insert("pk".into(), Arc::new(PublicKeyValidator));
        validators.insert("name".into(), Arc::new(NameValidator));
        validators.insert("v".into(), Arc::new(GenericValidator));
        Self { host, validators }
    }

    /// Register or replace the validator for a namespace.
    pub fn register(&mut self, namespace: impl Into<String>, validator: Arc<dyn RecordValidator>) {
        self.validators.insert(namespace.into(), validator);
    }

    fn validator_for<'s, 'k>(
        &'s self,
        key: &'k [u8],
    ) -> Result<(&'k str, &'s Arc<dyn RecordValidator>)> {
        let (namespace, _) = split_record_key(key)?;
        let validator = self
            .validators
            .get(namespace)
            .ok_or_else(|| DhtError::UnknownNamespace(namespace.to_string()))?;
        Ok((namespace, validator))
    }

    /// Full validation: signature over `key || value`, then namespace rules.
    pub fn validate(&self, record: &Record) -> Result<()> {
        let (_, validator) = self.validator_for(&record.key)?;

        let mut signed = Vec::with_capacity(record.key.len() + record.value.len());
        signed.extend_from_slice(&record.key);
        signed.extend_from_slice(&record.value);
        if !self.host.verify(&record.author, &signed, &record.signature) {
            return Err(DhtError::Validation("bad record signature".into()));
        }

        validator.validate(&record.key, record)
    }

    /// Select the best among validated candidates for `key`.
    pub fn select(&self, key: &[u8], candidates: &[Record]) -> Result<usize> {
        if candidates.is_empty() {
            return Err(DhtError::Validation("no candidates to select from".into()));
        }
        let (_, validator) = self.validator_for(key)?;
        Ok(validator.select(key, candidates))
    }
}

/// `/pk/<sha256(value)>`: the value IS the public key.
struct PublicKeyValidator;

impl RecordValidator for PublicKeyValidator {
    fn validate(&self, key: &[u8], record: &Record) -> Result<()> {
        let (_, suffix) = split_record_key(key)?;
        let digest = Sha256::digest(&record.value);
        if suffix != digest.as_slice() {
            return Err(DhtError::Validation(
                "public-key record value does not hash to its key".into(),
            ));
        }
        Ok(())
    }

    fn select(&self, _key: &[u8], _candidates: &[Record]) -> usize {
        // All valid public-key records under one key are byte-identical.
        0
    }
}

/// `/name/<author-id>`: mutable pointers ordered by a u64 sequence prefix.
struct NameValidator;

impl NameValidator {
    fn sequence(record: &Record) -> Option<u64> {
        let head: [u8; 8] = record.value.get(..8)?.try_into().ok()?;
        Some(u64::from_be_bytes(head))
    }
}

impl RecordValidator for NameValidator {
    fn validate(&self, key: &[u8], record: &Record) -> Result<()> {
        let (_, suffix) = split_record_key(key)?;
        if suffix != record.author.as_bytes() {
            return Err(DhtError::Validation(
                "naming record not published under its author".into(),
            ));
        }
        if Self::sequence(record).is_none() {
            return Err(DhtError::Validation(
                "naming record value lacks a sequence prefix".into(),
            ));
        }
        Ok(())
    }

    fn select(&self, _key: &[u8], candidates: &[Record]) -> usize {
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(idx, r)| (Self::sequence(r).unwrap_or(0), std::cmp::Reverse(*idx)))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

/// `/v/<anything>`: no structural rules; freshest candidate wins.
struct GenericValidator;

impl RecordValidator for GenericValidator {
    fn validate(&self, _key: &[u8], _record: &Record) -> Result<()> {
        Ok(())
    }

    fn select(&self, _key: &[u8], _candidates: &[Record]) -> usize {
        // Callers present candidates newest-first.
        0
    }
}
