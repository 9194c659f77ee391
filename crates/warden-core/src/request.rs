// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Provision requests and their derived fingerprints.
//!
//! Two requests with the same credential type and the same context map must
//! land on the same cache entry, regardless of the order context was
//! attached in. The context lives in a `BTreeMap` and the fingerprint hashes
//! length-prefixed `key`/`value` pairs, so the derivation is deterministic
//! and unambiguous.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single credential provisioning request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRequest {
	/// Credential class being requested; must name a configured spec.
	pub credential_type: String,
	/// Identity of the calling service.
	pub caller_service: String,
	/// Caller-supplied context, ordered for deterministic fingerprints.
	pub context: BTreeMap<String, String>,
	/// When the request was created.
	pub requested_at: DateTime<Utc>,
}

impl CredentialRequest {
	pub fn new(credential_type: impl Into<String>, caller_service: impl Into<String>) -> Self {
		Self {
			credential_type: credential_type.into(),
			caller_service: caller_service.into(),
			context: BTreeMap::new(),
			requested_at: Utc::now(),
		}
	}

	/// Attach one context field.
	pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.context.insert(key.into(), value.into());
		self
	}

	/// Pin the request timestamp, mainly useful in tests.
	pub fn at(mut self, requested_at: DateTime<Utc>) -> Self {
		self.requested_at = requested_at;
		self
	}

	/// SHA-256 over the canonically ordered context map, rendered as hex.
	pub fn context_fingerprint(&self) -> String {
		let mut hasher = Sha256::new();
		for (key, value) in &self.context {
			hasher.update((key.len() as u64).to_be_bytes());
			hasher.update(key.as_bytes());
			hasher.update((value.len() as u64).to_be_bytes());
			hasher.update(value.as_bytes());
		}
		hex::encode(hasher.finalize())
	}

	/// Deterministic cache key for `(credential_type, context_fingerprint)`.
	pub fn cache_key(&self) -> CacheKey {
		let mut hasher = Sha256::new();
		hasher.update((self.credential_type.len() as u64).to_be_bytes());
		hasher.update(self.credential_type.as_bytes());
		hasher.update(self.context_fingerprint().as_bytes());
		CacheKey(hex::encode(hasher.finalize()))
	}

	/// Returns the required fields this request's context does not carry.
	pub fn missing_context_fields<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
		required
			.iter()
			.filter(|field| !self.context.contains_key(field.as_str()))
			.map(String::as_str)
			.collect()
	}
}

/// Deterministic identifier for one cache slot.
///
/// Derived, never constructed from caller input directly; the hex rendering
/// is safe to log and to persist as a column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
	/// Rehydrates a key previously rendered with [`CacheKey::as_str`], e.g.
	/// when read back from a ledger row.
	pub fn from_hex(hex: impl Into<String>) -> Self {
		Self(hex.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CacheKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}
