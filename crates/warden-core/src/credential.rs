// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Credential class definitions and the registry that owns them.
//!
//! A deployment brokers a closed set of credential classes. Each class is a
//! [`CredentialSpec`] loaded from configuration at process start; the
//! [`SpecRegistry`] validates the set once and stays immutable afterwards.
//! Adding a credential type is a configuration change, not a code change.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a credential type id.
pub const MAX_CREDENTIAL_ID_LEN: usize = 64;

/// Errors raised while validating or loading credential specs.
#[derive(Debug, Error)]
pub enum SpecError {
	#[error("invalid credential id '{id}': {reason}")]
	InvalidId { id: String, reason: &'static str },

	#[error("credential '{id}': {reason}")]
	InvalidSpec { id: String, reason: &'static str },

	#[error("duplicate credential id '{0}'")]
	DuplicateId(String),
}

/// Static configuration for one credential class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSpec {
	/// Identifier callers pass as `credential_type`.
	pub id: String,
	/// Path component of the vault read for this class.
	pub vault_path: String,
	/// Context fields a request must carry; a missing field is an anomaly.
	#[serde(default)]
	pub required_context_fields: Vec<String>,
	/// Scopes stamped onto issued credentials.
	#[serde(default)]
	pub scopes: Vec<String>,
	/// Credential lifetime in seconds.
	pub ttl_seconds: u64,
	/// Whether issued values may be cached.
	#[serde(default = "default_cacheable")]
	pub cacheable: bool,
	/// Environment key holding the static fallback value, if any.
	#[serde(default)]
	pub fallback_env_key: Option<String>,
}

fn default_cacheable() -> bool {
	true
}

impl CredentialSpec {
	/// Credential lifetime as a [`Duration`].
	pub fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl_seconds)
	}

	fn validate(&self) -> Result<(), SpecError> {
		validate_credential_id(&self.id)?;

		if self.vault_path.trim().is_empty() {
			return Err(SpecError::InvalidSpec {
				id: self.id.clone(),
				reason: "vault_path must not be empty",
			});
		}

		if self.ttl_seconds == 0 {
			return Err(SpecError::InvalidSpec {
				id: self.id.clone(),
				reason: "ttl_seconds must be positive",
			});
		}

		if let Some(key) = &self.fallback_env_key {
			if key.trim().is_empty() {
				return Err(SpecError::InvalidSpec {
					id: self.id.clone(),
					reason: "fallback_env_key must not be empty when set",
				});
			}
		}

		Ok(())
	}
}

/// Validates a credential type id.
///
/// Valid ids:
/// - Lowercase alphanumeric with `-` and `_`
/// - First character must be a lowercase letter
/// - 1-64 characters
pub fn validate_credential_id(id: &str) -> Result<(), SpecError> {
	if id.is_empty() || id.len() > MAX_CREDENTIAL_ID_LEN {
		return Err(SpecError::InvalidId {
			id: id.to_string(),
			reason: "must be 1-64 characters",
		});
	}

	let mut chars = id.chars();

	match chars.next() {
		Some(c) if c.is_ascii_lowercase() => {}
		_ => {
			return Err(SpecError::InvalidId {
				id: id.to_string(),
				reason: "must start with a lowercase letter",
			})
		}
	}

	if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_') {
		return Err(SpecError::InvalidId {
			id: id.to_string(),
			reason: "may only contain lowercase alphanumerics, '-' and '_'",
		});
	}

	Ok(())
}

/// The closed set of credential classes this deployment brokers.
///
/// Immutable after construction; lookups are by credential type id.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
	specs: HashMap<String, CredentialSpec>,
}

impl SpecRegistry {
	/// Builds a registry from the configured specs, validating each one and
	/// rejecting duplicate ids.
	pub fn from_specs(specs: Vec<CredentialSpec>) -> Result<Self, SpecError> {
		let mut map = HashMap::with_capacity(specs.len());
		for spec in specs {
			spec.validate()?;
			if map.contains_key(&spec.id) {
				return Err(SpecError::DuplicateId(spec.id));
			}
			map.insert(spec.id.clone(), spec);
		}
		Ok(Self { specs: map })
	}

	pub fn get(&self, credential_type: &str) -> Option<&CredentialSpec> {
		self.specs.get(credential_type)
	}

	pub fn contains(&self, credential_type: &str) -> bool {
		self.specs.contains_key(credential_type)
	}

	pub fn len(&self) -> usize {
		self.specs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.specs.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &CredentialSpec> {
		self.specs.values()
	}
}
