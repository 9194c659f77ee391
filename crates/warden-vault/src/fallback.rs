// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Last-resort secret sources for vault outages.
//!
//! A fallback is only consulted when the vault is unreachable and the
//! credential explicitly opted in by naming a fallback key. Values
//! served from here are stale by definition, so they are never cached
//! and every issuance from a fallback is audited as such.

use std::collections::HashMap;

use tracing::warn;
use warden_core::SecretString;

/// A local source of pre-provisioned secret material.
pub trait FallbackSource: Send + Sync {
	/// Look up the fallback value stored under `key`. Empty values
	/// count as absent.
	fn lookup(&self, key: &str) -> Option<SecretString>;
}

/// Fallback source backed by the broker's own process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvFallback;

impl EnvFallback {
	pub fn new() -> Self {
		Self
	}
}

impl FallbackSource for EnvFallback {
	fn lookup(&self, key: &str) -> Option<SecretString> {
		match std::env::var(key) {
			Ok(value) if !value.is_empty() => Some(SecretString::new(value)),
			Ok(_) => {
				warn!(key, "fallback environment variable is set but empty");
				None
			}
			Err(_) => None,
		}
	}
}

/// In-memory fallback source. Used by deployments that inject
/// fallback material at startup rather than via the environment, and
/// by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticFallback {
	values: HashMap<String, String>,
}

impl StaticFallback {
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a fallback value under `key`, replacing any existing one.
	pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.values.insert(key.into(), value.into());
		self
	}
}

impl FallbackSource for StaticFallback {
	fn lookup(&self, key: &str) -> Option<SecretString> {
		self.values
			.get(key)
			.filter(|value| !value.is_empty())
			.map(|value| SecretString::new(value.clone()))
	}
}
