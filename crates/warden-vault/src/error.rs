// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for vault access.

use thiserror::Error;

/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors that can occur while talking to the upstream vault.
#[derive(Debug, Error)]
pub enum VaultError {
	/// The vault could not be reached, timed out, or answered with a
	/// transient server-side status. These are the only retryable
	/// failures, and the only ones that permit a fallback source.
	#[error("vault unreachable: {0}")]
	Unreachable(String),

	/// The vault rejected the broker's own credentials.
	#[error("vault rejected broker credentials")]
	AuthFailed,

	/// No secret exists at the requested path.
	#[error("no secret at vault path '{path}'")]
	NotFound {
		/// The vault path that was requested.
		path: String,
	},

	/// The vault answered with something the client cannot interpret.
	#[error("unexpected vault response: {0}")]
	Protocol(String),

	/// The client was constructed with invalid settings.
	#[error("invalid vault client configuration: {0}")]
	InvalidConfig(String),
}

impl VaultError {
	/// Whether a fresh attempt against the same vault could plausibly
	/// succeed. Auth, not-found and protocol failures are permanent
	/// for a given request and must not be retried.
	pub fn is_transient(&self) -> bool {
		matches!(self, VaultError::Unreachable(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_unreachable_is_transient() {
		assert!(VaultError::Unreachable("connect refused".to_string()).is_transient());
		assert!(!VaultError::AuthFailed.is_transient());
		assert!(!VaultError::NotFound { path: "kv/a".to_string() }.is_transient());
		assert!(!VaultError::Protocol("bad json".to_string()).is_transient());
		assert!(!VaultError::InvalidConfig("missing base url".to_string()).is_transient());
	}

	#[test]
	fn not_found_names_the_path() {
		let err = VaultError::NotFound { path: "kv/deploy/github".to_string() };
		assert_eq!(err.to_string(), "no secret at vault path 'kv/deploy/github'");
	}
}
