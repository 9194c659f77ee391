// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the encrypted cache.

use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur in the secret cache.
#[derive(Debug, Error)]
pub enum CacheError {
	/// Sealing a value for storage failed.
	#[error("encryption failed: {0}")]
	Encryption(String),

	/// A stored value failed authentication or decoding. The broker
	/// treats this as a miss; it must never surface to callers.
	#[error("stored value is corrupt: {0}")]
	Corrupt(String),

	/// The backing store failed.
	#[error("cache store error: {0}")]
	Store(#[from] sqlx::Error),

	/// The encryption key could not be derived from configuration.
	#[error("invalid cache encryption key: {0}")]
	InvalidKey(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_does_not_leak_internals() {
		let err = CacheError::Corrupt("aead tag mismatch".to_string());
		assert_eq!(err.to_string(), "stored value is corrupt: aead tag mismatch");
	}
}
