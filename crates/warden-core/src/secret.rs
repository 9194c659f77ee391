// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Secret wrapper types that prevent accidental logging of sensitive values.
//!
//! Credential material moves through the broker as [`SecretString`]: `Debug`
//! and `Display` render [`REDACTED`], the inner value is only reachable
//! through [`Secret::expose`], and the backing memory is zeroed on drop.

use std::fmt;

use serde::de::{Deserialize, Deserializer};
use zeroize::Zeroize;

/// Placeholder emitted wherever a secret would otherwise appear in output.
pub const REDACTED: &str = "[REDACTED]";

/// A wrapper that keeps a sensitive value out of logs and error chains.
///
/// Implements `Deserialize` but deliberately not `Serialize`: configuration
/// may load secrets, nothing may write them back out.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
	pub fn new(value: T) -> Self {
		Self(value)
	}

	/// Access the wrapped value.
	///
	/// Call sites are the audit surface for secret usage; keep them few.
	pub fn expose(&self) -> &T {
		&self.0
	}
}

impl<T: Zeroize> Drop for Secret<T> {
	fn drop(&mut self) {
		self.0.zeroize();
	}
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
	fn clone(&self) -> Self {
		Self(self.0.clone())
	}
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl<T: Zeroize> fmt::Display for Secret<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl<'de, T: Zeroize + Deserialize<'de>> Deserialize<'de> for Secret<T> {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		T::deserialize(deserializer).map(Secret::new)
	}
}

/// The common case: a secret UTF-8 string.
pub type SecretString = Secret<String>;

impl From<&str> for SecretString {
	fn from(value: &str) -> Self {
		Secret::new(value.to_string())
	}
}

impl From<String> for SecretString {
	fn from(value: String) -> Self {
		Secret::new(value)
	}
}
