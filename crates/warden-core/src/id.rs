// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Typed identifiers used across the broker.
//!
//! Raw UUIDs never cross component boundaries; wrapping them keeps a record
//! id from being handed to a revocation call and vice versa.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a [`ProvisionRecord`](crate::ProvisionRecord).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
	pub fn new(id: Uuid) -> Self {
		Self(id)
	}

	pub fn generate() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn into_inner(self) -> Uuid {
		self.0
	}

	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl fmt::Display for RecordId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<Uuid> for RecordId {
	fn from(id: Uuid) -> Self {
		Self(id)
	}
}

impl From<RecordId> for Uuid {
	fn from(id: RecordId) -> Self {
		id.0
	}
}

/// Opaque token handed to callers on issuance and presented back to revoke.
///
/// Generated fresh for every provisioning attempt; it does not encode any
/// information about the credential it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceTokenId(Uuid);

impl SourceTokenId {
	pub fn new(id: Uuid) -> Self {
		Self(id)
	}

	pub fn generate() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn into_inner(self) -> Uuid {
		self.0
	}

	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl fmt::Display for SourceTokenId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SourceTokenId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Uuid::parse_str(s).map(Self)
	}
}

impl From<Uuid> for SourceTokenId {
	fn from(id: Uuid) -> Self {
		Self(id)
	}
}

impl From<SourceTokenId> for Uuid {
	fn from(id: SourceTokenId) -> Self {
		id.0
	}
}
