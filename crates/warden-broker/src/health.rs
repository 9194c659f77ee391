// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Aggregated backend health reporting.

use std::time::Duration;

/// Point-in-time reachability of the broker's backends.
///
/// Produced by [`CredentialBroker::health_check`](crate::CredentialBroker::health_check);
/// probing never fails, it reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
	/// The vault answered its health endpoint and reported serviceable.
	pub vault_reachable: bool,
	/// The encrypted cache's backing store answered a probe query.
	pub cache_reachable: bool,
	/// The audit ledger's backing store answered a probe query.
	pub ledger_reachable: bool,
	/// Round-trip time of the vault probe, when it completed.
	pub vault_latency: Option<Duration>,
}

impl HealthReport {
	/// Whether every backend is currently reachable.
	pub fn healthy(&self) -> bool {
		self.vault_reachable && self.cache_reachable && self.ledger_reachable
	}
}
