// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The [`SecretCache`] contract.
//!
//! The broker talks to the cache exclusively through this trait so
//! its orchestration logic can be tested against counting mocks.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use warden_core::{CacheKey, SecretString};

use crate::error::Result;

/// How long a fetch lease shields a key from duplicate upstream
/// fetches. Long enough for one vault round trip with a retry, short
/// enough that a crashed owner does not stall other callers.
pub const DEFAULT_FETCH_LEASE: Duration = Duration::from_secs(5);

/// Ceiling on how long a singleflight loser waits for the winner to
/// fill the cache before falling through to its own uncached fetch.
pub const DEFAULT_WAIT_CEILING: Duration = Duration::from_secs(2);

/// Poll interval used while waiting for a lease owner to fill.
pub const DEFAULT_WAIT_POLL: Duration = Duration::from_millis(50);

/// A decrypted cache entry.
#[derive(Debug)]
pub struct CacheHit {
	/// The cached credential value.
	pub value: SecretString,
	/// When the entry stops being servable.
	pub expires_at: DateTime<Utc>,
	/// Vault version marker recorded when the entry was filled.
	pub vault_version: String,
}

/// Encrypted, TTL-bounded storage for issued credentials, plus the
/// fetch-lease primitive that bounds concurrent upstream fetches to
/// one per key.
#[async_trait]
pub trait SecretCache: Send + Sync {
	/// Look up a live entry. Expired or unreadable entries report as
	/// misses.
	async fn get(&self, key: &CacheKey) -> Result<Option<CacheHit>>;

	/// Store a value, replacing any existing entry for the key.
	async fn put(
		&self,
		key: &CacheKey,
		value: &SecretString,
		ttl: Duration,
		vault_version: &str,
	) -> Result<()>;

	/// Remove an entry. Returns whether one existed.
	async fn evict(&self, key: &CacheKey) -> Result<bool>;

	/// Try to become the single fetcher for `key`. Granted when no
	/// lease exists or the existing one has expired.
	async fn try_acquire_fetch_lease(
		&self,
		key: &CacheKey,
		owner: &str,
		lease: Duration,
	) -> Result<bool>;

	/// Release a lease previously acquired by `owner`. Releasing a
	/// lease that expired or was taken over is a no-op.
	async fn release_fetch_lease(&self, key: &CacheKey, owner: &str) -> Result<()>;

	/// Poll for an entry to appear, up to `ceiling`. Used by callers
	/// that lost the lease race: the winner is fetching, so the value
	/// should arrive shortly.
	async fn wait_for_entry(
		&self,
		key: &CacheKey,
		poll: Duration,
		ceiling: Duration,
	) -> Result<Option<CacheHit>> {
		let started = tokio::time::Instant::now();
		loop {
			if let Some(hit) = self.get(key).await? {
				return Ok(Some(hit));
			}
			if started.elapsed() + poll > ceiling {
				return Ok(None);
			}
			tokio::time::sleep(poll).await;
		}
	}

	/// Verify the backing store is reachable.
	async fn health_check(&self) -> Result<()>;
}
