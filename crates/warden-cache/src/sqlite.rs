// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite-backed [`SecretCache`] with encryption at rest.
//!
//! Two tables: `cache_entries` holds sealed values, `fetch_leases`
//! holds the short-lived singleflight markers. Values never touch the
//! database unencrypted, and an entry that fails authentication is
//! evicted and reported as a miss.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use warden_core::{CacheKey, SecretString};

use crate::cache::{CacheHit, SecretCache};
use crate::encryption::{CacheCipher, SealedSecret, NONCE_SIZE};
use crate::error::{CacheError, Result};

/// Encrypted credential cache over SQLite.
pub struct EncryptedCache {
	pool: SqlitePool,
	cipher: CacheCipher,
}

impl EncryptedCache {
	pub fn new(pool: SqlitePool, cipher: CacheCipher) -> Self {
		Self { pool, cipher }
	}

	/// Create the cache tables if they do not exist. Safe to run on
	/// every startup.
	pub async fn migrate(pool: &SqlitePool) -> Result<()> {
		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS cache_entries (
				cache_key TEXT PRIMARY KEY,
				ciphertext BLOB NOT NULL,
				nonce BLOB NOT NULL,
				expires_at TEXT NOT NULL,
				vault_version TEXT NOT NULL
			)
			"#,
		)
		.execute(pool)
		.await?;

		sqlx::query(
			"CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at)",
		)
		.execute(pool)
		.await?;

		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS fetch_leases (
				cache_key TEXT PRIMARY KEY,
				owner TEXT NOT NULL,
				expires_at TEXT NOT NULL
			)
			"#,
		)
		.execute(pool)
		.await?;

		Ok(())
	}

	/// Drop a row that failed authentication or decoding so it cannot
	/// waste work on every future read.
	async fn discard_unreadable(&self, key: &CacheKey, detail: &str) -> Result<()> {
		warn!(key = %key, detail, "discarding unreadable cache entry");
		sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
			.bind(key.as_str())
			.execute(&self.pool)
			.await?;
		Ok(())
	}
}

#[async_trait]
impl SecretCache for EncryptedCache {
	#[tracing::instrument(skip(self), fields(key = %key))]
	async fn get(&self, key: &CacheKey) -> Result<Option<CacheHit>> {
		let row = sqlx::query(
			r#"
			SELECT ciphertext, nonce, expires_at, vault_version
			FROM cache_entries
			WHERE cache_key = ?
			"#,
		)
		.bind(key.as_str())
		.fetch_optional(&self.pool)
		.await?;

		let Some(row) = row else {
			debug!("cache miss");
			return Ok(None);
		};

		let expires_at_raw: String = row.get("expires_at");
		let expires_at = match DateTime::parse_from_rfc3339(&expires_at_raw) {
			Ok(parsed) => parsed.with_timezone(&Utc),
			Err(e) => {
				self.discard_unreadable(key, &format!("bad expires_at: {e}")).await?;
				return Ok(None);
			}
		};
		if expires_at <= Utc::now() {
			debug!("cache entry expired");
			sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
				.bind(key.as_str())
				.execute(&self.pool)
				.await?;
			return Ok(None);
		}

		let ciphertext: Vec<u8> = row.get("ciphertext");
		let nonce_raw: Vec<u8> = row.get("nonce");
		let nonce: [u8; NONCE_SIZE] = match nonce_raw.try_into() {
			Ok(nonce) => nonce,
			Err(_) => {
				self.discard_unreadable(key, "nonce has wrong length").await?;
				return Ok(None);
			}
		};

		let sealed = SealedSecret { ciphertext, nonce };
		let plaintext = match self.cipher.open(&sealed) {
			Ok(plaintext) => plaintext,
			Err(CacheError::Corrupt(detail)) => {
				self.discard_unreadable(key, &detail).await?;
				return Ok(None);
			}
			Err(other) => return Err(other),
		};
		let value = match std::str::from_utf8(&plaintext) {
			Ok(value) => SecretString::new(value.to_string()),
			Err(e) => {
				self.discard_unreadable(key, &format!("not utf-8: {e}")).await?;
				return Ok(None);
			}
		};

		debug!("cache hit");
		Ok(Some(CacheHit { value, expires_at, vault_version: row.get("vault_version") }))
	}

	#[tracing::instrument(skip(self, value), fields(key = %key, ttl_secs = ttl.as_secs()))]
	async fn put(
		&self,
		key: &CacheKey,
		value: &SecretString,
		ttl: Duration,
		vault_version: &str,
	) -> Result<()> {
		let now = Utc::now();

		// Opportunistic sweep keeps dead rows from accumulating in
		// deployments where reads are rare.
		sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
			.bind(now.to_rfc3339())
			.execute(&self.pool)
			.await?;

		let sealed = self.cipher.seal(value.expose().as_bytes())?;
		let expires_at = now + chrono::Duration::seconds(ttl.as_secs() as i64);

		sqlx::query(
			r#"
			INSERT INTO cache_entries (cache_key, ciphertext, nonce, expires_at, vault_version)
			VALUES (?, ?, ?, ?, ?)
			ON CONFLICT(cache_key) DO UPDATE SET
				ciphertext = excluded.ciphertext,
				nonce = excluded.nonce,
				expires_at = excluded.expires_at,
				vault_version = excluded.vault_version
			"#,
		)
		.bind(key.as_str())
		.bind(sealed.ciphertext)
		.bind(sealed.nonce.to_vec())
		.bind(expires_at.to_rfc3339())
		.bind(vault_version)
		.execute(&self.pool)
		.await?;

		debug!("cache entry written");
		Ok(())
	}

	#[tracing::instrument(skip(self), fields(key = %key))]
	async fn evict(&self, key: &CacheKey) -> Result<bool> {
		let result = sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
			.bind(key.as_str())
			.execute(&self.pool)
			.await?;
		let removed = result.rows_affected() > 0;
		debug!(removed, "cache eviction");
		Ok(removed)
	}

	#[tracing::instrument(skip(self), fields(key = %key, owner))]
	async fn try_acquire_fetch_lease(
		&self,
		key: &CacheKey,
		owner: &str,
		lease: Duration,
	) -> Result<bool> {
		let now = Utc::now();
		let lease_expires = now + chrono::Duration::milliseconds(lease.as_millis() as i64);

		// One conditional upsert: granted when no lease row exists or
		// the existing lease has expired. rows_affected tells us which.
		let result = sqlx::query(
			r#"
			INSERT INTO fetch_leases (cache_key, owner, expires_at)
			VALUES (?, ?, ?)
			ON CONFLICT(cache_key) DO UPDATE SET
				owner = excluded.owner,
				expires_at = excluded.expires_at
			WHERE fetch_leases.expires_at <= ?
			"#,
		)
		.bind(key.as_str())
		.bind(owner)
		.bind(lease_expires.to_rfc3339())
		.bind(now.to_rfc3339())
		.execute(&self.pool)
		.await?;

		let acquired = result.rows_affected() == 1;
		debug!(acquired, "fetch lease attempt");
		Ok(acquired)
	}

	#[tracing::instrument(skip(self), fields(key = %key, owner))]
	async fn release_fetch_lease(&self, key: &CacheKey, owner: &str) -> Result<()> {
		// Owner-checked so a stolen or expired lease cannot be
		// released out from under its new holder.
		sqlx::query("DELETE FROM fetch_leases WHERE cache_key = ? AND owner = ?")
			.bind(key.as_str())
			.bind(owner)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn health_check(&self) -> Result<()> {
		sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
		Ok(())
	}
}
