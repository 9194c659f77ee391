// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fixed-window rate limiting per caller service.
//!
//! One counter row per `(caller_service, window_start)`. The window
//! boundary is computed from wall-clock epoch seconds, so counters
//! reset implicitly when the window rolls over. Simplicity is favored
//! over fairness: no leaky-bucket smoothing.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::debug;

use crate::error::Result;

/// Default request budget per caller per window.
pub const DEFAULT_RATE_LIMIT: u32 = 10;

/// Default window length.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(3600);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
	/// Whether this request fits in the caller's budget.
	pub allowed: bool,
	/// Budget left in the current window after this request.
	pub remaining: u32,
}

/// Admission control per caller service.
#[async_trait]
pub trait RateLimiter: Send + Sync {
	/// Count this request against the caller's current window and
	/// report whether it fits. `credential_type` is diagnostic only;
	/// the window is per caller.
	async fn allow(&self, caller_service: &str, credential_type: &str) -> Result<RateDecision>;
}

/// [`RateLimiter`] over SQLite, safe under concurrent increments from
/// multiple processes: increment-and-read is a single upsert with
/// `RETURNING`.
pub struct SqliteRateLimiter {
	pool: SqlitePool,
	limit: u32,
	window: Duration,
}

impl SqliteRateLimiter {
	pub fn new(pool: SqlitePool, limit: u32, window: Duration) -> Self {
		Self { pool, limit, window }
	}

	pub fn with_defaults(pool: SqlitePool) -> Self {
		Self::new(pool, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW)
	}

	/// Create the counter table if it does not exist. Safe to run on
	/// every startup.
	pub async fn migrate(pool: &SqlitePool) -> Result<()> {
		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS rate_windows (
				caller_service TEXT NOT NULL,
				window_start INTEGER NOT NULL,
				count INTEGER NOT NULL DEFAULT 0,
				PRIMARY KEY (caller_service, window_start)
			)
			"#,
		)
		.execute(pool)
		.await?;

		Ok(())
	}
}

/// Floor epoch seconds to the start of the containing window.
fn window_start_for(epoch_seconds: i64, window_seconds: i64) -> i64 {
	(epoch_seconds / window_seconds) * window_seconds
}

#[async_trait]
impl RateLimiter for SqliteRateLimiter {
	#[tracing::instrument(skip(self), fields(caller = caller_service, credential_type))]
	async fn allow(&self, caller_service: &str, credential_type: &str) -> Result<RateDecision> {
		let window_seconds = self.window.as_secs().max(1) as i64;
		let window_start = window_start_for(Utc::now().timestamp(), window_seconds);

		// Counters from closed windows are dead weight; sweep them
		// while we are here.
		sqlx::query("DELETE FROM rate_windows WHERE window_start < ?")
			.bind(window_start)
			.execute(&self.pool)
			.await?;

		let count: i64 = sqlx::query_scalar(
			r#"
			INSERT INTO rate_windows (caller_service, window_start, count)
			VALUES (?, ?, 1)
			ON CONFLICT(caller_service, window_start) DO UPDATE SET count = count + 1
			RETURNING count
			"#,
		)
		.bind(caller_service)
		.bind(window_start)
		.fetch_one(&self.pool)
		.await?;

		let allowed = count <= self.limit as i64;
		let remaining = (self.limit as i64 - count).max(0) as u32;
		debug!(count, allowed, remaining, "rate window increment");
		Ok(RateDecision { allowed, remaining })
	}
}
