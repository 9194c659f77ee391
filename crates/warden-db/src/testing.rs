// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared helpers for tests that need a database.
//!
//! Every helper hands back a hermetic in-memory pool. The pool is
//! pinned to one connection so all handles see the same database;
//! with more connections each would open its own private `:memory:`
//! instance.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::ledger::SqliteAuditLedger;
use crate::ratelimit::SqliteRateLimiter;

/// Create an empty in-memory pool.
pub async fn create_test_pool() -> SqlitePool {
	SqlitePoolOptions::new()
		.max_connections(1)
		.connect(":memory:")
		.await
		.expect("Failed to create test pool")
}

/// Pool with the provision_records table.
pub async fn create_ledger_test_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	SqliteAuditLedger::migrate(&pool).await.expect("Failed to create ledger tables");
	pool
}

/// Pool with the rate_windows table.
pub async fn create_ratelimit_test_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	SqliteRateLimiter::migrate(&pool).await.expect("Failed to create rate limiter tables");
	pool
}

/// Pool with every table this crate owns. Broker-level tests use this
/// so one database backs the ledger and the rate limiter together.
pub async fn create_broker_test_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	SqliteAuditLedger::migrate(&pool).await.expect("Failed to create ledger tables");
	SqliteRateLimiter::migrate(&pool).await.expect("Failed to create rate limiter tables");
	pool
}
