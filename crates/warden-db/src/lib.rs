// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite persistence for warden.
//!
//! Owns the two durable stores behind the broker: the append-only
//! audit ledger of provisioning attempts and the fixed-window rate
//! limiter. Also provides the shared pool constructor and the
//! in-memory pool helpers used by tests across the workspace.

pub mod error;
pub mod ledger;
pub mod pool;
pub mod ratelimit;
pub mod testing;

pub use error::{DbError, Result};
pub use ledger::{AuditLedger, LedgerQuery, RevokeOutcome, SqliteAuditLedger};
pub use pool::create_pool;
pub use ratelimit::{
	RateDecision, RateLimiter, SqliteRateLimiter, DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW,
};
