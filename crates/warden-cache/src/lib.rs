// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Encrypted secret cache for warden.
//!
//! Stores issued credentials encrypted at rest (AES-256-GCM under a
//! key derived from the configured cache secret) with TTL expiry, and
//! provides the fetch-lease primitive the broker uses to bound
//! concurrent vault fetches to one per cache key.

pub mod cache;
pub mod encryption;
pub mod error;
pub mod sqlite;

pub use cache::{
	CacheHit, SecretCache, DEFAULT_FETCH_LEASE, DEFAULT_WAIT_CEILING, DEFAULT_WAIT_POLL,
};
pub use encryption::{CacheCipher, SealedSecret, KEY_SIZE, NONCE_SIZE};
pub use error::{CacheError, Result};
pub use sqlite::EncryptedCache;
