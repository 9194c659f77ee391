// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Upstream vault access for warden.
//!
//! This crate owns everything that talks to the external secret
//! vault: the [`VaultClient`] trait and its HTTP implementation, the
//! bounded retry machinery, and the [`FallbackSource`] consulted when
//! the vault is down. Nothing here decides *whether* a secret may be
//! released; that is the broker's job.

pub mod client;
pub mod error;
pub mod fallback;
pub mod retry;

pub use client::{
	FetchedSecret, HttpVaultClient, HttpVaultClientBuilder, VaultClient, VaultHealth,
	DEFAULT_FETCH_TIMEOUT,
};
pub use error::{Result, VaultError};
pub use fallback::{EnvFallback, FallbackSource, StaticFallback};
pub use retry::{retry_with, RetryPolicy, Retryable};
