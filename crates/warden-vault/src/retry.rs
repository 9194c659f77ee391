// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded retry with exponential backoff and jitter.
//!
//! Every retry is spent inside the caller's latency budget, so the
//! defaults are deliberately tight: two attempts, sub-second delays.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// How a failed vault attempt is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
	/// Total attempts including the first one. 1 disables retry.
	pub max_attempts: u32,
	/// Delay before the first retry.
	pub base_delay: Duration,
	/// Upper bound on any single delay, before jitter.
	pub max_delay: Duration,
	/// Multiplier applied to the delay after each failed attempt.
	pub backoff_factor: f64,
	/// Randomize each delay to 50-150% of the computed value.
	pub jitter: bool,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 2,
			base_delay: Duration::from_millis(150),
			max_delay: Duration::from_secs(1),
			backoff_factor: 2.0,
			jitter: true,
		}
	}
}

impl RetryPolicy {
	/// A policy that never retries. Useful for health probes, where a
	/// stale answer is worse than a missing one.
	pub fn none() -> Self {
		Self { max_attempts: 1, ..Self::default() }
	}

	/// Delay to sleep after the given 1-based attempt has failed.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		// Cap the exponent so the f64 math cannot overflow to infinity.
		let exponent = attempt.saturating_sub(1).min(16);
		let raw = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent as i32);
		let capped = raw.min(self.max_delay.as_millis() as f64);
		let millis = if self.jitter { capped * (0.5 + fastrand::f64()) } else { capped };
		Duration::from_millis(millis as u64)
	}
}

/// Errors that can declare themselves worth retrying.
pub trait Retryable {
	fn is_retryable(&self) -> bool;
}

impl Retryable for crate::error::VaultError {
	fn is_retryable(&self) -> bool {
		self.is_transient()
	}
}

/// Run `attempt_fn` until it succeeds, fails permanently, or the
/// policy's attempt budget is spent. The final error is returned
/// unchanged so callers keep the full failure detail.
pub async fn retry_with<T, E, F, Fut>(
	policy: &RetryPolicy,
	operation: &str,
	mut attempt_fn: F,
) -> Result<T, E>
where
	E: Retryable + std::fmt::Display,
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	let mut attempt: u32 = 1;
	loop {
		match attempt_fn().await {
			Ok(value) => return Ok(value),
			Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
				let delay = policy.delay_for(attempt);
				warn!(
					operation,
					attempt,
					max_attempts = policy.max_attempts,
					delay_ms = delay.as_millis() as u64,
					error = %err,
					"transient failure, retrying"
				);
				tokio::time::sleep(delay).await;
				attempt += 1;
			}
			Err(err) => return Err(err),
		}
	}
}
