// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Deterministic risk scoring for provisioning requests.
//!
//! All admission heuristics live in one place: [`RiskEvaluator::assess`] is a
//! pure function of the request, its credential spec, and an aggregated
//! [`AccessHistory`] view. It reads history but never writes, and it never
//! touches the vault or the cache; the broker applies the resulting score
//! against the thresholds in `warden-core`.
//!
//! The factors, in evaluation order:
//!
//! 1. Required context fields missing from the request
//! 2. Novelty of the `(caller_service, credential_type)` pairing
//! 3. Deviation from the caller's hour-of-day pattern
//! 4. Request-rate spike relative to the caller's hourly mean
//! 5. Recent denials for the same caller
//!
//! Each factor contributes a fixed weight; the sum is clamped to `[0, 100]`.
//! Weights are internal: anomaly labels and reasons describe *what* was
//! suspicious, never how much it scored.

use chrono::Timelike;
use tracing::debug;

use warden_core::{AccessHistory, CredentialRequest, CredentialSpec, RiskAssessment};

/// Weight added when any required context field is missing.
const WEIGHT_MISSING_CONTEXT: u32 = 40;

/// Weight added for a caller/credential pairing with no issuance history.
const WEIGHT_NOVEL_PAIRING: u32 = 25;

/// Weight added for a request outside the caller's hour-of-day pattern.
const WEIGHT_UNUSUAL_HOUR: u32 = 15;

/// Weight added when the last hour's request rate spikes above the mean.
const WEIGHT_RATE_SPIKE: u32 = 15;

/// Weight added per recent denial, up to [`DENIAL_WEIGHT_CAP`].
const WEIGHT_PER_RECENT_DENIAL: u32 = 10;

/// Ceiling on the recent-denials contribution.
const DENIAL_WEIGHT_CAP: u32 = 30;

/// Minimum prior requests before hour-of-day and rate deviations are judged.
/// Below this the caller has no established pattern to deviate from.
const MIN_HISTORY_FOR_PATTERNS: u64 = 12;

/// A last-hour rate above this multiple of the caller's hourly mean counts
/// as a spike.
const RATE_SPIKE_FACTOR: f64 = 3.0;

/// Minimum last-hour request count before a spike is considered; keeps quiet
/// callers with a near-zero mean from tripping on a single request.
const RATE_SPIKE_FLOOR: u64 = 5;

/// Stateless evaluator; one instance serves all requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskEvaluator;

impl RiskEvaluator {
	pub fn new() -> Self {
		Self
	}

	/// Scores one request against its caller's history.
	///
	/// `spec` supplies the required context fields for the requested class;
	/// the caller has already resolved it from the registry.
	pub fn assess(
		&self,
		spec: &CredentialSpec,
		request: &CredentialRequest,
		history: &AccessHistory,
	) -> RiskAssessment {
		let mut score: u32 = 0;
		let mut anomalies = Vec::new();
		let mut reasons = Vec::new();

		// Required context fields
		let missing = request.missing_context_fields(&spec.required_context_fields);
		if !missing.is_empty() {
			score += WEIGHT_MISSING_CONTEXT;
			for field in &missing {
				anomalies.push(format!("missing_context_field:{field}"));
			}
			reasons.push(format!(
				"request is missing {} required context field(s): {}",
				missing.len(),
				missing.join(", ")
			));
		}

		// Pairing novelty
		if history.issued_for_pairing == 0 {
			score += WEIGHT_NOVEL_PAIRING;
			anomalies.push("new_caller_credential_pairing".to_string());
			reasons.push(format!(
				"no prior issuance of '{}' to caller '{}'",
				request.credential_type, request.caller_service
			));
		}

		// Hour-of-day deviation, only once a pattern exists
		let hour = request.requested_at.hour() as usize;
		if history.total_requests >= MIN_HISTORY_FOR_PATTERNS && history.hour_histogram[hour] == 0
		{
			score += WEIGHT_UNUSUAL_HOUR;
			anomalies.push("unusual_hour_of_day".to_string());
			reasons.push(format!(
				"caller '{}' has no prior activity in hour {hour:02} UTC",
				request.caller_service
			));
		}

		// Request-rate spike
		if let Some(mean) = hourly_mean(history) {
			if history.total_requests >= MIN_HISTORY_FOR_PATTERNS
				&& history.requests_last_hour >= RATE_SPIKE_FLOOR
				&& history.requests_last_hour as f64 > RATE_SPIKE_FACTOR * mean
			{
				score += WEIGHT_RATE_SPIKE;
				anomalies.push("request_rate_spike".to_string());
				reasons.push(format!(
					"{} requests in the last hour against an hourly mean of {mean:.2}",
					history.requests_last_hour
				));
			}
		}

		// Recent denials
		if history.recent_denials > 0 {
			let contribution =
				(history.recent_denials as u32 * WEIGHT_PER_RECENT_DENIAL).min(DENIAL_WEIGHT_CAP);
			score += contribution;
			anomalies.push("repeated_recent_denials".to_string());
			reasons.push(format!(
				"caller '{}' was denied {} time(s) recently",
				request.caller_service, history.recent_denials
			));
		}

		let score = score.min(100) as u8;
		debug!(
			credential_type = %request.credential_type,
			caller_service = %request.caller_service,
			score,
			anomaly_count = anomalies.len(),
			"risk assessment complete"
		);

		RiskAssessment {
			score,
			anomalies,
			reasons,
		}
	}
}

/// Mean requests per hour across the lookback window, when defined.
fn hourly_mean(history: &AccessHistory) -> Option<f64> {
	if history.lookback_hours == 0 {
		return None;
	}
	Some(history.total_requests as f64 / history.lookback_hours as f64)
}
