// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Risk assessment outputs and the history view they are computed from.
//!
//! Scoring itself lives in `warden-risk`; this module owns the types so the
//! evaluator, the ledger, and the broker agree on them without depending on
//! each other.

use serde::{Deserialize, Serialize};

/// Score at or above which a request is denied outright.
pub const RISK_DENY_THRESHOLD: u8 = 70;

/// Score at or above which an allowed request is flagged for enhanced audit.
pub const RISK_REVIEW_THRESHOLD: u8 = 50;

/// The policy outcome of a score, applied by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskAction {
	/// Proceed normally.
	Allow,
	/// Proceed, but flag the audit record for review.
	AllowWithReview,
	/// Refuse before any vault or cache access.
	Deny,
}

impl RiskAction {
	pub fn for_score(score: u8) -> Self {
		if score >= RISK_DENY_THRESHOLD {
			RiskAction::Deny
		} else if score >= RISK_REVIEW_THRESHOLD {
			RiskAction::AllowWithReview
		} else {
			RiskAction::Allow
		}
	}
}

/// The result of scoring one request against its caller's history.
///
/// Computed fresh per request and embedded in the audit record; never
/// persisted on its own. `reasons` are human-readable; `anomalies` are
/// stable machine-readable labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
	/// Suspicion score clamped to `[0, 100]`.
	pub score: u8,
	/// Stable anomaly labels, e.g. `missing_context_field:branch`.
	pub anomalies: Vec<String>,
	/// Human-readable explanations for each contributing factor.
	pub reasons: Vec<String>,
}

impl RiskAssessment {
	/// A zero-score assessment with no findings.
	pub fn clean() -> Self {
		Self {
			score: 0,
			anomalies: Vec::new(),
			reasons: Vec::new(),
		}
	}

	pub fn action(&self) -> RiskAction {
		RiskAction::for_score(self.score)
	}
}

/// Aggregated view of a caller's recent ledger activity.
///
/// Produced by the audit ledger, consumed read-only by the risk evaluator.
/// `Default` is the empty history: a caller the ledger has never seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessHistory {
	/// Attempts by this caller inside the lookback window, any outcome.
	pub total_requests: u64,
	/// Attempts by this caller in the last hour.
	pub requests_last_hour: u64,
	/// Attempt counts bucketed by UTC hour of day across the lookback.
	pub hour_histogram: [u32; 24],
	/// Issued records for this exact `(caller, credential_type)` pairing.
	pub issued_for_pairing: u64,
	/// Denied attempts by this caller inside the denial window.
	pub recent_denials: u64,
	/// Length of the lookback window, in hours.
	pub lookback_hours: u32,
}
