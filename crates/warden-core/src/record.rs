// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable provisioning records and their lifecycle types.
//!
//! Every provisioning attempt, issued or not, produces exactly one
//! [`ProvisionRecord`]. Records are append-only: the single permitted
//! mutation is setting `revoked_at`, once. The credential value itself is
//! never part of the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::{RecordId, SourceTokenId};
use crate::request::CacheKey;

/// Where an issued credential's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
	/// Fetched from the upstream vault on this request.
	Vault,
	/// Read from the static fallback configuration; only reachable when the
	/// vault was unreachable.
	Fallback,
	/// Served from the encrypted cache.
	Cache,
}

impl CredentialSource {
	pub fn as_str(&self) -> &'static str {
		match self {
			CredentialSource::Vault => "vault",
			CredentialSource::Fallback => "fallback",
			CredentialSource::Cache => "cache",
		}
	}
}

impl fmt::Display for CredentialSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl std::str::FromStr for CredentialSource {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"vault" => Ok(CredentialSource::Vault),
			"fallback" => Ok(CredentialSource::Fallback),
			"cache" => Ok(CredentialSource::Cache),
			_ => Err(format!("unknown credential source: {s}")),
		}
	}
}

/// Terminal state of one provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
	/// A credential value was returned to the caller.
	Issued,
	/// Admission control refused the request (rate limit or risk).
	Denied,
	/// The request was admitted but could not be satisfied.
	Failed,
}

impl ProvisionOutcome {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProvisionOutcome::Issued => "issued",
			ProvisionOutcome::Denied => "denied",
			ProvisionOutcome::Failed => "failed",
		}
	}
}

impl fmt::Display for ProvisionOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

impl std::str::FromStr for ProvisionOutcome {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"issued" => Ok(ProvisionOutcome::Issued),
			"denied" => Ok(ProvisionOutcome::Denied),
			"failed" => Ok(ProvisionOutcome::Failed),
			_ => Err(format!("unknown provision outcome: {s}")),
		}
	}
}

/// One append-only audit row for a provisioning attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRecord {
	/// Unique identifier for this record.
	pub id: RecordId,
	/// Credential class that was requested.
	pub credential_type: String,
	/// Identity of the calling service.
	pub caller_service: String,
	/// How the attempt ended.
	pub outcome: ProvisionOutcome,
	/// Stable error code for denied/failed outcomes; `None` when issued.
	pub reason_code: Option<String>,
	/// Where the value came from; only set for issued outcomes.
	pub source: Option<CredentialSource>,
	/// Risk score at decision time; `None` when assessment never ran.
	pub risk_score: Option<u8>,
	/// Stable anomaly labels from the risk assessment.
	pub anomalies: Vec<String>,
	/// Set for allowed requests scoring in the enhanced-audit band.
	pub flagged_for_review: bool,
	/// When the attempt was decided.
	pub issued_at: DateTime<Utc>,
	/// Credential expiry; only set for issued outcomes.
	pub expires_at: Option<DateTime<Utc>>,
	/// Set once if the issued credential is later revoked.
	pub revoked_at: Option<DateTime<Utc>>,
	/// Opaque token the caller presents to revoke this issuance.
	pub source_token_id: SourceTokenId,
	/// Cache slot the issuance mapped to, for best-effort eviction on revoke.
	pub cache_key: Option<CacheKey>,
}

impl ProvisionRecord {
	/// Create a new builder for the given attempt identity and outcome.
	pub fn builder(
		credential_type: impl Into<String>,
		caller_service: impl Into<String>,
		outcome: ProvisionOutcome,
	) -> ProvisionRecordBuilder {
		ProvisionRecordBuilder::new(credential_type, caller_service, outcome)
	}

	pub fn is_revoked(&self) -> bool {
		self.revoked_at.is_some()
	}
}

/// Builder for constructing provision records with a fluent API.
#[derive(Debug, Clone)]
pub struct ProvisionRecordBuilder {
	credential_type: String,
	caller_service: String,
	outcome: ProvisionOutcome,
	reason_code: Option<String>,
	source: Option<CredentialSource>,
	risk_score: Option<u8>,
	anomalies: Vec<String>,
	flagged_for_review: bool,
	issued_at: Option<DateTime<Utc>>,
	expires_at: Option<DateTime<Utc>>,
	source_token_id: Option<SourceTokenId>,
	cache_key: Option<CacheKey>,
}

impl ProvisionRecordBuilder {
	pub fn new(
		credential_type: impl Into<String>,
		caller_service: impl Into<String>,
		outcome: ProvisionOutcome,
	) -> Self {
		Self {
			credential_type: credential_type.into(),
			caller_service: caller_service.into(),
			outcome,
			reason_code: None,
			source: None,
			risk_score: None,
			anomalies: Vec::new(),
			flagged_for_review: false,
			issued_at: None,
			expires_at: None,
			source_token_id: None,
			cache_key: None,
		}
	}

	/// Set the stable error code explaining a denial or failure.
	pub fn reason_code(mut self, code: impl Into<String>) -> Self {
		self.reason_code = Some(code.into());
		self
	}

	/// Set where the issued value came from.
	pub fn source(mut self, source: CredentialSource) -> Self {
		self.source = Some(source);
		self
	}

	/// Attach the risk assessment that gated this attempt.
	pub fn risk(mut self, score: u8, anomalies: Vec<String>) -> Self {
		self.risk_score = Some(score);
		self.anomalies = anomalies;
		self
	}

	/// Flag the record for enhanced audit review.
	pub fn flagged_for_review(mut self, flagged: bool) -> Self {
		self.flagged_for_review = flagged;
		self
	}

	/// Pin the decision timestamp. Defaults to now.
	pub fn issued_at(mut self, at: DateTime<Utc>) -> Self {
		self.issued_at = Some(at);
		self
	}

	/// Set the credential expiry.
	pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
		self.expires_at = Some(at);
		self
	}

	/// Use a pre-generated revocation token. Defaults to a fresh one.
	pub fn source_token_id(mut self, token: SourceTokenId) -> Self {
		self.source_token_id = Some(token);
		self
	}

	/// Record the cache slot this issuance mapped to.
	pub fn cache_key(mut self, key: CacheKey) -> Self {
		self.cache_key = Some(key);
		self
	}

	/// Build the provision record.
	pub fn build(self) -> ProvisionRecord {
		ProvisionRecord {
			id: RecordId::generate(),
			credential_type: self.credential_type,
			caller_service: self.caller_service,
			outcome: self.outcome,
			reason_code: self.reason_code,
			source: self.source,
			risk_score: self.risk_score,
			anomalies: self.anomalies,
			flagged_for_review: self.flagged_for_review,
			issued_at: self.issued_at.unwrap_or_else(Utc::now),
			expires_at: self.expires_at,
			revoked_at: None,
			source_token_id: self.source_token_id.unwrap_or_else(SourceTokenId::generate),
			cache_key: self.cache_key,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	mod credential_source {
		use super::*;

		#[test]
		fn display_returns_snake_case() {
			assert_eq!(CredentialSource::Vault.to_string(), "vault");
			assert_eq!(CredentialSource::Fallback.to_string(), "fallback");
			assert_eq!(CredentialSource::Cache.to_string(), "cache");
		}

		#[test]
		fn round_trips_through_from_str() {
			for source in [
				CredentialSource::Vault,
				CredentialSource::Fallback,
				CredentialSource::Cache,
			] {
				let parsed: CredentialSource = source.as_str().parse().unwrap();
				assert_eq!(parsed, source);
			}
		}

		#[test]
		fn rejects_unknown_values() {
			assert!("keychain".parse::<CredentialSource>().is_err());
		}

		#[test]
		fn serializes_snake_case() {
			let json = serde_json::to_string(&CredentialSource::Fallback).unwrap();
			assert_eq!(json, "\"fallback\"");
		}
	}

	mod provision_outcome {
		use super::*;

		#[test]
		fn round_trips_through_from_str() {
			for outcome in [
				ProvisionOutcome::Issued,
				ProvisionOutcome::Denied,
				ProvisionOutcome::Failed,
			] {
				let parsed: ProvisionOutcome = outcome.as_str().parse().unwrap();
				assert_eq!(parsed, outcome);
			}
		}

		#[test]
		fn rejects_unknown_values() {
			assert!("revoked".parse::<ProvisionOutcome>().is_err());
		}
	}

	mod builder {
		use super::*;
		use crate::request::CredentialRequest;

		#[test]
		fn issued_record_carries_full_detail() {
			let request = CredentialRequest::new("github-deploy", "ci-runner")
				.with_context("repository", "ghuntley/warden");
			let expires = Utc::now() + chrono::Duration::seconds(900);

			let record =
				ProvisionRecord::builder("github-deploy", "ci-runner", ProvisionOutcome::Issued)
					.source(CredentialSource::Vault)
					.risk(12, vec![])
					.expires_at(expires)
					.cache_key(request.cache_key())
					.build();

			assert_eq!(record.outcome, ProvisionOutcome::Issued);
			assert_eq!(record.source, Some(CredentialSource::Vault));
			assert_eq!(record.risk_score, Some(12));
			assert_eq!(record.expires_at, Some(expires));
			assert!(record.reason_code.is_none());
			assert!(record.revoked_at.is_none());
			assert!(record.cache_key.is_some());
		}

		#[test]
		fn denied_record_defaults() {
			let record =
				ProvisionRecord::builder("github-deploy", "ci-runner", ProvisionOutcome::Denied)
					.reason_code("risk_too_high")
					.risk(85, vec!["new_caller_credential_pairing".to_string()])
					.build();

			assert_eq!(record.reason_code.as_deref(), Some("risk_too_high"));
			assert_eq!(record.risk_score, Some(85));
			assert!(record.source.is_none());
			assert!(record.expires_at.is_none());
			assert!(!record.flagged_for_review);
		}

		#[test]
		fn generates_distinct_ids_and_tokens() {
			let a = ProvisionRecord::builder("t", "svc", ProvisionOutcome::Failed).build();
			let b = ProvisionRecord::builder("t", "svc", ProvisionOutcome::Failed).build();
			assert_ne!(a.id, b.id);
			assert_ne!(a.source_token_id, b.source_token_id);
		}

		#[test]
		fn rate_limited_denial_has_no_risk_score() {
			let record =
				ProvisionRecord::builder("github-deploy", "ci-runner", ProvisionOutcome::Denied)
					.reason_code("rate_limited")
					.build();
			assert!(record.risk_score.is_none());
			assert!(record.anomalies.is_empty());
		}
	}
}
