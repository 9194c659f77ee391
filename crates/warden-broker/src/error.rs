// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for credential provisioning.
//!
//! Every [`ProvisionError`] variant maps to a stable machine-readable code
//! via [`ProvisionError::error_code`]. The same code is stamped into the
//! audit ledger as the `reason_code` of the attempt, so callers and
//! auditors speak one vocabulary.

use std::time::Duration;

use thiserror::Error;

use warden_core::SourceTokenId;
use warden_db::DbError;
use warden_vault::VaultError;

/// Errors returned from the broker's provisioning surface.
#[derive(Debug, Error)]
pub enum ProvisionError {
	/// The requested credential type names no configured spec.
	#[error("unknown credential type '{0}'")]
	UnknownCredentialType(String),

	/// The caller exhausted its request budget for the current window.
	#[error("rate limit exceeded, retry in {}s", retry_after.as_secs())]
	RateLimited {
		/// Time until the current window closes and the budget resets.
		retry_after: Duration,
	},

	/// The risk score reached the deny threshold; no backend was touched.
	#[error("request denied: risk score {score} is at or above the deny threshold")]
	RiskTooHigh {
		/// The score that triggered the denial.
		score: u8,
		/// Stable anomaly labels explaining what was suspicious.
		anomalies: Vec<String>,
	},

	/// The request was admitted but no value could be produced from the
	/// vault, the cache, or the fallback table.
	#[error("credential unavailable: {source}")]
	CredentialUnavailable {
		/// The vault failure that exhausted the acquisition paths.
		#[source]
		source: VaultError,
	},

	/// The issuance audit record could not be written; the credential was
	/// withheld because an unaudited issuance must not exist.
	#[error("audit write failed: {0}")]
	AuditWriteFailed(String),

	/// No issuance is recorded under the presented revocation token.
	#[error("no issuance found for source token {0}")]
	UnknownSourceToken(SourceTokenId),

	/// The audit ledger or rate-limit store could not serve the request.
	#[error("ledger operation failed: {0}")]
	Ledger(#[from] DbError),
}

impl ProvisionError {
	/// Stable machine-readable code for this error.
	///
	/// Vault failures are distinguished by their cause so that an
	/// operator can tell an outage from a bad token from a missing path.
	pub fn error_code(&self) -> &'static str {
		match self {
			ProvisionError::UnknownCredentialType(_) => "unknown_credential_type",
			ProvisionError::RateLimited { .. } => "rate_limited",
			ProvisionError::RiskTooHigh { .. } => "risk_too_high",
			ProvisionError::CredentialUnavailable { source } => match source {
				VaultError::Unreachable(_) => "vault_unreachable",
				VaultError::AuthFailed => "vault_auth_failed",
				VaultError::NotFound { .. } => "vault_not_found",
				VaultError::Protocol(_) | VaultError::InvalidConfig(_) => "credential_unavailable",
			},
			ProvisionError::AuditWriteFailed(_) => "audit_write_failed",
			ProvisionError::UnknownSourceToken(_) => "unknown_source_token",
			ProvisionError::Ledger(_) => "ledger_unavailable",
		}
	}
}

/// Errors raised while wiring a broker up from resolved configuration.
#[derive(Debug, Error)]
pub enum InitError {
	/// The backing database could not be opened or migrated.
	#[error("database initialization failed: {0}")]
	Db(#[from] DbError),

	/// The cache cipher or cache schema could not be set up.
	#[error("cache initialization failed: {0}")]
	Cache(#[from] warden_cache::CacheError),

	/// The vault client configuration was rejected.
	#[error("vault client initialization failed: {0}")]
	Vault(#[from] VaultError),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_codes_are_stable() {
		assert_eq!(
			ProvisionError::UnknownCredentialType("x".to_string()).error_code(),
			"unknown_credential_type"
		);
		assert_eq!(
			ProvisionError::RateLimited {
				retry_after: Duration::from_secs(60)
			}
			.error_code(),
			"rate_limited"
		);
		assert_eq!(
			ProvisionError::RiskTooHigh {
				score: 85,
				anomalies: vec![]
			}
			.error_code(),
			"risk_too_high"
		);
		assert_eq!(
			ProvisionError::AuditWriteFailed("ledger offline".to_string()).error_code(),
			"audit_write_failed"
		);
	}

	#[test]
	fn vault_failures_are_distinguished_by_cause() {
		let unreachable = ProvisionError::CredentialUnavailable {
			source: VaultError::Unreachable("connection refused".to_string()),
		};
		assert_eq!(unreachable.error_code(), "vault_unreachable");

		let auth = ProvisionError::CredentialUnavailable {
			source: VaultError::AuthFailed,
		};
		assert_eq!(auth.error_code(), "vault_auth_failed");

		let missing = ProvisionError::CredentialUnavailable {
			source: VaultError::NotFound {
				path: "ci/github".to_string(),
			},
		};
		assert_eq!(missing.error_code(), "vault_not_found");

		let protocol = ProvisionError::CredentialUnavailable {
			source: VaultError::Protocol("invalid secret body".to_string()),
		};
		assert_eq!(protocol.error_code(), "credential_unavailable");
	}

	#[test]
	fn display_never_contains_secret_material() {
		let err = ProvisionError::RiskTooHigh {
			score: 92,
			anomalies: vec!["new_caller_credential_pairing".to_string()],
		};
		let rendered = err.to_string();
		assert!(rendered.contains("92"));
		assert!(!rendered.contains("new_caller_credential_pairing"));
	}
}
