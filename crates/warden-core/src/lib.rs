// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared domain types for the warden credential broker.
//!
//! # Overview
//!
//! Warden mediates between internal service callers and backend secret
//! sources, issuing scoped, time-limited credentials. This crate holds the
//! vocabulary every other warden crate speaks:
//!
//! - [`CredentialSpec`] and [`SpecRegistry`]: the closed, configuration-loaded
//!   set of credential classes a deployment brokers
//! - [`CredentialRequest`]: one caller request plus its deterministic
//!   [`CacheKey`] derivation
//! - [`RiskAssessment`] and [`AccessHistory`]: risk scoring inputs and outputs
//! - [`ProvisionRecord`]: the append-only audit row written for every attempt
//! - [`SecretString`]: the redacting, zeroizing wrapper all secret material
//!   travels in
//!
//! # Example
//!
//! ```
//! use warden_core::{CredentialRequest, CredentialSpec, SpecRegistry};
//!
//! let registry = SpecRegistry::from_specs(vec![CredentialSpec {
//! 	id: "github-deploy".to_string(),
//! 	vault_path: "ci/github-deploy".to_string(),
//! 	required_context_fields: vec!["repository".to_string()],
//! 	scopes: vec!["deploy:write".to_string()],
//! 	ttl_seconds: 900,
//! 	cacheable: true,
//! 	fallback_env_key: None,
//! }])
//! .unwrap();
//!
//! let request = CredentialRequest::new("github-deploy", "ci-runner")
//! 	.with_context("repository", "ghuntley/warden");
//!
//! assert!(registry.get(&request.credential_type).is_some());
//! ```

pub mod assessment;
pub mod credential;
pub mod id;
pub mod record;
pub mod request;
pub mod secret;

pub use assessment::{
	AccessHistory, RiskAction, RiskAssessment, RISK_DENY_THRESHOLD, RISK_REVIEW_THRESHOLD,
};
pub use credential::{validate_credential_id, CredentialSpec, SpecError, SpecRegistry};
pub use id::{RecordId, SourceTokenId};
pub use record::{
	CredentialSource, ProvisionOutcome, ProvisionRecord, ProvisionRecordBuilder,
};
pub use request::{CacheKey, CredentialRequest};
pub use secret::{Secret, SecretString, REDACTED};
