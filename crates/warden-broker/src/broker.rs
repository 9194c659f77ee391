// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The credential broker: admission, acquisition, and audit for every
//! provisioning request.
//!
//! [`CredentialBroker::provision`] runs a fixed pipeline:
//!
//! 1. Resolve the credential spec from the registry
//! 2. Count the request against the caller's rate window
//! 3. Score the request against the caller's ledger history; deny at the
//!    risk threshold before any vault or cache access
//! 4. Acquire the value: cache hit, singleflight vault fetch, or the
//!    static fallback when the vault is unreachable
//! 5. Write the audit record; an issuance whose record cannot be written
//!    is withheld
//!
//! Denied and failed attempts write their audit records best effort: the
//! request already carries its answer, and a deaf ledger must not turn a
//! denial into an outage.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use warden_cache::{
	CacheCipher, EncryptedCache, SecretCache, DEFAULT_FETCH_LEASE, DEFAULT_WAIT_CEILING,
	DEFAULT_WAIT_POLL,
};
use warden_core::{
	AccessHistory, CredentialRequest, CredentialSource, CredentialSpec, ProvisionOutcome,
	ProvisionRecord, RiskAction, RiskAssessment, SecretString, SourceTokenId, SpecRegistry,
};
use warden_db::{
	create_pool, AuditLedger, LedgerQuery, RateLimiter, RevokeOutcome, SqliteAuditLedger,
	SqliteRateLimiter, DEFAULT_RATE_WINDOW,
};
use warden_risk::RiskEvaluator;
use warden_vault::{
	EnvFallback, FallbackSource, HttpVaultClient, RetryPolicy, VaultClient, VaultError,
};

use crate::config::{BrokerConfig, DEFAULT_AUDIT_WRITE_TIMEOUT_MS, DEFAULT_RISK_LOOKBACK_HOURS};
use crate::error::{InitError, ProvisionError};
use crate::health::HealthReport;

/// A brokered credential returned to a caller.
#[derive(Debug)]
pub struct IssuedCredential {
	/// The credential material; renders redacted in logs.
	pub credential: SecretString,
	/// Scopes granted by the credential class.
	pub scopes: Vec<String>,
	/// When the credential stops being valid.
	pub expires_at: DateTime<Utc>,
	/// Token the caller presents to revoke this issuance.
	pub source_token_id: SourceTokenId,
	/// The risk score the request was admitted at.
	pub risk_score: u8,
	/// Where the value came from.
	pub source: CredentialSource,
}

/// Acknowledgement of a revocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevokeAck {
	pub source_token_id: SourceTokenId,
	/// When this call observed the revocation. For an already-revoked
	/// issuance the original timestamp stands in the ledger.
	pub revoked_at: DateTime<Utc>,
	/// Whether an earlier call had already revoked the issuance.
	pub already_revoked: bool,
}

/// The backend handles a broker is composed from.
///
/// Everything is a trait object so deployments and tests can substitute
/// any piece without rebuilding the broker.
pub struct BrokerHandles {
	pub vault: Arc<dyn VaultClient>,
	pub cache: Arc<dyn SecretCache>,
	pub ledger: Arc<dyn AuditLedger>,
	pub rate_limiter: Arc<dyn RateLimiter>,
	pub fallback: Arc<dyn FallbackSource>,
}

/// Operational knobs for the provisioning pipeline.
#[derive(Debug, Clone)]
pub struct BrokerTuning {
	/// How long a fetch lease protects a cache slot before takeover.
	pub fetch_lease: Duration,
	/// Poll interval while waiting on another request's fetch.
	pub wait_poll: Duration,
	/// Ceiling on waiting for another request's fetch before fetching
	/// directly.
	pub wait_ceiling: Duration,
	/// Ceiling on a single audit write before issuance is failed.
	pub audit_write_timeout: Duration,
	/// Hours of ledger history consulted per risk assessment.
	pub risk_lookback_hours: u32,
	/// The rate limiter's window length; must match the limiter so that
	/// retry hints point at the actual window boundary.
	pub rate_window: Duration,
}

impl Default for BrokerTuning {
	fn default() -> Self {
		Self {
			fetch_lease: DEFAULT_FETCH_LEASE,
			wait_poll: DEFAULT_WAIT_POLL,
			wait_ceiling: DEFAULT_WAIT_CEILING,
			audit_write_timeout: Duration::from_millis(DEFAULT_AUDIT_WRITE_TIMEOUT_MS),
			risk_lookback_hours: DEFAULT_RISK_LOOKBACK_HOURS,
			rate_window: DEFAULT_RATE_WINDOW,
		}
	}
}

impl BrokerTuning {
	pub fn from_config(config: &BrokerConfig) -> Self {
		Self {
			fetch_lease: config.cache.fetch_lease,
			wait_poll: DEFAULT_WAIT_POLL,
			wait_ceiling: config.cache.wait_ceiling,
			audit_write_timeout: config.audit.write_timeout,
			risk_lookback_hours: config.risk.lookback_hours,
			rate_window: config.rate_limit.window,
		}
	}
}

/// A credential value plus the provenance the audit record needs.
struct AcquiredValue {
	value: SecretString,
	source: CredentialSource,
	expires_at: DateTime<Utc>,
}

/// Mediates between callers and backend secret sources.
pub struct CredentialBroker {
	vault: Arc<dyn VaultClient>,
	cache: Arc<dyn SecretCache>,
	ledger: Arc<dyn AuditLedger>,
	rate_limiter: Arc<dyn RateLimiter>,
	fallback: Arc<dyn FallbackSource>,
	specs: SpecRegistry,
	evaluator: RiskEvaluator,
	tuning: BrokerTuning,
}

impl CredentialBroker {
	pub fn new(handles: BrokerHandles, specs: SpecRegistry, tuning: BrokerTuning) -> Self {
		Self {
			vault: handles.vault,
			cache: handles.cache,
			ledger: handles.ledger,
			rate_limiter: handles.rate_limiter,
			fallback: handles.fallback,
			specs,
			evaluator: RiskEvaluator::new(),
			tuning,
		}
	}

	/// Wire a broker from resolved configuration: one SQLite database
	/// backing the ledger, the rate windows, and the encrypted cache,
	/// plus an HTTP vault client and the process environment as the
	/// fallback source.
	pub async fn from_config(config: BrokerConfig) -> Result<Self, InitError> {
		let pool = create_pool(&config.database.url).await?;
		SqliteAuditLedger::migrate(&pool).await?;
		SqliteRateLimiter::migrate(&pool).await?;
		EncryptedCache::migrate(&pool).await?;

		let cipher = CacheCipher::from_secret(&config.cache.encryption_secret)?;
		let vault = HttpVaultClient::builder()
			.base_url(config.vault.base_url.clone())
			.token(config.vault.token.clone())
			.fetch_timeout(config.vault.fetch_timeout)
			.retry(RetryPolicy {
				max_attempts: config.vault.retry_attempts,
				..RetryPolicy::default()
			})
			.build()?;

		let tuning = BrokerTuning::from_config(&config);
		let handles = BrokerHandles {
			vault: Arc::new(vault),
			cache: Arc::new(EncryptedCache::new(pool.clone(), cipher)),
			ledger: Arc::new(SqliteAuditLedger::new(pool.clone())),
			rate_limiter: Arc::new(SqliteRateLimiter::new(
				pool,
				config.rate_limit.per_caller_limit,
				config.rate_limit.window,
			)),
			fallback: Arc::new(EnvFallback::new()),
		};

		Ok(Self::new(handles, config.credentials, tuning))
	}

	/// Provision one credential.
	///
	/// Exactly one audit record is written per attempt. For issued
	/// outcomes the write is load-bearing: if it fails or times out, the
	/// credential is withheld and the caller sees `AuditWriteFailed`.
	#[tracing::instrument(
		skip(self, request),
		fields(
			credential_type = %request.credential_type,
			caller = %request.caller_service,
		)
	)]
	pub async fn provision(
		&self,
		request: CredentialRequest,
	) -> Result<IssuedCredential, ProvisionError> {
		let Some(spec) = self.specs.get(&request.credential_type) else {
			let err = ProvisionError::UnknownCredentialType(request.credential_type.clone());
			self.audit_rejection(&request, ProvisionOutcome::Failed, &err, None, false)
				.await;
			return Err(err);
		};

		let decision = self
			.rate_limiter
			.allow(&request.caller_service, &request.credential_type)
			.await?;
		if !decision.allowed {
			let err = ProvisionError::RateLimited {
				retry_after: self.retry_after(request.requested_at),
			};
			self.audit_rejection(&request, ProvisionOutcome::Denied, &err, None, false)
				.await;
			return Err(err);
		}

		// A deaf ledger weakens scoring but must not block issuance; the
		// empty history is the conservative substitute.
		let history = match self
			.ledger
			.access_history(
				&request.caller_service,
				&request.credential_type,
				request.requested_at,
				self.tuning.risk_lookback_hours,
			)
			.await
		{
			Ok(history) => history,
			Err(err) => {
				warn!(error = %err, "history read failed, assessing against an empty history");
				AccessHistory::default()
			}
		};

		let assessment = self.evaluator.assess(spec, &request, &history);
		let flagged = match assessment.action() {
			RiskAction::Deny => {
				let err = ProvisionError::RiskTooHigh {
					score: assessment.score,
					anomalies: assessment.anomalies.clone(),
				};
				self.audit_rejection(
					&request,
					ProvisionOutcome::Denied,
					&err,
					Some(&assessment),
					false,
				)
				.await;
				return Err(err);
			}
			RiskAction::AllowWithReview => {
				info!(score = assessment.score, "request allowed with review flag");
				true
			}
			RiskAction::Allow => false,
		};

		let acquired = match self.acquire(spec, &request).await {
			Ok(acquired) => acquired,
			Err(vault_err) => {
				let err = ProvisionError::CredentialUnavailable { source: vault_err };
				self.audit_rejection(
					&request,
					ProvisionOutcome::Failed,
					&err,
					Some(&assessment),
					flagged,
				)
				.await;
				return Err(err);
			}
		};

		let source_token_id = SourceTokenId::generate();
		let mut builder = ProvisionRecord::builder(
			request.credential_type.as_str(),
			request.caller_service.as_str(),
			ProvisionOutcome::Issued,
		)
		.source(acquired.source)
		.risk(assessment.score, assessment.anomalies.clone())
		.flagged_for_review(flagged)
		.expires_at(acquired.expires_at)
		.source_token_id(source_token_id);
		if spec.cacheable && acquired.source != CredentialSource::Fallback {
			builder = builder.cache_key(request.cache_key());
		}
		let record = builder.build();

		match timeout(self.tuning.audit_write_timeout, self.ledger.record(&record)).await {
			Ok(Ok(())) => {}
			Ok(Err(err)) => {
				error!(error = %err, "issuance audit write failed, withholding credential");
				return Err(ProvisionError::AuditWriteFailed(err.to_string()));
			}
			Err(_) => {
				error!("issuance audit write timed out, withholding credential");
				return Err(ProvisionError::AuditWriteFailed(
					"ledger write timed out".to_string(),
				));
			}
		}

		info!(
			source = %acquired.source,
			risk_score = assessment.score,
			flagged_for_review = flagged,
			"credential issued"
		);

		Ok(IssuedCredential {
			credential: acquired.value,
			scopes: spec.scopes.clone(),
			expires_at: acquired.expires_at,
			source_token_id,
			risk_score: assessment.score,
			source: acquired.source,
		})
	}

	/// Revoke an issuance by its source token.
	///
	/// The ledger row is the source of truth; evicting the cache slot the
	/// issuance mapped to is best effort on top.
	#[tracing::instrument(skip(self), fields(source_token = %token))]
	pub async fn revoke(&self, token: SourceTokenId) -> Result<RevokeAck, ProvisionError> {
		let revoked_at = Utc::now();
		match self.ledger.mark_revoked(&token, revoked_at).await? {
			RevokeOutcome::Revoked { cache_key } => {
				if let Some(key) = cache_key {
					match self.cache.evict(&key).await {
						Ok(evicted) => debug!(key = %key, evicted, "post-revocation eviction"),
						Err(err) => {
							warn!(error = %err, key = %key, "post-revocation eviction failed")
						}
					}
				}
				info!("issuance revoked");
				Ok(RevokeAck {
					source_token_id: token,
					revoked_at,
					already_revoked: false,
				})
			}
			RevokeOutcome::AlreadyRevoked => Ok(RevokeAck {
				source_token_id: token,
				revoked_at,
				already_revoked: true,
			}),
			RevokeOutcome::NotFound => Err(ProvisionError::UnknownSourceToken(token)),
		}
	}

	/// Filtered, paginated read of the audit ledger, newest first.
	pub async fn audit_query(
		&self,
		query: &LedgerQuery,
	) -> Result<Vec<ProvisionRecord>, ProvisionError> {
		Ok(self.ledger.query(query).await?)
	}

	/// Probe every backend concurrently. Never fails; reports.
	pub async fn health_check(&self) -> HealthReport {
		let (vault, cache, ledger) = tokio::join!(
			self.vault.health_check(),
			self.cache.health_check(),
			self.ledger.health_check(),
		);

		let (vault_reachable, vault_latency) = match vault {
			Ok(health) => (health.healthy, Some(health.latency)),
			Err(err) => {
				warn!(error = %err, "vault health probe failed");
				(false, None)
			}
		};
		if let Err(err) = &cache {
			warn!(error = %err, "cache health probe failed");
		}
		if let Err(err) = &ledger {
			warn!(error = %err, "ledger health probe failed");
		}

		HealthReport {
			vault_reachable,
			cache_reachable: cache.is_ok(),
			ledger_reachable: ledger.is_ok(),
			vault_latency,
		}
	}

	/// Produce the credential value for an admitted request.
	///
	/// Cacheable classes go through the cache with singleflight on miss;
	/// any cache failure degrades to a direct vault fetch. The fallback
	/// table is consulted only for vault unreachability.
	async fn acquire(
		&self,
		spec: &CredentialSpec,
		request: &CredentialRequest,
	) -> Result<AcquiredValue, VaultError> {
		if !spec.cacheable {
			return self.fetch_direct(spec).await;
		}

		let key = request.cache_key();

		match self.cache.get(&key).await {
			Ok(Some(hit)) => {
				debug!(key = %key, "cache hit");
				return Ok(AcquiredValue {
					value: hit.value,
					source: CredentialSource::Cache,
					expires_at: hit.expires_at,
				});
			}
			Ok(None) => {}
			Err(err) => warn!(error = %err, "cache read failed, treating as a miss"),
		}

		let owner = Uuid::new_v4().to_string();
		let lease_acquired = match self
			.cache
			.try_acquire_fetch_lease(&key, &owner, self.tuning.fetch_lease)
			.await
		{
			Ok(acquired) => acquired,
			Err(err) => {
				warn!(error = %err, "fetch lease unavailable, fetching directly");
				return self.fetch_direct(spec).await;
			}
		};

		if lease_acquired {
			// Fill on a detached task so caller cancellation cannot leave
			// the lease held with no fetch in flight.
			let vault = Arc::clone(&self.vault);
			let cache = Arc::clone(&self.cache);
			let vault_path = spec.vault_path.clone();
			let ttl = spec.ttl();
			let task_key = key.clone();
			let fill = tokio::spawn(async move {
				let fetched = vault.fetch(&vault_path).await;
				if let Ok(secret) = &fetched {
					if let Err(err) = cache.put(&task_key, &secret.value, ttl, &secret.version).await
					{
						warn!(error = %err, "cache fill failed, serving uncached");
					}
				}
				if let Err(err) = cache.release_fetch_lease(&task_key, &owner).await {
					warn!(error = %err, "fetch lease release failed");
				}
				fetched
			});

			return match fill.await {
				Ok(Ok(secret)) => Ok(AcquiredValue {
					value: secret.value,
					source: CredentialSource::Vault,
					expires_at: fresh_expiry(spec),
				}),
				Ok(Err(err)) => self.fallback_for(spec, err),
				Err(err) => self.fallback_for(
					spec,
					VaultError::Protocol(format!("credential fetch task failed: {err}")),
				),
			};
		}

		// Another request holds the fetch lease; wait for its fill.
		match self
			.cache
			.wait_for_entry(&key, self.tuning.wait_poll, self.tuning.wait_ceiling)
			.await
		{
			Ok(Some(hit)) => {
				debug!(key = %key, "entry filled while waiting");
				return Ok(AcquiredValue {
					value: hit.value,
					source: CredentialSource::Cache,
					expires_at: hit.expires_at,
				});
			}
			Ok(None) => debug!(key = %key, "wait ceiling reached, fetching directly"),
			Err(err) => warn!(error = %err, "wait for entry failed, fetching directly"),
		}

		self.fetch_direct(spec).await
	}

	async fn fetch_direct(&self, spec: &CredentialSpec) -> Result<AcquiredValue, VaultError> {
		match self.vault.fetch(&spec.vault_path).await {
			Ok(secret) => Ok(AcquiredValue {
				value: secret.value,
				source: CredentialSource::Vault,
				expires_at: fresh_expiry(spec),
			}),
			Err(err) => self.fallback_for(spec, err),
		}
	}

	/// Resolve a vault failure through the static fallback, when the
	/// class has one and the failure is unreachability. Auth failures and
	/// missing paths keep their original error: the vault answered.
	fn fallback_for(
		&self,
		spec: &CredentialSpec,
		err: VaultError,
	) -> Result<AcquiredValue, VaultError> {
		let VaultError::Unreachable(_) = &err else {
			return Err(err);
		};
		let Some(env_key) = &spec.fallback_env_key else {
			return Err(err);
		};

		match self.fallback.lookup(env_key) {
			Some(value) => {
				warn!(
					credential_type = %spec.id,
					"vault unreachable, serving the static fallback value"
				);
				Ok(AcquiredValue {
					value,
					source: CredentialSource::Fallback,
					expires_at: fresh_expiry(spec),
				})
			}
			None => {
				warn!(
					credential_type = %spec.id,
					env_key = %env_key,
					"fallback key configured but no value is present"
				);
				Err(err)
			}
		}
	}

	/// Write the audit record for a denied or failed attempt. Best
	/// effort: the attempt already has its answer.
	async fn audit_rejection(
		&self,
		request: &CredentialRequest,
		outcome: ProvisionOutcome,
		error: &ProvisionError,
		assessment: Option<&RiskAssessment>,
		flagged: bool,
	) {
		let mut builder = ProvisionRecord::builder(
			request.credential_type.as_str(),
			request.caller_service.as_str(),
			outcome,
		)
		.reason_code(error.error_code())
		.flagged_for_review(flagged);
		if let Some(assessment) = assessment {
			builder = builder.risk(assessment.score, assessment.anomalies.clone());
		}
		let record = builder.build();

		match timeout(self.tuning.audit_write_timeout, self.ledger.record(&record)).await {
			Ok(Ok(())) => {}
			Ok(Err(err)) => warn!(error = %err, outcome = %outcome, "audit write failed"),
			Err(_) => warn!(outcome = %outcome, "audit write timed out"),
		}
	}

	/// Seconds until the caller's current rate window closes.
	fn retry_after(&self, now: DateTime<Utc>) -> Duration {
		let window = self.tuning.rate_window.as_secs().max(1) as i64;
		let into_window = now.timestamp().rem_euclid(window);
		Duration::from_secs((window - into_window) as u64)
	}
}

fn fresh_expiry(spec: &CredentialSpec) -> DateTime<Utc> {
	Utc::now() + chrono::Duration::seconds(spec.ttl_seconds as i64)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use async_trait::async_trait;
	use sqlx::sqlite::SqlitePool;

	use warden_cache::{CacheHit, KEY_SIZE};
	use warden_core::CacheKey;
	use warden_db::testing::create_broker_test_pool;
	use warden_db::DbError;
	use warden_vault::{FetchedSecret, StaticFallback, VaultHealth};

	#[derive(Clone)]
	enum VaultMode {
		Value {
			value: &'static str,
			version: &'static str,
		},
		SlowValue {
			value: &'static str,
			version: &'static str,
			delay: Duration,
		},
		Unreachable,
		AuthFailed,
	}

	struct ScriptedVault {
		mode: VaultMode,
		fetches: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl VaultClient for ScriptedVault {
		async fn fetch(&self, _path: &str) -> warden_vault::Result<FetchedSecret> {
			self.fetches.fetch_add(1, Ordering::SeqCst);
			match &self.mode {
				VaultMode::Value { value, version } => Ok(FetchedSecret {
					value: SecretString::from(*value),
					version: (*version).to_string(),
				}),
				VaultMode::SlowValue {
					value,
					version,
					delay,
				} => {
					tokio::time::sleep(*delay).await;
					Ok(FetchedSecret {
						value: SecretString::from(*value),
						version: (*version).to_string(),
					})
				}
				VaultMode::Unreachable => {
					Err(VaultError::Unreachable("connection refused".to_string()))
				}
				VaultMode::AuthFailed => Err(VaultError::AuthFailed),
			}
		}

		async fn health_check(&self) -> warden_vault::Result<VaultHealth> {
			Ok(VaultHealth {
				healthy: true,
				latency: Duration::from_millis(1),
			})
		}
	}

	/// Delegates to a real [`EncryptedCache`] while counting reads, so
	/// tests can prove a path never touched the cache.
	struct CountingCache {
		inner: EncryptedCache,
		gets: Arc<AtomicUsize>,
	}

	#[async_trait]
	impl SecretCache for CountingCache {
		async fn get(&self, key: &CacheKey) -> warden_cache::Result<Option<CacheHit>> {
			self.gets.fetch_add(1, Ordering::SeqCst);
			self.inner.get(key).await
		}

		async fn put(
			&self,
			key: &CacheKey,
			value: &SecretString,
			ttl: Duration,
			vault_version: &str,
		) -> warden_cache::Result<()> {
			self.inner.put(key, value, ttl, vault_version).await
		}

		async fn evict(&self, key: &CacheKey) -> warden_cache::Result<bool> {
			self.inner.evict(key).await
		}

		async fn try_acquire_fetch_lease(
			&self,
			key: &CacheKey,
			owner: &str,
			lease: Duration,
		) -> warden_cache::Result<bool> {
			self.inner.try_acquire_fetch_lease(key, owner, lease).await
		}

		async fn release_fetch_lease(
			&self,
			key: &CacheKey,
			owner: &str,
		) -> warden_cache::Result<()> {
			self.inner.release_fetch_lease(key, owner).await
		}

		async fn health_check(&self) -> warden_cache::Result<()> {
			self.inner.health_check().await
		}
	}

	/// Ledger with scriptable failures for exercising degraded paths.
	struct ScriptedLedger {
		record_fails: bool,
		history_fails: bool,
		healthy: bool,
	}

	#[async_trait]
	impl AuditLedger for ScriptedLedger {
		async fn record(&self, _record: &ProvisionRecord) -> warden_db::Result<()> {
			if self.record_fails {
				Err(DbError::Internal("ledger offline".to_string()))
			} else {
				Ok(())
			}
		}

		async fn mark_revoked(
			&self,
			_token: &SourceTokenId,
			_at: DateTime<Utc>,
		) -> warden_db::Result<RevokeOutcome> {
			Ok(RevokeOutcome::NotFound)
		}

		async fn query(&self, _query: &LedgerQuery) -> warden_db::Result<Vec<ProvisionRecord>> {
			Ok(Vec::new())
		}

		async fn access_history(
			&self,
			_caller_service: &str,
			_credential_type: &str,
			_now: DateTime<Utc>,
			lookback_hours: u32,
		) -> warden_db::Result<AccessHistory> {
			if self.history_fails {
				Err(DbError::Internal("ledger offline".to_string()))
			} else {
				Ok(AccessHistory {
					lookback_hours,
					..AccessHistory::default()
				})
			}
		}

		async fn health_check(&self) -> warden_db::Result<()> {
			if self.healthy {
				Ok(())
			} else {
				Err(DbError::Internal("ledger offline".to_string()))
			}
		}
	}

	fn spec(id: &str) -> CredentialSpec {
		CredentialSpec {
			id: id.to_string(),
			vault_path: format!("ci/{id}"),
			required_context_fields: vec![],
			scopes: vec!["deploy:write".to_string()],
			ttl_seconds: 900,
			cacheable: true,
			fallback_env_key: None,
		}
	}

	fn request(credential_type: &str) -> CredentialRequest {
		CredentialRequest::new(credential_type, "ci-runner")
			.with_context("repository", "ghuntley/warden")
	}

	struct TestRig {
		broker: CredentialBroker,
		pool: SqlitePool,
		fetches: Arc<AtomicUsize>,
		cache_gets: Arc<AtomicUsize>,
	}

	async fn rig(mode: VaultMode, specs: Vec<CredentialSpec>, rate_limit: u32) -> TestRig {
		let pool = create_broker_test_pool().await;
		EncryptedCache::migrate(&pool).await.expect("cache migrate");

		let fetches = Arc::new(AtomicUsize::new(0));
		let cache_gets = Arc::new(AtomicUsize::new(0));

		let broker = CredentialBroker::new(
			BrokerHandles {
				vault: Arc::new(ScriptedVault {
					mode,
					fetches: Arc::clone(&fetches),
				}),
				cache: Arc::new(CountingCache {
					inner: EncryptedCache::new(pool.clone(), CacheCipher::from_key([7u8; KEY_SIZE])),
					gets: Arc::clone(&cache_gets),
				}),
				ledger: Arc::new(SqliteAuditLedger::new(pool.clone())),
				rate_limiter: Arc::new(SqliteRateLimiter::new(
					pool.clone(),
					rate_limit,
					Duration::from_secs(3600),
				)),
				fallback: Arc::new(StaticFallback::new().with("ANALYTICS_DB_PASSWORD", "zzz")),
			},
			SpecRegistry::from_specs(specs).expect("valid specs"),
			BrokerTuning {
				wait_poll: Duration::from_millis(10),
				..BrokerTuning::default()
			},
		);

		TestRig {
			broker,
			pool,
			fetches,
			cache_gets,
		}
	}

	async fn records(pool: &SqlitePool, outcome: ProvisionOutcome) -> Vec<ProvisionRecord> {
		SqliteAuditLedger::new(pool.clone())
			.query(&LedgerQuery {
				outcome: Some(outcome),
				..LedgerQuery::default()
			})
			.await
			.expect("ledger query")
	}

	async fn seed(pool: &SqlitePool, record: ProvisionRecord) {
		SqliteAuditLedger::new(pool.clone())
			.record(&record)
			.await
			.expect("seed record");
	}

	async fn cache_entry_count(pool: &SqlitePool) -> i64 {
		sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
			.fetch_one(pool)
			.await
			.expect("count cache entries")
	}

	#[tokio::test]
	async fn issues_from_vault_then_serves_from_cache() {
		let rig = rig(
			VaultMode::Value {
				value: "abc",
				version: "v1",
			},
			vec![spec("github-deploy")],
			100,
		)
		.await;

		let first = rig
			.broker
			.provision(request("github-deploy"))
			.await
			.expect("first issuance");
		assert_eq!(first.credential.expose(), "abc");
		assert_eq!(first.source, CredentialSource::Vault);
		assert_eq!(first.scopes, vec!["deploy:write".to_string()]);
		let remaining = (first.expires_at - Utc::now()).num_seconds();
		assert!(
			(890..=900).contains(&remaining),
			"expiry should reflect the 900s ttl, got {remaining}s"
		);
		assert_eq!(rig.fetches.load(Ordering::SeqCst), 1);

		let second = rig
			.broker
			.provision(request("github-deploy"))
			.await
			.expect("second issuance");
		assert_eq!(second.credential.expose(), "abc");
		assert_eq!(second.source, CredentialSource::Cache);
		// The cached entry keeps the first issuance's expiry.
		assert!(second.expires_at <= first.expires_at + chrono::Duration::seconds(1));
		assert_eq!(rig.fetches.load(Ordering::SeqCst), 1);

		let issued = records(&rig.pool, ProvisionOutcome::Issued).await;
		assert_eq!(issued.len(), 2);
		assert!(issued
			.iter()
			.any(|r| r.source == Some(CredentialSource::Vault)));
		assert!(issued
			.iter()
			.any(|r| r.source == Some(CredentialSource::Cache)));
		assert!(issued.iter().all(|r| r.cache_key.is_some()));
		assert_ne!(issued[0].source_token_id, issued[1].source_token_id);
	}

	#[tokio::test]
	async fn unknown_credential_type_fails_without_backend_access() {
		let rig = rig(
			VaultMode::Value {
				value: "abc",
				version: "v1",
			},
			vec![spec("github-deploy")],
			100,
		)
		.await;

		let err = rig
			.broker
			.provision(request("db-admin"))
			.await
			.unwrap_err();
		assert!(matches!(&err, ProvisionError::UnknownCredentialType(t) if t == "db-admin"));
		assert_eq!(err.error_code(), "unknown_credential_type");
		assert_eq!(rig.fetches.load(Ordering::SeqCst), 0);
		assert_eq!(rig.cache_gets.load(Ordering::SeqCst), 0);

		let failed = records(&rig.pool, ProvisionOutcome::Failed).await;
		assert_eq!(failed.len(), 1);
		assert_eq!(
			failed[0].reason_code.as_deref(),
			Some("unknown_credential_type")
		);
		assert!(failed[0].risk_score.is_none());
	}

	#[tokio::test]
	async fn denied_risk_never_touches_vault_or_cache() {
		let mut guarded = spec("github-deploy");
		guarded.required_context_fields =
			vec!["repository".to_string(), "change_ticket".to_string()];
		let rig = rig(
			VaultMode::Value {
				value: "abc",
				version: "v1",
			},
			vec![guarded],
			100,
		)
		.await;

		// Three recent denials, a missing required field, and a pairing
		// the ledger has never issued: 30 + 40 + 25.
		for _ in 0..3 {
			seed(
				&rig.pool,
				ProvisionRecord::builder("github-deploy", "ci-runner", ProvisionOutcome::Denied)
					.reason_code("risk_too_high")
					.issued_at(Utc::now() - chrono::Duration::minutes(30))
					.build(),
			)
			.await;
		}

		let err = rig
			.broker
			.provision(request("github-deploy"))
			.await
			.unwrap_err();
		let ProvisionError::RiskTooHigh { score, anomalies } = err else {
			panic!("expected a risk denial, got {err:?}");
		};
		assert_eq!(score, 95);
		assert!(anomalies.contains(&"missing_context_field:change_ticket".to_string()));
		assert!(anomalies.contains(&"new_caller_credential_pairing".to_string()));
		assert!(anomalies.contains(&"repeated_recent_denials".to_string()));

		assert_eq!(rig.fetches.load(Ordering::SeqCst), 0);
		assert_eq!(rig.cache_gets.load(Ordering::SeqCst), 0);

		let denied = records(&rig.pool, ProvisionOutcome::Denied).await;
		assert_eq!(denied.len(), 4);
		let fresh = denied
			.iter()
			.find(|r| r.risk_score == Some(95))
			.expect("fresh denial recorded");
		assert_eq!(fresh.reason_code.as_deref(), Some("risk_too_high"));
		assert!(!fresh.anomalies.is_empty());
	}

	#[tokio::test]
	async fn review_band_issues_with_the_record_flagged() {
		let mut guarded = spec("github-deploy");
		guarded.required_context_fields = vec!["change_ticket".to_string()];
		let rig = rig(
			VaultMode::Value {
				value: "abc",
				version: "v1",
			},
			vec![guarded],
			100,
		)
		.await;

		// A known pairing with one recent denial: the missing field's 40
		// plus the denial's 10 lands exactly on the review threshold.
		seed(
			&rig.pool,
			ProvisionRecord::builder("github-deploy", "ci-runner", ProvisionOutcome::Issued)
				.source(CredentialSource::Vault)
				.risk(0, vec![])
				.issued_at(Utc::now() - chrono::Duration::hours(2))
				.build(),
		)
		.await;
		seed(
			&rig.pool,
			ProvisionRecord::builder("github-deploy", "ci-runner", ProvisionOutcome::Denied)
				.reason_code("risk_too_high")
				.issued_at(Utc::now() - chrono::Duration::hours(3))
				.build(),
		)
		.await;

		let issued = rig
			.broker
			.provision(request("github-deploy"))
			.await
			.expect("review band still issues");
		assert_eq!(issued.risk_score, 50);

		let rows = records(&rig.pool, ProvisionOutcome::Issued).await;
		let fresh = rows
			.iter()
			.find(|r| r.risk_score == Some(50))
			.expect("flagged issuance recorded");
		assert!(fresh.flagged_for_review);
		assert!(fresh
			.anomalies
			.contains(&"missing_context_field:change_ticket".to_string()));
	}

	#[tokio::test]
	async fn concurrent_misses_share_one_vault_fetch() {
		let rig = rig(
			VaultMode::SlowValue {
				value: "abc",
				version: "v1",
				delay: Duration::from_millis(60),
			},
			vec![spec("github-deploy")],
			100,
		)
		.await;
		let broker = Arc::new(rig.broker);

		let a = tokio::spawn({
			let broker = Arc::clone(&broker);
			async move { broker.provision(request("github-deploy")).await }
		});
		let b = tokio::spawn({
			let broker = Arc::clone(&broker);
			async move { broker.provision(request("github-deploy")).await }
		});

		let a = a.await.expect("task a").expect("issuance a");
		let b = b.await.expect("task b").expect("issuance b");

		assert_eq!(a.credential.expose(), "abc");
		assert_eq!(b.credential.expose(), "abc");
		assert_eq!(
			rig.fetches.load(Ordering::SeqCst),
			1,
			"concurrent misses must share one vault fetch"
		);
		assert!([a.source, b.source].contains(&CredentialSource::Vault));
		assert!([a.source, b.source].contains(&CredentialSource::Cache));
	}

	#[tokio::test]
	async fn vault_outage_serves_the_fallback_uncached() {
		let mut fallback_spec = spec("analytics-db");
		fallback_spec.fallback_env_key = Some("ANALYTICS_DB_PASSWORD".to_string());
		let rig = rig(VaultMode::Unreachable, vec![fallback_spec], 100).await;

		let issued = rig
			.broker
			.provision(request("analytics-db"))
			.await
			.expect("fallback issuance");
		assert_eq!(issued.credential.expose(), "zzz");
		assert_eq!(issued.source, CredentialSource::Fallback);

		// Fallback values are never written to the cache.
		assert_eq!(cache_entry_count(&rig.pool).await, 0);

		let rows = records(&rig.pool, ProvisionOutcome::Issued).await;
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].source, Some(CredentialSource::Fallback));
		assert!(rows[0].cache_key.is_none());
	}

	#[tokio::test]
	async fn vault_outage_without_a_fallback_fails() {
		let rig = rig(VaultMode::Unreachable, vec![spec("github-deploy")], 100).await;

		let err = rig
			.broker
			.provision(request("github-deploy"))
			.await
			.unwrap_err();
		assert_eq!(err.error_code(), "vault_unreachable");
		assert!(matches!(
			err,
			ProvisionError::CredentialUnavailable {
				source: VaultError::Unreachable(_)
			}
		));

		let failed = records(&rig.pool, ProvisionOutcome::Failed).await;
		assert_eq!(failed.len(), 1);
		assert_eq!(failed[0].reason_code.as_deref(), Some("vault_unreachable"));
		// The assessment ran before acquisition and is preserved.
		assert_eq!(failed[0].risk_score, Some(25));
	}

	#[tokio::test]
	async fn auth_failure_never_reaches_the_fallback() {
		let mut fallback_spec = spec("analytics-db");
		fallback_spec.fallback_env_key = Some("ANALYTICS_DB_PASSWORD".to_string());
		let rig = rig(VaultMode::AuthFailed, vec![fallback_spec], 100).await;

		let err = rig
			.broker
			.provision(request("analytics-db"))
			.await
			.unwrap_err();
		assert_eq!(err.error_code(), "vault_auth_failed");
		assert!(records(&rig.pool, ProvisionOutcome::Issued).await.is_empty());
	}

	#[tokio::test]
	async fn over_budget_requests_are_denied_and_audited() {
		let rig = rig(
			VaultMode::Value {
				value: "abc",
				version: "v1",
			},
			vec![spec("github-deploy")],
			2,
		)
		.await;

		rig.broker
			.provision(request("github-deploy"))
			.await
			.expect("first within budget");
		rig.broker
			.provision(request("github-deploy"))
			.await
			.expect("second within budget");
		let err = rig
			.broker
			.provision(request("github-deploy"))
			.await
			.unwrap_err();

		let ProvisionError::RateLimited { retry_after } = err else {
			panic!("expected a rate limit denial, got {err:?}");
		};
		assert!(retry_after > Duration::ZERO);
		assert!(retry_after <= Duration::from_secs(3600));

		let denied = records(&rig.pool, ProvisionOutcome::Denied).await;
		assert_eq!(denied.len(), 1);
		assert_eq!(denied[0].reason_code.as_deref(), Some("rate_limited"));
		// Assessment never ran for the denied attempt.
		assert!(denied[0].risk_score.is_none());
	}

	#[tokio::test]
	async fn revoke_evicts_the_cache_slot_and_is_idempotent() {
		let rig = rig(
			VaultMode::Value {
				value: "abc",
				version: "v1",
			},
			vec![spec("github-deploy")],
			100,
		)
		.await;

		let issued = rig
			.broker
			.provision(request("github-deploy"))
			.await
			.expect("issuance");
		assert_eq!(cache_entry_count(&rig.pool).await, 1);

		let ack = rig
			.broker
			.revoke(issued.source_token_id)
			.await
			.expect("revocation");
		assert!(!ack.already_revoked);
		assert_eq!(ack.source_token_id, issued.source_token_id);
		assert_eq!(cache_entry_count(&rig.pool).await, 0);

		let again = rig
			.broker
			.revoke(issued.source_token_id)
			.await
			.expect("repeat revocation");
		assert!(again.already_revoked);

		let err = rig
			.broker
			.revoke(SourceTokenId::generate())
			.await
			.unwrap_err();
		assert_eq!(err.error_code(), "unknown_source_token");

		let rows = records(&rig.pool, ProvisionOutcome::Issued).await;
		assert!(rows[0].revoked_at.is_some());
	}

	#[tokio::test]
	async fn failed_issuance_audit_withholds_the_credential() {
		let pool = create_broker_test_pool().await;
		EncryptedCache::migrate(&pool).await.expect("cache migrate");
		let fetches = Arc::new(AtomicUsize::new(0));

		let broker = CredentialBroker::new(
			BrokerHandles {
				vault: Arc::new(ScriptedVault {
					mode: VaultMode::Value {
						value: "abc",
						version: "v1",
					},
					fetches: Arc::clone(&fetches),
				}),
				cache: Arc::new(EncryptedCache::new(
					pool.clone(),
					CacheCipher::from_key([7u8; KEY_SIZE]),
				)),
				ledger: Arc::new(ScriptedLedger {
					record_fails: true,
					history_fails: false,
					healthy: true,
				}),
				rate_limiter: Arc::new(SqliteRateLimiter::new(
					pool.clone(),
					100,
					Duration::from_secs(3600),
				)),
				fallback: Arc::new(StaticFallback::new()),
			},
			SpecRegistry::from_specs(vec![spec("github-deploy")]).expect("valid specs"),
			BrokerTuning::default(),
		);

		let err = broker
			.provision(request("github-deploy"))
			.await
			.unwrap_err();
		assert!(matches!(err, ProvisionError::AuditWriteFailed(_)));
		// The value was acquired, then withheld at the audit barrier.
		assert_eq!(fetches.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn history_outage_degrades_to_an_empty_history() {
		let pool = create_broker_test_pool().await;
		EncryptedCache::migrate(&pool).await.expect("cache migrate");

		let broker = CredentialBroker::new(
			BrokerHandles {
				vault: Arc::new(ScriptedVault {
					mode: VaultMode::Value {
						value: "abc",
						version: "v1",
					},
					fetches: Arc::new(AtomicUsize::new(0)),
				}),
				cache: Arc::new(EncryptedCache::new(
					pool.clone(),
					CacheCipher::from_key([7u8; KEY_SIZE]),
				)),
				ledger: Arc::new(ScriptedLedger {
					record_fails: false,
					history_fails: true,
					healthy: true,
				}),
				rate_limiter: Arc::new(SqliteRateLimiter::new(
					pool.clone(),
					100,
					Duration::from_secs(3600),
				)),
				fallback: Arc::new(StaticFallback::new()),
			},
			SpecRegistry::from_specs(vec![spec("github-deploy")]).expect("valid specs"),
			BrokerTuning::default(),
		);

		let issued = broker
			.provision(request("github-deploy"))
			.await
			.expect("issued despite the history outage");
		// The empty substitute history makes the pairing look novel.
		assert_eq!(issued.risk_score, 25);
	}

	#[tokio::test]
	async fn non_cacheable_classes_fetch_every_time() {
		let mut direct = spec("session-signing");
		direct.cacheable = false;
		let rig = rig(
			VaultMode::Value {
				value: "abc",
				version: "v1",
			},
			vec![direct],
			100,
		)
		.await;

		rig.broker
			.provision(request("session-signing"))
			.await
			.expect("first");
		rig.broker
			.provision(request("session-signing"))
			.await
			.expect("second");

		assert_eq!(rig.fetches.load(Ordering::SeqCst), 2);
		assert_eq!(rig.cache_gets.load(Ordering::SeqCst), 0);
		assert_eq!(cache_entry_count(&rig.pool).await, 0);

		let rows = records(&rig.pool, ProvisionOutcome::Issued).await;
		assert_eq!(rows.len(), 2);
		assert!(rows
			.iter()
			.all(|r| r.cache_key.is_none() && r.source == Some(CredentialSource::Vault)));
	}

	#[tokio::test]
	async fn health_check_reports_every_backend_reachable() {
		let rig = rig(
			VaultMode::Value {
				value: "abc",
				version: "v1",
			},
			vec![spec("github-deploy")],
			100,
		)
		.await;

		let report = rig.broker.health_check().await;
		assert!(report.healthy());
		assert!(report.vault_latency.is_some());
	}

	#[tokio::test]
	async fn health_check_flags_an_unreachable_ledger() {
		let pool = create_broker_test_pool().await;
		EncryptedCache::migrate(&pool).await.expect("cache migrate");

		let broker = CredentialBroker::new(
			BrokerHandles {
				vault: Arc::new(ScriptedVault {
					mode: VaultMode::Value {
						value: "abc",
						version: "v1",
					},
					fetches: Arc::new(AtomicUsize::new(0)),
				}),
				cache: Arc::new(EncryptedCache::new(
					pool.clone(),
					CacheCipher::from_key([7u8; KEY_SIZE]),
				)),
				ledger: Arc::new(ScriptedLedger {
					record_fails: false,
					history_fails: false,
					healthy: false,
				}),
				rate_limiter: Arc::new(SqliteRateLimiter::new(
					pool.clone(),
					100,
					Duration::from_secs(3600),
				)),
				fallback: Arc::new(StaticFallback::new()),
			},
			SpecRegistry::from_specs(vec![spec("github-deploy")]).expect("valid specs"),
			BrokerTuning::default(),
		);

		let report = broker.health_check().await;
		assert!(report.vault_reachable);
		assert!(report.cache_reachable);
		assert!(!report.ledger_reachable);
		assert!(!report.healthy());
	}

	#[tokio::test]
	async fn from_config_wires_a_working_broker() {
		let dir = tempfile::tempdir().expect("temp dir");
		let db_path = dir.path().join("warden.db");

		let mut layer = crate::config::BrokerConfigLayer::default();
		layer.database.url = Some(format!("sqlite://{}", db_path.display()));
		layer.vault.base_url = Some("https://vault.internal:8200".to_string());
		layer.vault.token = Some(SecretString::from("tok-abc"));
		layer.cache.encryption_secret = Some(SecretString::from("cache-key-material"));
		layer.credentials = Some(vec![spec("github-deploy")]);
		let config = layer.finalize().expect("valid config");

		let broker = CredentialBroker::from_config(config)
			.await
			.expect("broker init");

		// Unknown types are rejected without touching the vault.
		let err = broker.provision(request("db-admin")).await.unwrap_err();
		assert_eq!(err.error_code(), "unknown_credential_type");
	}
}
