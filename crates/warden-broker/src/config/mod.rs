// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Broker configuration: loading, layering, and validation.
//!
//! Values are resolved from three sources in precedence order: built-in
//! defaults, the TOML config file, then `WARDEN_*` environment variables.
//! Each source contributes a [`BrokerConfigLayer`] of optional fields;
//! [`BrokerConfigLayer::finalize`] fills defaults, validates, and produces
//! the resolved [`BrokerConfig`] the broker is wired from.
//!
//! The credential classes a deployment brokers are part of configuration:
//! `[[credential]]` tables in the config file become the immutable
//! [`SpecRegistry`].

pub mod sources;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use warden_core::{CredentialSpec, SecretString, SpecError, SpecRegistry};
use warden_db::{DEFAULT_RATE_LIMIT, DEFAULT_RATE_WINDOW};

use sources::{ConfigSource, DefaultsSource, EnvSource, TomlSource};

/// Default lookback window for caller access history, in hours. One week
/// captures weekday/weekend rhythm without dragging in stale behavior.
pub const DEFAULT_RISK_LOOKBACK_HOURS: u32 = 168;

/// Default ceiling on a single audit ledger write, in milliseconds.
pub const DEFAULT_AUDIT_WRITE_TIMEOUT_MS: u64 = 2_000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The config file exists but could not be read.
	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// The config file is not valid TOML for the expected shape.
	#[error("failed to parse config file {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	/// A value was present but unusable.
	#[error("invalid value for {key}: {message}")]
	InvalidValue { key: String, message: String },

	/// A required value was absent from every source.
	#[error("missing required configuration value: {0}")]
	MissingValue(&'static str),

	/// A credential spec failed validation.
	#[error(transparent)]
	Spec(#[from] SpecError),
}

impl ConfigError {
	pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
		ConfigError::InvalidValue {
			key: key.into(),
			message: message.into(),
		}
	}
}

/// Database settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
	/// SQLite connection URL backing the ledger, rate windows, and cache.
	pub url: String,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		Self {
			url: "sqlite:./warden.db".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfigLayer {
	#[serde(default)]
	pub url: Option<String>,
}

impl DatabaseConfigLayer {
	pub fn merge(&mut self, other: DatabaseConfigLayer) {
		if other.url.is_some() {
			self.url = other.url;
		}
	}

	pub fn finalize(self) -> DatabaseConfig {
		let defaults = DatabaseConfig::default();
		DatabaseConfig {
			url: self.url.unwrap_or(defaults.url),
		}
	}
}

/// Upstream vault connection settings.
#[derive(Debug, Clone)]
pub struct VaultConfig {
	/// Base URL of the vault, without a trailing slash.
	pub base_url: String,
	/// Bearer token presented on every vault request.
	pub token: SecretString,
	/// Per-request timeout for vault fetches.
	pub fetch_timeout: Duration,
	/// Total fetch attempts for transient failures, including the first.
	pub retry_attempts: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfigLayer {
	#[serde(default)]
	pub base_url: Option<String>,
	#[serde(default)]
	pub token: Option<SecretString>,
	#[serde(default)]
	pub fetch_timeout_secs: Option<u64>,
	#[serde(default)]
	pub retry_attempts: Option<u32>,
}

impl VaultConfigLayer {
	pub fn merge(&mut self, other: VaultConfigLayer) {
		if other.base_url.is_some() {
			self.base_url = other.base_url;
		}
		if other.token.is_some() {
			self.token = other.token;
		}
		if other.fetch_timeout_secs.is_some() {
			self.fetch_timeout_secs = other.fetch_timeout_secs;
		}
		if other.retry_attempts.is_some() {
			self.retry_attempts = other.retry_attempts;
		}
	}

	pub fn finalize(self) -> Result<VaultConfig, ConfigError> {
		let base_url = self
			.base_url
			.ok_or(ConfigError::MissingValue("vault.base_url"))?;
		let token = self.token.ok_or(ConfigError::MissingValue("vault.token"))?;

		if let Some(0) = self.fetch_timeout_secs {
			return Err(ConfigError::invalid_value(
				"vault.fetch_timeout_secs",
				"must be at least 1",
			));
		}
		if let Some(0) = self.retry_attempts {
			return Err(ConfigError::invalid_value(
				"vault.retry_attempts",
				"must be at least 1",
			));
		}

		Ok(VaultConfig {
			base_url,
			token,
			fetch_timeout: self
				.fetch_timeout_secs
				.map(Duration::from_secs)
				.unwrap_or(warden_vault::DEFAULT_FETCH_TIMEOUT),
			retry_attempts: self
				.retry_attempts
				.unwrap_or(warden_vault::RetryPolicy::default().max_attempts),
		})
	}
}

/// Encrypted cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
	/// Secret the per-deployment cache encryption key is derived from.
	pub encryption_secret: SecretString,
	/// How long a fetch lease protects a cache slot before takeover.
	pub fetch_lease: Duration,
	/// How long a request waits on another request's in-flight fetch
	/// before fetching directly.
	pub wait_ceiling: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfigLayer {
	#[serde(default)]
	pub encryption_secret: Option<SecretString>,
	#[serde(default)]
	pub fetch_lease_secs: Option<u64>,
	#[serde(default)]
	pub wait_ceiling_ms: Option<u64>,
}

impl CacheConfigLayer {
	pub fn merge(&mut self, other: CacheConfigLayer) {
		if other.encryption_secret.is_some() {
			self.encryption_secret = other.encryption_secret;
		}
		if other.fetch_lease_secs.is_some() {
			self.fetch_lease_secs = other.fetch_lease_secs;
		}
		if other.wait_ceiling_ms.is_some() {
			self.wait_ceiling_ms = other.wait_ceiling_ms;
		}
	}

	pub fn finalize(self) -> Result<CacheConfig, ConfigError> {
		let encryption_secret = self
			.encryption_secret
			.ok_or(ConfigError::MissingValue("cache.encryption_secret"))?;

		if let Some(0) = self.fetch_lease_secs {
			return Err(ConfigError::invalid_value(
				"cache.fetch_lease_secs",
				"must be at least 1",
			));
		}

		Ok(CacheConfig {
			encryption_secret,
			fetch_lease: self
				.fetch_lease_secs
				.map(Duration::from_secs)
				.unwrap_or(warden_cache::DEFAULT_FETCH_LEASE),
			// Zero is allowed: it disables waiting and sends cache-miss
			// losers straight to the vault.
			wait_ceiling: self
				.wait_ceiling_ms
				.map(Duration::from_millis)
				.unwrap_or(warden_cache::DEFAULT_WAIT_CEILING),
		})
	}
}

/// Per-caller admission budget.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
	/// Requests allowed per caller per window.
	pub per_caller_limit: u32,
	/// Fixed window length.
	pub window: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitConfigLayer {
	#[serde(default)]
	pub per_caller_limit: Option<u32>,
	#[serde(default)]
	pub window_secs: Option<u64>,
}

impl RateLimitConfigLayer {
	pub fn merge(&mut self, other: RateLimitConfigLayer) {
		if other.per_caller_limit.is_some() {
			self.per_caller_limit = other.per_caller_limit;
		}
		if other.window_secs.is_some() {
			self.window_secs = other.window_secs;
		}
	}

	pub fn finalize(self) -> Result<RateLimitConfig, ConfigError> {
		if let Some(0) = self.per_caller_limit {
			return Err(ConfigError::invalid_value(
				"rate_limit.per_caller_limit",
				"must be at least 1",
			));
		}
		if let Some(0) = self.window_secs {
			return Err(ConfigError::invalid_value(
				"rate_limit.window_secs",
				"must be at least 1",
			));
		}

		Ok(RateLimitConfig {
			per_caller_limit: self.per_caller_limit.unwrap_or(DEFAULT_RATE_LIMIT),
			window: self
				.window_secs
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_RATE_WINDOW),
		})
	}
}

/// Risk evaluation settings.
#[derive(Debug, Clone)]
pub struct RiskConfig {
	/// Hours of ledger history consulted per assessment.
	pub lookback_hours: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskConfigLayer {
	#[serde(default)]
	pub lookback_hours: Option<u32>,
}

impl RiskConfigLayer {
	pub fn merge(&mut self, other: RiskConfigLayer) {
		if other.lookback_hours.is_some() {
			self.lookback_hours = other.lookback_hours;
		}
	}

	pub fn finalize(self) -> Result<RiskConfig, ConfigError> {
		if let Some(0) = self.lookback_hours {
			return Err(ConfigError::invalid_value(
				"risk.lookback_hours",
				"must be at least 1",
			));
		}

		Ok(RiskConfig {
			lookback_hours: self.lookback_hours.unwrap_or(DEFAULT_RISK_LOOKBACK_HOURS),
		})
	}
}

/// Audit ledger write behavior.
#[derive(Debug, Clone)]
pub struct AuditConfig {
	/// Ceiling on a single ledger write before issuance is failed.
	pub write_timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditConfigLayer {
	#[serde(default)]
	pub write_timeout_ms: Option<u64>,
}

impl AuditConfigLayer {
	pub fn merge(&mut self, other: AuditConfigLayer) {
		if other.write_timeout_ms.is_some() {
			self.write_timeout_ms = other.write_timeout_ms;
		}
	}

	pub fn finalize(self) -> Result<AuditConfig, ConfigError> {
		if let Some(0) = self.write_timeout_ms {
			return Err(ConfigError::invalid_value(
				"audit.write_timeout_ms",
				"must be at least 1",
			));
		}

		Ok(AuditConfig {
			write_timeout: self
				.write_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(Duration::from_millis(DEFAULT_AUDIT_WRITE_TIMEOUT_MS)),
		})
	}
}

/// Fully resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
	pub database: DatabaseConfig,
	pub vault: VaultConfig,
	pub cache: CacheConfig,
	pub rate_limit: RateLimitConfig,
	pub risk: RiskConfig,
	pub audit: AuditConfig,
	/// The validated, immutable set of credential classes.
	pub credentials: SpecRegistry,
}

/// One source's contribution, all fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfigLayer {
	#[serde(default)]
	pub database: DatabaseConfigLayer,
	#[serde(default)]
	pub vault: VaultConfigLayer,
	#[serde(default)]
	pub cache: CacheConfigLayer,
	#[serde(default)]
	pub rate_limit: RateLimitConfigLayer,
	#[serde(default)]
	pub risk: RiskConfigLayer,
	#[serde(default)]
	pub audit: AuditConfigLayer,
	/// `[[credential]]` tables. A later layer that carries any tables
	/// replaces the set wholesale; specs do not merge field by field.
	#[serde(default, rename = "credential")]
	pub credentials: Option<Vec<CredentialSpec>>,
}

impl BrokerConfigLayer {
	/// Overlay `other` onto this layer; set fields in `other` win.
	pub fn merge(&mut self, other: BrokerConfigLayer) {
		self.database.merge(other.database);
		self.vault.merge(other.vault);
		self.cache.merge(other.cache);
		self.rate_limit.merge(other.rate_limit);
		self.risk.merge(other.risk);
		self.audit.merge(other.audit);
		if other.credentials.is_some() {
			self.credentials = other.credentials;
		}
	}

	/// Fill defaults, validate, and resolve into a [`BrokerConfig`].
	pub fn finalize(self) -> Result<BrokerConfig, ConfigError> {
		Ok(BrokerConfig {
			database: self.database.finalize(),
			vault: self.vault.finalize()?,
			cache: self.cache.finalize()?,
			rate_limit: self.rate_limit.finalize()?,
			risk: self.risk.finalize()?,
			audit: self.audit.finalize()?,
			credentials: SpecRegistry::from_specs(self.credentials.unwrap_or_default())?,
		})
	}
}

/// Load configuration from the system config file and the environment.
pub fn load_config() -> Result<BrokerConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource),
	])
}

/// Load configuration from an explicit config file path plus the
/// environment.
pub fn load_config_with_file(path: impl AsRef<Path>) -> Result<BrokerConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(path.as_ref())),
		Box::new(EnvSource),
	])
}

fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<BrokerConfig, ConfigError> {
	sources.sort_by_key(|source| source.precedence());

	let mut merged = BrokerConfigLayer::default();
	for source in sources {
		let layer = source.load()?;
		debug!(source = source.name(), "applying configuration layer");
		merged.merge(layer);
	}

	let config = merged.finalize()?;

	info!(
		database_url = %config.database.url,
		vault_base_url = %config.vault.base_url,
		credential_classes = config.credentials.len(),
		rate_limit = config.rate_limit.per_caller_limit,
		risk_lookback_hours = config.risk.lookback_hours,
		"configuration loaded"
	);

	Ok(config)
}
