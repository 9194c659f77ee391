// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources and their precedence.
//!
//! Configuration is assembled from layered sources. Each source produces a
//! [`BrokerConfigLayer`] with only the fields it knows about; layers are
//! merged in precedence order and the result is finalized into a
//! [`BrokerConfig`](super::BrokerConfig) with defaults filled in.

use std::path::PathBuf;

use tracing::debug;

use warden_core::SecretString;

use super::{BrokerConfigLayer, ConfigError};

/// Default location of the deployment config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden/config.toml";

/// Precedence levels for configuration sources.
/// Higher values override lower values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	/// Built-in defaults (lowest precedence)
	Defaults = 10,
	/// Configuration file
	ConfigFile = 20,
	/// Environment variables (highest precedence)
	Environment = 50,
}

/// A single source of configuration values.
pub trait ConfigSource: Send + Sync {
	/// Human-readable name for logging.
	fn name(&self) -> &'static str;

	/// Where this source sits in the override order.
	fn precedence(&self) -> Precedence;

	/// Produce this source's layer. Absent values stay `None`.
	fn load(&self) -> Result<BrokerConfigLayer, ConfigError>;
}

/// The empty base layer; every default is applied during finalization so
/// that file and environment layers always win.
pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<BrokerConfigLayer, ConfigError> {
		Ok(BrokerConfigLayer::default())
	}
}

/// Reads a TOML config file. A missing file is not an error; deployments
/// may run entirely from environment variables.
pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// The system config file at [`DEFAULT_CONFIG_PATH`].
	pub fn system() -> Self {
		Self::new(DEFAULT_CONFIG_PATH)
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"config-file"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<BrokerConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not present, skipping");
			return Ok(BrokerConfigLayer::default());
		}

		let raw = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::FileRead {
			path: self.path.clone(),
			source,
		})?;

		toml::from_str(&raw).map_err(|source| ConfigError::TomlParse {
			path: self.path.clone(),
			source,
		})
	}
}

/// Reads `WARDEN_*` environment variables.
///
/// Credential specs cannot be supplied this way; the `[[credential]]`
/// tables only exist in the config file.
pub struct EnvSource;

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<BrokerConfigLayer, ConfigError> {
		let mut layer = BrokerConfigLayer::default();

		layer.database.url = env_var("WARDEN_DATABASE_URL");

		layer.vault.base_url = env_var("WARDEN_VAULT_BASE_URL");
		layer.vault.token = env_secret("WARDEN_VAULT_TOKEN");
		layer.vault.fetch_timeout_secs = env_u64("WARDEN_VAULT_FETCH_TIMEOUT_SECS")?;
		layer.vault.retry_attempts = env_u32("WARDEN_VAULT_RETRY_ATTEMPTS")?;

		layer.cache.encryption_secret = env_secret("WARDEN_CACHE_ENCRYPTION_SECRET");
		layer.cache.fetch_lease_secs = env_u64("WARDEN_CACHE_FETCH_LEASE_SECS")?;
		layer.cache.wait_ceiling_ms = env_u64("WARDEN_CACHE_WAIT_CEILING_MS")?;

		layer.rate_limit.per_caller_limit = env_u32("WARDEN_RATE_LIMIT")?;
		layer.rate_limit.window_secs = env_u64("WARDEN_RATE_WINDOW_SECS")?;

		layer.risk.lookback_hours = env_u32("WARDEN_RISK_LOOKBACK_HOURS")?;

		layer.audit.write_timeout_ms = env_u64("WARDEN_AUDIT_WRITE_TIMEOUT_MS")?;

		Ok(layer)
	}
}

/// Read an environment variable, treating empty values as unset.
fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Read a secret-bearing environment variable into a [`SecretString`].
fn env_secret(name: &str) -> Option<SecretString> {
	env_var(name).map(SecretString::from)
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
	match env_var(name) {
		None => Ok(None),
		Some(value) => value.parse().map(Some).map_err(|_| {
			ConfigError::invalid_value(name, format!("invalid u64 value '{value}'"))
		}),
	}
}

fn env_u32(name: &str) -> Result<Option<u32>, ConfigError> {
	match env_var(name) {
		None => Ok(None),
		Some(value) => value.parse().map(Some).map_err(|_| {
			ConfigError::invalid_value(name, format!("invalid u32 value '{value}'"))
		}),
	}
}
