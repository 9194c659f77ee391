// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client for the upstream secret vault.
//!
//! The vault speaks a small JSON protocol: `GET /v1/secret/{path}`
//! returns `{"value": "...", "version": "..."}` for a readable secret,
//! and `GET /v1/sys/health` answers 200 when the vault can serve
//! reads. Every request carries the broker's own bearer token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use warden_core::SecretString;

use crate::error::{Result, VaultError};
use crate::retry::{retry_with, RetryPolicy};

/// Default per-request timeout. The broker promises its callers a
/// bounded worst case, so this must stay well under that budget even
/// with a retry on top.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(4);

/// A secret as returned by the vault, with the vault's version marker.
#[derive(Debug)]
pub struct FetchedSecret {
	/// The secret material itself.
	pub value: SecretString,
	/// Opaque version identifier assigned by the vault.
	pub version: String,
}

/// Outcome of a vault health probe.
#[derive(Debug, Clone)]
pub struct VaultHealth {
	/// Whether the vault answered that it can serve reads.
	pub healthy: bool,
	/// Round-trip time of the probe.
	pub latency: Duration,
}

/// Read access to the upstream vault.
#[async_trait]
pub trait VaultClient: Send + Sync {
	/// Fetch the secret stored at `path`.
	async fn fetch(&self, path: &str) -> Result<FetchedSecret>;

	/// Probe whether the vault is able to serve reads right now.
	async fn health_check(&self) -> Result<VaultHealth>;
}

/// Wire shape of a successful secret read.
#[derive(Debug, Deserialize)]
struct SecretEnvelope {
	value: String,
	version: String,
}

struct ClientInner {
	base_url: String,
	token: SecretString,
	http: reqwest::Client,
	retry: RetryPolicy,
}

/// [`VaultClient`] backed by the vault's HTTP API.
///
/// Cheap to clone; all clones share the same connection pool.
#[derive(Clone)]
pub struct HttpVaultClient {
	inner: Arc<ClientInner>,
}

impl HttpVaultClient {
	/// Start building a client. `base_url` and `token` are required.
	pub fn builder() -> HttpVaultClientBuilder {
		HttpVaultClientBuilder::new()
	}

	async fn fetch_once(&self, path: &str) -> Result<FetchedSecret> {
		let url = secret_url(&self.inner.base_url, path);
		let response = self
			.inner
			.http
			.get(&url)
			.bearer_auth(self.inner.token.expose())
			.send()
			.await
			.map_err(|err| VaultError::Unreachable(err.to_string()))?;

		let status = response.status();
		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Err(VaultError::AuthFailed);
		}
		if status == StatusCode::NOT_FOUND {
			return Err(VaultError::NotFound { path: path.to_string() });
		}
		// 429 and 5xx mean the vault exists but cannot serve us right
		// now, which is indistinguishable from unreachable for our
		// callers and is retried the same way.
		if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
			return Err(VaultError::Unreachable(format!("vault answered {status}")));
		}
		if !status.is_success() {
			return Err(VaultError::Protocol(format!("unexpected status {status}")));
		}

		let envelope: SecretEnvelope = response
			.json()
			.await
			.map_err(|err| VaultError::Protocol(format!("invalid secret body: {err}")))?;

		Ok(FetchedSecret { value: SecretString::new(envelope.value), version: envelope.version })
	}
}

#[async_trait]
impl VaultClient for HttpVaultClient {
	async fn fetch(&self, path: &str) -> Result<FetchedSecret> {
		debug!(path, "fetching secret from vault");
		retry_with(&self.inner.retry, "vault_fetch", || self.fetch_once(path)).await
	}

	async fn health_check(&self) -> Result<VaultHealth> {
		// Health probes are never retried. A probe that needed a retry
		// to pass is itself evidence of trouble.
		let url = format!("{}/v1/sys/health", self.inner.base_url);
		let start = Instant::now();
		let response = self
			.inner
			.http
			.get(&url)
			.bearer_auth(self.inner.token.expose())
			.send()
			.await
			.map_err(|err| VaultError::Unreachable(err.to_string()))?;
		let latency = start.elapsed();
		let healthy = response.status().is_success();
		debug!(healthy, latency_ms = latency.as_millis() as u64, "vault health probe");
		Ok(VaultHealth { healthy, latency })
	}
}

fn secret_url(base_url: &str, path: &str) -> String {
	format!("{}/v1/secret/{}", base_url, path.trim_start_matches('/'))
}

/// Builder for [`HttpVaultClient`].
pub struct HttpVaultClientBuilder {
	base_url: Option<String>,
	token: Option<SecretString>,
	fetch_timeout: Duration,
	retry: RetryPolicy,
}

impl HttpVaultClientBuilder {
	fn new() -> Self {
		Self {
			base_url: None,
			token: None,
			fetch_timeout: DEFAULT_FETCH_TIMEOUT,
			retry: RetryPolicy::default(),
		}
	}

	/// Base URL of the vault, e.g. `https://vault.internal:8200`.
	/// Trailing slashes are stripped.
	pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
		self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
		self
	}

	/// Bearer token the broker authenticates to the vault with.
	pub fn token(mut self, token: SecretString) -> Self {
		self.token = Some(token);
		self
	}

	/// Per-request timeout. Defaults to [`DEFAULT_FETCH_TIMEOUT`].
	pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
		self.fetch_timeout = timeout;
		self
	}

	/// Retry policy for transient failures. Defaults to two attempts.
	pub fn retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Validate the configuration and build the client.
	pub fn build(self) -> Result<HttpVaultClient> {
		let base_url = self
			.base_url
			.filter(|url| !url.is_empty())
			.ok_or_else(|| VaultError::InvalidConfig("base_url is required".to_string()))?;
		reqwest::Url::parse(&base_url)
			.map_err(|err| VaultError::InvalidConfig(format!("base_url is not a valid URL: {err}")))?;
		let token = self
			.token
			.ok_or_else(|| VaultError::InvalidConfig("token is required".to_string()))?;
		if token.expose().is_empty() {
			return Err(VaultError::InvalidConfig("token must not be empty".to_string()));
		}

		let http = reqwest::Client::builder()
			.timeout(self.fetch_timeout)
			.build()
			.map_err(|err| VaultError::InvalidConfig(format!("http client: {err}")))?;

		Ok(HttpVaultClient {
			inner: Arc::new(ClientInner { base_url, token, http, retry: self.retry }),
		})
	}
}
