// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The durable audit ledger.
//!
//! Every provisioning attempt leaves exactly one row here, written
//! before the broker reports success for issued credentials. Rows are
//! append-only; the single permitted mutation is setting `revoked_at`
//! once.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use uuid::Uuid;

use warden_core::{
	AccessHistory, CacheKey, CredentialSource, ProvisionOutcome, ProvisionRecord, RecordId,
	SourceTokenId,
};

use crate::error::{DbError, Result};

/// How far back denials count as "recent" for the risk evaluator's
/// repeated-denial factor.
const DENIAL_LOOKBACK_HOURS: i64 = 24;

/// Filters for [`AuditLedger::query`]. All fields are optional; an
/// empty query returns the newest records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerQuery {
	pub caller_service: Option<String>,
	pub credential_type: Option<String>,
	/// Inclusive lower bound on `issued_at`.
	pub from: Option<DateTime<Utc>>,
	/// Inclusive upper bound on `issued_at`.
	pub to: Option<DateTime<Utc>>,
	pub min_risk_score: Option<u8>,
	pub outcome: Option<ProvisionOutcome>,
	/// Page size; defaults to 50, capped at 1000.
	pub limit: Option<i64>,
	pub offset: Option<i64>,
}

/// What `mark_revoked` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevokeOutcome {
	/// The record was live and is now revoked. Carries the cache key
	/// recorded at issuance so the caller can evict it.
	Revoked { cache_key: Option<CacheKey> },
	/// The record was already revoked; nothing changed.
	AlreadyRevoked,
	/// No record was ever issued under this token.
	NotFound,
}

/// Append-only persistence for provisioning attempts.
#[async_trait]
pub trait AuditLedger: Send + Sync {
	/// Durably insert one record.
	async fn record(&self, record: &ProvisionRecord) -> Result<()>;

	/// Set `revoked_at` on the record issued under `token`, if it is
	/// still live. Idempotent at the SQL level.
	async fn mark_revoked(&self, token: &SourceTokenId, at: DateTime<Utc>)
		-> Result<RevokeOutcome>;

	/// Filtered, paginated read of the ledger, newest first.
	async fn query(&self, query: &LedgerQuery) -> Result<Vec<ProvisionRecord>>;

	/// Aggregate view of a caller's recent behavior, consumed by the
	/// risk evaluator.
	async fn access_history(
		&self,
		caller_service: &str,
		credential_type: &str,
		now: DateTime<Utc>,
		lookback_hours: u32,
	) -> Result<AccessHistory>;

	/// Verify the backing store is reachable.
	async fn health_check(&self) -> Result<()>;
}

/// [`AuditLedger`] over SQLite.
pub struct SqliteAuditLedger {
	pool: SqlitePool,
}

impl SqliteAuditLedger {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	/// Create the ledger table if it does not exist. Safe to run on
	/// every startup.
	pub async fn migrate(pool: &SqlitePool) -> Result<()> {
		sqlx::query(
			r#"
			CREATE TABLE IF NOT EXISTS provision_records (
				id TEXT PRIMARY KEY,
				credential_type TEXT NOT NULL,
				caller_service TEXT NOT NULL,
				outcome TEXT NOT NULL,
				reason_code TEXT,
				source TEXT,
				risk_score INTEGER,
				anomalies TEXT NOT NULL DEFAULT '[]',
				flagged_for_review INTEGER NOT NULL DEFAULT 0,
				issued_at TEXT NOT NULL,
				expires_at TEXT,
				revoked_at TEXT,
				source_token_id TEXT NOT NULL UNIQUE,
				cache_key TEXT
			)
			"#,
		)
		.execute(pool)
		.await?;

		sqlx::query(
			"CREATE INDEX IF NOT EXISTS idx_provision_records_caller \
			 ON provision_records(caller_service, credential_type, issued_at)",
		)
		.execute(pool)
		.await?;

		Ok(())
	}

	fn row_to_record(&self, row: &sqlx::sqlite::SqliteRow) -> Result<ProvisionRecord> {
		let id_str: String = row.get("id");
		let id = Uuid::parse_str(&id_str)
			.map(RecordId::from)
			.map_err(|e| DbError::Internal(format!("Invalid record id: {e}")))?;

		let token_str: String = row.get("source_token_id");
		let source_token_id = token_str
			.parse::<SourceTokenId>()
			.map_err(|e| DbError::Internal(format!("Invalid source_token_id: {e}")))?;

		let outcome_str: String = row.get("outcome");
		let outcome = outcome_str
			.parse::<ProvisionOutcome>()
			.map_err(|e| DbError::Internal(format!("Invalid outcome: {e}")))?;

		let source: Option<CredentialSource> = row
			.get::<Option<String>, _>("source")
			.map(|s| s.parse().map_err(|e| DbError::Internal(format!("Invalid source: {e}"))))
			.transpose()?;

		let risk_score: Option<u8> = row
			.get::<Option<i64>, _>("risk_score")
			.map(|v| {
				u8::try_from(v).map_err(|_| DbError::Internal(format!("Invalid risk_score: {v}")))
			})
			.transpose()?;

		let anomalies_json: String = row.get("anomalies");
		let anomalies: Vec<String> = serde_json::from_str(&anomalies_json)?;

		let cache_key: Option<CacheKey> =
			row.get::<Option<String>, _>("cache_key").map(CacheKey::from_hex);

		Ok(ProvisionRecord {
			id,
			credential_type: row.get("credential_type"),
			caller_service: row.get("caller_service"),
			outcome,
			reason_code: row.get("reason_code"),
			source,
			risk_score,
			anomalies,
			flagged_for_review: row.get("flagged_for_review"),
			issued_at: self.parse_timestamp(row, "issued_at")?,
			expires_at: self.parse_optional_timestamp(row, "expires_at")?,
			revoked_at: self.parse_optional_timestamp(row, "revoked_at")?,
			source_token_id,
			cache_key,
		})
	}

	fn parse_timestamp(&self, row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>> {
		let raw: String = row.get(column);
		DateTime::parse_from_rfc3339(&raw)
			.map(|dt| dt.with_timezone(&Utc))
			.map_err(|e| DbError::Internal(format!("Invalid {column}: {e}")))
	}

	fn parse_optional_timestamp(
		&self,
		row: &sqlx::sqlite::SqliteRow,
		column: &str,
	) -> Result<Option<DateTime<Utc>>> {
		row.get::<Option<String>, _>(column)
			.map(|raw| {
				DateTime::parse_from_rfc3339(&raw)
					.map(|dt| dt.with_timezone(&Utc))
					.map_err(|e| DbError::Internal(format!("Invalid {column}: {e}")))
			})
			.transpose()
	}
}

#[async_trait]
impl AuditLedger for SqliteAuditLedger {
	#[tracing::instrument(
		skip(self, record),
		fields(record_id = %record.id, outcome = %record.outcome, caller = %record.caller_service)
	)]
	async fn record(&self, record: &ProvisionRecord) -> Result<()> {
		let anomalies = serde_json::to_string(&record.anomalies)?;

		sqlx::query(
			r#"
			INSERT INTO provision_records (
				id, credential_type, caller_service, outcome, reason_code, source,
				risk_score, anomalies, flagged_for_review, issued_at, expires_at,
				revoked_at, source_token_id, cache_key
			)
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
			"#,
		)
		.bind(record.id.to_string())
		.bind(&record.credential_type)
		.bind(&record.caller_service)
		.bind(record.outcome.as_str())
		.bind(&record.reason_code)
		.bind(record.source.map(|s| s.as_str()))
		.bind(record.risk_score.map(|s| s as i64))
		.bind(anomalies)
		.bind(record.flagged_for_review)
		.bind(record.issued_at.to_rfc3339())
		.bind(record.expires_at.map(|at| at.to_rfc3339()))
		.bind(record.revoked_at.map(|at| at.to_rfc3339()))
		.bind(record.source_token_id.to_string())
		.bind(record.cache_key.as_ref().map(|k| k.as_str().to_string()))
		.execute(&self.pool)
		.await?;

		tracing::debug!("provision record written");
		Ok(())
	}

	#[tracing::instrument(skip(self), fields(token = %token))]
	async fn mark_revoked(
		&self,
		token: &SourceTokenId,
		at: DateTime<Utc>,
	) -> Result<RevokeOutcome> {
		let result = sqlx::query(
			r#"
			UPDATE provision_records
			SET revoked_at = ?
			WHERE source_token_id = ? AND revoked_at IS NULL
			"#,
		)
		.bind(at.to_rfc3339())
		.bind(token.to_string())
		.execute(&self.pool)
		.await?;

		if result.rows_affected() == 1 {
			let cache_key: Option<String> = sqlx::query_scalar(
				"SELECT cache_key FROM provision_records WHERE source_token_id = ?",
			)
			.bind(token.to_string())
			.fetch_one(&self.pool)
			.await?;

			tracing::debug!("record revoked");
			return Ok(RevokeOutcome::Revoked { cache_key: cache_key.map(CacheKey::from_hex) });
		}

		// Nothing updated: the record is already revoked or was never
		// written.
		let existing: i64 =
			sqlx::query_scalar("SELECT COUNT(*) FROM provision_records WHERE source_token_id = ?")
				.bind(token.to_string())
				.fetch_one(&self.pool)
				.await?;

		if existing > 0 {
			Ok(RevokeOutcome::AlreadyRevoked)
		} else {
			Ok(RevokeOutcome::NotFound)
		}
	}

	#[tracing::instrument(skip(self, query))]
	async fn query(&self, query: &LedgerQuery) -> Result<Vec<ProvisionRecord>> {
		let limit = query.limit.unwrap_or(50).min(1000);
		let offset = query.offset.unwrap_or(0);

		let mut conditions = vec!["1=1".to_string()];
		if query.caller_service.is_some() {
			conditions.push("caller_service = ?".to_string());
		}
		if query.credential_type.is_some() {
			conditions.push("credential_type = ?".to_string());
		}
		if query.from.is_some() {
			conditions.push("issued_at >= ?".to_string());
		}
		if query.to.is_some() {
			conditions.push("issued_at <= ?".to_string());
		}
		if query.min_risk_score.is_some() {
			conditions.push("risk_score >= ?".to_string());
		}
		if query.outcome.is_some() {
			conditions.push("outcome = ?".to_string());
		}

		let sql = format!(
			"SELECT id, credential_type, caller_service, outcome, reason_code, source, \
			 risk_score, anomalies, flagged_for_review, issued_at, expires_at, revoked_at, \
			 source_token_id, cache_key \
			 FROM provision_records WHERE {} ORDER BY issued_at DESC LIMIT ? OFFSET ?",
			conditions.join(" AND ")
		);

		let mut data_query = sqlx::query(&sql);
		if let Some(v) = &query.caller_service {
			data_query = data_query.bind(v);
		}
		if let Some(v) = &query.credential_type {
			data_query = data_query.bind(v);
		}
		if let Some(v) = query.from {
			data_query = data_query.bind(v.to_rfc3339());
		}
		if let Some(v) = query.to {
			data_query = data_query.bind(v.to_rfc3339());
		}
		if let Some(v) = query.min_risk_score {
			data_query = data_query.bind(v as i64);
		}
		if let Some(v) = query.outcome {
			data_query = data_query.bind(v.as_str());
		}
		data_query = data_query.bind(limit).bind(offset);

		let rows = data_query.fetch_all(&self.pool).await?;
		rows.iter().map(|row| self.row_to_record(row)).collect()
	}

	#[tracing::instrument(skip(self), fields(caller = caller_service, credential_type))]
	async fn access_history(
		&self,
		caller_service: &str,
		credential_type: &str,
		now: DateTime<Utc>,
		lookback_hours: u32,
	) -> Result<AccessHistory> {
		let since = now - chrono::Duration::hours(lookback_hours as i64);
		let hour_ago = now - chrono::Duration::hours(1);
		let denial_since = now - chrono::Duration::hours(DENIAL_LOOKBACK_HOURS);

		let total_requests: i64 = sqlx::query_scalar(
			"SELECT COUNT(*) FROM provision_records WHERE caller_service = ? AND issued_at > ?",
		)
		.bind(caller_service)
		.bind(since.to_rfc3339())
		.fetch_one(&self.pool)
		.await?;

		let requests_last_hour: i64 = sqlx::query_scalar(
			"SELECT COUNT(*) FROM provision_records WHERE caller_service = ? AND issued_at > ?",
		)
		.bind(caller_service)
		.bind(hour_ago.to_rfc3339())
		.fetch_one(&self.pool)
		.await?;

		// Hour-of-day usage buckets over the lookback window. Stored
		// timestamps are UTC, so strftime needs no zone conversion.
		let buckets: Vec<(i64, i64)> = sqlx::query_as(
			r#"
			SELECT CAST(strftime('%H', issued_at) AS INTEGER) AS hour, COUNT(*)
			FROM provision_records
			WHERE caller_service = ? AND issued_at > ?
			GROUP BY hour
			"#,
		)
		.bind(caller_service)
		.bind(since.to_rfc3339())
		.fetch_all(&self.pool)
		.await?;

		let mut hour_histogram = [0u32; 24];
		for (hour, count) in buckets {
			if (0..24).contains(&hour) {
				hour_histogram[hour as usize] = count.max(0) as u32;
			}
		}

		// Novelty is judged against everything ever issued for the
		// pairing, not just the lookback window.
		let issued_for_pairing: i64 = sqlx::query_scalar(
			"SELECT COUNT(*) FROM provision_records \
			 WHERE caller_service = ? AND credential_type = ? AND outcome = 'issued'",
		)
		.bind(caller_service)
		.bind(credential_type)
		.fetch_one(&self.pool)
		.await?;

		let recent_denials: i64 = sqlx::query_scalar(
			"SELECT COUNT(*) FROM provision_records \
			 WHERE caller_service = ? AND outcome = 'denied' AND issued_at > ?",
		)
		.bind(caller_service)
		.bind(denial_since.to_rfc3339())
		.fetch_one(&self.pool)
		.await?;

		Ok(AccessHistory {
			total_requests: total_requests.max(0) as u64,
			requests_last_hour: requests_last_hour.max(0) as u64,
			hour_histogram,
			issued_for_pairing: issued_for_pairing.max(0) as u64,
			recent_denials: recent_denials.max(0) as u64,
			lookback_hours,
		})
	}

	async fn health_check(&self) -> Result<()> {
		sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
		Ok(())
	}
}
