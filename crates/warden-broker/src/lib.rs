// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The warden credential broker.
//!
//! Composes the vault client, encrypted cache, audit ledger, rate
//! limiter, and risk evaluator into a single provisioning pipeline.
//! [`CredentialBroker::provision`] is the only path by which callers
//! obtain credential material; [`CredentialBroker::revoke`] and
//! [`CredentialBroker::audit_query`] operate on the issuance trail it
//! leaves behind.
//!
//! Configuration is layered (defaults, then the TOML config file, then
//! `WARDEN_`-prefixed environment variables) and resolved once at
//! startup via [`load_config`]; [`CredentialBroker::from_config`] wires
//! the production backends from the result.

pub mod broker;
pub mod config;
pub mod error;
pub mod health;

pub use broker::{BrokerHandles, BrokerTuning, CredentialBroker, IssuedCredential, RevokeAck};
pub use config::{load_config, load_config_with_file, BrokerConfig, ConfigError};
pub use error::{InitError, ProvisionError};
pub use health::HealthReport;
