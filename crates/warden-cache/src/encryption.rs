// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Authenticated encryption for cached secret values.
//!
//! Cached credentials are sealed with AES-256-GCM under a single
//! process-wide key derived from the configured cache secret. The key
//! never leaves this module and is zeroized on drop.

use aes_gcm::{
	aead::{Aead, KeyInit, OsRng},
	Aes256Gcm, Key, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use warden_core::SecretString;
use zeroize::Zeroizing;

use crate::error::{CacheError, Result};

/// Size of the encryption key in bytes (256 bits for AES-256).
pub const KEY_SIZE: usize = 32;

/// Size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Domain-separation tag for key derivation. Changing it invalidates
/// every existing cache entry, which reads then treat as corrupt.
const KEY_DOMAIN_TAG: &[u8] = b"warden/cache-encryption/v1";

/// An encrypted value with the nonce it was sealed under.
#[derive(Debug, Clone)]
pub struct SealedSecret {
	pub ciphertext: Vec<u8>,
	pub nonce: [u8; NONCE_SIZE],
}

/// Generate a random nonce.
///
/// 96-bit random nonces from OsRng. The same (key, nonce) pair must
/// never be reused; random nonces are safe for the cache's write
/// volumes (collision probability becomes a concern only after about
/// 2^32 writes under one key).
fn generate_nonce() -> [u8; NONCE_SIZE] {
	let mut nonce = [0u8; NONCE_SIZE];
	OsRng.fill_bytes(&mut nonce);
	nonce
}

/// The cache's sealing key plus the seal/open operations.
pub struct CacheCipher {
	key: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for CacheCipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("CacheCipher([REDACTED])")
	}
}

impl CacheCipher {
	/// Derive the sealing key from the configured cache secret via
	/// HMAC-SHA-256 with a fixed domain tag. Deterministic, so every
	/// broker process sharing the secret can read the same cache.
	pub fn from_secret(secret: &SecretString) -> Result<Self> {
		if secret.expose().is_empty() {
			return Err(CacheError::InvalidKey("encryption secret must not be empty".to_string()));
		}
		let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(KEY_DOMAIN_TAG)
			.map_err(|e| CacheError::InvalidKey(format!("key derivation: {e}")))?;
		mac.update(secret.expose().as_bytes());
		let digest = mac.finalize().into_bytes();

		let mut key = Zeroizing::new([0u8; KEY_SIZE]);
		key.copy_from_slice(&digest);
		Ok(Self { key })
	}

	/// Build a cipher from raw key bytes. Test seam.
	pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
		Self { key: Zeroizing::new(key) }
	}

	/// Seal a plaintext under a fresh random nonce.
	pub fn seal(&self, plaintext: &[u8]) -> Result<SealedSecret> {
		let key = Key::<Aes256Gcm>::from_slice(self.key.as_ref());
		let cipher = Aes256Gcm::new(key);

		let nonce_bytes = generate_nonce();
		let nonce = Nonce::from_slice(&nonce_bytes);

		let ciphertext = cipher
			.encrypt(nonce, plaintext)
			.map_err(|e| CacheError::Encryption(format!("seal failed: {e}")))?;

		Ok(SealedSecret { ciphertext, nonce: nonce_bytes })
	}

	/// Open a sealed value, authenticating it in the process.
	pub fn open(&self, sealed: &SealedSecret) -> Result<Zeroizing<Vec<u8>>> {
		let key = Key::<Aes256Gcm>::from_slice(self.key.as_ref());
		let cipher = Aes256Gcm::new(key);
		let nonce = Nonce::from_slice(&sealed.nonce);

		let plaintext = cipher
			.decrypt(nonce, sealed.ciphertext.as_slice())
			.map_err(|e| CacheError::Corrupt(format!("open failed: {e}")))?;

		Ok(Zeroizing::new(plaintext))
	}
}
