//! Authenticated frame encryption
//!
//! Command and data of every frame are sealed independently with
//! AES-256-GCM under the shared key. A sealed token is the URL-safe base64
//! of `nonce || ciphertext`, written to the wire as bytes. A failed
//! authentication tag terminates the connection with no retry.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use rand::RngCore;

use crate::error::ProtocolError;

const NONCE_LEN: usize = 12;

/// Symmetric cipher shared by both peers of a connection
#[derive(Clone)]
pub struct FrameCipher {
	cipher: Aes256Gcm,
}

impl FrameCipher {
	pub fn new(key: &[u8; 32]) -> FrameCipher {
		FrameCipher { cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)) }
	}

	/// Seal a plaintext into a wire token
	pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, ProtocolError> {
		let mut nonce_bytes = [0u8; NONCE_LEN];
		rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
		let nonce = Nonce::from_slice(&nonce_bytes);

		let ciphertext =
			self.cipher.encrypt(nonce, plain).map_err(|_| ProtocolError::AuthFailed)?;

		let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
		token.extend_from_slice(&nonce_bytes);
		token.extend_from_slice(&ciphertext);
		Ok(URL_SAFE.encode(token).into_bytes())
	}

	/// Open a wire token back into plaintext
	pub fn open(&self, token: &[u8]) -> Result<Vec<u8>, ProtocolError> {
		let raw = URL_SAFE
			.decode(token)
			.map_err(|e| ProtocolError::Decode { message: format!("sealed token base64: {}", e) })?;
		if raw.len() < NONCE_LEN {
			return Err(ProtocolError::Decode { message: "sealed token too short".to_string() });
		}

		let nonce = Nonce::from_slice(&raw[..NONCE_LEN]);
		self.cipher.decrypt(nonce, &raw[NONCE_LEN..]).map_err(|_| ProtocolError::AuthFailed)
	}
}

impl std::fmt::Debug for FrameCipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FrameCipher").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_key() -> [u8; 32] {
		let mut key = [0u8; 32];
		for (i, b) in key.iter_mut().enumerate() {
			*b = i as u8;
		}
		key
	}

	#[test]
	fn test_seal_open_round_trip() {
		let cipher = FrameCipher::new(&test_key());
		let token = cipher.seal(b"HELLO").unwrap();
		assert_eq!(cipher.open(&token).unwrap(), b"HELLO");
	}

	#[test]
	fn test_tokens_differ_per_seal() {
		let cipher = FrameCipher::new(&test_key());
		let a = cipher.seal(b"same").unwrap();
		let b = cipher.seal(b"same").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn test_wrong_key_fails_auth() {
		let cipher = FrameCipher::new(&test_key());
		let mut other_key = test_key();
		other_key[0] ^= 0xff;
		let other = FrameCipher::new(&other_key);

		let token = cipher.seal(b"secret").unwrap();
		assert!(matches!(other.open(&token), Err(ProtocolError::AuthFailed)));
	}

	#[test]
	fn test_tampered_token_fails_auth() {
		let cipher = FrameCipher::new(&test_key());
		let token = cipher.seal(b"secret").unwrap();
		let mut raw = URL_SAFE.decode(&token).unwrap();
		let last = raw.len() - 1;
		raw[last] ^= 0x01;
		let tampered = URL_SAFE.encode(raw).into_bytes();
		assert!(matches!(cipher.open(&tampered), Err(ProtocolError::AuthFailed)));
	}

	#[test]
	fn test_truncated_token_rejected() {
		let cipher = FrameCipher::new(&test_key());
		assert!(cipher.open(b"AAAA").is_err());
	}
}

// vim: ts=4
