//! Self-describing payload envelope with optional zlib compression
//!
//! Every frame payload travels as `{"compressed": bool, "data": <base64>}`.
//! The receiver needs no out-of-band mode agreement: the flag says whether
//! the body was deflated. Compression is applied before encryption.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::ProtocolError;

/// Payloads at or below this size are never deflated
pub const COMPRESS_THRESHOLD: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
	compressed: bool,
	data: String,
}

/// Wrap a payload for the wire
pub fn encode(payload: &[u8], compress: bool) -> Result<Vec<u8>, ProtocolError> {
	let (compressed, body) = if compress && payload.len() > COMPRESS_THRESHOLD {
		let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
		encoder.write_all(payload)?;
		(true, encoder.finish()?)
	} else {
		(false, payload.to_vec())
	};

	let envelope = Envelope { compressed, data: STANDARD.encode(body) };
	Ok(serde_json::to_vec(&envelope)?)
}

/// Unwrap a received payload, inflating when flagged
pub fn decode(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
	let envelope: Envelope = serde_json::from_slice(data)?;
	let body = STANDARD
		.decode(envelope.data.as_bytes())
		.map_err(|e| ProtocolError::Decode { message: format!("envelope base64: {}", e) })?;

	if !envelope.compressed {
		return Ok(body);
	}

	let mut decoder = ZlibDecoder::new(body.as_slice());
	let mut out = Vec::new();
	decoder
		.read_to_end(&mut out)
		.map_err(|e| ProtocolError::Decode { message: format!("zlib inflate: {}", e) })?;
	Ok(out)
}


// vim: ts=4
