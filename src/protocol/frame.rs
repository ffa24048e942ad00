//! Length-prefixed frame codec
//!
//! Wire layout, integers big-endian:
//!
//! ```text
//! +----------+----------+-----------+-------------+
//! | cmd_len  | data_len |   cmd     |    data     |
//! | uint32   | uint32   | ASCII     | opaque      |
//! +----------+----------+-----------+-------------+
//! ```
//!
//! `data` always carries the compression envelope; when a cipher is
//! configured, `cmd` and `data` are sealed independently after enveloping.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::compress;
use super::crypto::FrameCipher;
use crate::error::ProtocolError;

/// Upper bound for one frame's data section
pub const MAX_FRAME_DATA: usize = 64 * 1024 * 1024;

/// Upper bound for the command token (sealed tokens included)
pub const MAX_FRAME_CMD: usize = 256;

/// Frame encoder/decoder with the connection's compression and encryption
/// settings
#[derive(Debug, Clone)]
pub struct FrameCodec {
	cipher: Option<FrameCipher>,
	compress: bool,
}

impl FrameCodec {
	pub fn new(cipher: Option<FrameCipher>, compress: bool) -> FrameCodec {
		FrameCodec { cipher, compress }
	}

	pub fn plaintext() -> FrameCodec {
		FrameCodec { cipher: None, compress: false }
	}

	/// Write one frame
	pub async fn send<W>(&self, writer: &mut W, cmd: &str, data: &[u8]) -> Result<(), ProtocolError>
	where
		W: AsyncWrite + Unpin,
	{
		let data = compress::encode(data, self.compress)?;
		let (cmd_bytes, data_bytes) = match &self.cipher {
			Some(cipher) => (cipher.seal(cmd.as_bytes())?, cipher.seal(&data)?),
			None => (cmd.as_bytes().to_vec(), data),
		};

		if cmd_bytes.len() > MAX_FRAME_CMD {
			return Err(ProtocolError::FrameTooLarge { len: cmd_bytes.len(), max: MAX_FRAME_CMD });
		}
		if data_bytes.len() > MAX_FRAME_DATA {
			return Err(ProtocolError::FrameTooLarge {
				len: data_bytes.len(),
				max: MAX_FRAME_DATA,
			});
		}

		writer.write_u32(cmd_bytes.len() as u32).await?;
		writer.write_u32(data_bytes.len() as u32).await?;
		writer.write_all(&cmd_bytes).await?;
		writer.write_all(&data_bytes).await?;
		writer.flush().await?;
		Ok(())
	}

	/// Read one frame, returning the command token and the unwrapped payload
	pub async fn recv<R>(&self, reader: &mut R) -> Result<(String, Vec<u8>), ProtocolError>
	where
		R: AsyncRead + Unpin,
	{
		let cmd_len = reader.read_u32().await? as usize;
		let data_len = reader.read_u32().await? as usize;

		if cmd_len == 0 || cmd_len > MAX_FRAME_CMD {
			return Err(ProtocolError::FrameTooLarge { len: cmd_len, max: MAX_FRAME_CMD });
		}
		if data_len > MAX_FRAME_DATA {
			return Err(ProtocolError::FrameTooLarge { len: data_len, max: MAX_FRAME_DATA });
		}

		let mut cmd_bytes = vec![0u8; cmd_len];
		reader.read_exact(&mut cmd_bytes).await?;
		let mut data_bytes = vec![0u8; data_len];
		reader.read_exact(&mut data_bytes).await?;

		let (cmd_bytes, data_bytes) = match &self.cipher {
			Some(cipher) => (cipher.open(&cmd_bytes)?, cipher.open(&data_bytes)?),
			None => (cmd_bytes, data_bytes),
		};

		let cmd = String::from_utf8(cmd_bytes)
			.map_err(|_| ProtocolError::Decode { message: "command not UTF-8".to_string() })?;
		let data = compress::decode(&data_bytes)?;
		Ok((cmd, data))
	}
}


// vim: ts=4
