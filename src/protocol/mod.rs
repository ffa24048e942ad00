//! Framed transport: codec, envelope, crypto and typed message helpers

pub mod compress;
pub mod crypto;
pub mod frame;
pub mod messages;
pub mod transfer;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;

pub use crypto::FrameCipher;
pub use frame::FrameCodec;
pub use messages::*;
pub use transfer::{recv_ack, recv_file_body, send_file};

/// Send a command with a JSON payload
pub async fn send_json<W, T>(
	codec: &FrameCodec,
	writer: &mut W,
	cmd: Command,
	payload: &T,
) -> Result<(), ProtocolError>
where
	W: AsyncWrite + Unpin,
	T: Serialize,
{
	let data = serde_json::to_vec(payload)?;
	codec.send(writer, cmd.token(), &data).await
}

/// Send a command with no payload
pub async fn send_empty<W>(
	codec: &FrameCodec,
	writer: &mut W,
	cmd: Command,
) -> Result<(), ProtocolError>
where
	W: AsyncWrite + Unpin,
{
	codec.send(writer, cmd.token(), b"").await
}

/// Send a command with a raw binary payload (`FILE_CHUNK`)
pub async fn send_raw<W>(
	codec: &FrameCodec,
	writer: &mut W,
	cmd: Command,
	data: &[u8],
) -> Result<(), ProtocolError>
where
	W: AsyncWrite + Unpin,
{
	codec.send(writer, cmd.token(), data).await
}

/// Send an `ERROR` frame; failures are ignored since the connection is
/// usually going away
pub async fn send_error<W>(codec: &FrameCodec, writer: &mut W, message: &str)
where
	W: AsyncWrite + Unpin,
{
	let payload = ErrorPayload { message: message.to_string() };
	let _ = send_json(codec, writer, Command::Error, &payload).await;
}

/// Receive one frame and parse its command token
pub async fn recv<R>(codec: &FrameCodec, reader: &mut R) -> Result<(Command, Vec<u8>), ProtocolError>
where
	R: AsyncRead + Unpin,
{
	let (token, data) = codec.recv(reader).await?;
	Ok((Command::parse(&token)?, data))
}

/// Receive one frame, bounded by the session idle timeout
pub async fn recv_timeout<R>(
	codec: &FrameCodec,
	reader: &mut R,
	timeout: Duration,
) -> Result<(Command, Vec<u8>), ProtocolError>
where
	R: AsyncRead + Unpin,
{
	match tokio::time::timeout(timeout, recv(codec, reader)).await {
		Ok(result) => result,
		Err(_) => Err(ProtocolError::Timeout),
	}
}

/// Parse a JSON payload
pub fn parse_json<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
	Ok(serde_json::from_slice(data)?)
}

// vim: ts=4
