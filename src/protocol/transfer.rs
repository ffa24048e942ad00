//! File transfer helpers shared by both ends of a session
//!
//! Small files (≤ 1 MiB) travel as one `FILE_DATA` frame with the content
//! embedded as base64. Larger files announce a chunk count in the header and
//! stream that many `FILE_CHUNK` frames; the receiver concatenates, verifies
//! total size and recomputed MD5, and discards the file on mismatch.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::FrameCodec;
use super::messages::{Command, ErrorPayload, FileDataPayload, SMALL_FILE_LIMIT};
use super::{parse_json, recv_timeout, send_json, send_raw};
use crate::error::{ProtocolError, TransferError};
use crate::state::FileEntry;

/// Send one file from `root` as described by its state entry.
///
/// Exactly `entry.size` bytes are sent; a file that shrank on disk since the
/// state was taken surfaces as an I/O error rather than a short stream.
pub async fn send_file<W>(
	codec: &FrameCodec,
	writer: &mut W,
	root: &Path,
	entry: &FileEntry,
	chunk_size: usize,
) -> Result<(), ProtocolError>
where
	W: AsyncWrite + Unpin,
{
	let full = root.join(&entry.path);

	if entry.size <= SMALL_FILE_LIMIT {
		let bytes = tokio::fs::read(&full).await?;
		let payload = FileDataPayload {
			path: entry.path.clone(),
			size: entry.size,
			hash: entry.hash.clone(),
			version: entry.version,
			modified: entry.modified,
			chunks: 0,
			body: Some(STANDARD.encode(&bytes)),
		};
		return send_json(codec, writer, Command::FileData, &payload).await;
	}

	let chunk_size = chunk_size.max(1);
	let chunks = entry.size.div_ceil(chunk_size as u64) as u32;
	let header = FileDataPayload {
		path: entry.path.clone(),
		size: entry.size,
		hash: entry.hash.clone(),
		version: entry.version,
		modified: entry.modified,
		chunks,
		body: None,
	};
	send_json(codec, writer, Command::FileData, &header).await?;

	let mut file = tokio::fs::File::open(&full).await?;
	let mut buf = vec![0u8; chunk_size];
	let mut remaining = entry.size;
	while remaining > 0 {
		let take = remaining.min(chunk_size as u64) as usize;
		file.read_exact(&mut buf[..take]).await?;
		send_raw(codec, writer, Command::FileChunk, &buf[..take]).await?;
		remaining -= take as u64;
	}

	Ok(())
}

/// Receive the body announced by a `FILE_DATA` header into `tmp_path`.
///
/// The outer error aborts the session; the inner one marks a discarded
/// transfer the session survives. On mismatch the temp file is removed.
pub async fn recv_file_body<R>(
	codec: &FrameCodec,
	reader: &mut R,
	header: &FileDataPayload,
	tmp_path: &Path,
	timeout: Duration,
) -> Result<Result<(), TransferError>, ProtocolError>
where
	R: AsyncRead + Unpin,
{
	let mut md5_ctx = md5::Context::new();
	let mut received: u64 = 0;
	let mut file = tokio::fs::File::create(tmp_path).await?;

	if header.chunks == 0 {
		let body = header.body.as_deref().unwrap_or("");
		let bytes = STANDARD
			.decode(body)
			.map_err(|e| ProtocolError::Decode { message: format!("file body base64: {}", e) })?;
		md5_ctx.consume(&bytes);
		received = bytes.len() as u64;
		file.write_all(&bytes).await?;
	} else {
		for _ in 0..header.chunks {
			let (cmd, data) = recv_timeout(codec, reader, timeout).await?;
			if cmd != Command::FileChunk {
				return Err(ProtocolError::UnexpectedCommand {
					expected: "FILE_CHUNK",
					got: cmd.token().to_string(),
				});
			}
			md5_ctx.consume(&data);
			received += data.len() as u64;
			file.write_all(&data).await?;
		}
	}

	file.flush().await?;
	drop(file);

	if received != header.size {
		let _ = tokio::fs::remove_file(tmp_path).await;
		return Ok(Err(TransferError::SizeMismatch {
			path: header.path.clone(),
			expected: header.size,
			actual: received,
		}));
	}

	let hash = format!("{:x}", md5_ctx.compute());
	if hash != header.hash {
		let _ = tokio::fs::remove_file(tmp_path).await;
		return Ok(Err(TransferError::HashMismatch {
			path: header.path.clone(),
			expected: header.hash.clone(),
			actual: hash,
		}));
	}

	Ok(Ok(()))
}

/// Receive the per-transfer acknowledgement: `Ok(Ok(()))` on `OK`,
/// `Ok(Err(message))` on a peer `ERROR` for that transfer only
pub async fn recv_ack<R>(
	codec: &FrameCodec,
	reader: &mut R,
	timeout: Duration,
) -> Result<Result<(), String>, ProtocolError>
where
	R: AsyncRead + Unpin,
{
	let (cmd, data) = recv_timeout(codec, reader, timeout).await?;
	match cmd {
		Command::Ok => Ok(Ok(())),
		Command::Error => {
			let payload: ErrorPayload = parse_json(&data)?;
			Ok(Err(payload.message))
		}
		other => Err(ProtocolError::UnexpectedCommand {
			expected: "OK or ERROR",
			got: other.token().to_string(),
		}),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::state::FileStatus;
	use crate::util;

	fn entry_for(path: &str, bytes: &[u8]) -> FileEntry {
		FileEntry {
			path: path.to_string(),
			hash: util::md5_hex(bytes),
			size: bytes.len() as u64,
			modified: 1000,
			version: 1,
			status: FileStatus::Active,
			deleted_at: None,
		}
	}

	#[tokio::test]
	async fn test_small_file_round_trip() {
		let src = tempfile::tempdir().unwrap();
		let dst = tempfile::tempdir().unwrap();
		tokio::fs::write(src.path().join("a.txt"), b"hello").await.unwrap();
		let entry = entry_for("a.txt", b"hello");

		let codec = FrameCodec::plaintext();
		let (mut tx, mut rx) = tokio::io::duplex(1024 * 1024);
		send_file(&codec, &mut tx, src.path(), &entry, 65536).await.unwrap();

		let (cmd, data) = recv_timeout(&codec, &mut rx, Duration::from_secs(5)).await.unwrap();
		assert_eq!(cmd, Command::FileData);
		let header: FileDataPayload = parse_json(&data).unwrap();
		assert_eq!(header.chunks, 0);

		let tmp = dst.path().join("a.txt.sync-tmp");
		let result = recv_file_body(&codec, &mut rx, &header, &tmp, Duration::from_secs(5))
			.await
			.unwrap();
		assert!(result.is_ok());
		assert_eq!(tokio::fs::read(&tmp).await.unwrap(), b"hello");
	}

	#[tokio::test]
	async fn test_large_file_streams_in_chunks() {
		let src = tempfile::tempdir().unwrap();
		let dst = tempfile::tempdir().unwrap();
		// Just over the whole-file limit, odd size so the tail chunk is short
		let content: Vec<u8> = (0..SMALL_FILE_LIMIT + 100_001).map(|i| (i % 251) as u8).collect();
		tokio::fs::write(src.path().join("big.bin"), &content).await.unwrap();
		let entry = entry_for("big.bin", &content);

		let codec = FrameCodec::plaintext();
		let (mut tx, mut rx) = tokio::io::duplex(8 * 1024 * 1024);
		let chunk_size = 65536;

		let sender = {
			let codec = codec.clone();
			let root = src.path().to_path_buf();
			let entry = entry.clone();
			tokio::spawn(async move { send_file(&codec, &mut tx, &root, &entry, chunk_size).await })
		};

		let (cmd, data) = recv_timeout(&codec, &mut rx, Duration::from_secs(5)).await.unwrap();
		assert_eq!(cmd, Command::FileData);
		let header: FileDataPayload = parse_json(&data).unwrap();
		assert_eq!(header.chunks as u64, entry.size.div_ceil(chunk_size as u64));
		assert!(header.body.is_none());

		let tmp = dst.path().join("big.bin.sync-tmp");
		let result = recv_file_body(&codec, &mut rx, &header, &tmp, Duration::from_secs(5))
			.await
			.unwrap();
		assert!(result.is_ok());
		sender.await.unwrap().unwrap();
		assert_eq!(tokio::fs::read(&tmp).await.unwrap(), content);
	}

	#[tokio::test]
	async fn test_corrupt_body_discarded() {
		let dst = tempfile::tempdir().unwrap();
		let codec = FrameCodec::plaintext();
		let (_tx, mut rx) = tokio::io::duplex(1024);

		let header = FileDataPayload {
			path: "a.txt".to_string(),
			size: 5,
			hash: "0000000000000000000000000000000".to_string(),
			version: 1,
			modified: 0,
			chunks: 0,
			body: Some(STANDARD.encode(b"hello")),
		};
		let tmp = dst.path().join("a.txt.sync-tmp");
		let result = recv_file_body(&codec, &mut rx, &header, &tmp, Duration::from_secs(5))
			.await
			.unwrap();
		assert!(matches!(result, Err(TransferError::HashMismatch { .. })));
		assert!(!tmp.exists());
	}
}

// vim: ts=4
