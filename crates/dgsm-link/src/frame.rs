//! Separator-delimited JSON frames.
//!
//! A frame is a serialized message followed by [`SEPARATOR`]. There is no length
//! prefix and no escaping: serde_json writes control characters below U+0020 as
//! `\u00XX` escapes inside strings and never emits them between tokens, so the
//! separator bytes cannot occur inside an encoded message.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::LinkError;

pub const SEPARATOR: [u8; 2] = [0x17, 0x04];

pub fn encode<M: Serialize>(msg: &M) -> Result<Vec<u8>, LinkError> {
	let mut data = serde_json::to_vec(msg).map_err(LinkError::Encode)?;
	data.extend_from_slice(&SEPARATOR);
	Ok(data)
}

pub fn decode<M: DeserializeOwned>(frame: &[u8]) -> Result<M, LinkError> {
	serde_json::from_slice(frame).map_err(LinkError::Decode)
}

/// Read the next frame body with the separator stripped.
///
/// Returns `Ok(None)` once the peer closes the stream. A trailing partial frame
/// with no separator is discarded.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
	R: AsyncBufRead + Unpin,
{
	let mut frame = Vec::new();
	loop {
		let n = reader.read_until(SEPARATOR[1], &mut frame).await?;
		if n == 0 {
			if !frame.is_empty() {
				tracing::debug!("discarding {} bytes of unterminated frame", frame.len());
			}
			return Ok(None);
		}
		if frame.ends_with(&SEPARATOR) {
			frame.truncate(frame.len() - SEPARATOR.len());
			return Ok(Some(frame));
		}
	}
}

/// Write one message as a single frame.
pub async fn write_frame<W, M>(writer: &mut W, msg: &M) -> Result<(), LinkError>
where
	W: AsyncWrite + Unpin,
	M: Serialize,
{
	let data = encode(msg)?;
	writer.write_all(&data).await?;
	writer.flush().await?;
	Ok(())
}
