use std::io;

/// Errors from link operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
	/// IO error on the underlying socket.
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	/// Failed to serialize an outgoing message.
	#[error("encode error: {0}")]
	Encode(#[source] serde_json::Error),
	/// Failed to deserialize an incoming frame.
	#[error("decode error: {0}")]
	Decode(#[source] serde_json::Error),
}
