//! The relay side of teed mode.
//!
//! Runs inside the terminal window. It launches the real program, echoes its
//! output both to the terminal and back to the supervisor, and feeds the
//! program's stdin from two sources: the operator's keyboard and the
//! supervisor's pipe.

use nix::fcntl::{fcntl, FcntlArg};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;

use crate::spawn::{self, BoxWriter, SpawnError};

/// Env var holding the read end of the supervisor-to-relay pipe.
pub const P2CR: &str = "p2cr";
/// Env var holding the write end of the relay-to-supervisor pipe.
pub const C2PW: &str = "c2pw";
/// Env var holding the application name.
pub const PROC_NAME: &str = "proc_name";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
	#[error("missing or invalid pipe descriptor in ${0}")]
	MissingPipe(&'static str),
	#[error(transparent)]
	Spawn(#[from] SpawnError),
	#[error(transparent)]
	Io(#[from] io::Error),
}

fn inherited_fd(var: &'static str) -> Result<OwnedFd, RelayError> {
	let raw: RawFd = std::env::var(var)
		.ok()
		.and_then(|v| v.trim().parse().ok())
		.ok_or(RelayError::MissingPipe(var))?;
	if raw < 0 || fcntl(raw, FcntlArg::F_GETFD).is_err() {
		return Err(RelayError::MissingPipe(var));
	}
	// Safety: the supervisor created this descriptor for us and passed its
	// number through the environment; nothing else in this process owns it.
	let fd = unsafe { OwnedFd::from_raw_fd(raw) };
	spawn::set_cloexec(&fd, true)?;
	Ok(fd)
}

/// Run `argv` under the relay. Returns the program's exit code.
pub async fn run_relay(argv: Vec<String>) -> Result<i32, RelayError> {
	let from_parent = pipe::Receiver::from_owned_fd(inherited_fd(P2CR)?)?;
	let mut to_parent = pipe::Sender::from_owned_fd(inherited_fd(C2PW)?)?;
	let name = std::env::var(PROC_NAME).unwrap_or_default();

	let spawned = spawn::spawn_direct(&argv)?;
	let mut child = spawned.child;
	let input: Arc<Mutex<Option<BoxWriter>>> = Arc::new(Mutex::new(Some(spawned.input)));
	tracing::info!("relaying {} (pid {:?})", name, child.id());

	let console = tokio::spawn(forward_input(tokio::io::stdin(), Arc::clone(&input)));
	let parent = forward_input(from_parent, Arc::clone(&input));
	let output = async move {
		let mut reader = BufReader::new(spawned.output);
		let mut stdout = tokio::io::stdout();
		let mut line = Vec::new();
		loop {
			line.clear();
			match reader.read_until(b'\n', &mut line).await {
				Ok(0) => break,
				Ok(_) => {
					let _ = stdout.write_all(&line).await;
					let _ = stdout.flush().await;
					if to_parent.write_all(&line).await.is_err() {
						tracing::warn!("supervisor pipe closed");
						break;
					}
				}
				Err(e) => {
					tracing::warn!("reading program output failed: {}", e);
					break;
				}
			}
		}
	};

	// keyboard EOF only ends the console forwarder
	tokio::select! {
		_ = output => {}
		_ = parent => tracing::info!("supervisor went away"),
	}
	console.abort();
	input.lock().await.take();

	let status = child.wait().await?;
	Ok(status.code().unwrap_or(1))
}

async fn forward_input<R>(source: R, input: Arc<Mutex<Option<BoxWriter>>>)
where
	R: AsyncRead + Unpin,
{
	let mut reader = BufReader::new(source);
	let mut line = Vec::new();
	loop {
		line.clear();
		match reader.read_until(b'\n', &mut line).await {
			Ok(0) | Err(_) => return,
			Ok(_) => {
				let mut guard = input.lock().await;
				let Some(writer) = guard.as_mut() else {
					return;
				};
				if writer.write_all(&line).await.is_err() || writer.flush().await.is_err() {
					return;
				}
			}
		}
	}
}
