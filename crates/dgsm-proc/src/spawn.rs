//! Launching supervised processes.
//!
//! Direct mode pipes stdin and merges stdout and stderr into one stream. Teed
//! mode starts the program under the `dgsm-tee` relay inside a terminal window,
//! so an operator can watch and type into it while the supervisor keeps its own
//! input and output channel through two inherited pipes. Teed mode needs a unix
//! host; on Windows only direct mode is available.

#[cfg(unix)]
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use serde::{Deserialize, Serialize};
use std::io;
#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
#[cfg(unix)]
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

#[cfg(unix)]
use crate::tee;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const RELAY_BIN: &str = "dgsm-tee";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
	#[error("executable not found: {0}")]
	NotFound(String),
	#[error("no program given")]
	Empty,
	#[error("not supported on this platform: {0}")]
	Unsupported(&'static str),
	#[error("spawn failed: {0}")]
	Io(#[from] io::Error),
}

/// How teed processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeeConfig {
	/// Terminal launcher argv; `{name}` is replaced by the application name and
	/// the relay command line is appended.
	pub terminal: Vec<String>,
	/// Relay executable. Defaults to `dgsm-tee` next to the running binary.
	pub relay: Option<PathBuf>,
}

impl Default for TeeConfig {
	fn default() -> Self {
		Self {
			terminal: vec!["xterm".into(), "-T".into(), "{name}".into(), "-e".into()],
			relay: None,
		}
	}
}

impl TeeConfig {
	#[cfg_attr(not(unix), allow(dead_code))]
	fn relay_path(&self) -> Result<PathBuf, SpawnError> {
		if let Some(relay) = &self.relay {
			return Ok(relay.clone());
		}
		let exe = std::env::current_exe()?;
		let dir = exe.parent().unwrap_or_else(|| Path::new("."));
		Ok(dir.join(RELAY_BIN))
	}
}

pub enum Mode<'a> {
	Direct,
	Teed { name: &'a str, tee: &'a TeeConfig },
}

/// A freshly launched process with its I/O channels.
pub struct Spawned {
	pub child: Child,
	pub output: BoxReader,
	pub input: BoxWriter,
}

pub fn spawn(argv: &[String], mode: Mode<'_>) -> Result<Spawned, SpawnError> {
	match mode {
		Mode::Direct => spawn_direct(argv),
		Mode::Teed { name, tee } => spawn_teed(argv, name, tee),
	}
}

#[cfg(unix)]
pub fn spawn_direct(argv: &[String]) -> Result<Spawned, SpawnError> {
	let (program, args) = argv.split_first().ok_or(SpawnError::Empty)?;
	let (read, write) = cloexec_pipe()?;
	let stderr = write.try_clone()?;

	let mut cmd = Command::new(program);
	cmd.args(args)
		.stdin(Stdio::piped())
		.stdout(Stdio::from(write))
		.stderr(Stdio::from(stderr))
		.process_group(0);

	let mut child = cmd.spawn().map_err(|e| not_found(program, e))?;
	// the write ends live in `cmd`; drop it so EOF arrives when the child exits
	drop(cmd);

	let input = child
		.stdin
		.take()
		.ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdin missing"))?;
	let output = pipe::Receiver::from_owned_fd(read)?;
	tracing::debug!("spawned {} as pid {:?}", program, child.id());

	Ok(Spawned {
		child,
		output: Box::new(output),
		input: Box::new(input),
	})
}

/// Stdout and stderr are read separately and merged a line at a time.
#[cfg(windows)]
pub fn spawn_direct(argv: &[String]) -> Result<Spawned, SpawnError> {
	use std::sync::Arc;
	use tokio::sync::Mutex;

	const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
	let (program, args) = argv.split_first().ok_or(SpawnError::Empty)?;

	let mut cmd = Command::new(program);
	cmd.args(args)
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.stderr(Stdio::piped())
		.creation_flags(CREATE_NEW_PROCESS_GROUP);
	let mut child = cmd.spawn().map_err(|e| not_found(program, e))?;

	let missing = |what: &str| io::Error::new(io::ErrorKind::BrokenPipe, format!("child {} missing", what));
	let input = child.stdin.take().ok_or_else(|| missing("stdin"))?;
	let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
	let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

	// the reader sees EOF once both forwarders drop their handle
	let (merged, output) = tokio::io::duplex(64 * 1024);
	let merged = Arc::new(Mutex::new(merged));
	tokio::spawn(forward_lines(stdout, Arc::clone(&merged)));
	tokio::spawn(forward_lines(stderr, merged));
	tracing::debug!("spawned {} as pid {:?}", program, child.id());

	Ok(Spawned {
		child,
		output: Box::new(output),
		input: Box::new(input),
	})
}

#[cfg(windows)]
async fn forward_lines<R: AsyncRead + Unpin>(
	from: R,
	to: std::sync::Arc<tokio::sync::Mutex<tokio::io::DuplexStream>>,
) {
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

	let mut reader = BufReader::new(from);
	let mut line = Vec::new();
	loop {
		line.clear();
		match reader.read_until(b'\n', &mut line).await {
			Ok(0) | Err(_) => return,
			Ok(_) => {
				if to.lock().await.write_all(&line).await.is_err() {
					return;
				}
			}
		}
	}
}

#[cfg(not(unix))]
fn spawn_teed(_argv: &[String], _name: &str, _tee: &TeeConfig) -> Result<Spawned, SpawnError> {
	Err(SpawnError::Unsupported("new_console needs a unix host"))
}

#[cfg(unix)]
fn spawn_teed(argv: &[String], name: &str, tee: &TeeConfig) -> Result<Spawned, SpawnError> {
	let program = argv.first().ok_or(SpawnError::Empty)?;
	if locate(program).is_none() {
		return Err(SpawnError::NotFound(program.clone()));
	}
	let relay = tee.relay_path()?;
	if !relay.is_file() {
		return Err(SpawnError::NotFound(relay.display().to_string()));
	}

	let (p2c_read, p2c_write) = cloexec_pipe()?;
	let (c2p_read, c2p_write) = cloexec_pipe()?;
	set_cloexec(&p2c_read, false)?;
	set_cloexec(&c2p_write, false)?;

	let mut launch: Vec<String> = tee
		.terminal
		.iter()
		.map(|arg| arg.replace("{name}", name))
		.collect();
	launch.push(relay.display().to_string());
	launch.extend(argv.iter().cloned());
	let (launcher, rest) = launch.split_first().ok_or(SpawnError::Empty)?;

	let mut cmd = Command::new(launcher);
	cmd.args(rest)
		.env(tee::P2CR, p2c_read.as_raw_fd().to_string())
		.env(tee::C2PW, c2p_write.as_raw_fd().to_string())
		.env(tee::PROC_NAME, name)
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.process_group(0);

	let child = cmd.spawn().map_err(|e| not_found(launcher, e))?;
	// the relay holds its own copies now
	drop(p2c_read);
	drop(c2p_write);

	let output = pipe::Receiver::from_owned_fd(c2p_read)?;
	let input = pipe::Sender::from_owned_fd(p2c_write)?;
	tracing::debug!("launched {} in a terminal via {:?}", name, launcher);

	Ok(Spawned {
		child,
		output: Box::new(output),
		input: Box::new(input),
	})
}

fn not_found(program: &str, e: io::Error) -> SpawnError {
	if e.kind() == io::ErrorKind::NotFound {
		SpawnError::NotFound(program.to_string())
	} else {
		SpawnError::Io(e)
	}
}

/// Resolve a program name the way `execvp` would.
#[cfg(unix)]
pub fn locate(program: &str) -> Option<PathBuf> {
	if program.contains('/') {
		let path = PathBuf::from(program);
		return path.is_file().then_some(path);
	}
	let paths = std::env::var_os("PATH")?;
	std::env::split_paths(&paths)
		.map(|dir| dir.join(program))
		.find(|candidate| candidate.is_file())
}

#[cfg(unix)]
pub(crate) fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
	let (read, write) = nix::unistd::pipe()?;
	set_cloexec(&read, true)?;
	set_cloexec(&write, true)?;
	Ok((read, write))
}

#[cfg(unix)]
pub(crate) fn set_cloexec(fd: &impl AsRawFd, on: bool) -> io::Result<()> {
	let flags = if on {
		FdFlag::FD_CLOEXEC
	} else {
		FdFlag::empty()
	};
	fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(flags))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

	fn argv(parts: &[&str]) -> Vec<String> {
		parts.iter().map(|s| s.to_string()).collect()
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn direct_merges_stdout_and_stderr() {
		let mut spawned =
			spawn_direct(&argv(&["sh", "-c", "echo out; echo err >&2"])).unwrap();
		let mut lines = BufReader::new(spawned.output).lines();
		let mut got = Vec::new();
		while let Some(line) = lines.next_line().await.unwrap() {
			got.push(line);
		}
		got.sort();
		assert_eq!(got, vec!["err", "out"]);
		assert!(spawned.child.wait().await.unwrap().success());
	}

	#[cfg(windows)]
	#[tokio::test]
	async fn direct_merges_stdout_and_stderr() {
		let mut spawned =
			spawn_direct(&argv(&["cmd", "/C", "echo out& echo err 1>&2"])).unwrap();
		let mut lines = BufReader::new(spawned.output).lines();
		let mut got = Vec::new();
		while let Some(line) = lines.next_line().await.unwrap() {
			got.push(line.trim().to_string());
		}
		got.sort();
		assert_eq!(got, vec!["err", "out"]);
		assert!(spawned.child.wait().await.unwrap().success());
	}

	#[cfg(windows)]
	#[tokio::test]
	async fn teed_is_unsupported() {
		let tee = TeeConfig::default();
		let err = spawn(&argv(&["cmd"]), Mode::Teed { name: "x", tee: &tee })
			.err()
			.unwrap();
		assert!(matches!(err, SpawnError::Unsupported(_)));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn direct_feeds_stdin() {
		let mut spawned = spawn_direct(&argv(&["cat"])).unwrap();
		spawned.input.write_all(b"hello\n").await.unwrap();
		spawned.input.flush().await.unwrap();
		drop(spawned.input);
		let mut lines = BufReader::new(spawned.output).lines();
		assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("hello"));
		assert_eq!(lines.next_line().await.unwrap(), None);
		spawned.child.wait().await.unwrap();
	}

	#[tokio::test]
	async fn missing_executable_is_distinct() {
		let err = spawn_direct(&argv(&["/nonexistent/dgsm-test-binary"]))
			.err()
			.unwrap();
		assert!(matches!(err, SpawnError::NotFound(_)));
		assert!(matches!(spawn_direct(&[]), Err(SpawnError::Empty)));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn teed_checks_program_before_launching() {
		let tee = TeeConfig::default();
		let err = spawn(
			&argv(&["dgsm-no-such-program"]),
			Mode::Teed { name: "x", tee: &tee },
		)
		.err()
		.unwrap();
		assert!(matches!(err, SpawnError::NotFound(p) if p == "dgsm-no-such-program"));
	}

	#[cfg(unix)]
	#[test]
	fn locate_searches_path() {
		assert!(locate("sh").is_some());
		assert!(locate("/bin/sh").is_some() || locate("/usr/bin/sh").is_some());
		assert!(locate("dgsm-no-such-program").is_none());
	}
}
