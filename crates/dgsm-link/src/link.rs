use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::frame;
use crate::LinkError;

/// How long to wait between connection attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long one outgoing frame may take before the connection is dropped.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	/// Bind the address and accept one peer at a time.
	#[default]
	Listen,
	/// Dial the address.
	Dial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
	Disconnected,
	Connecting,
	Connected,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
	pub role: Role,
	pub addr: String,
	pub poll_interval: Duration,
	pub write_timeout: Duration,
}

impl LinkConfig {
	pub fn new(role: Role, addr: impl Into<String>) -> Self {
		Self {
			role,
			addr: addr.into(),
			poll_interval: POLL_INTERVAL,
			write_timeout: WRITE_TIMEOUT,
		}
	}

	pub fn poll_interval(mut self, interval: Duration) -> Self {
		self.poll_interval = interval;
		self
	}

	pub fn write_timeout(mut self, timeout: Duration) -> Self {
		self.write_timeout = timeout;
		self
	}
}

/// Callbacks invoked by a [`Link`].
///
/// Every inbound message gets its own task, so a slow `on_message` never holds
/// up the read loop.
#[async_trait]
pub trait LinkHandler<M: Send + 'static>: Send + Sync + 'static {
	async fn on_message(&self, link: Link<M>, msg: M);

	async fn on_connect(&self, _link: Link<M>) {}

	async fn on_disconnect(&self, _link: Link<M>) {}
}

struct Running {
	stop: CancellationToken,
	task: JoinHandle<()>,
}

struct Inner<M: Send + 'static> {
	config: LinkConfig,
	handler: Arc<dyn LinkHandler<M>>,
	state: watch::Sender<LinkState>,
	writer: Mutex<Option<OwnedWriteHalf>>,
	session: Mutex<Option<CancellationToken>>,
	run: Mutex<Option<Running>>,
}

/// Handle to a reconnecting link. Cheap to clone.
pub struct Link<M: Send + 'static> {
	inner: Arc<Inner<M>>,
}

impl<M: Send + 'static> Clone for Link<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<M> Link<M>
where
	M: Serialize + DeserializeOwned + Send + 'static,
{
	pub fn new<H: LinkHandler<M>>(config: LinkConfig, handler: H) -> Self {
		let (state, _) = watch::channel(LinkState::Disconnected);
		Self {
			inner: Arc::new(Inner {
				config,
				handler: Arc::new(handler),
				state,
				writer: Mutex::new(None),
				session: Mutex::new(None),
				run: Mutex::new(None),
			}),
		}
	}

	pub fn config(&self) -> &LinkConfig {
		&self.inner.config
	}

	pub fn state(&self) -> LinkState {
		*self.inner.state.borrow()
	}

	pub fn is_connected(&self) -> bool {
		self.state() == LinkState::Connected
	}

	/// Subscribe to connection state changes.
	pub fn watch(&self) -> watch::Receiver<LinkState> {
		self.inner.state.subscribe()
	}

	/// Start the connect loop. Returns false if it is already running.
	pub async fn spawn(&self) -> bool {
		let mut run = self.inner.run.lock().await;
		if run.as_ref().is_some_and(|r| !r.task.is_finished()) {
			return false;
		}
		let stop = CancellationToken::new();
		let link = self.clone();
		let token = stop.clone();
		let task = tokio::spawn(async move {
			match link.inner.config.role {
				Role::Listen => link.listen_loop(&token).await,
				Role::Dial => link.dial_loop(&token).await,
			}
			link.set_state(LinkState::Disconnected);
		});
		*run = Some(Running { stop, task });
		true
	}

	/// Send one message. Returns `Ok(false)` without sending when no peer is
	/// connected.
	///
	/// A write that stalls past the configured timeout drops the connection. A
	/// write in flight when the session ends or the link stops is abandoned.
	pub async fn write(&self, msg: &M) -> Result<bool, LinkError> {
		let Some(cancel) = self.inner.session.lock().await.clone() else {
			tracing::debug!("no peer connected, dropping outgoing message");
			return Ok(false);
		};
		let mut writer = self.inner.writer.lock().await;
		let Some(stream) = writer.as_mut() else {
			tracing::debug!("no peer connected, dropping outgoing message");
			return Ok(false);
		};
		let limit = self.inner.config.write_timeout;
		tokio::select! {
			_ = cancel.cancelled() => Err(LinkError::Io(io::Error::new(
				io::ErrorKind::ConnectionAborted,
				"connection closed during write",
			))),
			written = tokio::time::timeout(limit, frame::write_frame(stream, msg)) => match written {
				Ok(result) => result.map(|_| true),
				Err(_) => {
					tracing::warn!("write to {} stalled for {:?}, dropping connection", self.inner.config.addr, limit);
					cancel.cancel();
					Err(LinkError::Io(io::Error::new(io::ErrorKind::TimedOut, "write timed out")))
				}
			},
		}
	}

	/// Drop the current connection, if any, and go back to polling.
	pub async fn disconnect(&self) {
		if let Some(session) = self.inner.session.lock().await.as_ref() {
			session.cancel();
		}
	}

	/// Stop the connect loop and close the connection. Safe to call repeatedly.
	pub async fn stop(&self) {
		let running = self.inner.run.lock().await.take();
		let Some(running) = running else {
			return;
		};
		running.stop.cancel();
		if let Err(e) = running.task.await {
			if e.is_panic() {
				tracing::error!("link task panicked: {}", e);
			}
		}
		self.close_writer().await;
		self.set_state(LinkState::Disconnected);
		tracing::info!("link to {} stopped", self.inner.config.addr);
	}

	async fn listen_loop(&self, stop: &CancellationToken) {
		let addr = self.inner.config.addr.clone();
		let listener = loop {
			match TcpListener::bind(&addr).await {
				Ok(listener) => break listener,
				Err(e) => {
					tracing::warn!("failed to bind {}: {}", addr, e);
					if self.pause(stop).await {
						return;
					}
				}
			}
		};
		tracing::info!("listening for a peer on {}", addr);

		loop {
			self.set_state(LinkState::Connecting);
			let accepted = tokio::select! {
				_ = stop.cancelled() => return,
				accepted = listener.accept() => accepted,
			};
			match accepted {
				Ok((stream, peer)) => {
					tracing::info!("peer connected from {}", peer);
					if self.session(stream, stop).await {
						return;
					}
				}
				Err(e) => {
					tracing::warn!("accept failed: {}", e);
					if self.pause(stop).await {
						return;
					}
				}
			}
		}
	}

	async fn dial_loop(&self, stop: &CancellationToken) {
		let addr = self.inner.config.addr.clone();
		loop {
			self.set_state(LinkState::Connecting);
			let connected = tokio::select! {
				_ = stop.cancelled() => return,
				connected = TcpStream::connect(&addr) => connected,
			};
			match connected {
				Ok(stream) => {
					tracing::info!("connected to {}", addr);
					if self.session(stream, stop).await {
						return;
					}
				}
				Err(e) => {
					tracing::debug!("dial {} failed: {}", addr, e);
					if self.pause(stop).await {
						return;
					}
				}
			}
		}
	}

	/// Sleep one poll interval. Returns true if stopped meanwhile.
	async fn pause(&self, stop: &CancellationToken) -> bool {
		tokio::select! {
			_ = stop.cancelled() => true,
			_ = tokio::time::sleep(self.inner.config.poll_interval) => false,
		}
	}

	/// Run one connected session. Returns true if the link was stopped.
	async fn session(&self, stream: TcpStream, stop: &CancellationToken) -> bool {
		if let Err(e) = stream.set_nodelay(true) {
			tracing::debug!("set_nodelay failed: {}", e);
		}
		let (reader, writer) = stream.into_split();
		let cancel = stop.child_token();
		*self.inner.session.lock().await = Some(cancel.clone());
		*self.inner.writer.lock().await = Some(writer);
		self.set_state(LinkState::Connected);

		let link = self.clone();
		let handler = Arc::clone(&self.inner.handler);
		tokio::spawn(async move { handler.on_connect(link).await });

		self.read_frames(reader, &cancel).await;

		self.inner.session.lock().await.take();
		self.close_writer().await;
		self.set_state(LinkState::Disconnected);
		tracing::info!("peer on {} disconnected", self.inner.config.addr);
		self.inner.handler.on_disconnect(self.clone()).await;
		stop.is_cancelled()
	}

	async fn read_frames(&self, reader: OwnedReadHalf, cancel: &CancellationToken) {
		let mut reader = BufReader::new(reader);
		loop {
			let frame = tokio::select! {
				_ = cancel.cancelled() => return,
				frame = frame::read_frame(&mut reader) => frame,
			};
			match frame {
				Ok(Some(bytes)) => match frame::decode::<M>(&bytes) {
					Ok(msg) => {
						let link = self.clone();
						let handler = Arc::clone(&self.inner.handler);
						tokio::spawn(async move { handler.on_message(link, msg).await });
					}
					Err(e) => tracing::warn!("dropping malformed frame: {}", e),
				},
				Ok(None) => return,
				Err(e) => {
					tracing::warn!("read failed: {}", e);
					return;
				}
			}
		}
	}

	async fn close_writer(&self) {
		if let Some(mut writer) = self.inner.writer.lock().await.take() {
			let _ = writer.shutdown().await;
		}
	}

	fn set_state(&self, state: LinkState) {
		self.inner.state.send_if_modified(|current| {
			if *current == state {
				return false;
			}
			*current = state;
			true
		});
	}
}
