use parking_lot::Mutex;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::commands::{CommandError, CommandSpec};
use crate::detect::{AppState, DetectorSet, Readiness};
use crate::output::{OutputBroker, Subscription};
use crate::profiles::Profile;
use crate::spawn::{self, BoxReader, BoxWriter, Mode, SpawnError, Spawned, TeeConfig};
use crate::tree::{self, Sig, Tracked};
use crate::types::*;

/// How long output keeps being read after the process exits.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
	/// Limit for the application to report it is ready.
	pub start: Duration,
	/// Limit for a commanded stop to take effect.
	pub stop: Duration,
	/// Grace period before a forced stop escalates to SIGKILL.
	pub force: Duration,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			start: Duration::from_secs(90),
			stop: Duration::from_secs(30),
			force: Duration::from_secs(5),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
	pub tee: TeeConfig,
	pub timeouts: Timeouts,
}

/// Per-run bookkeeping, reset on every start and teardown.
#[derive(Default)]
struct Run {
	pid: Option<u32>,
	cancel: Option<CancellationToken>,
	tracked: Tracked,
	stop_commanded: bool,
	reply: Option<Reply>,
}

/// Owns one application and at most one live OS process for it.
pub struct Supervisor {
	def: AppDef,
	profile: &'static Profile,
	detectors: Arc<DetectorSet>,
	options: SupervisorOptions,
	broker: OutputBroker,
	app: Arc<Mutex<AppState>>,
	run: Mutex<Run>,
	input: tokio::sync::Mutex<Option<BoxWriter>>,
	lifecycle: watch::Sender<Lifecycle>,
}

impl Supervisor {
	pub fn new(
		def: AppDef,
		profile: &'static Profile,
		detectors: DetectorSet,
		options: SupervisorOptions,
	) -> Arc<Self> {
		let (lifecycle, _) = watch::channel(Lifecycle::Idle);
		Arc::new(Self {
			def,
			profile,
			detectors: Arc::new(detectors),
			options,
			broker: OutputBroker::new(),
			app: Arc::new(Mutex::new(AppState::default())),
			run: Mutex::new(Run::default()),
			input: tokio::sync::Mutex::new(None),
			lifecycle,
		})
	}

	pub fn name(&self) -> &str {
		&self.def.name
	}

	pub fn profile(&self) -> &'static Profile {
		self.profile
	}

	pub fn commands(&self) -> &'static [CommandSpec] {
		self.profile.commands
	}

	pub fn broker(&self) -> &OutputBroker {
		&self.broker
	}

	pub fn lifecycle(&self) -> Lifecycle {
		*self.lifecycle.borrow()
	}

	pub fn watch(&self) -> watch::Receiver<Lifecycle> {
		self.lifecycle.subscribe()
	}

	pub fn is_running(&self) -> bool {
		self.lifecycle().is_active()
	}

	pub fn app_state(&self) -> AppState {
		self.app.lock().clone()
	}

	pub fn pid(&self) -> Option<u32> {
		self.run.lock().pid
	}

	/// Short status word: Online/Offline for applications that announce
	/// readiness, Running/Stopped otherwise.
	pub fn status(&self) -> &'static str {
		if self.detectors.announces_ready() {
			if self.app.lock().online {
				"Online"
			} else {
				"Offline"
			}
		} else if self.is_running() {
			"Running"
		} else {
			"Stopped"
		}
	}

	pub fn snapshot(&self) -> AppSnapshot {
		AppSnapshot {
			name: self.name().to_string(),
			commands: self.commands().iter().map(|c| c.name.to_string()).collect(),
			status: self.status().to_string(),
			id: self.profile.id.to_string(),
		}
	}

	/// Run a named command from this application's table.
	pub async fn command(
		self: &Arc<Self>,
		name: &str,
		args: Option<String>,
		reply: Reply,
	) -> Result<(), CommandError> {
		let spec = self
			.profile
			.command(name)
			.ok_or_else(|| CommandError::Unsupported {
				app: self.name().to_string(),
				cmd: name.to_string(),
			})?;
		let args = args.filter(|a| !a.trim().is_empty());
		if !spec.arity.accepts(args.is_some()) {
			return Err(CommandError::ArityMismatch(format!("{}.{}", self.name(), spec.name)));
		}
		tracing::info!("calling {}.{}({})", self.name(), spec.name, args.as_deref().unwrap_or(""));
		(spec.handler)(Arc::clone(self), args, reply).await;
		Ok(())
	}

	pub async fn start(self: &Arc<Self>, reply: Reply) {
		let name = self.name().to_string();
		let cancel = CancellationToken::new();
		let already = {
			let mut run = self.run.lock();
			if self.lifecycle().is_active() {
				true
			} else {
				*run = Run {
					cancel: Some(cancel.clone()),
					reply: Some(Arc::clone(&reply)),
					..Run::default()
				};
				self.lifecycle.send_replace(Lifecycle::Starting);
				false
			}
		};
		if already {
			reply.notify(Notice::Text(format!("{} is already running", name)));
			return;
		}

		*self.app.lock() = AppState::default();
		if self.detectors.announces_ready() {
			reply.notify(Notice::Text(format!("Starting {}", name)));
		}

		let mode = if self.def.new_console {
			Mode::Teed {
				name: &name,
				tee: &self.options.tee,
			}
		} else {
			Mode::Direct
		};
		let Spawned {
			child,
			output,
			input,
		} = match spawn::spawn(&self.def.argv, mode) {
			Ok(spawned) => spawned,
			Err(e) => {
				tracing::warn!("{} failed to spawn: {}", name, e);
				*self.run.lock() = Run::default();
				self.lifecycle.send_replace(Lifecycle::Idle);
				let msg = match e {
					SpawnError::NotFound(_) => {
						format!("{} did not start - unable to locate the executable.", name)
					}
					_ => format!("{} is unable to start", name),
				};
				reply.notify(Notice::Text(msg));
				return;
			}
		};

		let pid = child.id();
		self.run.lock().pid = pid;
		*self.input.lock().await = Some(input);
		tracing::info!("{} spawned with pid {:?}", name, pid);

		let (ready_tx, ready_rx) = oneshot::channel();
		let core = self.watch_output(ready_tx);
		let sup = Arc::clone(self);
		tokio::spawn(async move { sup.monitor(child, output, cancel, core).await });

		self.wait_for_start(ready_rx, pid, &reply).await;
	}

	async fn wait_for_start(&self, ready: oneshot::Receiver<()>, pid: Option<u32>, reply: &Reply) {
		let name = self.name();
		let mut life = self.lifecycle.subscribe();
		let readiness = async {
			match &self.detectors.readiness {
				Readiness::After(delay) => {
					tokio::time::sleep(*delay).await;
					true
				}
				// a dropped sender means the output ended; `ended` reports that
				// once teardown has settled the lifecycle
				Readiness::Line(_) => match ready.await {
					Ok(()) => true,
					Err(_) => std::future::pending().await,
				},
			}
		};
		let ended = async {
			let _ = life.wait_for(|s| *s == Lifecycle::Idle).await;
		};
		let outcome = tokio::time::timeout(self.options.timeouts.start, async {
			tokio::select! {
				biased;
				ok = readiness => ok,
				_ = ended => false,
			}
		})
		.await;

		match outcome {
			Ok(true) => {
				if !self.promote(pid) {
					tracing::info!("{} was stopped while starting", name);
					return;
				}
				tracing::info!("{} has started", name);
				reply.notify(Notice::Text(self.started_message()));
				reply.notify(Notice::Status(self.snapshot()));
			}
			Ok(false) => {
				tracing::warn!("{} exited before it was ready", name);
				reply.notify(Notice::Text(format!("{} is unable to start", name)));
			}
			Err(_) => {
				tracing::warn!(
					"{} did not report ready within {:?}",
					name,
					self.options.timeouts.start
				);
				// keep supervising it; it may still come up
				self.promote(pid);
				reply.notify(Notice::Text(format!("{} is unable to start", name)));
			}
		}
	}

	/// Starting -> Running, snapshotting the process tree. False if the run
	/// already moved on.
	fn promote(&self, pid: Option<u32>) -> bool {
		let mut run = self.run.lock();
		let moved = self.lifecycle.send_if_modified(|s| {
			if *s == Lifecycle::Starting {
				*s = Lifecycle::Running;
				true
			} else {
				false
			}
		});
		if moved {
			if let Some(pid) = pid {
				run.tracked = Tracked::snapshot(pid);
			}
		}
		moved
	}

	fn started_message(&self) -> String {
		let mut msg = format!("{} has started", self.name());
		if let Some(ep) = self.def.app_info.get("endpoint") {
			msg.push_str(&format!("\nEndpoint: {}", ep));
		}
		if let Some(pw) = self.def.app_info.get("password") {
			msg.push_str(&format!("\nPassword: {}", pw));
		}
		msg
	}

	pub async fn stop(self: &Arc<Self>, reply: Reply) {
		let name = self.name().to_string();
		match self.lifecycle() {
			Lifecycle::Running => {}
			Lifecycle::Starting => {
				reply.notify(Notice::Text(format!("{} is still starting", name)));
				return;
			}
			Lifecycle::Stopping => {
				reply.notify(Notice::Text(format!("{} is already stopping", name)));
				return;
			}
			Lifecycle::Idle => {
				reply.notify(Notice::Text(format!("{} is not running", name)));
				return;
			}
		}

		let refusal = self.detectors.stop_ok(&name, &self.app.lock()).err();
		if let Some(why) = refusal {
			tracing::info!("refusing to stop {}: {}", name, why);
			reply.notify(Notice::Text(why));
			return;
		}

		let commanded = {
			let mut run = self.run.lock();
			let moved = self.lifecycle.send_if_modified(|s| {
				if *s == Lifecycle::Running {
					*s = Lifecycle::Stopping;
					true
				} else {
					false
				}
			});
			if moved {
				run.stop_commanded = true;
				run.reply = Some(Arc::clone(&reply));
				Some((run.cancel.clone(), kill_list(&run)))
			} else {
				None
			}
		};
		let Some((cancel, pids)) = commanded else {
			reply.notify(Notice::Text(format!("{} is not running", name)));
			return;
		};

		tracing::info!("stopping {}", name);
		match cancel {
			Some(cancel) if !cancel.is_cancelled() => cancel.cancel(),
			// an earlier stop timed out and teardown is still waiting on the process
			_ => tree::signal_all(&pids, Sig::Term),
		}

		if self.wait_idle(self.options.timeouts.stop).await {
			tracing::info!("{} has stopped", name);
			reply.notify(Notice::Text(format!("{} has stopped", name)));
			reply.notify(Notice::Status(self.snapshot()));
			return;
		}

		tracing::warn!("{} did not stop within {:?}", name, self.options.timeouts.stop);
		{
			let mut run = self.run.lock();
			let reverted = self.lifecycle.send_if_modified(|s| {
				if *s == Lifecycle::Stopping {
					*s = Lifecycle::Running;
					true
				} else {
					false
				}
			});
			if reverted {
				run.stop_commanded = false;
			}
		}
		reply.notify(Notice::Text(format!("{} is unable to stop", name)));
	}

	/// Stop without asking, escalating to SIGKILL. Sends no notifications.
	pub async fn force_stop(&self) {
		let cancel = {
			let mut run = self.run.lock();
			if !self.lifecycle().is_active() {
				return;
			}
			run.stop_commanded = true;
			self.lifecycle.send_replace(Lifecycle::Stopping);
			run.cancel.clone()
		};
		if let Some(cancel) = cancel {
			cancel.cancel();
		}
		if self.wait_idle(self.options.timeouts.force).await {
			tracing::info!("{} has been force stopped", self.name());
			return;
		}

		tracing::warn!("{} ignored SIGTERM, killing it", self.name());
		let pids = kill_list(&self.run.lock());
		tree::signal_all(&pids, Sig::Kill);
		if !self.wait_idle(self.options.timeouts.force).await {
			tracing::error!("{} survived SIGKILL", self.name());
		}
	}

	/// Write one line to the application's stdin. False if it is not running.
	pub async fn message_app(&self, text: &str) -> bool {
		if !self.is_running() {
			return false;
		}
		let mut input = self.input.lock().await;
		let Some(writer) = input.as_mut() else {
			return false;
		};
		let line = format!("{}\n", text.trim());
		let sent = match writer.write_all(line.as_bytes()).await {
			Ok(()) => writer.flush().await,
			Err(e) => Err(e),
		};
		if let Err(e) = sent {
			tracing::warn!("writing to {} failed: {}", self.name(), e);
			return false;
		}
		true
	}

	pub fn usage(&self) -> Option<tree::Usage> {
		let mut tracked = {
			let run = self.run.lock();
			if run.tracked.is_empty() {
				return None;
			}
			run.tracked.clone()
		};
		let usage = tracked.usage();
		let mut run = self.run.lock();
		if run.tracked.procs() == tracked.procs() {
			run.tracked = tracked;
		}
		Some(usage)
	}

	/// Multi-line status for the `status` command.
	pub fn status_report(&self) -> String {
		let name = self.name();
		if !self.detectors.announces_ready() {
			let mut text = format!("{} is {}", name, self.status());
			if let Some(usage) = self.usage() {
				text.push_str(&format!("\n  CPU: {}%\n  Mem: {} GB", usage.cpu_percent, usage.mem_gb));
			}
			return text;
		}

		let app = self.app_state();
		if !app.online {
			return format!("{} is Offline", name);
		}
		let mut text = format!("{} - {}\n", name, self.profile.label);
		if let Some(version) = &app.version {
			text.push_str(&format!("  version: {}\n", version));
		}
		for (key, value) in &self.def.app_info {
			text.push_str(&format!("  {}: {}\n", key, value));
		}
		let count = app.players.len();
		text.push_str(&format!(
			"  {} player{} online",
			count,
			if count == 1 { "" } else { "s" }
		));
		if count > 0 {
			text.push(':');
			for player in app.player_names() {
				text.push_str(&format!("\n    {}", player));
			}
		}
		if let Some(usage) = self.usage() {
			text.push_str(&format!("\n  CPU: {}%\n  Mem: {} GB", usage.cpu_percent, usage.mem_gb));
		}
		text
	}

	fn watch_output(&self, ready: oneshot::Sender<()>) -> Subscription {
		let detectors = Arc::clone(&self.detectors);
		let app = Arc::clone(&self.app);
		let name = self.name().to_string();
		let ready = Mutex::new(Some(ready));
		self.broker.subscribe(move |line| {
			if detectors.inspect(line, &mut app.lock()) {
				if let Some(tx) = ready.lock().take() {
					tracing::info!("{} reported ready", name);
					let _ = tx.send(());
				}
			}
		})
	}

	async fn monitor(
		self: Arc<Self>,
		mut child: Child,
		output: BoxReader,
		cancel: CancellationToken,
		core: Subscription,
	) {
		tracing::info!("{} output monitoring has started", self.name());
		let mut reader = BufReader::new(output);
		let mut line = Vec::new();
		let mut exited = None;
		loop {
			line.clear();
			tokio::select! {
				_ = cancel.cancelled() => break,
				status = child.wait() => {
					exited = status.ok();
					self.drain(&mut reader).await;
					break;
				}
				read = reader.read_until(b'\n', &mut line) => match read {
					Ok(0) => break,
					Ok(_) => self.broker.publish(&decode_line(&line)),
					Err(e) => {
						tracing::warn!("reading {} output failed: {}", self.name(), e);
						break;
					}
				},
			}
		}
		drop(core);
		drop(reader);
		self.teardown(child, exited).await;
	}

	async fn drain(&self, reader: &mut BufReader<BoxReader>) {
		let mut line = Vec::new();
		loop {
			line.clear();
			match tokio::time::timeout(DRAIN_GRACE, reader.read_until(b'\n', &mut line)).await {
				Ok(Ok(n)) if n > 0 => self.broker.publish(&decode_line(&line)),
				_ => return,
			}
		}
	}

	/// Runs exactly once per process, whatever ended it.
	async fn teardown(&self, mut child: Child, exited: Option<ExitStatus>) {
		let name = self.name().to_string();
		self.input.lock().await.take();
		self.broker.clear();

		let pids = {
			let mut run = self.run.lock();
			// a reaped root's pid may already belong to someone else
			if exited.is_some() {
				run.pid = None;
			}
			kill_list(&run)
		};
		tree::signal_all(&pids, Sig::Term);

		let status = match exited {
			Some(status) => Some(status),
			None => child.wait().await.ok(),
		};
		tracing::info!("{} exited ({:?})", name, status);

		let (commanded, was_starting, reply) = {
			let mut run = self.run.lock();
			let commanded = run.stop_commanded;
			let reply = run.reply.take();
			*run = Run::default();
			*self.app.lock() = AppState::default();
			let was_starting = self.lifecycle() == Lifecycle::Starting;
			self.lifecycle.send_replace(Lifecycle::Idle);
			(commanded, was_starting, reply)
		};

		// a start that never became ready reports its own failure
		if !commanded && !was_starting {
			tracing::warn!("{} was terminated unexpectedly", name);
			if let Some(reply) = reply {
				reply.notify(Notice::Text(format!("{} was terminated unexpectedly", name)));
				reply.notify(Notice::Status(self.snapshot()));
			}
		}
	}

	async fn wait_idle(&self, limit: Duration) -> bool {
		let mut life = self.lifecycle.subscribe();
		let idle = tokio::time::timeout(limit, async {
			life.wait_for(|s| *s == Lifecycle::Idle).await.is_ok()
		})
		.await;
		matches!(idle, Ok(true))
	}
}

/// Root, its current descendants and whatever tracked at start is still alive.
fn kill_list(run: &Run) -> Vec<u32> {
	let mut pids = run.tracked.live_pids();
	if let Some(root) = run.pid {
		pids.extend(tree::descendants(root));
		pids.push(root);
	}
	pids.sort_unstable();
	pids.dedup();
	pids
}

fn decode_line(raw: &[u8]) -> String {
	let text = String::from_utf8_lossy(raw);
	text.trim_end_matches(|c| c == '\n' || c == '\r').to_string()
}
