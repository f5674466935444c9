use async_trait::async_trait;
use dgsm_link::{AppInfo, Link, LinkHandler, Payload, UserCmd};
use dgsm_proc::{
	profiles, AppDef, CommandError, Notice, Notify, Reply, Supervisor, SupervisorOptions,
	Timeouts,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::console::ConsoleEvent;

const COORDINATOR_COMMANDS: &[&str] = &["start", "stop", "status", "help", "sleep"];

/// Where the reply to a command should go.
#[derive(Debug, Clone, PartialEq)]
pub enum Origin {
	Console,
	/// The remote controller; the context is echoed back untouched.
	Remote(Option<Value>),
}

#[derive(Debug)]
pub struct Outbound {
	pub origin: Origin,
	pub notice: Notice,
}

/// Reply sink that tags every notice with its origin.
struct Route {
	origin: Origin,
	outbox: mpsc::UnboundedSender<Outbound>,
}

impl Notify for Route {
	fn notify(&self, notice: Notice) {
		let out = Outbound {
			origin: self.origin.clone(),
			notice,
		};
		if self.outbox.send(out).is_err() {
			tracing::debug!("outbox closed");
		}
	}
}

/// Owns every configured application and routes commands to them.
pub struct Coordinator {
	/// Keyed by lowercased name.
	apps: BTreeMap<String, Arc<Supervisor>>,
	outbox: mpsc::UnboundedSender<Outbound>,
	sleep_command: Option<String>,
	shutdown: CancellationToken,
	power_off: AtomicBool,
}

impl Coordinator {
	pub fn new(
		apps: impl IntoIterator<Item = Arc<Supervisor>>,
		outbox: mpsc::UnboundedSender<Outbound>,
		sleep_command: Option<String>,
	) -> Arc<Self> {
		Arc::new(Self {
			apps: apps
				.into_iter()
				.map(|app| (app.name().to_lowercase(), app))
				.collect(),
			outbox,
			sleep_command,
			shutdown: CancellationToken::new(),
			power_off: AtomicBool::new(false),
		})
	}

	/// Build supervisors for every usable entry. Returns the problems found
	/// along the way so the caller can show them.
	pub fn from_config(
		config: &Config,
		outbox: mpsc::UnboundedSender<Outbound>,
	) -> (Arc<Self>, Vec<String>) {
		let options = SupervisorOptions {
			tee: config.tee.clone(),
			timeouts: Timeouts::default(),
		};
		let mut apps = Vec::new();
		let mut warnings = Vec::new();

		for (name, entry) in &config.apps {
			let Some(prg) = entry.prg.as_ref().filter(|p| !p.is_empty()) else {
				warnings.push(format!(
					"{} is missing key 'prg' in its configuration. {} will be unavailable to use.",
					name, name
				));
				continue;
			};
			let profile = match entry.id.as_deref() {
				None => &profiles::DEFAULT,
				Some(id) => match profiles::lookup(id) {
					Some(profile) => profile,
					None => {
						warnings.push(format!(
							"{} has an unknown id '{}' and will use the default behaviour",
							name, id
						));
						&profiles::DEFAULT
					}
				},
			};
			let detectors = match profile.detectors() {
				Ok(detectors) => detectors,
				Err(e) => {
					warnings.push(format!("{}: invalid output patterns: {}", name, e));
					continue;
				}
			};
			let def = AppDef {
				name: name.clone(),
				argv: prg.argv(),
				app_info: entry.app_info.clone(),
				new_console: entry.opts.new_console,
			};
			apps.push(Supervisor::new(def, profile, detectors, options.clone()));
		}

		for warning in &warnings {
			tracing::warn!("{}", warning);
		}
		(Self::new(apps, outbox, config.sleep_command.clone()), warnings)
	}

	pub fn reply(&self, origin: Origin) -> Reply {
		Arc::new(Route {
			origin,
			outbox: self.outbox.clone(),
		})
	}

	/// Send a line to the local console only.
	pub fn note(&self, text: impl Into<String>) {
		self.reply(Origin::Console).notify(Notice::text(text));
	}

	pub fn app(&self, name: &str) -> Option<&Arc<Supervisor>> {
		self.apps.get(&name.to_lowercase())
	}

	pub fn apps(&self) -> impl Iterator<Item = &Arc<Supervisor>> {
		self.apps.values()
	}

	pub fn app_info(&self) -> BTreeMap<String, AppInfo> {
		self.apps
			.iter()
			.map(|(key, app)| {
				let snap = app.snapshot();
				let info = AppInfo {
					name: snap.name,
					commands: snap.commands,
					status: snap.status,
					id: snap.id,
				};
				(key.clone(), info)
			})
			.collect()
	}

	pub fn shutdown_token(&self) -> CancellationToken {
		self.shutdown.clone()
	}

	pub fn wants_power_off(&self) -> bool {
		self.power_off.load(Ordering::SeqCst)
	}

	/// Run a user command, answering errors through the same reply sink.
	pub async fn dispatch(&self, cmd: UserCmd, reply: Reply) {
		if let Err(e) = self.try_dispatch(cmd, Arc::clone(&reply)).await {
			tracing::info!("command rejected: {}", e);
			reply.notify(Notice::text(e.to_string()));
		}
	}

	async fn try_dispatch(&self, cmd: UserCmd, reply: Reply) -> Result<(), CommandError> {
		let raw = cmd.cmd.trim();
		if raw.is_empty() {
			return Err(CommandError::Malformed);
		}
		let name = raw.to_lowercase();
		let args = cmd.args.filter(|a| !a.trim().is_empty());

		if let Some(app) = cmd.app.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
			let target = self
				.app(app)
				.ok_or_else(|| CommandError::UnknownApplication(app.to_string()))?;
			return target.command(&name, args, reply).await;
		}

		match name.as_str() {
			"help" | "status" | "sleep" if args.is_some() => Err(CommandError::ArityMismatch(name)),
			"help" => {
				reply.notify(Notice::text(self.help_text()));
				Ok(())
			}
			"status" => {
				reply.notify(Notice::text(self.status_text()));
				Ok(())
			}
			"sleep" => {
				self.sleep(reply).await;
				Ok(())
			}
			other if profiles::is_app_command(other) => {
				Err(CommandError::MissingApplication(raw.to_string()))
			}
			_ => Err(CommandError::UnknownCommand(raw.to_string())),
		}
	}

	pub fn help_text(&self) -> String {
		let mut out = String::from("Available Apps:\n");
		for app in self.apps.values() {
			out.push_str(&format!("  {} - {}\n", app.name(), app.profile().label));
		}
		out.push_str("Commands:\n");
		out.push_str(&format!("  {}\n", COORDINATOR_COMMANDS.join(", ")));
		if let Some(first) = self.apps.values().next() {
			let name = first.name();
			out.push_str("Usage:\n");
			out.push_str(&format!("  'start {}' will start the {} application\n", name, name));
			out.push_str(&format!("  'status {}' returns the status of {}\n", name, name));
			out.push_str(&format!("  'help {}' lists the commands {} supports\n", name, name));
		}
		out.trim_end().to_string()
	}

	pub fn status_text(&self) -> String {
		let mut out = String::from("Apps:");
		for app in self.apps.values() {
			out.push_str(&format!("\n  {}: {}", app.name(), app.status()));
		}
		out
	}

	/// Stop every running application, then ask the process to power off
	/// the host once nothing is left running.
	pub async fn sleep(&self, reply: Reply) {
		reply.notify(Notice::text("Attempting to power off the host"));
		for app in self.apps.values() {
			if app.is_running() {
				app.stop(Arc::clone(&reply)).await;
			}
		}
		if let Some(app) = self.apps.values().find(|a| a.lifecycle().is_active()) {
			reply.notify(Notice::text(format!(
				"{} is preventing the host from powering off",
				app.name()
			)));
			return;
		}
		if self.sleep_command.is_none() {
			reply.notify(Notice::text(
				"No sleep_command is configured, the host will stay on",
			));
			return;
		}
		reply.notify(Notice::text("Powering off the host"));
		tracing::info!("power off requested");
		self.power_off.store(true, Ordering::SeqCst);
		self.shutdown.cancel();
	}

	pub fn start_defaults(&self, names: &[String]) {
		for name in names {
			let Some(app) = self.app(name) else {
				tracing::warn!("default app '{}' is not configured", name);
				self.note(format!("'{}' is not a recognized application", name));
				continue;
			};
			let app = Arc::clone(app);
			let reply = self.reply(Origin::Console);
			tokio::spawn(async move { app.start(reply).await });
		}
	}

	/// Kill every application without notices. Used on exit.
	pub async fn shutdown_apps(&self) {
		let stops = self.apps.values().map(|app| app.force_stop());
		futures::future::join_all(stops).await;
	}
}

/// Link callbacks for the remote controller.
pub struct RemoteHandler {
	coordinator: Arc<Coordinator>,
}

impl RemoteHandler {
	pub fn new(coordinator: Arc<Coordinator>) -> Self {
		Self { coordinator }
	}

	async fn push_app_info(&self, link: &Link<Payload>, context: Option<Value>) {
		let payload = Payload::app_info(self.coordinator.app_info()).with_context(context);
		if let Err(e) = link.write(&payload).await {
			tracing::warn!("failed to send app info: {}", e);
		}
	}
}

#[async_trait]
impl LinkHandler<Payload> for RemoteHandler {
	async fn on_message(&self, link: Link<Payload>, msg: Payload) {
		if let Some(cmd) = msg.user_cmd {
			tracing::info!("remote command: {:?}", cmd);
			let coordinator = Arc::clone(&self.coordinator);
			let reply = coordinator.reply(Origin::Remote(msg.context.clone()));
			tokio::spawn(async move { coordinator.dispatch(cmd, reply).await });
		}
		if msg.app_info_req {
			self.push_app_info(&link, msg.context).await;
		}
	}

	async fn on_connect(&self, link: Link<Payload>) {
		tracing::info!("remote controller connected");
		self.coordinator.note("Connected to the remote controller");
		self.push_app_info(&link, None).await;
	}

	async fn on_disconnect(&self, _link: Link<Payload>) {
		tracing::info!("remote controller disconnected");
		self.coordinator.note("Disconnected from the remote controller");
	}
}

/// Deliver notices: console text to the console, remote text over the link.
/// Status changes from either side refresh the controller's app listing.
pub async fn route(
	mut outbox: mpsc::UnboundedReceiver<Outbound>,
	link: Link<Payload>,
	console: mpsc::UnboundedSender<ConsoleEvent>,
	coordinator: Arc<Coordinator>,
) {
	while let Some(Outbound { origin, notice }) = outbox.recv().await {
		let payload = match (origin, notice) {
			(Origin::Console, Notice::Text(text)) => {
				if console.send(ConsoleEvent::Message(text)).is_err() {
					tracing::debug!("console closed");
				}
				continue;
			}
			(Origin::Remote(context), Notice::Text(text)) => {
				Payload::message(text).with_context(context)
			}
			(_, Notice::Status(snap)) => {
				tracing::debug!("{} is now {}", snap.name, snap.status);
				Payload::app_info(coordinator.app_info())
			}
		};
		match link.write(&payload).await {
			Ok(true) => {}
			Ok(false) => tracing::debug!("no remote peer, dropped outbound message"),
			Err(e) => tracing::warn!("failed to write to remote: {}", e),
		}
	}
}
