use dgsm_link::UserCmd;
use dgsm_proc::{Supervisor, Subscription};
use owo_colors::OwoColorize;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{Coordinator, Origin};

const CLEAR_LINE: &str = "\x1b[2K\x1b[1G";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
	Message(String),
	/// A line of output from the focused application.
	AppLine { app: String, line: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	Continue,
	Exit,
}

struct Focus {
	app: Arc<Supervisor>,
	_mirror: Subscription,
}

/// Interactive operator console. Commands typed here go through the same
/// dispatcher as remote commands; while an application is focused, raw input
/// is written straight to it and its output is mirrored here.
pub struct Console {
	coordinator: Arc<Coordinator>,
	events_tx: mpsc::UnboundedSender<ConsoleEvent>,
	events: mpsc::UnboundedReceiver<ConsoleEvent>,
	focus: Option<Focus>,
}

impl Console {
	pub fn new(
		coordinator: Arc<Coordinator>,
		events_tx: mpsc::UnboundedSender<ConsoleEvent>,
		events: mpsc::UnboundedReceiver<ConsoleEvent>,
	) -> Self {
		Self {
			coordinator,
			events_tx,
			events,
			focus: None,
		}
	}

	/// Runs until `shutdown` fires or the operator types `exit`. Closing stdin
	/// leaves the process running headless.
	pub async fn run(mut self, shutdown: CancellationToken) {
		let mut lines = BufReader::new(tokio::io::stdin()).lines();
		let mut stdin_open = true;
		self.prompt();
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => break,
				event = self.events.recv() => match event {
					Some(event) => self.print(event),
					None => break,
				},
				line = lines.next_line(), if stdin_open => match line {
					Ok(Some(line)) => {
						if self.handle(&line).await == Flow::Exit {
							shutdown.cancel();
							break;
						}
						self.prompt();
					}
					Ok(None) => {
						tracing::info!("console input closed");
						stdin_open = false;
					}
					Err(e) => {
						tracing::warn!("console read failed: {}", e);
						stdin_open = false;
					}
				},
			}
		}
		self.focus = None;
		println!();
	}

	pub async fn handle(&mut self, input: &str) -> Flow {
		let mut input = input.trim();
		if input.is_empty() {
			return Flow::Continue;
		}

		if let Some(focus) = &self.focus {
			let Some(escaped) = input.strip_prefix("--") else {
				let app = Arc::clone(&focus.app);
				if !app.is_running() {
					self.say(format!("{} must be started first", app.name()));
				} else if !app.message_app(input).await {
					self.say(format!("Unable to send input to {}", app.name()));
				}
				return Flow::Continue;
			};
			input = escaped.trim_start_matches('-').trim();
			if input.is_empty() {
				return Flow::Continue;
			}
		}

		let mut words = input.split_whitespace();
		let Some(cmd) = words.next() else {
			return Flow::Continue;
		};
		let app = words.next().map(str::to_string);
		let rest: Vec<&str> = words.collect();
		let targets_app = app
			.as_deref()
			.is_some_and(|a| self.coordinator.app(a).is_some());

		match cmd.to_lowercase().as_str() {
			"focus" => self.focus(app.as_deref()),
			"unfocus" if !targets_app => self.unfocus(),
			"exit" if !targets_app => return Flow::Exit,
			"help" if !targets_app => self.say(self.help_text()),
			_ => {
				let mut user_cmd = UserCmd::new(cmd);
				user_cmd.app = app;
				user_cmd.args = (!rest.is_empty()).then(|| rest.join(" "));
				let coordinator = Arc::clone(&self.coordinator);
				let reply = coordinator.reply(Origin::Console);
				tokio::spawn(async move { coordinator.dispatch(user_cmd, reply).await });
			}
		}
		Flow::Continue
	}

	pub fn focused(&self) -> Option<&str> {
		self.focus.as_ref().map(|f| f.app.name())
	}

	fn focus(&mut self, name: Option<&str>) {
		let Some(name) = name else {
			self.say("Must specify an application with 'focus'".to_string());
			return;
		};
		let Some(app) = self.coordinator.app(name).cloned() else {
			self.say(format!("'{}' is not a recognized application", name));
			return;
		};
		self.unfocus();

		let tx = self.events_tx.clone();
		let label = app.name().to_string();
		let mirror = app.broker().subscribe(move |line| {
			let _ = tx.send(ConsoleEvent::AppLine {
				app: label.clone(),
				line: line.to_string(),
			});
		});
		self.say(format!(
			"Focusing {}, all input is fed directly to {}. Use '--unfocus' to exit this mode",
			app.name(),
			app.name()
		));
		tracing::info!("console focused on {}", app.name());
		self.focus = Some(Focus {
			app,
			_mirror: mirror,
		});
	}

	fn unfocus(&mut self) {
		if let Some(focus) = self.focus.take() {
			self.say(format!("{} is no longer focused", focus.app.name()));
		}
	}

	fn help_text(&self) -> String {
		format!(
			"{}\nConsole Only Commands:\n  focus, unfocus, exit\n\
			Use 'focus <app>' to send all input directly to <app>\n\
			While focused, prefix a command with '--' to run it, e.g. '--unfocus'",
			self.coordinator.help_text()
		)
	}

	/// Queue a line for printing from the run loop.
	fn say(&self, text: String) {
		let _ = self.events_tx.send(ConsoleEvent::Message(text));
	}

	fn print(&self, event: ConsoleEvent) {
		let mut out = String::from(CLEAR_LINE);
		match event {
			ConsoleEvent::Message(text) => {
				out.push_str(text.trim_end_matches('\n'));
			}
			ConsoleEvent::AppLine { app, line } => {
				let tag = format!("[{}]:", app);
				out.push_str(&format!("{} {}", tag.blue(), line.trim_end_matches(['\r', '\n'])));
			}
		}
		println!("{}", out);
		self.prompt();
	}

	fn prompt(&self) {
		match self.focused() {
			Some(name) => print!("{}$ ", name.bright_blue()),
			None => print!("{}$ ", "dgsm".bright_green()),
		}
		let _ = std::io::stdout().flush();
	}
}
