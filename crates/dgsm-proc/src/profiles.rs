//! Built-in application kinds.
//!
//! A profile pairs a command table with the detectors that read an
//! application's console. Unknown ids fall back to [`DEFAULT`], which treats
//! the process as ready a few seconds after launch and watches nothing else.

use futures::future::BoxFuture;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use crate::commands::{Arity, CommandSpec, BASE, HELP, START, STATUS, STOP};
use crate::detect::{DetectorSet, Pattern, Readiness};
use crate::supervisor::Supervisor;
use crate::types::{Notice, Reply};

pub const DEFAULT_READY_AFTER: Duration = Duration::from_secs(3);

pub struct Profile {
	pub id: &'static str,
	/// Display name, e.g. in status output.
	pub label: &'static str,
	pub commands: &'static [CommandSpec],
	detectors: fn() -> Result<DetectorSet, regex::Error>,
}

impl Profile {
	pub fn detectors(&self) -> Result<DetectorSet, regex::Error> {
		(self.detectors)()
	}

	pub fn command(&self, name: &str) -> Option<&'static CommandSpec> {
		self.commands.iter().find(|c| c.name.eq_ignore_ascii_case(name))
	}
}

impl std::fmt::Debug for Profile {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Profile").field("id", &self.id).finish()
	}
}

pub static DEFAULT: Profile = Profile {
	id: "default",
	label: "Default",
	commands: BASE,
	detectors: || Ok(DetectorSet::delayed(DEFAULT_READY_AFTER)),
};

pub static MINECRAFT: Profile = Profile {
	id: "minecraft",
	label: "Minecraft",
	commands: &[START, STOP, STATUS, HELP, ECHO, SEED, INPUT],
	detectors: minecraft,
};

pub static VALHEIM: Profile = Profile {
	id: "valheim",
	label: "Valheim",
	commands: BASE,
	detectors: valheim,
};

pub static FACTORIO: Profile = Profile {
	id: "factorio",
	label: "Factorio",
	commands: BASE,
	detectors: factorio,
};

pub static PROFILES: &[&Profile] = &[&DEFAULT, &MINECRAFT, &VALHEIM, &FACTORIO];

pub fn lookup(id: &str) -> Option<&'static Profile> {
	PROFILES
		.iter()
		.copied()
		.find(|p| p.id.eq_ignore_ascii_case(id))
}

/// Whether any application kind has a command with this name.
pub fn is_app_command(name: &str) -> bool {
	PROFILES.iter().any(|p| p.command(name).is_some())
}

fn minecraft() -> Result<DetectorSet, regex::Error> {
	Ok(DetectorSet {
		readiness: Readiness::Line(Box::new(Pattern::simple(r"(Done \([\w.]+s\)!)")?)),
		version: Some(Box::new(Pattern::simple(
			r"(?:Starting minecraft server version )([\w.]+)",
		)?)),
		connect: Some(Box::new(Pattern::simple(r"(\w+)(?: joined the game)")?)),
		disconnect: Some(Box::new(Pattern::simple(r"(\w+)(?: left the game)")?)),
	})
}

fn valheim() -> Result<DetectorSet, regex::Error> {
	Ok(DetectorSet {
		readiness: Readiness::Line(Box::new(Pattern::simple(r"(Game server connected)(?:\s|$)")?)),
		version: Some(Box::new(Pattern::simple(r"(?:Valheim version[:\s]+)([\w.]+)(?:\s|$)")?)),
		// players are keyed by session id, the name only appears on join
		connect: Some(Box::new(Pattern::new(
			r"(?:Got character ZDOID from )(\w+)(?: : )(-?[0-9]{5,})(?::)",
			2,
			1,
		)?)),
		disconnect: Some(Box::new(Pattern::simple(
			r"(?:Destroying abandoned non persistent zdo -?[0-9]{5,}:\d+ owner )(-?[0-9]{5,})(?:\s|$)",
		)?)),
	})
}

fn factorio() -> Result<DetectorSet, regex::Error> {
	Ok(DetectorSet {
		readiness: Readiness::Line(Box::new(Pattern::simple(r"(Hosting game at IP ADDR)")?)),
		version: Some(Box::new(Pattern::simple(r"(?:Factorio )([\w.]+)(?: \(build)")?)),
		connect: Some(Box::new(Pattern::simple(r"(?:\[JOIN\] )(\w+)(?: joined the game)")?)),
		disconnect: Some(Box::new(Pattern::simple(r"(?:\[LEAVE\] )(\w+)(?: left the game)")?)),
	})
}

const SEED_PATTERN: &str = r"(?:Seed: \[)(-?\d+)(?:\])";
const SEED_TIMEOUT: Duration = Duration::from_secs(10);
const INPUT_WINDOW: Duration = Duration::from_secs(1);

pub const ECHO: CommandSpec = CommandSpec {
	name: "echo",
	help: "Echoes back whatever is given",
	arity: Arity::Optional,
	handler: echo,
};

pub const SEED: CommandSpec = CommandSpec {
	name: "seed",
	help: "Returns the world seed",
	arity: Arity::None,
	handler: seed,
};

pub const INPUT: CommandSpec = CommandSpec {
	name: "input",
	help: "Sends a console command to the server and returns its output",
	arity: Arity::Required,
	handler: input,
};

fn echo(_sup: Arc<Supervisor>, args: Option<String>, reply: Reply) -> BoxFuture<'static, ()> {
	Box::pin(async move {
		reply.notify(Notice::Text(
			args.unwrap_or_else(|| "nothing but silence".to_string()),
		));
	})
}

fn seed(sup: Arc<Supervisor>, _args: Option<String>, reply: Reply) -> BoxFuture<'static, ()> {
	Box::pin(async move {
		let re = match Regex::new(SEED_PATTERN) {
			Ok(re) => re,
			Err(e) => {
				tracing::warn!("bad seed pattern: {}", e);
				return;
			}
		};
		let waiter = sup.broker().pattern_waiter(re, SEED_TIMEOUT);
		if !sup.message_app("seed").await {
			reply.notify(Notice::Text(format!("{} is not running", sup.name())));
			return;
		}
		match waiter.wait().await {
			Some(found) => reply.notify(Notice::Text(format!(
				"{} Seed: {}",
				sup.name(),
				found.get(1).unwrap_or_default()
			))),
			None => reply.notify(Notice::Text(format!("{} did not report a seed", sup.name()))),
		}
	})
}

fn input(sup: Arc<Supervisor>, args: Option<String>, reply: Reply) -> BoxFuture<'static, ()> {
	Box::pin(async move {
		let waiter = match sup.broker().duration_waiter(INPUT_WINDOW) {
			Ok(waiter) => waiter,
			Err(e) => {
				tracing::warn!("input waiter: {}", e);
				return;
			}
		};
		if !sup.message_app(args.as_deref().unwrap_or_default()).await {
			reply.notify(Notice::Text(format!("{} is not running", sup.name())));
			return;
		}
		let output = waiter.wait().await;
		let output = output.trim_end();
		if output.is_empty() {
			reply.notify(Notice::Text(format!("{} gave no response", sup.name())));
		} else {
			reply.notify(Notice::Text(output.to_string()));
		}
	})
}
