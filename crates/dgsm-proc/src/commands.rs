use futures::future::BoxFuture;
use std::sync::Arc;

use crate::supervisor::Supervisor;
use crate::types::Reply;

pub type Handler = fn(Arc<Supervisor>, Option<String>, Reply) -> BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
	None,
	Optional,
	Required,
}

impl Arity {
	pub fn accepts(&self, has_args: bool) -> bool {
		match self {
			Arity::None => !has_args,
			Arity::Optional => true,
			Arity::Required => has_args,
		}
	}
}

/// One entry in an application's command table.
#[derive(Clone, Copy)]
pub struct CommandSpec {
	pub name: &'static str,
	pub help: &'static str,
	pub arity: Arity,
	pub handler: Handler,
}

impl std::fmt::Debug for CommandSpec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CommandSpec")
			.field("name", &self.name)
			.field("arity", &self.arity)
			.finish()
	}
}

/// User-facing command failures. None of them change any state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
	#[error("'{0}' is not a recognized application")]
	UnknownApplication(String),
	#[error("{app} does not support the command '{cmd}'")]
	Unsupported { app: String, cmd: String },
	#[error("Incorrect number of arguments were given for {0}")]
	ArityMismatch(String),
	#[error("Must specify an application with '{0}'")]
	MissingApplication(String),
	#[error("Unknown command '{0}'. Try 'help' for more information")]
	UnknownCommand(String),
	#[error("Sorry, I do not understand")]
	Malformed,
}

pub const START: CommandSpec = CommandSpec {
	name: "start",
	help: "Start the application",
	arity: Arity::None,
	handler: start,
};

pub const STOP: CommandSpec = CommandSpec {
	name: "stop",
	help: "Stop the application",
	arity: Arity::None,
	handler: stop,
};

pub const STATUS: CommandSpec = CommandSpec {
	name: "status",
	help: "Returns the status of the application",
	arity: Arity::None,
	handler: status,
};

pub const HELP: CommandSpec = CommandSpec {
	name: "help",
	help: "Displays this help message",
	arity: Arity::None,
	handler: help,
};

/// Commands every application supports.
pub const BASE: &[CommandSpec] = &[START, STOP, STATUS, HELP];

fn start(sup: Arc<Supervisor>, _args: Option<String>, reply: Reply) -> BoxFuture<'static, ()> {
	Box::pin(async move { sup.start(reply).await })
}

fn stop(sup: Arc<Supervisor>, _args: Option<String>, reply: Reply) -> BoxFuture<'static, ()> {
	Box::pin(async move { sup.stop(reply).await })
}

fn status(sup: Arc<Supervisor>, _args: Option<String>, reply: Reply) -> BoxFuture<'static, ()> {
	Box::pin(async move { reply.notify(crate::Notice::Text(sup.status_report())) })
}

fn help(sup: Arc<Supervisor>, _args: Option<String>, reply: Reply) -> BoxFuture<'static, ()> {
	Box::pin(async move { reply.notify(crate::Notice::Text(help_text(sup.name(), sup.commands()))) })
}

pub fn help_text(name: &str, commands: &[CommandSpec]) -> String {
	let mut msg = format!("{} Supported Commands:\n", name);
	for spec in commands {
		msg.push_str(&format!("  {} - {}\n", spec.name, spec.help));
	}
	msg
}
