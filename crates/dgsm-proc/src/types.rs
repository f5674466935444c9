use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
	Idle,
	Starting,
	Running,
	Stopping,
}

impl Lifecycle {
	/// True while an OS process belongs to this run.
	pub fn is_active(&self) -> bool {
		!matches!(self, Lifecycle::Idle)
	}
}

/// What to launch and how to describe it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppDef {
	pub name: String,
	pub argv: Vec<String>,
	/// Free-form details shown in status output, e.g. `endpoint`, `password`.
	#[serde(default)]
	pub app_info: BTreeMap<String, String>,
	/// Launch inside a separate terminal window through the relay.
	#[serde(default)]
	pub new_console: bool,
}

/// Summary of one application for remote listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSnapshot {
	pub name: String,
	pub commands: Vec<String>,
	pub status: String,
	pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
	Text(String),
	Status(AppSnapshot),
}

impl Notice {
	pub fn text(text: impl Into<String>) -> Self {
		Notice::Text(text.into())
	}

	pub fn as_text(&self) -> Option<&str> {
		match self {
			Notice::Text(text) => Some(text),
			Notice::Status(_) => None,
		}
	}
}

/// Destination for notifications produced while serving a command.
pub trait Notify: Send + Sync {
	fn notify(&self, notice: Notice);
}

pub type Reply = Arc<dyn Notify>;

impl Notify for mpsc::UnboundedSender<Notice> {
	fn notify(&self, notice: Notice) {
		if self.send(notice).is_err() {
			tracing::debug!("notice receiver dropped");
		}
	}
}

/// A reply sink that discards everything.
pub struct Discard;

impl Notify for Discard {
	fn notify(&self, _notice: Notice) {}
}
