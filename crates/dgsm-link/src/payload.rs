use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The message exchanged between the manager and its remote controller.
///
/// Every field is optional; a payload may carry a notification, a command, an
/// application summary, or any mix of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
	/// Opaque correlation data, echoed back on every reply to a command.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub context: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_cmd: Option<UserCmd>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub app_info: Option<BTreeMap<String, AppInfo>>,
	/// Asks the receiver to answer with `app_info`.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub app_info_req: bool,
}

impl Payload {
	pub fn message(text: impl Into<String>) -> Self {
		Self {
			message: Some(text.into()),
			..Self::default()
		}
	}

	pub fn app_info(apps: BTreeMap<String, AppInfo>) -> Self {
		Self {
			app_info: Some(apps),
			..Self::default()
		}
	}

	pub fn with_context(mut self, context: Option<Value>) -> Self {
		self.context = context;
		self
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCmd {
	pub cmd: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub app: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub args: Option<String>,
}

impl UserCmd {
	pub fn new(cmd: impl Into<String>) -> Self {
		Self {
			cmd: cmd.into(),
			app: None,
			args: None,
		}
	}

	pub fn app(mut self, app: impl Into<String>) -> Self {
		self.app = Some(app.into());
		self
	}

	pub fn args(mut self, args: impl Into<String>) -> Self {
		self.args = Some(args.into());
		self
	}
}

/// Summary of one supervised application, as shown to the remote controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
	pub name: String,
	pub commands: Vec<String>,
	pub status: String,
	pub id: String,
}
