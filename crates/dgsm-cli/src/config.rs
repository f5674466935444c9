use dgsm_link::Role;
use dgsm_proc::TeeConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const FILE_NAME: &str = "dgsm.toml";

pub const TEMPLATE: &str = r#"# dgsm configuration

# Link to the remote controller. With role = "listen" dgsm waits for the
# controller to connect to address:port; with role = "dial" it connects out.
address = "localhost"
port = 8888
role = "listen"
reconnect_secs = 5

# Applications started as soon as dgsm launches.
default_apps = []

# Run by the `sleep` command once every application has stopped.
# sleep_command = "shutdown -h now"

# Applications with opts.new_console = true open in their own terminal.
# [tee]
# terminal = ["xterm", "-T", "{name}", "-e"]

[apps.valheim]
# Required: executable path, or a full command line as a list.
prg = "/opt/valheim/start_server.sh"
# Optional: minecraft, valheim, factorio. Anything else uses the default
# behaviour (ready after a few seconds, no output parsing).
id = "valheim"

[apps.valheim.app_info]
endpoint = "play.example.net:2456"
password = "changeme"

[apps.valheim.opts]
new_console = false
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	#[serde(default = "default_address")]
	pub address: String,
	#[serde(default = "default_port")]
	pub port: u16,
	#[serde(default)]
	pub role: Role,
	#[serde(default = "default_reconnect_secs")]
	pub reconnect_secs: u64,
	#[serde(default)]
	pub default_apps: Vec<String>,
	pub sleep_command: Option<String>,
	#[serde(default)]
	pub tee: TeeConfig,
	#[serde(default)]
	pub apps: BTreeMap<String, AppEntry>,
}

impl Config {
	pub fn link_addr(&self) -> String {
		format!("{}:{}", self.address, self.port)
	}
}

fn default_address() -> String {
	"localhost".into()
}
fn default_port() -> u16 {
	8888
}
fn default_reconnect_secs() -> u64 {
	5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppEntry {
	pub prg: Option<Program>,
	pub id: Option<String>,
	#[serde(default)]
	pub app_info: BTreeMap<String, String>,
	#[serde(default)]
	pub opts: AppOpts,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppOpts {
	#[serde(default)]
	pub new_console: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Program {
	/// Path to an executable or start script, run without arguments.
	Path(String),
	Argv(Vec<String>),
}

impl Program {
	pub fn argv(&self) -> Vec<String> {
		match self {
			Program::Path(path) => vec![path.clone()],
			Program::Argv(argv) => argv.clone(),
		}
	}

	pub fn is_empty(&self) -> bool {
		match self {
			Program::Path(path) => path.trim().is_empty(),
			Program::Argv(argv) => argv.is_empty(),
		}
	}
}

#[derive(Debug, PartialEq)]
pub enum Located {
	Found(PathBuf),
	/// No config existed; a template was written here.
	Created(PathBuf),
}

/// Find the config file: an explicit path, then `./dgsm.toml`, then the user
/// config directory. Writes a template into the config directory if none
/// exists.
pub fn locate(explicit: Option<&Path>, cwd: &Path, config_dir: &Path) -> Result<Located, String> {
	if let Some(path) = explicit {
		if path.is_file() {
			return Ok(Located::Found(path.to_path_buf()));
		}
		return Err(format!("Unable to locate config file: '{}'", path.display()));
	}
	for candidate in [cwd.join(FILE_NAME), config_dir.join(FILE_NAME)] {
		if candidate.is_file() {
			return Ok(Located::Found(candidate));
		}
	}
	let target = config_dir.join(FILE_NAME);
	std::fs::create_dir_all(config_dir)
		.and_then(|_| std::fs::write(&target, TEMPLATE))
		.map_err(|e| format!("failed to write {}: {}", target.display(), e))?;
	Ok(Located::Created(target))
}

pub fn load(path: &Path) -> Result<Config, String> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
	parse(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

pub fn parse(content: &str) -> Result<Config, String> {
	let config: Config = toml::from_str(content).map_err(|e| e.to_string())?;
	if config.apps.is_empty() {
		return Err(format!(
			"no applications configured; add an [apps.<name>] table (see the template '{}')",
			FILE_NAME
		));
	}
	Ok(config)
}
