use std::path::PathBuf;

const APP: &str = "dgsm";

/// Per-user locations for the config file and the log.
#[derive(Debug, Clone)]
pub struct AppPaths {
	state_dir: PathBuf,
	config_dir: PathBuf,
}

impl AppPaths {
	pub fn from_env() -> Self {
		Self::resolve(|key| std::env::var(key).ok())
	}

	fn resolve(env: impl Fn(&str) -> Option<String>) -> Self {
		let home = env("HOME").map(PathBuf::from);
		let base = |xdg: &str, under_home: &[&str]| -> PathBuf {
			match (env(xdg), &home) {
				(Some(dir), _) if !dir.is_empty() => PathBuf::from(dir),
				(_, Some(home)) => under_home.iter().fold(home.clone(), |p, part| p.join(part)),
				_ => std::env::temp_dir(),
			}
		};
		Self {
			state_dir: base("XDG_STATE_HOME", &[".local", "state"]).join(APP),
			config_dir: base("XDG_CONFIG_HOME", &[".config"]).join(APP),
		}
	}

	pub fn state_dir(&self) -> &PathBuf {
		&self.state_dir
	}

	pub fn config_dir(&self) -> &PathBuf {
		&self.config_dir
	}

	pub fn log_path(&self) -> PathBuf {
		self.state_dir.join(format!("{}.log", APP))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn paths(vars: &[(&str, &str)]) -> AppPaths {
		let vars: HashMap<String, String> = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		AppPaths::resolve(|key| vars.get(key).cloned())
	}

	#[test]
	fn xdg_vars_win() {
		let p = paths(&[
			("HOME", "/home/sam"),
			("XDG_STATE_HOME", "/var/state"),
			("XDG_CONFIG_HOME", "/etc/xdg"),
		]);
		assert_eq!(p.state_dir(), &PathBuf::from("/var/state/dgsm"));
		assert_eq!(p.config_dir(), &PathBuf::from("/etc/xdg/dgsm"));
		assert_eq!(p.log_path(), PathBuf::from("/var/state/dgsm/dgsm.log"));
	}

	#[test]
	fn falls_back_to_home() {
		let p = paths(&[("HOME", "/home/sam"), ("XDG_STATE_HOME", "")]);
		assert_eq!(p.state_dir(), &PathBuf::from("/home/sam/.local/state/dgsm"));
		assert_eq!(p.config_dir(), &PathBuf::from("/home/sam/.config/dgsm"));
	}

	#[test]
	fn no_home_uses_temp() {
		let p = paths(&[]);
		assert_eq!(p.config_dir(), &std::env::temp_dir().join("dgsm"));
	}
}
