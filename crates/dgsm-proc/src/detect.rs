//! Inferring application state from console output.

use regex::{Regex, RegexBuilder};
use std::time::Duration;

/// Something a matcher pulled out of a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
	/// Identity of the thing detected, e.g. a player's session id.
	pub key: String,
	/// Human readable value, e.g. a player name or a version string.
	pub value: String,
}

pub trait Detector: Send + Sync {
	fn detect(&self, line: &str) -> Option<Detected>;
}

/// Case-insensitive regex detector reading key and value from capture groups.
pub struct Pattern {
	re: Regex,
	key: usize,
	value: usize,
}

impl Pattern {
	pub fn new(pattern: &str, key: usize, value: usize) -> Result<Self, regex::Error> {
		let re = RegexBuilder::new(pattern).case_insensitive(true).build()?;
		Ok(Self { re, key, value })
	}

	/// Key and value both taken from group 1.
	pub fn simple(pattern: &str) -> Result<Self, regex::Error> {
		Self::new(pattern, 1, 1)
	}
}

impl Detector for Pattern {
	fn detect(&self, line: &str) -> Option<Detected> {
		let caps = self.re.captures(line)?;
		let group = |idx: usize| caps.get(idx).map(|m| m.as_str().to_string()).unwrap_or_default();
		Some(Detected {
			key: group(self.key),
			value: group(self.value),
		})
	}
}

pub enum Readiness {
	/// Ready once a line matches.
	Line(Box<dyn Detector>),
	/// Ready after a fixed delay, if the process is still alive.
	After(Duration),
}

/// Per-run state derived from output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppState {
	pub online: bool,
	pub version: Option<String>,
	/// Connected players as `(key, name)`, in join order.
	pub players: Vec<(String, String)>,
}

impl AppState {
	pub fn player_names(&self) -> Vec<&str> {
		self.players.iter().map(|(_, name)| name.as_str()).collect()
	}
}

/// The matchers that interpret one kind of application.
pub struct DetectorSet {
	pub readiness: Readiness,
	pub version: Option<Box<dyn Detector>>,
	pub connect: Option<Box<dyn Detector>>,
	pub disconnect: Option<Box<dyn Detector>>,
}

impl DetectorSet {
	/// Ready a fixed delay after launch, nothing else tracked.
	pub fn delayed(delay: Duration) -> Self {
		Self {
			readiness: Readiness::After(delay),
			version: None,
			connect: None,
			disconnect: None,
		}
	}

	/// Whether readiness comes from the output rather than a timer.
	pub fn announces_ready(&self) -> bool {
		matches!(self.readiness, Readiness::Line(_))
	}

	pub fn tracks_players(&self) -> bool {
		self.connect.is_some()
	}

	/// Apply the first matcher that fires on `line`. Returns true if the line
	/// marked the application ready.
	pub fn inspect(&self, line: &str, state: &mut AppState) -> bool {
		if let Some(found) = self.version.as_ref().and_then(|d| d.detect(line)) {
			tracing::debug!("detected version {}", found.value);
			state.version = Some(found.value);
			return false;
		}
		if let Readiness::Line(detector) = &self.readiness {
			if detector.detect(line).is_some() {
				state.online = true;
				return true;
			}
		}
		if let Some(found) = self.connect.as_ref().and_then(|d| d.detect(line)) {
			tracing::info!("player {} connected", found.value);
			state.players.retain(|(key, _)| *key != found.key);
			state.players.push((found.key, found.value));
			return false;
		}
		if let Some(found) = self.disconnect.as_ref().and_then(|d| d.detect(line)) {
			state.players.retain(|(key, _)| *key != found.key);
			tracing::info!("player {} disconnected", found.key);
		}
		false
	}

	/// Refuse to stop while players are connected.
	pub fn stop_ok(&self, name: &str, state: &AppState) -> Result<(), String> {
		if self.tracks_players() && !state.players.is_empty() {
			return Err(format!("Cannot stop {} with players connected", name));
		}
		Ok(())
	}
}
