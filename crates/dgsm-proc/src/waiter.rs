//! One-shot waiters over live output.
//!
//! Each waiter registers a subscription on an [`OutputBroker`], accumulates lines
//! (each terminated with `\n`) according to its completion policy, and resolves
//! exactly once. A timeout of [`Duration::ZERO`] means wait indefinitely. When the
//! broker is cleared (the process ended) a pending waiter resolves right away
//! with whatever its timeout would have produced.

use parking_lot::Mutex;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::output::{OutputBroker, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaiterError {
	#[error("line count must be at least 1")]
	ZeroCount,
	#[error("duration must be greater than zero")]
	ZeroDuration,
	#[error("substring must not be empty")]
	EmptySubstring,
}

/// A successful pattern match, detached from the line it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
	pub line: String,
	groups: Vec<Option<String>>,
}

impl PatternMatch {
	fn new(re: &Regex, line: &str) -> Option<Self> {
		let caps = re.captures(line)?;
		Some(Self {
			line: line.to_string(),
			groups: caps
				.iter()
				.map(|m| m.map(|m| m.as_str().to_string()))
				.collect(),
		})
	}

	/// The whole matched text.
	pub fn as_str(&self) -> &str {
		self.get(0).unwrap_or_default()
	}

	pub fn get(&self, idx: usize) -> Option<&str> {
		self.groups.get(idx).and_then(|g| g.as_deref())
	}
}

type Finish<T> = Box<dyn FnOnce(bool) -> T + Send>;

/// Pending result of a waiter. Dropping it unsubscribes.
pub struct Waiter<T> {
	done: oneshot::Receiver<()>,
	timeout: Option<Duration>,
	subscription: Subscription,
	finish: Finish<T>,
}

impl<T> Waiter<T> {
	fn new(
		done: oneshot::Receiver<()>,
		timeout: Duration,
		subscription: Subscription,
		finish: impl FnOnce(bool) -> T + Send + 'static,
	) -> Self {
		Self {
			done,
			timeout: (!timeout.is_zero()).then_some(timeout),
			subscription,
			finish: Box::new(finish),
		}
	}

	pub async fn wait(self) -> T {
		let Waiter {
			done,
			timeout,
			subscription,
			finish,
		} = self;
		let resolved = match timeout {
			Some(limit) => matches!(tokio::time::timeout(limit, done).await, Ok(Ok(()))),
			None => done.await.is_ok(),
		};
		subscription.cancel();
		finish(resolved)
	}
}

struct Signal(Mutex<Option<oneshot::Sender<()>>>);

impl Signal {
	fn new() -> (Self, oneshot::Receiver<()>) {
		let (tx, rx) = oneshot::channel();
		(Self(Mutex::new(Some(tx))), rx)
	}

	fn fire(&self) {
		if let Some(tx) = self.0.lock().take() {
			let _ = tx.send(());
		}
	}
}

#[derive(Default)]
struct Collected {
	text: String,
	lines: usize,
	matched: bool,
}

impl Collected {
	fn push(&mut self, line: &str) {
		self.text.push_str(line);
		self.text.push('\n');
		self.lines += 1;
	}
}

impl OutputBroker {
	/// Resolve after `n` lines with exactly those lines.
	///
	/// On timeout, returns the lines seen so far if `return_partial`, else an
	/// empty string.
	pub fn count_waiter(
		&self,
		n: usize,
		return_partial: bool,
		timeout: Duration,
	) -> Result<Waiter<String>, WaiterError> {
		if n == 0 {
			return Err(WaiterError::ZeroCount);
		}
		let (signal, done) = Signal::new();
		let collected = Arc::new(Mutex::new(Collected::default()));
		let sink = Arc::clone(&collected);
		let subscription = self.subscribe(move |line| {
			let mut c = sink.lock();
			if c.lines >= n {
				return;
			}
			c.push(line);
			if c.lines == n {
				signal.fire();
			}
		});
		Ok(Waiter::new(done, timeout, subscription, move |resolved| {
			let c = collected.lock();
			if resolved || return_partial {
				c.text.clone()
			} else {
				String::new()
			}
		}))
	}

	/// Collect every line seen during `duration`.
	pub fn duration_waiter(&self, duration: Duration) -> Result<Waiter<String>, WaiterError> {
		if duration.is_zero() {
			return Err(WaiterError::ZeroDuration);
		}
		let (signal, done) = Signal::new();
		let collected = Arc::new(Mutex::new(Collected::default()));
		let sink = Arc::clone(&collected);
		let subscription = self.subscribe(move |line| {
			// never fired; held so a cleared broker ends the window early
			let _keep = &signal;
			sink.lock().push(line);
		});
		Ok(Waiter::new(done, duration, subscription, move |_| {
			collected.lock().text.clone()
		}))
	}

	/// Resolve on the first line containing `needle`.
	///
	/// With `aggregate`, the result holds every line up to and including the
	/// matching one; otherwise only the matching line.
	pub fn substring_waiter(
		&self,
		needle: &str,
		aggregate: bool,
		return_partial: bool,
		timeout: Duration,
	) -> Result<Waiter<String>, WaiterError> {
		if needle.is_empty() {
			return Err(WaiterError::EmptySubstring);
		}
		let needle = needle.to_string();
		let (signal, done) = Signal::new();
		let collected = Arc::new(Mutex::new(Collected::default()));
		let sink = Arc::clone(&collected);
		let subscription = self.subscribe(move |line| {
			let mut c = sink.lock();
			if c.matched {
				return;
			}
			let hit = line.contains(needle.as_str());
			if aggregate || hit {
				c.push(line);
			}
			if hit {
				c.matched = true;
				signal.fire();
			}
		});
		Ok(Waiter::new(done, timeout, subscription, move |resolved| {
			let c = collected.lock();
			if resolved || return_partial {
				c.text.clone()
			} else {
				String::new()
			}
		}))
	}

	/// Resolve on the first line matching `pattern`.
	pub fn pattern_waiter(
		&self,
		pattern: Regex,
		timeout: Duration,
	) -> Waiter<Option<PatternMatch>> {
		let (signal, done) = Signal::new();
		let found: Arc<Mutex<Option<PatternMatch>>> = Arc::new(Mutex::new(None));
		let sink = Arc::clone(&found);
		let subscription = self.subscribe(move |line| {
			let mut slot = sink.lock();
			if slot.is_some() {
				return;
			}
			if let Some(m) = PatternMatch::new(&pattern, line) {
				*slot = Some(m);
				signal.fire();
			}
		});
		Waiter::new(done, timeout, subscription, move |resolved| {
			if resolved {
				found.lock().take()
			} else {
				None
			}
		})
	}
}
