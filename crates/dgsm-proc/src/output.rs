use parking_lot::Mutex;
use std::sync::{Arc, Weak};

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Registry {
	next_key: u64,
	subscribers: Vec<(u64, Callback)>,
}

/// Fans each output line out to every current subscriber.
///
/// Delivery is synchronous and in subscription order. Callbacks run over a
/// snapshot of the registry, so a callback may cancel its own subscription (or
/// any other) while a line is being dispatched.
#[derive(Clone, Default)]
pub struct OutputBroker {
	registry: Arc<Mutex<Registry>>,
}

impl OutputBroker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe<F>(&self, callback: F) -> Subscription
	where
		F: Fn(&str) + Send + Sync + 'static,
	{
		let mut registry = self.registry.lock();
		let key = registry.next_key;
		registry.next_key += 1;
		registry.subscribers.push((key, Arc::new(callback)));
		Subscription {
			key,
			registry: Arc::downgrade(&self.registry),
		}
	}

	pub fn publish(&self, line: &str) {
		let snapshot: Vec<Callback> = self
			.registry
			.lock()
			.subscribers
			.iter()
			.map(|(_, cb)| Arc::clone(cb))
			.collect();
		for callback in snapshot {
			callback(line);
		}
	}

	/// Drop every subscription at once.
	pub fn clear(&self) {
		let dropped = std::mem::take(&mut self.registry.lock().subscribers);
		drop(dropped);
	}

	pub fn len(&self) -> usize {
		self.registry.lock().subscribers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Handle to a registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
	key: u64,
	registry: Weak<Mutex<Registry>>,
}

impl Subscription {
	pub fn cancel(self) {}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		let Some(registry) = self.registry.upgrade() else {
			return;
		};
		let removed = {
			let mut registry = registry.lock();
			registry
				.subscribers
				.iter()
				.position(|(key, _)| *key == self.key)
				.map(|idx| registry.subscribers.remove(idx))
		};
		drop(removed);
	}
}
