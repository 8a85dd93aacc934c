use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Cooperative deadline carried by foreground requests.
///
/// Long-running loops poll `expired()` and stop early, returning whatever
/// they have so far flagged as partial.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
	at: Option<Instant>,
}

impl Deadline {
	pub fn none() -> Self {
		Self { at: None }
	}

	pub fn after(budget: Duration) -> Self {
		Self {
			at: Some(Instant::now() + budget),
		}
	}

	pub fn after_ms(ms: u64) -> Self {
		Self::after(Duration::from_millis(ms))
	}

	pub fn expired(&self) -> bool {
		match self.at {
			Some(at) => Instant::now() >= at,
			None => false,
		}
	}
}

impl Default for Deadline {
	fn default() -> Self {
		Self::none()
	}
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}
