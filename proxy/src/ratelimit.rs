use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// One named window: a cap and a horizon, e.g. "3 per hour".
#[derive(Debug, Clone, Copy)]
struct WindowSpec {
	cap: usize,
	horizon: Duration,
}

const POST_HOURLY: WindowSpec = WindowSpec {
	cap: 3,
	horizon: Duration::from_secs(3600),
};
const POST_DAILY: WindowSpec = WindowSpec {
	cap: 10,
	horizon: Duration::from_secs(24 * 3600),
};
const VOTE_HOURLY: WindowSpec = WindowSpec {
	cap: 20,
	horizon: Duration::from_secs(3600),
};

fn spec_for(key: &str) -> WindowSpec {
	match key {
		"post_hourly" => POST_HOURLY,
		"post_daily" => POST_DAILY,
		"vote_hourly" => VOTE_HOURLY,
		other => panic!("unknown rate-limit window: {other}"),
	}
}

pub struct Decision {
	pub allowed: bool,
	pub reason: Option<String>,
}

/// A single window's acceptance timestamps, process-wide and cleared on restart.
/// Append and prune are always done together under the window's own mutex —
/// operations on a window are mutually exclusive, but windows never block each other.
struct Window {
	spec: WindowSpec,
	timestamps: Mutex<Vec<Instant>>,
}

impl Window {
	fn new(spec: WindowSpec) -> Self {
		Window {
			spec,
			timestamps: Mutex::new(Vec::new()),
		}
	}

	fn prune(timestamps: &mut Vec<Instant>, horizon: Duration, now: Instant) {
		timestamps.retain(|t| now.duration_since(*t) < horizon);
	}

	fn check(&self, key: &str, now: Instant) -> Decision {
		let mut timestamps = self.timestamps.lock();
		Self::prune(&mut timestamps, self.spec.horizon, now);
		if timestamps.len() < self.spec.cap {
			Decision {
				allowed: true,
				reason: None,
			}
		} else {
			Decision {
				allowed: false,
				reason: Some(format!(
					"Rate limit exceeded: {key} ({} per {}h)",
					self.spec.cap,
					self.spec.horizon.as_secs() / 3600
				)),
			}
		}
	}

	fn record(&self, now: Instant) {
		let mut timestamps = self.timestamps.lock();
		Self::prune(&mut timestamps, self.spec.horizon, now);
		timestamps.push(now);
	}
}

/// In-memory sliding-window rate limiter keyed by action class. Shared across
/// connection handlers behind an `Arc`; each window's state is independent so
/// checking `post_hourly` never contends with `vote_hourly`.
pub struct RateLimiter {
	windows: HashMap<&'static str, Window>,
}

impl RateLimiter {
	pub fn new() -> Self {
		let mut windows = HashMap::new();
		windows.insert("post_hourly", Window::new(POST_HOURLY));
		windows.insert("post_daily", Window::new(POST_DAILY));
		windows.insert("vote_hourly", Window::new(VOTE_HOURLY));
		RateLimiter { windows }
	}

	fn window(&self, key: &str) -> &Window {
		self
			.windows
			.get(key)
			.unwrap_or_else(|| panic!("unknown rate-limit window: {key}"))
	}

	/// Non-mutating: does not consume quota, only reports whether the next
	/// admission would succeed.
	pub fn check(&self, key: &str) -> Decision {
		let _ = spec_for(key);
		self.window(key).check(key, Instant::now())
	}

	/// Records one acceptance against `key`. Callers only call this after a
	/// successful upstream response — denied, failed, and sanitized requests
	/// never consume quota.
	pub fn record(&self, key: &str) {
		self.window(key).record(Instant::now());
	}

	/// Consults both `post_hourly` and `post_daily`; a failure of either denies
	/// without recording anything.
	pub fn check_post(&self) -> Decision {
		let hourly = self.check("post_hourly");
		if !hourly.allowed {
			return hourly;
		}
		self.check("post_daily")
	}

	/// Records both post windows; called only after a successful upstream call.
	pub fn record_post(&self) {
		self.record("post_hourly");
		self.record("post_daily");
	}
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new()
	}
}
