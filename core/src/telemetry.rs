use std::time::Instant;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Recorded at process start so uptime can be reported without a wall-clock dependency.
pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Initializes the operational tracing subscriber. Call once, at process start.
///
/// Controlled by `RUST_LOG` (default `info`). This is separate from the audit
/// trail: the audit log is a compliance record and is never gated by a filter.
pub fn init() {
	Lazy::force(&APPLICATION_START_TIME);
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::registry()
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_target(true)
				.with_ansi(false)
				.with_span_events(FmtSpan::NONE),
		)
		.init();
}

pub fn uptime_seconds() -> u64 {
	APPLICATION_START_TIME.elapsed().as_secs()
}
