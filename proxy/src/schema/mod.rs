pub mod memory;
pub mod post;
pub mod vote;

pub use memory::{MemoryFile, validate_memory};
pub use post::{PostRequest, validate_post_request};
pub use vote::{VoteRequest, validate_vote_request};

/// Accumulates `path: message` fragments across the fields of a single document,
/// per the design note that validators surface one joined string rather than an
/// engine-specific error object.
#[derive(Default)]
pub(crate) struct Errors(Vec<String>);

impl Errors {
	pub(crate) fn push(&mut self, path: &str, message: impl Into<String>) {
		self.0.push(format!("{path}: {}", message.into()));
	}

	pub(crate) fn into_result<T>(self, value: T) -> Result<T, String> {
		if self.0.is_empty() {
			Ok(value)
		} else {
			Err(self.0.join("; "))
		}
	}
}

pub(crate) fn validate_id(errors: &mut Errors, path: &str, value: &str) {
	if value.is_empty() || value.len() > 128 {
		errors.push(path, "must be 1-128 characters");
		return;
	}
	if !value
		.bytes()
		.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
	{
		errors.push(path, "must match ^[A-Za-z0-9_-]+$");
	}
}

pub(crate) fn validate_timestamp(errors: &mut Errors, path: &str, value: &str) {
	if chrono::DateTime::parse_from_rfc3339(value).is_err() {
		errors.push(path, "must be an ISO-8601 UTC timestamp");
	}
}
