use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Errors, validate_id};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostRequest {
	pub content: String,
	#[serde(default)]
	pub thread_id: Option<String>,
	#[serde(default)]
	pub title: Option<String>,
	#[serde(default)]
	pub submolt_name: Option<String>,
}

pub fn validate_post_request(json: &Value) -> Result<PostRequest, String> {
	let parsed: PostRequest = match serde_path_to_error::deserialize(json) {
		Ok(v) => v,
		Err(e) => return Err(format!("{}: {}", e.path(), e.inner())),
	};

	let mut errors = Errors::default();

	if parsed.content.is_empty() || parsed.content.chars().count() > 500 {
		errors.push("content", "must be 1-500 characters");
	}
	if let Some(thread_id) = &parsed.thread_id {
		validate_id(&mut errors, "thread_id", thread_id);
	}
	if let Some(title) = &parsed.title {
		if title.is_empty() || title.chars().count() > 300 {
			errors.push("title", "must be 1-300 characters");
		}
	}
	if let Some(submolt_name) = &parsed.submolt_name {
		if submolt_name.is_empty() || submolt_name.chars().count() > 128 {
			errors.push("submolt_name", "must be 1-128 characters");
		}
	}

	errors.into_result(parsed)
}
