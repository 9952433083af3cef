use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Errors, validate_id};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoteRequest {
	pub post_id: String,
}

pub fn validate_vote_request(json: &Value) -> Result<VoteRequest, String> {
	let parsed: VoteRequest = match serde_path_to_error::deserialize(json) {
		Ok(v) => v,
		Err(e) => return Err(format!("{}: {}", e.path(), e.inner())),
	};

	let mut errors = Errors::default();
	validate_id(&mut errors, "post_id", &parsed.post_id);
	errors.into_result(parsed)
}
