use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Errors, validate_id, validate_timestamp};

static RUN_ID_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^[a-f0-9-]+(-(cp|checkpoint)\d+)?$").unwrap());

const TOPIC_LABELS: &[&str] = &[
	"ai_safety",
	"agent_design",
	"moltbook_meta",
	"social",
	"technical",
	"other",
];
const SENTIMENTS: &[&str] = &["positive", "neutral", "negative"];
const ACTIONS: &[&str] = &["reply", "new_post", "upvote"];

const MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryFile {
	pub version: u64,
	pub run_id: String,
	pub run_start: String,
	pub run_end: String,
	pub entries: Vec<Entry>,
	pub stats: Stats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum Entry {
	#[serde(rename = "post_seen")]
	PostSeen {
		post_id: String,
		timestamp: String,
		topic_label: String,
		sentiment: String,
	},
	#[serde(rename = "post_made")]
	PostMade {
		post_id: String,
		thread_id: String,
		timestamp: String,
		action: String,
	},
	#[serde(rename = "thread_tracked")]
	ThreadTracked {
		thread_id: String,
		topic_label: String,
		first_seen: String,
		last_interaction: String,
	},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stats {
	pub posts_read: u64,
	pub posts_made: u64,
	pub upvotes: u64,
	pub threads_tracked: u64,
}

/// Extracts the checkpoint number from a `run_id` suffix such as `-cp3` or
/// `-checkpoint3`, if present. The memory-file schema has no stored `checkpointNum`
/// field, so this is always derived on demand from a single place rather than cached
/// or computed inconsistently across call sites.
pub fn checkpoint_num(run_id: &str) -> Option<u32> {
	let (_, suffix) = run_id.rsplit_once('-')?;
	let digits = suffix
		.strip_prefix("checkpoint")
		.or_else(|| suffix.strip_prefix("cp"))?;
	digits.parse().ok()
}

pub fn validate_memory(json: &Value) -> Result<MemoryFile, String> {
	let parsed: MemoryFile = match serde_path_to_error::deserialize(json) {
		Ok(v) => v,
		Err(e) => return Err(format!("{}: {}", e.path(), e.inner())),
	};

	let mut errors = Errors::default();

	if parsed.version != 1 {
		errors.push("version", "must be the literal integer 1");
	}
	if parsed.run_id.len() > 128 || !RUN_ID_RE.is_match(&parsed.run_id) {
		errors.push(
			"run_id",
			r"must match ^[a-f0-9-]+(-(cp|checkpoint)\d+)?$ and be <=128 chars",
		);
	}
	validate_timestamp(&mut errors, "run_start", &parsed.run_start);
	validate_timestamp(&mut errors, "run_end", &parsed.run_end);

	if parsed.entries.len() > MAX_ENTRIES {
		errors.push("entries", format!("must have at most {MAX_ENTRIES} elements"));
	}

	for (i, entry) in parsed.entries.iter().enumerate() {
		let prefix = format!("entries[{i}]");
		match entry {
			Entry::PostSeen {
				post_id,
				timestamp,
				topic_label,
				sentiment,
			} => {
				validate_id(&mut errors, &format!("{prefix}.post_id"), post_id);
				validate_timestamp(&mut errors, &format!("{prefix}.timestamp"), timestamp);
				if !TOPIC_LABELS.contains(&topic_label.as_str()) {
					errors.push(&format!("{prefix}.topic_label"), "not a recognized topic label");
				}
				if !SENTIMENTS.contains(&sentiment.as_str()) {
					errors.push(&format!("{prefix}.sentiment"), "not a recognized sentiment");
				}
			},
			Entry::PostMade {
				post_id,
				thread_id,
				timestamp,
				action,
			} => {
				validate_id(&mut errors, &format!("{prefix}.post_id"), post_id);
				validate_id(&mut errors, &format!("{prefix}.thread_id"), thread_id);
				validate_timestamp(&mut errors, &format!("{prefix}.timestamp"), timestamp);
				if !ACTIONS.contains(&action.as_str()) {
					errors.push(&format!("{prefix}.action"), "not a recognized action");
				}
			},
			Entry::ThreadTracked {
				thread_id,
				topic_label,
				first_seen,
				last_interaction,
			} => {
				validate_id(&mut errors, &format!("{prefix}.thread_id"), thread_id);
				if !TOPIC_LABELS.contains(&topic_label.as_str()) {
					errors.push(&format!("{prefix}.topic_label"), "not a recognized topic label");
				}
				validate_timestamp(&mut errors, &format!("{prefix}.first_seen"), first_seen);
				validate_timestamp(&mut errors, &format!("{prefix}.last_interaction"), last_interaction);
			},
		}
	}

	errors.into_result(parsed)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn valid_doc() -> Value {
		json!({
			"version": 1,
			"run_id": "550e8400-e29b-41d4-a716-446655440000",
			"run_start": "2026-01-01T00:00:00Z",
			"run_end": "2026-01-01T01:00:00Z",
			"entries": [
				{"type":"post_seen","post_id":"p1","timestamp":"2026-01-01T00:01:00Z","topic_label":"other","sentiment":"neutral"}
			],
			"stats": {"posts_read":1,"posts_made":0,"upvotes":0,"threads_tracked":0}
		})
	}

	#[test]
	fn accepts_valid_document() {
		assert!(validate_memory(&valid_doc()).is_ok());
	}

	#[test]
	fn rejects_unknown_top_level_field() {
		let mut doc = valid_doc();
		doc.as_object_mut().unwrap().insert("extra".into(), json!(true));
		assert!(validate_memory(&doc).is_err());
	}

	#[test]
	fn rejects_bad_run_id() {
		let mut doc = valid_doc();
		doc["run_id"] = json!("has spaces!");
		let err = validate_memory(&doc).unwrap_err();
		assert!(err.contains("run_id"));
	}

	#[test]
	fn rejects_unknown_variant_tag() {
		let mut doc = valid_doc();
		doc["entries"] = json!([{"type":"post_deleted","post_id":"p1"}]);
		assert!(validate_memory(&doc).is_err());
	}

	#[test]
	fn accepts_checkpoint_suffixed_run_id() {
		let mut doc = valid_doc();
		doc["run_id"] = json!("550e8400-e29b-41d4-a716-446655440000-cp3");
		assert!(validate_memory(&doc).is_ok());
		assert_eq!(
			checkpoint_num("550e8400-e29b-41d4-a716-446655440000-cp3"),
			Some(3)
		);
	}

	#[test]
	fn rejects_too_many_entries() {
		let mut doc = valid_doc();
		let entry = json!({"type":"post_seen","post_id":"p1","timestamp":"2026-01-01T00:01:00Z","topic_label":"other","sentiment":"neutral"});
		doc["entries"] = Value::Array(vec![entry; 10_001]);
		assert!(validate_memory(&doc).is_err());
	}
}
