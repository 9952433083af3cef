use std::io::Write;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Map, Value, json};

/// Appends one JSON object per line to a sink. Writes are serialized behind a
/// mutex so whole records never interleave, matching the teacher's separation
/// of operational `tracing` diagnostics from an always-on structured sink —
/// this one is the compliance trail, not best-effort logging, so it is never
/// gated by a filter level.
pub struct AuditLogger {
	sink: Mutex<Box<dyn Write + Send>>,
}

impl AuditLogger {
	pub fn stdout() -> Self {
		AuditLogger {
			sink: Mutex::new(Box::new(std::io::stdout())),
		}
	}

	#[cfg(test)]
	pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
		AuditLogger {
			sink: Mutex::new(sink),
		}
	}

	/// Emits one audit record. `timestamp` is stamped with "now" in ISO-8601
	/// UTC with millisecond precision if the caller omitted it.
	pub fn log(&self, mut record: Map<String, Value>) {
		record
			.entry("timestamp")
			.or_insert_with(|| json!(now_iso8601()));
		self.write_line(&Value::Object(record));
	}

	/// Emits an error record: `level: "error"`, plus `error_name`/`error_message`
	/// and a stack-trace field when an error is supplied. Internal detail goes
	/// here rather than leaking to the client response.
	pub fn log_error(&self, message: &str, err: Option<&anyhow::Error>) {
		let mut record = Map::new();
		record.insert("timestamp".to_string(), json!(now_iso8601()));
		record.insert("level".to_string(), json!("error"));
		record.insert("message".to_string(), json!(message));
		if let Some(err) = err {
			record.insert("error_name".to_string(), json!(error_name(err)));
			record.insert("error_message".to_string(), json!(err.to_string()));
			record.insert("stack".to_string(), json!(format!("{err:?}")));
		}
		self.write_line(&Value::Object(record));
	}

	fn write_line(&self, value: &Value) {
		let mut line = serde_json::to_vec(value).expect("audit record must serialize");
		line.push(b'\n');
		let mut sink = self.sink.lock().expect("audit sink mutex poisoned");
		let _ = sink.write_all(&line);
		let _ = sink.flush();
	}
}

fn error_name(err: &anyhow::Error) -> String {
	err
		.chain()
		.next()
		.map(|e| e.to_string())
		.unwrap_or_else(|| "error".to_string())
}

fn now_iso8601() -> String {
	Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Builder for the flat audit record shape spec.md §3 describes, reused across
/// the three dispatch arms.
#[derive(Default)]
pub struct AuditRecord(Map<String, Value>);

impl AuditRecord {
	pub fn new(method: &str) -> Self {
		let mut map = Map::new();
		map.insert("method".to_string(), json!(method));
		AuditRecord(map)
	}

	pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
		self.0.insert("hostname".to_string(), json!(hostname.into()));
		self
	}

	pub fn port(mut self, port: u16) -> Self {
		self.0.insert("port".to_string(), json!(port));
		self
	}

	pub fn path(mut self, path: impl Into<String>) -> Self {
		self.0.insert("path".to_string(), json!(path.into()));
		self
	}

	pub fn allowed(mut self, allowed: bool) -> Self {
		self.0.insert("allowed".to_string(), json!(allowed));
		self
	}

	pub fn sanitized(mut self, sanitized: bool) -> Self {
		self.0.insert("sanitized".to_string(), json!(sanitized));
		self
	}

	pub fn duration_ms(mut self, duration_ms: u128) -> Self {
		self.0.insert("duration_ms".to_string(), json!(duration_ms));
		self
	}

	pub fn blocked_reason(mut self, reason: impl Into<String>) -> Self {
		self.0.insert("blocked_reason".to_string(), json!(reason.into()));
		self
	}

	/// A free-text note for records that announce a system event (e.g. shutdown)
	/// rather than a per-request decision.
	pub fn message(mut self, message: impl Into<String>) -> Self {
		self.0.insert("message".to_string(), json!(message.into()));
		self
	}

	pub fn injection_patterns(mut self, patterns: &[String]) -> Self {
		if !patterns.is_empty() {
			self.0.insert("injection_patterns".to_string(), json!(patterns));
		}
		self
	}

	pub fn response_status(mut self, status: u16) -> Self {
		self.0.insert("response_status".to_string(), json!(status));
		self
	}

	pub fn into_map(self) -> Map<String, Value> {
		self.0
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex as StdMutex};

	use super::*;

	struct SharedBuf(Arc<StdMutex<Vec<u8>>>);
	impl Write for SharedBuf {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.0.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}
		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn log_stamps_timestamp_when_absent() {
		let buf = Arc::new(StdMutex::new(Vec::new()));
		let logger = AuditLogger::with_sink(Box::new(SharedBuf(buf.clone())));
		logger.log(AuditRecord::new("GET").hostname("api.example.com").allowed(true).into_map());
		let contents = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
		let value: Value = serde_json::from_str(contents.trim()) .unwrap();
		assert!(value.get("timestamp").is_some());
		assert_eq!(value["method"], "GET");
	}

	#[test]
	fn each_log_call_emits_exactly_one_line() {
		let buf = Arc::new(StdMutex::new(Vec::new()));
		let logger = AuditLogger::with_sink(Box::new(SharedBuf(buf.clone())));
		logger.log(AuditRecord::new("GET").into_map());
		logger.log(AuditRecord::new("POST").into_map());
		let contents = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
		assert_eq!(contents.lines().count(), 2);
	}

	#[test]
	fn shutdown_record_carries_a_message() {
		let buf = Arc::new(StdMutex::new(Vec::new()));
		let logger = AuditLogger::with_sink(Box::new(SharedBuf(buf.clone())));
		logger.log(AuditRecord::new("SHUTDOWN").allowed(true).message("draining").into_map());
		let contents = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
		let value: Value = serde_json::from_str(contents.trim()).unwrap();
		assert_eq!(value["method"], "SHUTDOWN");
		assert_eq!(value["message"], "draining");
	}

	#[test]
	fn log_error_includes_error_detail() {
		let buf = Arc::new(StdMutex::new(Vec::new()));
		let logger = AuditLogger::with_sink(Box::new(SharedBuf(buf.clone())));
		let err = anyhow::anyhow!("boom");
		logger.log_error("upstream failed", Some(&err));
		let contents = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
		let value: Value = serde_json::from_str(contents.trim()).unwrap();
		assert_eq!(value["level"], "error");
		assert_eq!(value["error_message"], "boom");
	}
}
