use serde_json::{Value, json};

use crate::http::{Response, StatusCode, json_response};

/// The error taxonomy for the local-endpoint and forwarding arms. Each variant carries
/// the exact JSON body the client should see; internal detail never crosses this boundary
/// (it goes to the audit sink via `logError` instead).
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("malformed request line")]
	MalformedRequest,
	#[error("not found")]
	NotFound,
	#[error("forbidden: {reason}")]
	Forbidden { reason: String },
	#[error("bad request")]
	BadRequest(Value),
	#[error("conflict")]
	Conflict(Value),
	#[error("payload too large")]
	PayloadTooLarge(Value),
	#[error("rate limited: {reason}")]
	RateLimited { reason: String },
	#[error("upstream error")]
	Upstream(Value),
	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
}

impl ProxyError {
	pub fn bad_request(msg: impl Into<String>) -> Self {
		ProxyError::BadRequest(json!({ "error": msg.into() }))
	}

	pub fn invalid_json() -> Self {
		ProxyError::BadRequest(json!({ "error": "Invalid JSON" }))
	}

	pub fn schema_failure(message: String) -> Self {
		ProxyError::BadRequest(json!({ "error": "Invalid request", "details": message }))
	}

	pub fn injection_detected(patterns: Vec<String>) -> Self {
		ProxyError::BadRequest(json!({
			"error": "Content contains disallowed patterns",
			"patterns": patterns,
		}))
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::MalformedRequest | ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
			ProxyError::Forbidden { .. } => StatusCode::FORBIDDEN,
			ProxyError::NotFound => StatusCode::NOT_FOUND,
			ProxyError::Conflict(_) => StatusCode::CONFLICT,
			ProxyError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
			ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// A short string suitable for the audit record's `blocked_reason` field.
	pub fn blocked_reason(&self) -> String {
		match self {
			ProxyError::MalformedRequest => "malformed request line".to_string(),
			ProxyError::Forbidden { reason } => reason.clone(),
			ProxyError::NotFound => "not found".to_string(),
			ProxyError::RateLimited { reason } => reason.clone(),
			ProxyError::BadRequest(v) | ProxyError::Conflict(v) | ProxyError::PayloadTooLarge(v)
			| ProxyError::Upstream(v) => v
				.get("error")
				.and_then(Value::as_str)
				.unwrap_or("request rejected")
				.to_string(),
			ProxyError::Internal(e) => e.to_string(),
		}
	}

	pub fn into_response(self) -> Response {
		let code = self.status();
		let body = match &self {
			ProxyError::MalformedRequest => json!({ "error": "Malformed request line" }),
			ProxyError::NotFound => json!({ "error": "Not found" }),
			ProxyError::Forbidden { reason } => json!({ "error": "Forbidden", "reason": reason }),
			ProxyError::BadRequest(v)
			| ProxyError::Conflict(v)
			| ProxyError::PayloadTooLarge(v)
			| ProxyError::Upstream(v) => v.clone(),
			ProxyError::RateLimited { reason } => json!({ "error": "Rate limit exceeded", "reason": reason }),
			ProxyError::Internal(_) => json!({ "error": "Internal error" }),
		};
		json_response(code, &body)
	}
}
