use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::config::UPSTREAM_TIMEOUT;

/// The external "moltbook" social-network backend the write endpoints target.
/// Its three operations are fixed against a configurable base URL, per the
/// assumption recorded in DESIGN.md: spec.md names the operations
/// ("top-level posts endpoint", "comments endpoint for a thread", "upvote
/// endpoint") without giving concrete paths.
#[derive(Clone)]
pub struct MoltbookClient {
	http: reqwest::Client,
	base_url: String,
	token: SecretString,
}

pub struct UpstreamResponse {
	pub status: u16,
	pub body: Value,
}

impl MoltbookClient {
	pub fn new(base_url: String, token: SecretString) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).build()?;
		Ok(MoltbookClient {
			http,
			base_url,
			token,
		})
	}

	async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<UpstreamResponse> {
		let url = format!("{}{}", self.base_url, path);
		let resp = self
			.http
			.post(url)
			.bearer_auth(self.token.expose_secret())
			.json(body)
			.send()
			.await?;
		let status = resp.status().as_u16();
		let body = resp.json::<Value>().await.unwrap_or(Value::Null);
		Ok(UpstreamResponse { status, body })
	}

	pub async fn create_post(&self, body: &Value) -> anyhow::Result<UpstreamResponse> {
		self.post_json("/api/v1/posts", body).await
	}

	pub async fn create_comment(&self, thread_id: &str, body: &Value) -> anyhow::Result<UpstreamResponse> {
		self
			.post_json(&format!("/api/v1/posts/{thread_id}/comments"), body)
			.await
	}

	pub async fn upvote(&self, post_id: &str) -> anyhow::Result<UpstreamResponse> {
		self
			.post_json(&format!("/api/v1/posts/{post_id}/upvote"), &Value::Null)
			.await
	}
}

/// Fetches an already-validated, allowlisted absolute URL for the HTTP
/// forwarding arm, preserving method/headers/body and bounded by the same
/// upstream timeout as the write endpoints.
pub async fn fetch(
	client: &reqwest::Client,
	method: reqwest::Method,
	url: &str,
	headers: reqwest::header::HeaderMap,
	body: Option<bytes::Bytes>,
) -> anyhow::Result<reqwest::Response> {
	let mut req = client.request(method, url).headers(headers).timeout(Duration::from_secs(10));
	if let Some(body) = body {
		req = req.body(body);
	}
	Ok(req.send().await?)
}

#[cfg(test)]
mod tests {
	use secrecy::SecretString;
	use serde_json::json;
	use wiremock::matchers::{header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	#[tokio::test]
	async fn create_post_sends_bearer_token_and_json_body() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v1/posts"))
			.and(header("authorization", "Bearer test-token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p1" })))
			.mount(&server)
			.await;

		let client = MoltbookClient::new(server.uri(), SecretString::from("test-token".to_string())).unwrap();
		let resp = client.create_post(&json!({ "content": "hi" })).await.unwrap();
		assert_eq!(resp.status, 200);
		assert_eq!(resp.body["id"], "p1");
	}

	#[tokio::test]
	async fn create_comment_targets_thread_endpoint() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v1/posts/t1/comments"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
			.mount(&server)
			.await;

		let client = MoltbookClient::new(server.uri(), SecretString::from("t".to_string())).unwrap();
		let resp = client.create_comment("t1", &json!({ "content": "hi" })).await.unwrap();
		assert_eq!(resp.status, 200);
	}

	#[tokio::test]
	async fn upvote_targets_post_upvote_endpoint() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/api/v1/posts/p1/upvote"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
			.mount(&server)
			.await;

		let client = MoltbookClient::new(server.uri(), SecretString::from("t".to_string())).unwrap();
		let resp = client.upvote("p1").await.unwrap();
		assert_eq!(resp.status, 200);
	}
}
