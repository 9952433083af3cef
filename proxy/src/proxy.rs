//! C7 Proxy Core (spec.md §4.7): a single TCP listener serving CONNECT
//! tunnels, absolute-form/remote-Host forwarding, and a small set of local
//! endpoints on one port. Grounded on the CONNECT/forward split in
//! `t3hw00t/ARW`'s `egress_proxy.rs` (an egress proxy in the retrieval
//! pack's `other_examples/`), adapted to this proxy's allowlist, sanitizer,
//! rate limiter, audit trail, and memory-store write path.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::net::TcpStream;

use crate::allowlist::Allowlist;
use crate::audit::{AuditLogger, AuditRecord};
use crate::config::{Config, HEAD_LIMIT_BYTES, MEMORY_FILE_MAX_BYTES, POST_BODY_MAX_BYTES};
use crate::error::ProxyError;
use crate::http::{BodyRead, HOP_BY_HOP_HEADERS, Method, Request, Response, StatusCode, read_body_limited};
use crate::ratelimit::RateLimiter;
use crate::sanitizer::sanitize;
use crate::schema::{validate_memory, validate_post_request, validate_vote_request};
use crate::store::{BlobMetadata, Store, StoreError};
use crate::upstream::{MoltbookClient, fetch};

pub struct ProxyState {
	pub allowlist: Allowlist,
	pub rate_limiter: RateLimiter,
	pub audit: AuditLogger,
	pub store: Store,
	pub moltbook: MoltbookClient,
	forward_client: reqwest::Client,
}

impl ProxyState {
	pub fn new(allowlist: Allowlist, store: Store, moltbook: MoltbookClient) -> anyhow::Result<Self> {
		let forward_client = reqwest::Client::builder()
			.timeout(crate::config::UPSTREAM_TIMEOUT)
			.build()?;
		Ok(ProxyState {
			allowlist,
			rate_limiter: RateLimiter::new(),
			audit: AuditLogger::stdout(),
			store,
			moltbook,
			forward_client,
		})
	}
}

/// Entry point wired into the hyper service for every accepted connection.
/// Never returns an error: any failure in the arms below is mapped to an
/// HTTP response, per §7's "fail-closed, never leak a stack trace" policy.
pub async fn route(state: Arc<ProxyState>, req: Request) -> Result<Response, Infallible> {
	let start = Instant::now();
	if req.method() == Method::CONNECT {
		return Ok(handle_connect(state, req, start).await);
	}
	if is_forwarding_request(&req) {
		return Ok(handle_forward(state, req, start).await);
	}
	Ok(handle_local(state, req, start).await)
}

/// Dispatch arm 2 of §4.7.1: absolute-form URIs are always forwarded. An
/// origin-form request is forwarded too, unless its path is one of the five
/// known local endpoints — anything else addressed in origin-form is, by
/// construction, a request whose Host header names a remote host.
fn is_forwarding_request(req: &Request) -> bool {
	if req.uri().scheme().is_some() {
		return true;
	}
	!matches!(
		req.uri().path(),
		"/health" | "/post" | "/vote" | "/memory" | "/memory/latest"
	)
}

// ---------------------------------------------------------------------------
// Arm 1: CONNECT tunneling
// ---------------------------------------------------------------------------

async fn handle_connect(state: Arc<ProxyState>, req: Request, start: Instant) -> Response {
	let Some(authority) = req.uri().authority().cloned() else {
		return audit_and_respond(
			&state,
			"CONNECT",
			None,
			None,
			"/",
			start,
			false,
			None,
			Some("malformed CONNECT target"),
			ProxyError::MalformedRequest.into_response(),
		);
	};
	let host = authority.host().to_string();
	let port = authority.port_u16().unwrap_or(443);

	let decision = state.allowlist.check(&host, "CONNECT", "/");
	if !decision.allowed {
		let reason = decision.reason.unwrap_or_default();
		return audit_and_respond(
			&state,
			"CONNECT",
			Some(&host),
			Some(port),
			"/",
			start,
			false,
			None,
			Some(&reason),
			ProxyError::Forbidden { reason: reason.clone() }.into_response(),
		);
	}

	let upstream = match TcpStream::connect((host.as_str(), port)).await {
		Ok(s) => s,
		Err(e) => {
			return audit_and_respond(
				&state,
				"CONNECT",
				Some(&host),
				Some(port),
				"/",
				start,
				true,
				None,
				None,
				bad_gateway(&format!("Failed to connect to {host}:{port}: {e}")),
			);
		},
	};

	let response = audit_and_respond(
		&state,
		"CONNECT",
		Some(&host),
		Some(port),
		"/",
		start,
		true,
		None,
		None,
		crate::http::empty_response(StatusCode::OK),
	);

	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => {
				let mut client_io = TokioIo::new(upgraded);
				let mut upstream = upstream;
				let _ = tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await;
			},
			Err(e) => {
				state.audit.log_error("CONNECT upgrade failed", Some(&anyhow::anyhow!(e)));
			},
		}
	});

	response
}

// ---------------------------------------------------------------------------
// Arm 2: HTTP forwarding
// ---------------------------------------------------------------------------

async fn handle_forward(state: Arc<ProxyState>, req: Request, start: Instant) -> Response {
	let method = req.method().clone();
	let (parts, body) = req.into_parts();

	let url = match resolve_absolute_url(&parts) {
		Some(u) => u,
		None => {
			return audit_and_respond(
				&state,
				method.as_str(),
				None,
				None,
				parts.uri.path(),
				start,
				false,
				None,
				Some("could not resolve an absolute URL for forwarding"),
				ProxyError::MalformedRequest.into_response(),
			);
		},
	};
	let host = url.host_str().unwrap_or_default().to_string();
	let port = url.port_or_known_default().unwrap_or(80);
	let path = url.path().to_string();

	let decision = state.allowlist.check(&host, method.as_str(), &path);
	if !decision.allowed {
		let reason = decision.reason.unwrap_or_default();
		return audit_and_respond(
			&state,
			method.as_str(),
			Some(&host),
			Some(port),
			&path,
			start,
			false,
			None,
			Some(&reason),
			ProxyError::Forbidden { reason }.into_response(),
		);
	}

	let body_bytes = match read_body_limited(body, POST_BODY_MAX_BYTES).await {
		Ok(BodyRead::Ok(b)) => b,
		Ok(BodyRead::TooLarge(_)) => {
			return audit_and_respond(
				&state,
				method.as_str(),
				Some(&host),
				Some(port),
				&path,
				start,
				true,
				None,
				None,
				ProxyError::bad_request("Request body too large").into_response(),
			);
		},
		Err(e) => {
			state.audit.log_error("failed reading forward-arm body", Some(&e));
			return audit_and_respond(
				&state,
				method.as_str(),
				Some(&host),
				Some(port),
				&path,
				start,
				true,
				None,
				None,
				bad_gateway("Failed to read request body"),
			);
		},
	};

	let headers = strip_hop_by_hop(parts.headers);
	let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
	let send_body = if matches!(method, Method::GET | Method::HEAD) {
		None
	} else {
		Some(body_bytes)
	};

	match fetch(&state.forward_client, reqwest_method, url.as_str(), headers, send_body).await {
		Ok(upstream_resp) => {
			let status = upstream_resp.status();
			let resp_headers = upstream_resp.headers().clone();
			let resp_bytes = match upstream_resp.bytes().await {
				Ok(b) => b,
				Err(e) => {
					state.audit.log_error("failed reading upstream response body", Some(&e.into()));
					return audit_and_respond(
						&state,
						method.as_str(),
						Some(&host),
						Some(port),
						&path,
						start,
						true,
						None,
						None,
						bad_gateway("Failed to read upstream response"),
					);
				},
			};
			let body_text = String::from_utf8_lossy(&resp_bytes).into_owned();
			let sanitized = sanitize(&body_text);
			let out_bytes = if sanitized.sanitized {
				Bytes::from(sanitized.content.clone())
			} else {
				resp_bytes
			};

			let mut builder = ::http::Response::builder().status(status.as_u16());
			for (name, value) in resp_headers.iter() {
				if name == ::http::header::TRANSFER_ENCODING || name == ::http::header::CONTENT_LENGTH {
					continue;
				}
				builder = builder.header(name, value);
			}
			let response = builder
				.header(::http::header::CONTENT_LENGTH, out_bytes.len())
				.header(::http::header::CONNECTION, "close")
				.body(crate::http::Body::new(out_bytes))
				.unwrap_or_else(|_| crate::http::empty_response(StatusCode::BAD_GATEWAY));

			audit_and_respond(
				&state,
				method.as_str(),
				Some(&host),
				Some(port),
				&path,
				start,
				true,
				if sanitized.sanitized { Some(sanitized.patterns.as_slice()) } else { None },
				None,
				response,
			)
		},
		Err(e) => {
			state.audit.log_error("forward upstream call failed", Some(&e));
			audit_and_respond(
				&state,
				method.as_str(),
				Some(&host),
				Some(port),
				&path,
				start,
				true,
				None,
				None,
				bad_gateway(&format!("Failed to reach upstream: {e}")),
			)
		},
	}
}

/// Resolves the absolute URL a forwarding-arm request targets: directly from
/// an absolute-form URI, or by combining the `Host` header with an
/// origin-form path. Plain HTTP only — CONNECT is the path to HTTPS targets.
fn resolve_absolute_url(parts: &::http::request::Parts) -> Option<url::Url> {
	if parts.uri.scheme().is_some() {
		return url::Url::parse(&parts.uri.to_string()).ok();
	}
	let host = parts.headers.get(::http::header::HOST)?.to_str().ok()?;
	let path_and_query = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
	url::Url::parse(&format!("http://{host}{path_and_query}")).ok()
}

fn strip_hop_by_hop(mut headers: ::http::HeaderMap) -> ::http::HeaderMap {
	for name in HOP_BY_HOP_HEADERS {
		headers.remove(*name);
	}
	headers
}

fn bad_gateway(message: &str) -> Response {
	crate::http::json_response(StatusCode::BAD_GATEWAY, &json!({ "error": message }))
}

// ---------------------------------------------------------------------------
// Arm 3: local endpoints
// ---------------------------------------------------------------------------

async fn handle_local(state: Arc<ProxyState>, req: Request, start: Instant) -> Response {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	match (&method, path.as_str()) {
		(&Method::GET, "/health") => handle_health(&state, start),
		(&Method::POST, "/post") => handle_post(&state, req, start).await,
		(&Method::POST, "/vote") => handle_vote(&state, req, start).await,
		(&Method::POST, "/memory") => handle_memory_post(&state, req, start).await,
		(&Method::GET, "/memory/latest") => handle_memory_latest(&state, start).await,
		_ => audit_and_respond(
			&state,
			method.as_str(),
			Some("local"),
			None,
			&path,
			start,
			false,
			None,
			Some("unrecognized local path"),
			ProxyError::NotFound.into_response(),
		),
	}
}

fn handle_health(state: &ProxyState, start: Instant) -> Response {
	let body = json!({
		"status": "healthy",
		"uptime_seconds": moltproxy_core::telemetry::uptime_seconds(),
		"allowlist_domains": state.allowlist.current().domains(),
	});
	audit_and_respond(
		state,
		"GET",
		Some("local"),
		None,
		"/health",
		start,
		true,
		None,
		None,
		crate::http::json_response(StatusCode::OK, &body),
	)
}

async fn handle_post(state: &ProxyState, req: Request, start: Instant) -> Response {
	let body = req.into_body();
	let bytes = match read_body_limited(body, POST_BODY_MAX_BYTES).await {
		Ok(BodyRead::Ok(b)) => b,
		Ok(BodyRead::TooLarge(_)) => {
			return local_error(state, "POST", "/post", start, ProxyError::bad_request("Request body too large"));
		},
		Err(_) => return local_error(state, "POST", "/post", start, ProxyError::invalid_json()),
	};

	let json: Value = match serde_json::from_slice(&bytes) {
		Ok(v) => v,
		Err(_) => return local_error(state, "POST", "/post", start, ProxyError::invalid_json()),
	};
	let parsed = match validate_post_request(&json) {
		Ok(v) => v,
		Err(message) => return local_error(state, "POST", "/post", start, ProxyError::schema_failure(message)),
	};

	let decision = state.rate_limiter.check_post();
	if !decision.allowed {
		let reason = decision.reason.unwrap_or_default();
		return local_error(state, "POST", "/post", start, ProxyError::RateLimited { reason });
	}

	let sanitized = sanitize(&parsed.content);
	if sanitized.sanitized {
		return local_error(state, "POST", "/post", start, ProxyError::injection_detected(sanitized.patterns));
	}

	let upstream_body = json!({
		"content": parsed.content,
		"title": parsed.title,
		"submolt_name": parsed.submolt_name,
	});

	let result = if let Some(thread_id) = &parsed.thread_id {
		state.moltbook.create_comment(thread_id, &upstream_body).await
	} else {
		state.moltbook.create_post(&upstream_body).await
	};

	match result {
		Ok(resp) if (200..300).contains(&resp.status) => {
			state.rate_limiter.record_post();
			audit_and_respond(
				state,
				"POST",
				Some("local"),
				None,
				"/post",
				start,
				true,
				None,
				None,
				crate::http::json_response(
					StatusCode::OK,
					&json!({ "ok": true, "moltbook_status": resp.status, "data": resp.body }),
				),
			)
		},
		Ok(resp) => audit_and_respond(
			state,
			"POST",
			Some("local"),
			None,
			"/post",
			start,
			true,
			None,
			None,
			crate::http::json_response(
				StatusCode::BAD_GATEWAY,
				&json!({ "error": "Upstream error", "moltbook_status": resp.status, "data": resp.body }),
			),
		),
		Err(e) => {
			state.audit.log_error("post upstream call failed", Some(&e));
			audit_and_respond(
				state,
				"POST",
				Some("local"),
				None,
				"/post",
				start,
				true,
				None,
				None,
				bad_gateway(&format!("Failed to reach upstream: {e}")),
			)
		},
	}
}

async fn handle_vote(state: &ProxyState, req: Request, start: Instant) -> Response {
	let body = req.into_body();
	let bytes = match read_body_limited(body, POST_BODY_MAX_BYTES).await {
		Ok(BodyRead::Ok(b)) => b,
		Ok(BodyRead::TooLarge(_)) => {
			return local_error(state, "POST", "/vote", start, ProxyError::bad_request("Request body too large"));
		},
		Err(_) => return local_error(state, "POST", "/vote", start, ProxyError::invalid_json()),
	};

	let json: Value = match serde_json::from_slice(&bytes) {
		Ok(v) => v,
		Err(_) => return local_error(state, "POST", "/vote", start, ProxyError::invalid_json()),
	};
	let parsed = match validate_vote_request(&json) {
		Ok(v) => v,
		Err(message) => return local_error(state, "POST", "/vote", start, ProxyError::schema_failure(message)),
	};

	let decision = state.rate_limiter.check("vote_hourly");
	if !decision.allowed {
		let reason = decision.reason.unwrap_or_default();
		return local_error(state, "POST", "/vote", start, ProxyError::RateLimited { reason });
	}

	match state.moltbook.upvote(&parsed.post_id).await {
		Ok(resp) if (200..300).contains(&resp.status) => {
			state.rate_limiter.record("vote_hourly");
			audit_and_respond(
				state,
				"POST",
				Some("local"),
				None,
				"/vote",
				start,
				true,
				None,
				None,
				crate::http::json_response(
					StatusCode::OK,
					&json!({ "ok": true, "moltbook_status": resp.status }),
				),
			)
		},
		Ok(resp) => audit_and_respond(
			state,
			"POST",
			Some("local"),
			None,
			"/vote",
			start,
			true,
			None,
			None,
			crate::http::json_response(
				StatusCode::BAD_GATEWAY,
				&json!({ "error": "Upstream error", "moltbook_status": resp.status }),
			),
		),
		Err(e) => {
			state.audit.log_error("vote upstream call failed", Some(&e));
			audit_and_respond(
				state,
				"POST",
				Some("local"),
				None,
				"/vote",
				start,
				true,
				None,
				None,
				bad_gateway(&format!("Failed to reach upstream: {e}")),
			)
		},
	}
}

async fn handle_memory_post(state: &ProxyState, req: Request, start: Instant) -> Response {
	let body = req.into_body();
	let collected = match body.collect().await {
		Ok(c) => c.to_bytes(),
		Err(_) => return local_error(state, "POST", "/memory", start, ProxyError::invalid_json()),
	};

	if collected.is_empty() {
		return local_error(state, "POST", "/memory", start, ProxyError::bad_request("Request body is empty"));
	}
	if collected.len() > MEMORY_FILE_MAX_BYTES {
		return audit_and_respond(
			state,
			"POST",
			Some("local"),
			None,
			"/memory",
			start,
			true,
			None,
			Some("memory document exceeds 1 MiB"),
			ProxyError::PayloadTooLarge(json!({
				"error": "Memory document too large",
				"size": collected.len(),
				"max": MEMORY_FILE_MAX_BYTES,
			}))
			.into_response(),
		);
	}

	let json: Value = match serde_json::from_slice(&collected) {
		Ok(v) => v,
		Err(_) => return local_error(state, "POST", "/memory", start, ProxyError::invalid_json()),
	};
	let parsed = match validate_memory(&json) {
		Ok(v) => v,
		Err(message) => return local_error(state, "POST", "/memory", start, ProxyError::schema_failure(message)),
	};

	let key = format!("memory/{}.json", parsed.run_id);
	let metadata = BlobMetadata {
		run_id: parsed.run_id.clone(),
		run_start: parsed.run_start.clone(),
		analyzed: "false".to_string(),
		approved: "false".to_string(),
		content_type: "application/json".to_string(),
	};

	match state.store.put(&key, collected, "application/json", metadata).await {
		Ok(()) => audit_and_respond(
			state,
			"POST",
			Some("local"),
			None,
			"/memory",
			start,
			true,
			None,
			None,
			crate::http::json_response(
				StatusCode::OK,
				&json!({ "ok": true, "blob": key, "run_id": parsed.run_id }),
			),
		),
		Err(StoreError::Conflict) => audit_and_respond(
			state,
			"POST",
			Some("local"),
			None,
			"/memory",
			start,
			true,
			None,
			Some("memory blob already exists for this run_id"),
			ProxyError::Conflict(json!({
				"error": "Memory blob already exists for this run_id",
				"run_id": parsed.run_id,
			}))
			.into_response(),
		),
		Err(e) => {
			state.audit.log_error("memory store write failed", Some(&anyhow::anyhow!(e)));
			audit_and_respond(
				state,
				"POST",
				Some("local"),
				None,
				"/memory",
				start,
				true,
				None,
				None,
				crate::http::json_response(
					StatusCode::INTERNAL_SERVER_ERROR,
					&json!({ "error": "Internal error" }),
				),
			)
		},
	}
}

async fn handle_memory_latest(state: &ProxyState, start: Instant) -> Response {
	match state.store.list_by_prefix("memory/").await {
		Ok(listing) => {
			let newest = listing
				.into_iter()
				.filter(|b| b.metadata.as_ref().map(|m| m.approved == "true").unwrap_or(false))
				.max_by_key(|b| b.last_modified);

			match newest {
				None => audit_and_respond(
					state,
					"GET",
					Some("local"),
					None,
					"/memory/latest",
					start,
					true,
					None,
					None,
					crate::http::json_response(
						StatusCode::OK,
						&json!({ "ok": true, "data": null, "message": "No approved memory found" }),
					),
				),
				Some(listing) => match state.store.get(&listing.name).await {
					Ok(bytes) => {
						let data: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
						audit_and_respond(
							state,
							"GET",
							Some("local"),
							None,
							"/memory/latest",
							start,
							true,
							None,
							None,
							crate::http::json_response(StatusCode::OK, &json!({ "ok": true, "data": data })),
						)
					},
					Err(e) => {
						state.audit.log_error("memory latest fetch failed", Some(&anyhow::anyhow!(e)));
						audit_and_respond(
							state,
							"GET",
							Some("local"),
							None,
							"/memory/latest",
							start,
							true,
							None,
							None,
							crate::http::json_response(
								StatusCode::INTERNAL_SERVER_ERROR,
								&json!({ "error": "Internal error" }),
							),
						)
					},
				},
			}
		},
		Err(e) => {
			state.audit.log_error("memory listing failed", Some(&anyhow::anyhow!(e)));
			audit_and_respond(
				state,
				"GET",
				Some("local"),
				None,
				"/memory/latest",
				start,
				true,
				None,
				None,
				crate::http::json_response(
					StatusCode::INTERNAL_SERVER_ERROR,
					&json!({ "error": "Internal error" }),
				),
			)
		},
	}
}

fn local_error(state: &ProxyState, method: &str, path: &str, start: Instant, err: ProxyError) -> Response {
	let reason = err.blocked_reason();
	audit_and_respond(state, method, Some("local"), None, path, start, false, None, Some(&reason), err.into_response())
}

/// Every branch that produces a response — allowed or denied — emits exactly
/// one audit record first, per §7's propagation policy.
#[allow(clippy::too_many_arguments)]
fn audit_and_respond(
	state: &ProxyState,
	method: &str,
	hostname: Option<&str>,
	port: Option<u16>,
	path: &str,
	start: Instant,
	allowed: bool,
	patterns: Option<&[String]>,
	blocked_reason: Option<&str>,
	response: Response,
) -> Response {
	let mut record = AuditRecord::new(method)
		.path(path)
		.allowed(allowed)
		.sanitized(patterns.is_some_and(|p| !p.is_empty()))
		.duration_ms(start.elapsed().as_millis())
		.response_status(response.status().as_u16());
	if let Some(hostname) = hostname {
		record = record.hostname(hostname);
	}
	if let Some(port) = port {
		record = record.port(port);
	}
	if let Some(patterns) = patterns {
		record = record.injection_patterns(patterns);
	}
	if let Some(reason) = blocked_reason {
		record = record.blocked_reason(reason);
	}
	state.audit.log(record.into_map());
	response
}

/// Binds the listener and serves connections until `drain` signals shutdown,
/// per §4.7.6 and the concurrency model in §5: one spawned task per accepted
/// connection, none holding any shared lock across an I/O suspension point.
pub async fn serve(
	config: &Config,
	state: Arc<ProxyState>,
	drain: moltproxy_core::drain::DrainWatcher,
) -> anyhow::Result<()> {
	let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
	let listener = tokio::net::TcpListener::bind(addr).await?;
	tracing::info!(%addr, "moltproxy listening");

	let drain_accept = drain.clone();
	let mut wait_for_drain = Box::pin(drain_accept.wait_for_drain());
	loop {
		tokio::select! {
			_ = &mut wait_for_drain => {
				tracing::info!("listener draining, no longer accepting connections");
				return Ok(());
			}
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(v) => v,
					Err(e) => {
						tracing::warn!(error = %e, "accept failed");
						continue;
					},
				};
				let state = state.clone();
				tokio::spawn(serve_connection(state, stream, peer, drain.clone()));
			}
		}
	}
}

async fn serve_connection(
	state: Arc<ProxyState>,
	stream: TcpStream,
	peer: SocketAddr,
	drain: moltproxy_core::drain::DrainWatcher,
) {
	let _ = stream.set_nodelay(true);
	let io = TokioIo::new(stream);
	let service = hyper::service::service_fn(move |req| {
		let state = state.clone();
		route(state, req)
	});

	let mut builder = hyper::server::conn::http1::Builder::new();
	builder.max_buf_size(HEAD_LIMIT_BYTES);
	let conn = builder.serve_connection(io, service).with_upgrades();

	match futures_util::future::select(Box::pin(drain.wait_for_drain()), conn).await {
		futures_util::future::Either::Left((_release, mut conn)) => {
			std::pin::Pin::new(&mut conn).graceful_shutdown();
			if let Err(e) = conn.await {
				tracing::debug!(%peer, error = %e, "connection ended during drain");
			}
		},
		futures_util::future::Either::Right((result, _wait)) => {
			if let Err(e) = result {
				tracing::debug!(%peer, error = %e, "connection ended with error");
			}
		},
	}
}
