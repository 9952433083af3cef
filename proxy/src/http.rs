use bytes::Bytes;
use http_body_util::{BodyExt, Full};

pub type Body = Full<Bytes>;
pub type Request = ::http::Request<hyper::body::Incoming>;
pub type Response = ::http::Response<Body>;

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};

pub fn empty_response(code: StatusCode) -> Response {
	::http::Response::builder()
		.status(code)
		.body(Body::new(Bytes::new()))
		.expect("status code is valid")
}

pub fn json_response(code: StatusCode, value: &impl serde::Serialize) -> Response {
	let bytes = serde_json::to_vec(value).expect("value must serialize");
	::http::Response::builder()
		.status(code)
		.header(header::CONTENT_TYPE, "application/json")
		.header(header::CONNECTION, "close")
		.body(Body::new(Bytes::from(bytes)))
		.expect("status code is valid")
}

/// The outcome of a bounded body read: either the full body, or a marker that
/// it exceeded the caller's limit along with its actual size (so endpoints
/// that report the size in a 413 body, like `/memory`, don't need a second pass).
pub enum BodyRead {
	Ok(Bytes),
	TooLarge(usize),
}

/// Reads an incoming request body fully, up to `limit` bytes.
pub async fn read_body_limited(
	body: hyper::body::Incoming,
	limit: usize,
) -> anyhow::Result<BodyRead> {
	let collected = body.collect().await?.to_bytes();
	if collected.len() > limit {
		Ok(BodyRead::TooLarge(collected.len()))
	} else {
		Ok(BodyRead::Ok(collected))
	}
}

pub const HOP_BY_HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];
