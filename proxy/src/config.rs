use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;

pub const DEFAULT_PORT: u16 = 3128;
pub const HEAD_LIMIT_BYTES: usize = 64 * 1024;
pub const MEMORY_FILE_MAX_BYTES: usize = 1024 * 1024;
pub const POST_BODY_MAX_BYTES: usize = 1024 * 1024;
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Everything the proxy needs to run, sourced from the environment at startup.
///
/// Per the ambient-identity requirement on the object-store client, no storage
/// credentials live here: `object_store_url` only selects a backend and container;
/// authentication is resolved by the `object_store` crate from its own ambient
/// environment variables (`AWS_*`, `AZURE_*`, or none at all for the local/in-memory
/// backends used in development and tests).
#[derive(Clone)]
pub struct Config {
	pub port: u16,
	pub allowlist_path: PathBuf,
	pub moltbook_base_url: String,
	pub moltbook_token: SecretString,
	pub object_store_url: String,
}

impl Config {
	pub fn from_env() -> anyhow::Result<Self> {
		Ok(Config {
			port: parse_default("PORT", DEFAULT_PORT)?,
			allowlist_path: parse("ALLOWLIST_CONFIG")
				.context("ALLOWLIST_CONFIG must name the allowlist file")?,
			moltbook_base_url: parse_default_string(
				"MOLTBOOK_API_BASE",
				"https://moltbook.internal",
			),
			moltbook_token: SecretString::from(required("MOLTBOOK_API_TOKEN")?),
			object_store_url: parse_default_string("OBJECT_STORE_URL", "memory:///"),
		})
	}
}

fn required(name: &str) -> anyhow::Result<String> {
	std::env::var(name).with_context(|| format!("environment variable {name} must be set"))
}

fn parse<T: FromStr>(name: &str) -> anyhow::Result<T>
where
	T::Err: std::error::Error + Send + Sync + 'static,
{
	let raw = required(name)?;
	raw
		.parse()
		.with_context(|| format!("failed to parse {name}={raw:?}"))
}

fn parse_default<T: FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
	T::Err: std::error::Error + Send + Sync + 'static,
{
	match std::env::var(name) {
		Ok(raw) => raw
			.parse()
			.with_context(|| format!("failed to parse {name}={raw:?}")),
		Err(_) => Ok(default),
	}
}

fn parse_default_string(name: &str, default: &str) -> String {
	std::env::var(name).unwrap_or_else(|_| default.to_string())
}
