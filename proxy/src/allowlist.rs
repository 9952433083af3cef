use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Deserialize;

/// A single allowlist rule: an exact (case-insensitive) hostname, the HTTP methods
/// permitted against it, and an optional set of path prefixes.
#[derive(Debug, Clone, Deserialize)]
struct RawEntry {
	domain: String,
	methods: Vec<String>,
	#[serde(default)]
	paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
	#[serde(rename = "allowedDomains")]
	allowed_domains: Vec<RawEntry>,
}

#[derive(Debug, Clone)]
pub struct AllowlistEntry {
	pub domain: String,
	pub methods: HashSet<String>,
	pub paths: Option<Vec<String>>,
}

/// An immutable snapshot of the allowlist. Never mutated in place — a reload produces
/// a fresh one that atomically replaces the active snapshot.
#[derive(Debug, Clone, Default)]
pub struct AllowlistConfig {
	entries: Vec<AllowlistEntry>,
}

pub struct Decision {
	pub allowed: bool,
	pub reason: Option<String>,
}

impl Decision {
	fn allow() -> Self {
		Decision {
			allowed: true,
			reason: None,
		}
	}

	fn deny(reason: String) -> Self {
		Decision {
			allowed: false,
			reason: Some(reason),
		}
	}
}

impl AllowlistConfig {
	pub fn parse(contents: &str) -> anyhow::Result<Self> {
		let raw: RawConfig = serde_json::from_str(contents)?;
		let entries = raw
			.allowed_domains
			.into_iter()
			.map(|e| AllowlistEntry {
				domain: e.domain.to_lowercase(),
				methods: e.methods.into_iter().map(|m| m.to_uppercase()).collect(),
				paths: e.paths,
			})
			.collect();
		Ok(AllowlistConfig { entries })
	}

	pub fn domains(&self) -> Vec<String> {
		self.entries.iter().map(|e| e.domain.clone()).collect()
	}

	/// The first entry whose hostname matches wins; if the method or path then fails,
	/// the request is denied outright rather than falling through to a later entry.
	pub fn check(&self, host: &str, method: &str, path: &str) -> Decision {
		let host = host.to_lowercase();
		let Some(entry) = self.entries.iter().find(|e| e.domain == host) else {
			return Decision::deny(format!("Domain not in allowlist: {host}"));
		};
		let method = method.to_uppercase();
		if !entry.methods.contains(&method) {
			return Decision::deny(format!("Method {method} not allowed for {host}"));
		}
		if let Some(paths) = &entry.paths {
			if !paths.is_empty() && !paths.iter().any(|p| path.starts_with(p.as_str())) {
				return Decision::deny(format!("Path {path} not in allowed paths for {host}"));
			}
		}
		Decision::allow()
	}
}

/// Reload-aware holder for the active allowlist. Readers clone the `Arc` out via
/// `load()`, so an in-flight check always sees either the old or the new snapshot,
/// never a torn read.
pub struct Allowlist {
	path: PathBuf,
	current: ArcSwap<AllowlistConfig>,
}

impl Allowlist {
	pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
		let path = path.as_ref().to_path_buf();
		let config = Self::read(&path).await?;
		Ok(Allowlist {
			path,
			current: ArcSwap::new(Arc::new(config)),
		})
	}

	async fn read(path: &Path) -> anyhow::Result<AllowlistConfig> {
		let contents = tokio::fs::read_to_string(path).await?;
		AllowlistConfig::parse(&contents)
	}

	pub fn current(&self) -> Arc<AllowlistConfig> {
		self.current.load_full()
	}

	pub fn check(&self, host: &str, method: &str, path: &str) -> Decision {
		self.current().check(host, method, path)
	}

	/// Re-reads the allowlist file and swaps it in atomically. On parse or I/O
	/// failure the previous snapshot is left in place — reload never abandons
	/// enforcement.
	pub async fn reload(&self) -> anyhow::Result<()> {
		let config = Self::read(&self.path).await?;
		self.current.store(Arc::new(config));
		Ok(())
	}
}
