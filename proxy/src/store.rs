use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};

/// Metadata carried alongside a memory blob. `object_store` has no portable
/// per-object tagging API across backends, so this is persisted as a sidecar
/// object at `<key>.meta.json` written alongside the blob body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMetadata {
	pub run_id: String,
	pub run_start: String,
	pub analyzed: String,
	pub approved: String,
	#[serde(default = "default_content_type")]
	pub content_type: String,
}

fn default_content_type() -> String {
	"application/json".to_string()
}

impl BlobMetadata {
	fn sidecar_path(key: &str) -> StorePath {
		StorePath::from(format!("{key}.meta.json"))
	}
}

pub struct BlobListing {
	pub name: String,
	pub last_modified: chrono::DateTime<chrono::Utc>,
	pub metadata: Option<BlobMetadata>,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("key already exists")]
	Conflict,
	#[error("not found")]
	NotFound,
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

/// Wraps an `object_store::ObjectStore` to provide the append-only memory-blob
/// contract the proxy needs: conditional-create writes, prefix listing with the
/// metadata sidecar attached, and metadata-only mutation.
#[derive(Clone)]
pub struct Store {
	inner: Arc<dyn ObjectStore>,
	root: StorePath,
}

impl Store {
	/// Parses a URL such as `memory:///` or `file:///var/lib/moltproxy` into a
	/// backend and root path. Credentials are never part of this URL: the
	/// `object_store` crate resolves the ambient cloud identity on its own.
	pub fn from_url(url: &str) -> anyhow::Result<Self> {
		let parsed = url::Url::parse(url)?;
		let (store, root) = object_store::parse_url(&parsed)?;
		Ok(Store {
			inner: Arc::from(store),
			root,
		})
	}

	fn full_path(&self, key: &str) -> StorePath {
		self.root.parts().chain(StorePath::from(key).parts()).collect()
	}

	/// Writes `key` with `PutMode::Create`, which fails atomically if the key
	/// already exists. This is the append-only guarantee the memory store
	/// depends on: never a blind overwrite.
	pub async fn put(
		&self,
		key: &str,
		bytes: Bytes,
		content_type: &str,
		mut metadata: BlobMetadata,
	) -> Result<(), StoreError> {
		metadata.content_type = content_type.to_string();
		let path = self.full_path(key);
		let opts = PutOptions::from(PutMode::Create);
		match self.inner.put_opts(&path, PutPayload::from_bytes(bytes), opts).await {
			Ok(_) => {},
			Err(object_store::Error::AlreadyExists { .. }) => return Err(StoreError::Conflict),
			Err(e) => return Err(StoreError::Other(e.into())),
		}

		let meta_path = self.full_path(&BlobMetadata::sidecar_path(key).to_string());
		let meta_bytes = serde_json::to_vec(&metadata).map_err(|e| StoreError::Other(e.into()))?;
		self
			.inner
			.put(&meta_path, PutPayload::from_bytes(Bytes::from(meta_bytes)))
			.await
			.map_err(|e| StoreError::Other(e.into()))?;
		Ok(())
	}

	pub async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
		match self.inner.get(&self.full_path(key)).await {
			Ok(result) => Ok(result.bytes().await.map_err(|e| StoreError::Other(e.into()))?),
			Err(object_store::Error::NotFound { .. }) => Err(StoreError::NotFound),
			Err(e) => Err(StoreError::Other(e.into())),
		}
	}

	async fn get_metadata(&self, key: &str) -> Option<BlobMetadata> {
		let meta_path = self.full_path(&BlobMetadata::sidecar_path(key).to_string());
		let bytes = self.inner.get(&meta_path).await.ok()?.bytes().await.ok()?;
		serde_json::from_slice(&bytes).ok()
	}

	/// Mutates only the metadata sidecar for `key`, leaving the blob body untouched.
	/// This is the seam the external analyzer writes through: it flips `analyzed`
	/// and `approved`, never the blob itself.
	pub async fn set_metadata(&self, key: &str, metadata: BlobMetadata) -> Result<(), StoreError> {
		let meta_path = self.full_path(&BlobMetadata::sidecar_path(key).to_string());
		let bytes = serde_json::to_vec(&metadata).map_err(|e| StoreError::Other(e.into()))?;
		self
			.inner
			.put(&meta_path, PutPayload::from_bytes(Bytes::from(bytes)))
			.await
			.map_err(|e| StoreError::Other(e.into()))?;
		Ok(())
	}

	/// Lists every blob under `prefix` (excluding the `.meta.json` sidecars
	/// themselves), attaching each one's metadata.
	pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<BlobListing>, StoreError> {
		use futures_util::StreamExt;

		let full_prefix = self.full_path(prefix);
		let mut stream = self.inner.list(Some(&full_prefix));
		let mut out = Vec::new();
		while let Some(meta) = stream.next().await {
			let meta = meta.map_err(|e| StoreError::Other(e.into()))?;
			let name = meta.location.to_string();
			if name.ends_with(".meta.json") {
				continue;
			}
			let key = name
				.strip_prefix(&format!("{}/", self.root))
				.unwrap_or(&name)
				.to_string();
			let metadata = self.get_metadata(&key).await;
			out.push(BlobListing {
				name: key,
				last_modified: meta.last_modified,
				metadata,
			});
		}
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_metadata() -> BlobMetadata {
		BlobMetadata {
			run_id: "r1".into(),
			run_start: "2026-01-01T00:00:00Z".into(),
			analyzed: "false".into(),
			approved: "false".into(),
			content_type: "application/json".into(),
		}
	}

	#[tokio::test]
	async fn put_then_get_round_trips() {
		let store = Store::from_url("memory:///").unwrap();
		store
			.put("memory/r1.json", Bytes::from_static(b"{}"), "application/json", sample_metadata())
			.await
			.unwrap();
		let bytes = store.get("memory/r1.json").await.unwrap();
		assert_eq!(bytes.as_ref(), b"{}");
	}

	#[tokio::test]
	async fn second_put_with_same_key_conflicts() {
		let store = Store::from_url("memory:///").unwrap();
		store
			.put("memory/r1.json", Bytes::from_static(b"{}"), "application/json", sample_metadata())
			.await
			.unwrap();
		let err = store
			.put("memory/r1.json", Bytes::from_static(b"{}"), "application/json", sample_metadata())
			.await
			.unwrap_err();
		assert!(matches!(err, StoreError::Conflict));
	}

	#[tokio::test]
	async fn list_by_prefix_excludes_sidecars_and_attaches_metadata() {
		let store = Store::from_url("memory:///").unwrap();
		store
			.put("memory/r1.json", Bytes::from_static(b"{}"), "application/json", sample_metadata())
			.await
			.unwrap();
		let listing = store.list_by_prefix("memory/").await.unwrap();
		assert_eq!(listing.len(), 1);
		assert_eq!(listing[0].name, "memory/r1.json");
		assert_eq!(listing[0].metadata.as_ref().unwrap().run_id, "r1");
	}

	#[tokio::test]
	async fn set_metadata_mutates_without_touching_body() {
		let store = Store::from_url("memory:///").unwrap();
		store
			.put("memory/r1.json", Bytes::from_static(b"{\"a\":1}"), "application/json", sample_metadata())
			.await
			.unwrap();
		let mut approved = sample_metadata();
		approved.approved = "true".into();
		store.set_metadata("memory/r1.json", approved).await.unwrap();
		let listing = store.list_by_prefix("memory/").await.unwrap();
		assert_eq!(listing[0].metadata.as_ref().unwrap().approved, "true");
		let bytes = store.get("memory/r1.json").await.unwrap();
		assert_eq!(bytes.as_ref(), b"{\"a\":1}");
	}
}
