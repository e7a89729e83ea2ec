#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

/// Fire-and-forget document indexing. Callers never await indexing as part
/// of a broadcast path; failures are logged by the caller and dropped.
#[async_trait]
pub trait SearchIndex: Send + Sync {
	async fn index(&self, collection: &str, id: &str, document: Value) -> anyhow::Result<()>;
}

/// Discards everything; used when indexing is disabled.
#[derive(Debug, Default, Clone)]
pub struct NullSearchIndex;

#[async_trait]
impl SearchIndex for NullSearchIndex {
	async fn index(&self, _collection: &str, _id: &str, _document: Value) -> anyhow::Result<()> {
		Ok(())
	}
}

/// In-memory index used by tests to observe what got indexed.
#[derive(Debug, Default, Clone)]
pub struct MemorySearchIndex {
	inner: Arc<Mutex<HashMap<(String, String), Value>>>,
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
	async fn index(&self, collection: &str, id: &str, document: Value) -> anyhow::Result<()> {
		self.inner
			.lock()
			.await
			.insert((collection.to_string(), id.to_string()), document);
		Ok(())
	}
}

impl MemorySearchIndex {
	pub async fn get(&self, collection: &str, id: &str) -> Option<Value> {
		self.inner
			.lock()
			.await
			.get(&(collection.to_string(), id.to_string()))
			.cloned()
	}

	pub async fn len(&self) -> usize {
		self.inner.lock().await.len()
	}
}
