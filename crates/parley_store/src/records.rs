#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive per-key async locks shared by every backend.
///
/// Guards release on drop, so a lock is never leaked on an error path.
#[derive(Debug, Default, Clone)]
pub struct KeyLocks {
	inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Held per-key lock; dropping it releases the key.
pub struct KeyLockGuard {
	_guard: OwnedMutexGuard<()>,
}

impl KeyLocks {
	pub async fn lock(&self, key: &str) -> KeyLockGuard {
		let entry = {
			let mut map = self.inner.lock().await;
			if map.len() >= 4096 {
				map.retain(|_, v| Arc::strong_count(v) > 1);
			}
			Arc::clone(map.entry(key.to_string()).or_default())
		};
		KeyLockGuard {
			_guard: entry.lock_owned().await,
		}
	}
}

/// Key/value record storage with bounded-list append and multi-step
/// transactions scoped to a single key.
#[async_trait]
pub trait RecordStore: Send + Sync {
	async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

	async fn put(&self, key: &str, value: Value) -> anyhow::Result<()>;

	async fn delete(&self, key: &str) -> anyhow::Result<()>;

	/// Append to a list; returns the new list length.
	async fn list_push(&self, list: &str, value: Value) -> anyhow::Result<u64>;

	/// Most recent `limit` items in insertion order; `limit == 0` means all.
	async fn list_recent(&self, list: &str, limit: usize) -> anyhow::Result<Vec<Value>>;

	/// Exclusive lock on one key. The returned guard releases on drop.
	async fn lock(&self, key: &str) -> KeyLockGuard;

	/// Begin an exclusive transaction on one key. The key lock is held
	/// until commit or abort.
	async fn begin(&self, key: &str) -> anyhow::Result<Box<dyn StoreTransaction>>;
}

/// A read-modify-write transaction. Exactly one of `commit`/`abort` should
/// be called; dropping without either behaves like abort.
#[async_trait]
pub trait StoreTransaction: Send {
	async fn get(&mut self, key: &str) -> anyhow::Result<Option<Value>>;

	async fn put(&mut self, key: &str, value: Value) -> anyhow::Result<()>;

	async fn commit(self: Box<Self>) -> anyhow::Result<()>;

	async fn abort(self: Box<Self>) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct MemoryInner {
	records: HashMap<String, Value>,
	lists: HashMap<String, VecDeque<Value>>,
}

/// In-memory record store for tests and single-process dev setups.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordStore {
	inner: Arc<Mutex<MemoryInner>>,
	locks: KeyLocks,
}

impl MemoryRecordStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
	async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
		Ok(self.inner.lock().await.records.get(key).cloned())
	}

	async fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
		self.inner.lock().await.records.insert(key.to_string(), value);
		Ok(())
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		self.inner.lock().await.records.remove(key);
		Ok(())
	}

	async fn list_push(&self, list: &str, value: Value) -> anyhow::Result<u64> {
		let mut inner = self.inner.lock().await;
		let entry = inner.lists.entry(list.to_string()).or_default();
		entry.push_back(value);
		Ok(entry.len() as u64)
	}

	async fn list_recent(&self, list: &str, limit: usize) -> anyhow::Result<Vec<Value>> {
		let inner = self.inner.lock().await;
		let Some(entry) = inner.lists.get(list) else {
			return Ok(Vec::new());
		};
		let skip = if limit == 0 || limit >= entry.len() {
			0
		} else {
			entry.len() - limit
		};
		Ok(entry.iter().skip(skip).cloned().collect())
	}

	async fn lock(&self, key: &str) -> KeyLockGuard {
		self.locks.lock(key).await
	}

	async fn begin(&self, key: &str) -> anyhow::Result<Box<dyn StoreTransaction>> {
		let guard = self.locks.lock(key).await;
		Ok(Box::new(MemoryTransaction {
			store: Arc::clone(&self.inner),
			staged: HashMap::new(),
			_guard: guard,
		}))
	}
}

struct MemoryTransaction {
	store: Arc<Mutex<MemoryInner>>,
	staged: HashMap<String, Value>,
	_guard: KeyLockGuard,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
	async fn get(&mut self, key: &str) -> anyhow::Result<Option<Value>> {
		if let Some(staged) = self.staged.get(key) {
			return Ok(Some(staged.clone()));
		}
		Ok(self.store.lock().await.records.get(key).cloned())
	}

	async fn put(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
		self.staged.insert(key.to_string(), value);
		Ok(())
	}

	async fn commit(self: Box<Self>) -> anyhow::Result<()> {
		let mut inner = self.store.lock().await;
		for (key, value) in self.staged {
			inner.records.insert(key, value);
		}
		Ok(())
	}

	async fn abort(self: Box<Self>) -> anyhow::Result<()> {
		// staged writes are simply discarded
		Ok(())
	}
}

/// SQLite-backed record store.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
	pool: sqlx::SqlitePool,
	locks: KeyLocks,
}

impl SqliteRecordStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;

		sqlx::query("CREATE TABLE IF NOT EXISTS records (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
			.execute(&pool)
			.await
			.context("create records table")?;
		sqlx::query(
			"CREATE TABLE IF NOT EXISTS list_items (list TEXT NOT NULL, idx INTEGER NOT NULL, value TEXT NOT NULL, \
			PRIMARY KEY (list, idx))",
		)
		.execute(&pool)
		.await
		.context("create list_items table")?;

		Ok(Self {
			pool,
			locks: KeyLocks::default(),
		})
	}
}

fn encode(value: &Value) -> anyhow::Result<String> {
	serde_json::to_string(value).context("encode record value")
}

fn decode(raw: &str) -> anyhow::Result<Value> {
	serde_json::from_str(raw).context("decode record value")
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
	async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
		let row: Option<(String,)> = sqlx::query_as("SELECT value FROM records WHERE key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await
			.context("select record")?;
		row.map(|(raw,)| decode(&raw)).transpose()
	}

	async fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
		sqlx::query("INSERT INTO records (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
			.bind(key)
			.bind(encode(&value)?)
			.execute(&self.pool)
			.await
			.context("upsert record")?;
		Ok(())
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		sqlx::query("DELETE FROM records WHERE key = ?")
			.bind(key)
			.execute(&self.pool)
			.await
			.context("delete record")?;
		Ok(())
	}

	async fn list_push(&self, list: &str, value: Value) -> anyhow::Result<u64> {
		let mut tx = self.pool.begin().await.context("begin list push")?;
		let (next,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(idx) + 1, 0) FROM list_items WHERE list = ?")
			.bind(list)
			.fetch_one(&mut *tx)
			.await
			.context("next list index")?;
		sqlx::query("INSERT INTO list_items (list, idx, value) VALUES (?, ?, ?)")
			.bind(list)
			.bind(next)
			.bind(encode(&value)?)
			.execute(&mut *tx)
			.await
			.context("insert list item")?;
		tx.commit().await.context("commit list push")?;
		Ok((next + 1) as u64)
	}

	async fn list_recent(&self, list: &str, limit: usize) -> anyhow::Result<Vec<Value>> {
		let rows: Vec<(String,)> = if limit == 0 {
			sqlx::query_as("SELECT value FROM list_items WHERE list = ? ORDER BY idx ASC")
				.bind(list)
				.fetch_all(&self.pool)
				.await
				.context("select list items")?
		} else {
			let mut rows: Vec<(String,)> =
				sqlx::query_as("SELECT value FROM list_items WHERE list = ? ORDER BY idx DESC LIMIT ?")
					.bind(list)
					.bind(limit as i64)
					.fetch_all(&self.pool)
					.await
					.context("select recent list items")?;
			rows.reverse();
			rows
		};

		rows.iter().map(|(raw,)| decode(raw)).collect()
	}

	async fn lock(&self, key: &str) -> KeyLockGuard {
		self.locks.lock(key).await
	}

	async fn begin(&self, key: &str) -> anyhow::Result<Box<dyn StoreTransaction>> {
		let guard = self.locks.lock(key).await;
		let tx = self.pool.begin().await.context("begin sqlite tx")?;
		Ok(Box::new(SqliteTransaction {
			tx: Some(tx),
			_guard: guard,
		}))
	}
}

struct SqliteTransaction {
	tx: Option<sqlx::Transaction<'static, sqlx::Sqlite>>,
	_guard: KeyLockGuard,
}

impl SqliteTransaction {
	fn tx(&mut self) -> anyhow::Result<&mut sqlx::Transaction<'static, sqlx::Sqlite>> {
		self.tx.as_mut().context("transaction already finished")
	}
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
	async fn get(&mut self, key: &str) -> anyhow::Result<Option<Value>> {
		let tx = self.tx()?;
		let row: Option<(String,)> = sqlx::query_as("SELECT value FROM records WHERE key = ?")
			.bind(key)
			.fetch_optional(&mut **tx)
			.await
			.context("select record in tx")?;
		row.map(|(raw,)| decode(&raw)).transpose()
	}

	async fn put(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
		let raw = encode(&value)?;
		let tx = self.tx()?;
		sqlx::query("INSERT INTO records (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
			.bind(key)
			.bind(raw)
			.execute(&mut **tx)
			.await
			.context("upsert record in tx")?;
		Ok(())
	}

	async fn commit(mut self: Box<Self>) -> anyhow::Result<()> {
		let tx = self.tx.take().context("transaction already finished")?;
		tx.commit().await.context("commit sqlite tx")
	}

	async fn abort(mut self: Box<Self>) -> anyhow::Result<()> {
		let tx = self.tx.take().context("transaction already finished")?;
		tx.rollback().await.context("rollback sqlite tx")
	}
}
