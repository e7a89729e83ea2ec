#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parley_domain::{ConnectionId, Username};
use parley_protocol::ServerEvent;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Items queued to a connection's writer task. Per-connection send order
/// is preserved because everything rides one queue.
#[derive(Debug, Clone)]
pub enum Outbound {
	Event(ServerEvent),
	/// Ask the writer to close the transport.
	Close,
}

/// Byte counters shared between the transport tasks and the registry.
#[derive(Debug, Default)]
pub struct TrafficCounters {
	pub bytes_in: AtomicU64,
	pub bytes_out: AtomicU64,
}

struct ConnEntry {
	addr: String,
	authenticated: bool,
	username: Option<Username>,
	session_id: Option<String>,
	/// Last liveness signal (hey or echoback), unix ms.
	last_heartbeat_ms: i64,
	ping_ms: i64,
	/// Client-reported fields; `last_event_time` feeds status tie-breaking.
	metadata: BTreeMap<String, Value>,
	/// In-flight liveness probe.
	echo_id: Option<String>,
	echo_time_ms: i64,
	traffic: Arc<TrafficCounters>,
	last_bytes_in: u64,
	last_bytes_out: u64,
	sender: mpsc::UnboundedSender<Outbound>,
}

/// Point-in-time view of one connection, used by the sweeper and tests.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
	pub id: ConnectionId,
	pub addr: String,
	pub authenticated: bool,
	pub username: Option<Username>,
	pub last_heartbeat_ms: i64,
	pub ping_ms: i64,
}

/// Owns every live transport connection and its per-connection metadata.
#[derive(Default)]
pub struct ConnectionRegistry {
	inner: Mutex<HashMap<ConnectionId, ConnEntry>>,
	next_id: AtomicU64,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Admit a new transport connection in the unauthenticated state.
	pub async fn register(
		&self,
		addr: impl Into<String>,
		sender: mpsc::UnboundedSender<Outbound>,
		traffic: Arc<TrafficCounters>,
		now_ms: i64,
	) -> ConnectionId {
		let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
		let mut metadata = BTreeMap::new();
		metadata.insert("last_event_time".to_string(), Value::from(now_ms));

		self.inner.lock().await.insert(
			id,
			ConnEntry {
				addr: addr.into(),
				authenticated: false,
				username: None,
				session_id: None,
				last_heartbeat_ms: now_ms,
				ping_ms: 0,
				metadata,
				echo_id: None,
				echo_time_ms: 0,
				traffic,
				last_bytes_in: 0,
				last_bytes_out: 0,
				sender,
			},
		);

		metrics::gauge!("parley_active_connections").increment(1.0);
		id
	}

	/// Forget a connection. Idempotent; safe for never-authenticated ids.
	/// Callers that own an authenticated connection must run the presence
	/// detach path before calling this.
	pub async fn remove(&self, id: ConnectionId) {
		if self.inner.lock().await.remove(&id).is_some() {
			metrics::gauge!("parley_active_connections").decrement(1.0);
		}
	}

	/// Queue an event to one connection. Failures (connection gone, writer
	/// stopped) are logged and swallowed: a half-closed socket must never
	/// crash the dispatcher.
	pub async fn send(&self, id: ConnectionId, event: &ServerEvent) {
		let inner = self.inner.lock().await;
		let Some(entry) = inner.get(&id) else {
			debug!(conn = %id, event = event.name(), "send to unknown connection dropped");
			return;
		};
		if entry.sender.send(Outbound::Event(event.clone())).is_err() {
			debug!(conn = %id, event = event.name(), "send to closed connection dropped");
			metrics::counter!("parley_send_drops_total").increment(1);
		}
	}

	/// Like [`send`](Self::send) but skips unauthenticated connections.
	pub async fn send_if_authenticated(&self, id: ConnectionId, event: &ServerEvent) {
		let inner = self.inner.lock().await;
		let Some(entry) = inner.get(&id) else {
			return;
		};
		if !entry.authenticated {
			return;
		}
		if entry.sender.send(Outbound::Event(event.clone())).is_err() {
			metrics::counter!("parley_send_drops_total").increment(1);
		}
	}

	/// Ask the writer task to close the transport.
	pub async fn force_close(&self, id: ConnectionId) {
		let inner = self.inner.lock().await;
		if let Some(entry) = inner.get(&id) {
			let _ = entry.sender.send(Outbound::Close);
		}
	}

	/// Mark a connection authenticated and bound to a user.
	pub async fn bind(&self, id: ConnectionId, username: Username, session_id: String) {
		if let Some(entry) = self.inner.lock().await.get_mut(&id) {
			entry.authenticated = true;
			entry.username = Some(username);
			entry.session_id = Some(session_id);
		}
	}

	/// Drop the authenticated flag (logout keeps the transport open).
	pub async fn unbind(&self, id: ConnectionId) {
		if let Some(entry) = self.inner.lock().await.get_mut(&id) {
			entry.authenticated = false;
		}
	}

	pub async fn username(&self, id: ConnectionId) -> Option<Username> {
		self.inner.lock().await.get(&id).and_then(|e| e.username.clone())
	}

	pub async fn session_id(&self, id: ConnectionId) -> Option<String> {
		self.inner.lock().await.get(&id).and_then(|e| e.session_id.clone())
	}

	pub async fn is_authenticated(&self, id: ConnectionId) -> bool {
		self.inner.lock().await.get(&id).map(|e| e.authenticated).unwrap_or(false)
	}

	pub async fn addr(&self, id: ConnectionId) -> Option<String> {
		self.inner.lock().await.get(&id).map(|e| e.addr.clone())
	}

	/// Record a liveness signal and merge client-reported metadata.
	pub async fn touch(&self, id: ConnectionId, fields: BTreeMap<String, Value>, now_ms: i64) {
		if let Some(entry) = self.inner.lock().await.get_mut(&id) {
			entry.last_heartbeat_ms = now_ms;
			for (key, value) in fields {
				entry.metadata.insert(key, value);
			}
		}
	}

	/// Arm a liveness probe on the connection.
	pub async fn set_echo(&self, id: ConnectionId, echo_id: String, now_ms: i64) {
		if let Some(entry) = self.inner.lock().await.get_mut(&id) {
			entry.echo_id = Some(echo_id);
			entry.echo_time_ms = now_ms;
		}
	}

	/// Process an echo reply; returns the measured round-trip time when the
	/// correlation id matches the in-flight probe.
	pub async fn record_echo_reply(&self, id: ConnectionId, echo_id: &str, now_ms: i64) -> Option<i64> {
		let mut inner = self.inner.lock().await;
		let entry = inner.get_mut(&id)?;
		entry.last_heartbeat_ms = now_ms;

		if entry.echo_id.as_deref() == Some(echo_id) {
			let ping_ms = (now_ms - entry.echo_time_ms).max(0);
			entry.ping_ms = ping_ms;
			entry.echo_id = None;
			Some(ping_ms)
		} else {
			entry.ping_ms = 0;
			None
		}
	}

	/// Numeric metadata field, tolerating both integer and float encodings.
	pub async fn metadata_number(&self, id: ConnectionId, key: &str) -> Option<f64> {
		self.inner.lock().await.get(&id).and_then(|e| e.metadata.get(key)).and_then(Value::as_f64)
	}

	pub async fn authenticated_ids(&self) -> Vec<ConnectionId> {
		self.inner
			.lock()
			.await
			.iter()
			.filter(|(_, e)| e.authenticated)
			.map(|(id, _)| *id)
			.collect()
	}

	pub async fn count(&self) -> usize {
		self.inner.lock().await.len()
	}

	pub async fn authenticated_count(&self) -> usize {
		self.inner.lock().await.values().filter(|e| e.authenticated).count()
	}

	pub async fn snapshot_all(&self) -> Vec<ConnectionSnapshot> {
		self.inner
			.lock()
			.await
			.iter()
			.map(|(id, e)| ConnectionSnapshot {
				id: *id,
				addr: e.addr.clone(),
				authenticated: e.authenticated,
				username: e.username.clone(),
				last_heartbeat_ms: e.last_heartbeat_ms,
				ping_ms: e.ping_ms,
			})
			.collect()
	}

	/// Byte-in/byte-out deltas since the previous sweep.
	pub async fn take_traffic_delta(&self, id: ConnectionId) -> (u64, u64) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.get_mut(&id) else {
			return (0, 0);
		};

		let cur_in = entry.traffic.bytes_in.load(Ordering::Relaxed);
		let cur_out = entry.traffic.bytes_out.load(Ordering::Relaxed);
		let delta_in = cur_in.saturating_sub(entry.last_bytes_in);
		let delta_out = cur_out.saturating_sub(entry.last_bytes_out);
		entry.last_bytes_in = cur_in;
		entry.last_bytes_out = cur_out;
		(delta_in, delta_out)
	}
}
