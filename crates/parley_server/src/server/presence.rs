#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};

use parley_domain::{ChannelId, ConnectionId, UserRecord, Username};
use tokio::sync::Mutex;
use tracing::debug;

/// One known user and the connections currently backing them. Online is
/// derived from the connection set being non-empty, never stored.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
	pub user: UserRecord,
	pub connections: HashSet<ConnectionId>,
	pub live_channels: HashSet<ChannelId>,
	pub ip: Option<String>,
	pub login_time: Option<i64>,
	pub logout_time: Option<i64>,
}

/// Result of removing one connection from a user.
#[derive(Debug, Default)]
pub struct DetachOutcome {
	/// False when the id was not in the set (detach raced a forced logout).
	pub removed: bool,
	/// True when this was the user's last connection.
	pub went_offline: bool,
	/// Channels the user was live in, drained only on `went_offline`.
	pub live_channels: Vec<ChannelId>,
}

/// Owns the set of known users; records are created at first reference and
/// retained for the life of the process.
#[derive(Default)]
pub struct PresenceRegistry {
	inner: Mutex<HashMap<Username, PresenceRecord>>,
}

impl PresenceRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Bind a connection to a (possibly newly created) presence record.
	/// First connection records source IP and login time.
	pub async fn attach(&self, username: &Username, conn_id: ConnectionId, user: UserRecord, ip: &str, now_ms: i64) {
		let mut inner = self.inner.lock().await;
		let record = inner.entry(username.clone()).or_insert_with(|| PresenceRecord {
			user: user.clone(),
			connections: HashSet::new(),
			live_channels: HashSet::new(),
			ip: None,
			login_time: None,
			logout_time: None,
		});

		// keep the cached profile fresh on every login
		record.user = user;

		if record.connections.is_empty() {
			record.login_time = Some(now_ms);
		}
		record.ip = Some(ip.to_string());
		record.connections.insert(conn_id);

		debug!(
			username = %username,
			connections = record.connections.len(),
			"presence attach"
		);
	}

	/// Remove a connection from the user's set. Unknown users and absent
	/// ids are no-ops (disconnect can race a ban-triggered forced logout).
	pub async fn detach(&self, username: &Username, conn_id: ConnectionId, now_ms: i64) -> DetachOutcome {
		let mut inner = self.inner.lock().await;
		let Some(record) = inner.get_mut(username) else {
			return DetachOutcome::default();
		};

		let removed = record.connections.remove(&conn_id);
		if !removed {
			return DetachOutcome::default();
		}

		if record.connections.is_empty() {
			record.ip = None;
			record.login_time = None;
			record.logout_time = Some(now_ms);
			let live_channels = record.live_channels.drain().collect();

			debug!(username = %username, "presence detach: user offline");
			DetachOutcome {
				removed: true,
				went_offline: true,
				live_channels,
			}
		} else {
			debug!(
				username = %username,
				connections = record.connections.len(),
				"presence detach: other connections remain"
			);
			DetachOutcome {
				removed: true,
				went_offline: false,
				live_channels: Vec::new(),
			}
		}
	}

	pub async fn is_online(&self, username: &Username) -> bool {
		self.inner
			.lock()
			.await
			.get(username)
			.map(|r| !r.connections.is_empty())
			.unwrap_or(false)
	}

	pub async fn connection_ids(&self, username: &Username) -> Vec<ConnectionId> {
		self.inner
			.lock()
			.await
			.get(username)
			.map(|r| r.connections.iter().copied().collect())
			.unwrap_or_default()
	}

	pub async fn add_live_channel(&self, username: &Username, channel_id: &ChannelId) {
		if let Some(record) = self.inner.lock().await.get_mut(username) {
			record.live_channels.insert(channel_id.clone());
		}
	}

	pub async fn remove_live_channel(&self, username: &Username, channel_id: &ChannelId) {
		if let Some(record) = self.inner.lock().await.get_mut(username) {
			record.live_channels.remove(channel_id);
		}
	}

	pub async fn live_channels(&self, username: &Username) -> Vec<ChannelId> {
		self.inner
			.lock()
			.await
			.get(username)
			.map(|r| r.live_channels.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub async fn profile(&self, username: &Username) -> Option<UserRecord> {
		self.inner.lock().await.get(username).map(|r| r.user.clone())
	}

	/// Refresh the cached profile after an identity-provider change. A
	/// record is created if the user was never seen (lazy first reference).
	pub async fn update_profile(&self, user: UserRecord) {
		let mut inner = self.inner.lock().await;
		match inner.get_mut(&user.username) {
			Some(record) => record.user = user,
			None => {
				let username = user.username.clone();
				inner.insert(
					username,
					PresenceRecord {
						user,
						connections: HashSet::new(),
						live_channels: HashSet::new(),
						ip: None,
						login_time: None,
						logout_time: None,
					},
				);
			}
		}
	}

	/// Drop a record entirely (account deleted upstream).
	pub async fn remove(&self, username: &Username) -> Option<PresenceRecord> {
		self.inner.lock().await.remove(username)
	}

	/// Known users keyed by username, for the login snapshot.
	pub async fn snapshot_users(&self) -> BTreeMap<Username, UserRecord> {
		self.inner
			.lock()
			.await
			.iter()
			.map(|(name, record)| (name.clone(), record.user.clone()))
			.collect()
	}

	pub async fn contains(&self, username: &Username) -> bool {
		self.inner.lock().await.contains_key(username)
	}
}
