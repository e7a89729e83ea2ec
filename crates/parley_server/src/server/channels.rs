#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use parley_domain::{ChannelId, ChannelInfo, ChatMessage, MemberRole, MessageId, UserRecord, Username};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
	#[error("Channel already exists: {0}")]
	AlreadyExists(ChannelId),
	#[error("Channel not found: {0}")]
	NotFound(String),
	#[error("You do not have access to private channel: {0}")]
	AccessDenied(ChannelId),
	#[error("Invalid channel ID: {0}")]
	ReservedId(String),
}

/// One channel: persisted definition plus ephemeral live-membership and
/// the bounded in-memory history ring.
#[derive(Debug, Clone)]
pub struct ChannelRecord {
	pub info: ChannelInfo,
	pub live: HashSet<Username>,
	pub history: VecDeque<ChatMessage>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelPatch {
	pub title: Option<String>,
	pub topic: Option<String>,
	pub private: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
	/// False when the user was already live (another device); the joined
	/// notice is suppressed but the welcome snapshot still goes out.
	pub first_join: bool,
	pub channel: ChannelInfo,
	pub history: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct LeaveOutcome {
	/// False when the user was not live; nothing to announce.
	pub removed: bool,
	/// The channel was an empty PM channel and has been dropped.
	pub pm_deleted: bool,
	pub channel: ChannelInfo,
}

/// Owns channel definitions, persisted membership, live-membership, and
/// bounded history.
pub struct ChannelRegistry {
	inner: Mutex<HashMap<ChannelId, ChannelRecord>>,
	max_history: usize,
}

impl ChannelRegistry {
	pub fn new(max_history: usize) -> Self {
		Self {
			inner: Mutex::new(HashMap::new()),
			max_history,
		}
	}

	/// Insert a definition loaded from the store at startup.
	pub async fn insert_loaded(&self, info: ChannelInfo) {
		let mut inner = self.inner.lock().await;
		inner.entry(info.id.clone()).or_insert_with(|| ChannelRecord {
			info,
			live: HashSet::new(),
			history: VecDeque::new(),
		});
	}

	/// Create a persistent channel. The reserved PM prefix is forbidden.
	pub async fn create(&self, info: ChannelInfo) -> Result<ChannelInfo, ChannelError> {
		if info.id.is_pm() {
			return Err(ChannelError::ReservedId(info.id.as_str().to_string()));
		}

		let mut inner = self.inner.lock().await;
		if inner.contains_key(&info.id) {
			return Err(ChannelError::AlreadyExists(info.id));
		}

		inner.insert(
			info.id.clone(),
			ChannelRecord {
				info: info.clone(),
				live: HashSet::new(),
				history: VecDeque::new(),
			},
		);
		Ok(info)
	}

	/// Apply a patch; returns the updated definition plus any live users
	/// who lost access because the channel just became private.
	pub async fn update(
		&self,
		id: &ChannelId,
		patch: ChannelPatch,
		now_ms: i64,
	) -> Result<(ChannelInfo, Vec<Username>), ChannelError> {
		let mut inner = self.inner.lock().await;
		let record = inner
			.get_mut(id)
			.ok_or_else(|| ChannelError::NotFound(id.as_str().to_string()))?;

		let was_private = record.info.private;
		if let Some(title) = patch.title {
			record.info.title = title;
		}
		if let Some(topic) = patch.topic {
			record.info.topic = topic;
		}
		if let Some(private) = patch.private {
			record.info.private = private;
		}
		record.info.modified = now_ms;

		let mut evicted = Vec::new();
		if record.info.private && !was_private {
			for username in &record.live {
				if !record.info.users.contains_key(username) {
					evicted.push(username.clone());
				}
			}
		}

		Ok((record.info.clone(), evicted))
	}

	/// Drop a channel. Callers must have emptied live-membership through
	/// the leave path first.
	pub async fn remove(&self, id: &ChannelId) -> Result<ChannelInfo, ChannelError> {
		let mut inner = self.inner.lock().await;
		let record = inner
			.remove(id)
			.ok_or_else(|| ChannelError::NotFound(id.as_str().to_string()))?;
		Ok(record.info)
	}

	/// Find or lazily create the deterministic PM channel for two users.
	/// Both parties are (re)granted admin on every call.
	pub async fn get_or_create_pm(&self, a: &Username, b: &Username, now_ms: i64) -> (ChannelInfo, bool) {
		let id = ChannelId::pm_for(a, b);
		let mut inner = self.inner.lock().await;

		let created = !inner.contains_key(&id);
		let record = inner.entry(id.clone()).or_insert_with(|| ChannelRecord {
			info: ChannelInfo {
				id,
				title: "(PM)".to_string(),
				topic: "(Private Chat)".to_string(),
				private: true,
				pm: true,
				founder: a.clone(),
				users: BTreeMap::new(),
				created: now_ms,
				modified: now_ms,
			},
			live: HashSet::new(),
			history: VecDeque::new(),
		});

		record.info.users.insert(a.clone(), MemberRole { admin: true });
		record.info.users.insert(b.clone(), MemberRole { admin: true });

		(record.info.clone(), created)
	}

	/// Add a user to live-membership. Private channels require membership
	/// or a global admin. Idempotent for users already live.
	pub async fn join(&self, username: &Username, is_global_admin: bool, id: &ChannelId) -> Result<JoinOutcome, ChannelError> {
		let mut inner = self.inner.lock().await;
		let record = inner
			.get_mut(id)
			.ok_or_else(|| ChannelError::NotFound(id.as_str().to_string()))?;

		if record.info.private && !is_global_admin && !record.info.users.contains_key(username) {
			return Err(ChannelError::AccessDenied(id.clone()));
		}

		let first_join = record.live.insert(username.clone());

		Ok(JoinOutcome {
			first_join,
			channel: record.info.clone(),
			history: record.history.iter().cloned().collect(),
		})
	}

	/// Remove a user from live-membership; empty PM channels are dropped.
	pub async fn leave(&self, username: &Username, id: &ChannelId) -> Result<LeaveOutcome, ChannelError> {
		let mut inner = self.inner.lock().await;
		let record = inner
			.get_mut(id)
			.ok_or_else(|| ChannelError::NotFound(id.as_str().to_string()))?;

		let removed = record.live.remove(username);
		let channel = record.info.clone();
		let pm_deleted = channel.pm && record.live.is_empty();

		if pm_deleted {
			debug!(channel = %id, "last user left temp PM channel, deleting");
			inner.remove(id);
		}

		Ok(LeaveOutcome {
			removed,
			pm_deleted,
			channel,
		})
	}

	/// Append to the bounded history ring (FIFO eviction) and return the
	/// live-membership snapshot, taken under the same guard so membership
	/// and the resulting broadcast cannot diverge mid-update.
	pub async fn commit_message(&self, id: &ChannelId, message: ChatMessage) -> Result<Vec<Username>, ChannelError> {
		let mut inner = self.inner.lock().await;
		let record = inner
			.get_mut(id)
			.ok_or_else(|| ChannelError::NotFound(id.as_str().to_string()))?;

		record.history.push_back(message);
		while record.history.len() > self.max_history {
			record.history.pop_front();
		}

		Ok(record.live.iter().cloned().collect())
	}

	/// Patch a cached history entry in place (annotation sync). Returns
	/// whether the message was present in the ring.
	pub async fn patch_history<F>(&self, id: &ChannelId, message_id: &MessageId, patch: F) -> bool
	where
		F: FnOnce(&mut ChatMessage),
	{
		let mut inner = self.inner.lock().await;
		let Some(record) = inner.get_mut(id) else {
			return false;
		};
		match record.history.iter_mut().find(|m| m.id == *message_id) {
			Some(message) => {
				patch(message);
				true
			}
			None => false,
		}
	}

	/// Replace the history ring with records preloaded from the store.
	pub async fn preload_history(&self, id: &ChannelId, messages: Vec<ChatMessage>) {
		let mut inner = self.inner.lock().await;
		if let Some(record) = inner.get_mut(id) {
			record.history = messages.into_iter().collect();
			while record.history.len() > self.max_history {
				record.history.pop_front();
			}
		}
	}

	pub async fn info(&self, id: &ChannelId) -> Option<ChannelInfo> {
		self.inner.lock().await.get(id).map(|r| r.info.clone())
	}

	pub async fn exists(&self, id: &ChannelId) -> bool {
		self.inner.lock().await.contains_key(id)
	}

	pub async fn is_live(&self, id: &ChannelId, username: &Username) -> bool {
		self.inner
			.lock()
			.await
			.get(id)
			.map(|r| r.live.contains(username))
			.unwrap_or(false)
	}

	pub async fn live_members(&self, id: &ChannelId) -> Vec<Username> {
		self.inner
			.lock()
			.await
			.get(id)
			.map(|r| r.live.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub async fn history(&self, id: &ChannelId) -> Vec<ChatMessage> {
		self.inner
			.lock()
			.await
			.get(id)
			.map(|r| r.history.iter().cloned().collect())
			.unwrap_or_default()
	}

	/// Whether the user holds channel-admin on this channel.
	pub async fn is_channel_admin(&self, id: &ChannelId, username: &Username) -> bool {
		self.inner
			.lock()
			.await
			.get(id)
			.and_then(|r| r.info.users.get(username))
			.map(|role| role.admin)
			.unwrap_or(false)
	}

	/// Channels a user should see in their login snapshot: PM channels
	/// only for their members, private channels for members and global
	/// admins, public channels for everyone.
	pub async fn visible_for(&self, user: &UserRecord) -> BTreeMap<ChannelId, ChannelInfo> {
		let inner = self.inner.lock().await;
		inner
			.iter()
			.filter(|(_, record)| {
				let info = &record.info;
				if info.pm {
					info.users.contains_key(&user.username)
				} else if info.private {
					user.privileges.admin || info.users.contains_key(&user.username)
				} else {
					true
				}
			})
			.map(|(id, record)| (id.clone(), record.info.clone()))
			.collect()
	}

	/// All non-PM definitions, for persistence.
	pub async fn persistent_infos(&self) -> Vec<ChannelInfo> {
		self.inner
			.lock()
			.await
			.values()
			.filter(|r| !r.info.pm)
			.map(|r| r.info.clone())
			.collect()
	}
}
