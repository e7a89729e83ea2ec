#![forbid(unsafe_code)]

//! Core identifiers and message model shared by the wire, store, and
//! server crates. Everything here is pure data — no I/O, no clocks except
//! where a caller passes a timestamp in.

use core::fmt;
use core::str::FromStr;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

fn normalize_word(s: &str) -> String {
	s.chars()
		.filter(|c| c.is_ascii_alphanumeric() || *c == '_')
		.flat_map(|c| c.to_lowercase())
		.collect()
}

/// Normalized username: lower-case alphanumeric plus underscore.
///
/// All lookups across the registries key on this, so any user-supplied
/// spelling must pass through [`Username::normalize`] exactly once at the
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	pub fn normalize(s: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let norm = normalize_word(s.as_ref());
		if norm.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(norm))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::normalize(s)
	}
}

/// Reserved prefix for ephemeral direct-message channels.
pub const PM_PREFIX: &str = "pm_";

/// Normalized channel identifier: lower-case alphanumeric plus underscore.
///
/// Ids starting with [`PM_PREFIX`] denote ephemeral direct channels and are
/// only ever minted by [`ChannelId::pm_for`], never by user-supplied create
/// requests (the registry rejects those).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
	pub fn normalize(s: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let norm = normalize_word(s.as_ref());
		if norm.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(norm))
	}

	/// Deterministic id for the direct channel between two users.
	///
	/// Hashes the sorted pair, so `pm_for(a, b) == pm_for(b, a)` and both
	/// parties converge on the same channel regardless of who initiates.
	pub fn pm_for(a: &Username, b: &Username) -> Self {
		let mut pair = [a.as_str(), b.as_str()];
		pair.sort_unstable();
		let digest = Sha256::digest(pair.join("-").as_bytes());
		let mut hex = String::with_capacity(32);
		for byte in digest.iter().take(16) {
			hex.push_str(&format!("{byte:02x}"));
		}
		Self(format!("{PM_PREFIX}{hex}"))
	}

	pub fn is_pm(&self) -> bool {
		self.0.starts_with(PM_PREFIX)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelId::normalize(s)
	}
}

/// Opaque per-process connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "c{}", self.0)
	}
}

/// Chat message identifier (client- or server-assigned).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Sequence id cross-referencing the persisted copy of a message.
///
/// Assigned only to indexable messages in non-private, non-PM channels;
/// annotation updates address the stored record through this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqId(String);

impl SeqId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SeqId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

fn to_base36(mut v: u128) -> String {
	const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
	if v == 0 {
		return "0".to_string();
	}
	let mut out = Vec::new();
	while v > 0 {
		out.push(DIGITS[(v % 36) as usize]);
		v /= 36;
	}
	out.reverse();
	String::from_utf8(out).expect("base36 digits are ascii")
}

/// Generator for short sortable unique ids: millisecond timestamp plus a
/// wrapping counter, both base36, with an optional prefix.
#[derive(Debug, Default)]
pub struct IdFactory {
	counter: AtomicU32,
}

impl IdFactory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next(&self, prefix: &str) -> String {
		// counter wraps at 36^2 so the suffix stays two digits
		let n = self.counter.fetch_add(1, Ordering::Relaxed) % (36 * 36);
		let ms = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis();
		format!("{prefix}{:0>8}{:0>2}", to_base36(ms), to_base36(n as u128))
	}
}

/// Chat message types carried over the wire and into history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	Standard,
	Pose,
	Code,
	Notice,
	App,
	Whisper,
	Delete,
}

impl MessageKind {
	/// Whether messages of this kind are persisted and indexed.
	pub fn is_indexable(self) -> bool {
		matches!(
			self,
			MessageKind::Standard | MessageKind::Code | MessageKind::Pose | MessageKind::App | MessageKind::Delete
		)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Standard => "standard",
			MessageKind::Pose => "pose",
			MessageKind::Code => "code",
			MessageKind::Notice => "notice",
			MessageKind::App => "app",
			MessageKind::Whisper => "whisper",
			MessageKind::Delete => "delete",
		}
	}
}

/// Action applied to a reaction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
	Add,
	Delete,
}

/// A single emoji reaction on a message: who applied it plus a sort key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
	pub users: BTreeSet<Username>,
	/// Creation order; "+1" and "-1" get fixed low keys so they sort first.
	pub date: i64,
}

/// All reactions on one message, keyed by emoji id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionMap(pub BTreeMap<String, Reaction>);

impl ReactionMap {
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	fn sort_key(emoji_id: &str, now_ms: i64) -> i64 {
		match emoji_id {
			"+1" => 1,
			"-1" => 2,
			_ => now_ms,
		}
	}

	fn remove_user(&mut self, emoji_id: &str, user: &Username) -> bool {
		let Some(reaction) = self.0.get_mut(emoji_id) else {
			return false;
		};
		let removed = reaction.users.remove(user);
		if reaction.users.is_empty() {
			self.0.remove(emoji_id);
		}
		removed
	}

	/// Apply an add/delete, upholding the +1/-1 mutual exclusion: a user
	/// may hold at most one of the two vote emoji on a message at a time.
	pub fn apply(&mut self, action: ReactionAction, emoji_id: &str, user: &Username, now_ms: i64) -> bool {
		match action {
			ReactionAction::Add => {
				let entry = self.0.entry(emoji_id.to_string()).or_insert_with(|| Reaction {
					users: BTreeSet::new(),
					date: Self::sort_key(emoji_id, now_ms),
				});
				let inserted = entry.users.insert(user.clone());

				match emoji_id {
					"+1" => {
						self.remove_user("-1", user);
					}
					"-1" => {
						self.remove_user("+1", user);
					}
					_ => {}
				}

				inserted
			}
			ReactionAction::Delete => self.remove_user(emoji_id, user),
		}
	}

	pub fn users_of(&self, emoji_id: &str) -> Option<&BTreeSet<Username>> {
		self.0.get(emoji_id).map(|r| &r.users)
	}
}

/// Action applied to a message's tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagAction {
	Add,
	Remove,
}

/// Free-text labels on a message, canonicalized as a sorted, de-duplicated
/// comma list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
	pub fn parse_csv(csv: &str) -> Self {
		let mut set = BTreeSet::new();
		for part in csv.split(',') {
			let tag = part.trim();
			if !tag.is_empty() {
				set.insert(tag.to_string());
			}
		}
		Self(set)
	}

	pub fn to_csv(&self) -> String {
		self.0.iter().cloned().collect::<Vec<_>>().join(",")
	}

	pub fn apply(&mut self, action: TagAction, other: &TagSet) {
		match action {
			TagAction::Add => {
				for tag in &other.0 {
					self.0.insert(tag.clone());
				}
			}
			TagAction::Remove => {
				for tag in &other.0 {
					self.0.remove(tag);
				}
			}
		}
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn contains(&self, tag: &str) -> bool {
		self.0.contains(tag)
	}
}

/// One chat message, immutable once broadcast except for its reactions and
/// tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub id: MessageId,
	pub channel_id: ChannelId,
	#[serde(rename = "type")]
	pub kind: MessageKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub username: Option<Username>,
	pub content: String,
	/// Unix milliseconds.
	pub date: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub seq_id: Option<SeqId>,
	/// Notice label ("User", "Topic", ...).
	#[serde(skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
	/// Whisper recipient.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub to: Option<Username>,
	#[serde(default, skip_serializing_if = "ReactionMap::is_empty")]
	pub reactions: ReactionMap,
	/// Canonical sorted comma list.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tags: Option<String>,
}

/// Privilege flags attached to a user record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privileges {
	#[serde(default)]
	pub admin: bool,
	#[serde(default)]
	pub manage_emoji: bool,
	#[serde(default)]
	pub create_channels: bool,
	#[serde(default)]
	pub edit_channels: bool,
	#[serde(default)]
	pub delete_channels: bool,
}

/// Durable user record as held by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
	pub username: Username,
	pub full_name: String,
	pub nickname: String,
	#[serde(default)]
	pub status: String,
	#[serde(default)]
	pub status_hint: String,
	/// Inactive means banned; the record is retained but forced offline.
	#[serde(default = "default_true")]
	pub active: bool,
	#[serde(default)]
	pub privileges: Privileges,
	#[serde(default)]
	pub created: i64,
	#[serde(default)]
	pub modified: i64,
}

fn default_true() -> bool {
	true
}

/// Per-channel membership role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRole {
	#[serde(default)]
	pub admin: bool,
}

/// Channel definition as persisted and sent to clients (no live state, no
/// history).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
	pub id: ChannelId,
	pub title: String,
	#[serde(default)]
	pub topic: String,
	#[serde(default)]
	pub private: bool,
	#[serde(default)]
	pub pm: bool,
	pub founder: Username,
	#[serde(default)]
	pub users: BTreeMap<Username, MemberRole>,
	#[serde(default)]
	pub created: i64,
	#[serde(default)]
	pub modified: i64,
}

/// Custom emoji library entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmojiInfo {
	pub id: String,
	pub title: String,
	pub url: String,
	#[serde(default)]
	pub created: i64,
	#[serde(default)]
	pub modified: i64,
}

/// API key summary pushed to clients; the key material itself is withheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyInfo {
	pub id: String,
	pub title: String,
	#[serde(default = "default_true")]
	pub active: bool,
	#[serde(default)]
	pub created: i64,
}

/// Why a user left a channel; drives both the event payload and the
/// human-readable notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
	#[serde(rename = "self")]
	SelfLeave,
	Logout,
	Disconnect,
	Private,
	Delete,
	Kick,
}

impl LeaveReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			LeaveReason::SelfLeave => "self",
			LeaveReason::Logout => "logout",
			LeaveReason::Disconnect => "disconnect",
			LeaveReason::Private => "private",
			LeaveReason::Delete => "delete",
			LeaveReason::Kick => "kick",
		}
	}

	/// Human-readable suffix for the departure notice. `who` names the
	/// kicking admin and is only used for [`LeaveReason::Kick`].
	pub fn notice_text(self, who: Option<&str>) -> String {
		match self {
			LeaveReason::SelfLeave => "has left the channel.".to_string(),
			LeaveReason::Logout => "has logged out.".to_string(),
			LeaveReason::Disconnect => "has disconnected from the server.".to_string(),
			LeaveReason::Private => "was kicked, due to the channel becoming private.".to_string(),
			LeaveReason::Delete => "was kicked, due to their account being deleted.".to_string(),
			LeaveReason::Kick => format!("was kicked by {}.", who.unwrap_or("an administrator")),
		}
	}

	/// Departing users get a direct goodbye unless the whole session is
	/// already going away.
	pub fn wants_goodbye(self) -> bool {
		!matches!(self, LeaveReason::Logout | LeaveReason::Disconnect)
	}
}

/// Render "Full Name (nickname)" unless the nickname already appears in
/// the full name.
pub fn display_name(full_name: &str, nickname: &str) -> String {
	let nickname = nickname.trim();
	if nickname.is_empty() || full_name.to_lowercase().contains(&nickname.to_lowercase()) {
		full_name.to_string()
	} else {
		format!("{full_name} ({nickname})")
	}
}
