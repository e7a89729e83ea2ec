#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use parley_domain::{
	ApiKeyInfo, ChannelId, ChannelInfo, ChatMessage, EmojiInfo, LeaveReason, MessageId, ReactionAction, TagAction,
	UserRecord, Username,
};
use serde::Serialize;

/// Server-to-client events, serialized as `{ "cmd": ..., "data": ... }`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
	Login(Box<LoginPayload>),
	AuthFailure(ErrorPayload),
	Welcome(Box<WelcomePayload>),
	Said(Box<ChatMessage>),
	Joined(Box<JoinedPayload>),
	Left(LeftPayload),
	Goodbye(GoodbyePayload),
	Typing(TypingPayload),
	Reacted(ReactedPayload),
	TagsUpdated(TagsUpdatedPayload),
	UserUpdated(Box<UserRecord>),
	UserDeleted(UserDeletedPayload),
	ChannelUpdated(Box<ChannelUpdatedPayload>),
	EmojiUpdated(EmojiUpdatedPayload),
	Status(StatusPayload),
	Echo(EchoPayload),
	Pong(PongPayload),
	Notice(NoticePayload),
	Error(ErrorPayload),
}

impl ServerEvent {
	/// Stable event name for logs and metrics.
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Login(_) => "login",
			Self::AuthFailure(_) => "auth_failure",
			Self::Welcome(_) => "welcome",
			Self::Said(_) => "said",
			Self::Joined(_) => "joined",
			Self::Left(_) => "left",
			Self::Goodbye(_) => "goodbye",
			Self::Typing(_) => "typing",
			Self::Reacted(_) => "reacted",
			Self::TagsUpdated(_) => "tags_updated",
			Self::UserUpdated(_) => "user_updated",
			Self::UserDeleted(_) => "user_deleted",
			Self::ChannelUpdated(_) => "channel_updated",
			Self::EmojiUpdated(_) => "emoji_updated",
			Self::Status(_) => "status",
			Self::Echo(_) => "echo",
			Self::Pong(_) => "pong",
			Self::Notice(_) => "notice",
			Self::Error(_) => "error",
		}
	}

	pub fn encode(&self) -> String {
		serde_json::to_string(self).unwrap_or_else(|_| "{\"cmd\":\"error\"}".to_string())
	}
}

/// Client-facing configuration chunk delivered at login.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientConfig {
	pub status_map: BTreeMap<String, String>,
	pub base_app_url: String,
	pub max_message_content_length: usize,
}

/// Full state snapshot pushed right after successful authentication.
#[derive(Debug, Clone, Serialize)]
pub struct LoginPayload {
	pub username: Username,
	pub session_id: String,
	pub user: UserRecord,
	pub users: BTreeMap<Username, UserRecord>,
	pub channels: BTreeMap<ChannelId, ChannelInfo>,
	pub emoji: BTreeMap<String, EmojiInfo>,
	pub api_keys: BTreeMap<String, ApiKeyInfo>,
	pub config: ClientConfig,
	pub epoch: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WelcomePayload {
	pub channel_id: ChannelId,
	pub channel: ChannelInfo,
	pub history: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedPayload {
	pub channel_id: ChannelId,
	pub username: Username,
	pub user: UserRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeftPayload {
	pub channel_id: ChannelId,
	pub username: Username,
	pub reason: LeaveReason,
	pub nice_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoodbyePayload {
	pub channel_id: ChannelId,
	pub reason: LeaveReason,
	pub nice_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypingPayload {
	pub channel_id: ChannelId,
	pub username: Username,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactedPayload {
	pub channel_id: ChannelId,
	pub id: MessageId,
	pub username: Username,
	pub emoji_id: String,
	pub action: ReactionAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagsUpdatedPayload {
	pub channel_id: ChannelId,
	pub id: MessageId,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub seq_id: Option<String>,
	pub action: TagAction,
	pub tags: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserDeletedPayload {
	pub username: Username,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelUpdatedPayload {
	pub channel_id: ChannelId,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub channel: Option<ChannelInfo>,
	#[serde(skip_serializing_if = "core::ops::Not::not")]
	pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmojiUpdatedPayload {
	pub id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub emoji: Option<EmojiInfo>,
	#[serde(skip_serializing_if = "core::ops::Not::not")]
	pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
	pub epoch: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EchoPayload {
	pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PongPayload {
	pub epoch: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoticePayload {
	pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
	pub code: String,
	pub description: String,
}
