#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use parley_domain::{MessageKind, ReactionAction, TagAction};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("malformed frame: {0}")]
	Malformed(#[from] serde_json::Error),
	#[error("unknown command: {0}")]
	UnknownCommand(String),
	#[error("invalid payload for {cmd}: {source}")]
	InvalidPayload {
		cmd: &'static str,
		source: serde_json::Error,
	},
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
	cmd: String,
	#[serde(default)]
	data: Option<Value>,
}

/// Every command a client may send. Decoding is an explicit closed table:
/// anything not listed here is an [`DecodeError::UnknownCommand`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
	Authenticate(AuthRequest),
	Join(JoinParams),
	Leave(LeaveParams),
	Say(SayParams),
	Pm(PmParams),
	Kick(KickParams),
	Ban(BanParams),
	Unban(BanParams),
	Typing(TypingParams),
	Status(StatusParams),
	Nick(NickParams),
	Topic(TopicParams),
	Emoji(EmojiParams),
	React(ReactParams),
	Tags(TagsParams),
	Ping,
	Hey(HeyParams),
	Echoback(EchoReply),
	Logout,
}

fn payload<T: for<'de> Deserialize<'de>>(cmd: &'static str, data: Option<Value>) -> Result<T, DecodeError> {
	let value = data.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
	serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload { cmd, source })
}

impl ClientCommand {
	/// Decode one inbound text frame.
	pub fn decode(text: &str) -> Result<Self, DecodeError> {
		let raw: RawEnvelope = serde_json::from_str(text)?;
		let data = raw.data;

		match raw.cmd.as_str() {
			"authenticate" => Ok(Self::Authenticate(payload("authenticate", data)?)),
			"join" => Ok(Self::Join(payload("join", data)?)),
			"leave" => Ok(Self::Leave(payload("leave", data)?)),
			"say" => Ok(Self::Say(payload("say", data)?)),
			"pm" => Ok(Self::Pm(payload("pm", data)?)),
			"kick" => Ok(Self::Kick(payload("kick", data)?)),
			"ban" => Ok(Self::Ban(payload("ban", data)?)),
			"unban" => Ok(Self::Unban(payload("unban", data)?)),
			"typing" => Ok(Self::Typing(payload("typing", data)?)),
			"status" => Ok(Self::Status(payload("status", data)?)),
			"nick" => Ok(Self::Nick(payload("nick", data)?)),
			"topic" => Ok(Self::Topic(payload("topic", data)?)),
			"emoji" => Ok(Self::Emoji(payload("emoji", data)?)),
			"react" => Ok(Self::React(payload("react", data)?)),
			"tags" => Ok(Self::Tags(payload("tags", data)?)),
			"ping" => Ok(Self::Ping),
			"hey" => Ok(Self::Hey(payload("hey", data)?)),
			"echoback" => Ok(Self::Echoback(payload("echoback", data)?)),
			"logout" => Ok(Self::Logout),
			other => Err(DecodeError::UnknownCommand(other.to_string())),
		}
	}

	/// Stable command name for logs and metrics.
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Authenticate(_) => "authenticate",
			Self::Join(_) => "join",
			Self::Leave(_) => "leave",
			Self::Say(_) => "say",
			Self::Pm(_) => "pm",
			Self::Kick(_) => "kick",
			Self::Ban(_) => "ban",
			Self::Unban(_) => "unban",
			Self::Typing(_) => "typing",
			Self::Status(_) => "status",
			Self::Nick(_) => "nick",
			Self::Topic(_) => "topic",
			Self::Emoji(_) => "emoji",
			Self::React(_) => "react",
			Self::Tags(_) => "tags",
			Self::Ping => "ping",
			Self::Hey(_) => "hey",
			Self::Echoback(_) => "echoback",
			Self::Logout => "logout",
		}
	}

	/// Whether an unauthenticated connection may issue this command.
	pub const fn allowed_unauthenticated(&self) -> bool {
		matches!(self, Self::Authenticate(_) | Self::Hey(_) | Self::Echoback(_))
	}
}

/// Authentication request; exactly one of the three forms must be present.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthRequest {
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub session_id: Option<String>,
	#[serde(default)]
	pub api_key: Option<String>,
}

/// The resolved authentication form, in the order the fields are checked.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthForm {
	Credentials { username: String, password: String },
	Session { token: String },
	ApiKey { key: String },
}

impl AuthRequest {
	pub fn form(&self) -> Option<AuthForm> {
		if let (Some(username), Some(password)) = (&self.username, &self.password) {
			return Some(AuthForm::Credentials {
				username: username.clone(),
				password: password.clone(),
			});
		}
		if let Some(token) = &self.session_id {
			return Some(AuthForm::Session { token: token.clone() });
		}
		if let Some(key) = &self.api_key {
			return Some(AuthForm::ApiKey { key: key.clone() });
		}
		None
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinParams {
	pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LeaveParams {
	pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SayParams {
	pub channel_id: String,
	#[serde(rename = "type")]
	pub kind: MessageKind,
	#[serde(default)]
	pub content: String,
	/// Client-assigned message id, kept so the sender can de-dupe its
	/// local echo.
	#[serde(default)]
	pub id: Option<String>,
	/// Whisper recipient.
	#[serde(default)]
	pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PmParams {
	pub username: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KickParams {
	pub channel_id: String,
	pub username: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BanParams {
	pub username: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypingParams {
	pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusParams {
	#[serde(default)]
	pub status: String,
	#[serde(default)]
	pub hint: String,
	#[serde(default)]
	pub quiet: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NickParams {
	pub nickname: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TopicParams {
	pub channel_id: String,
	#[serde(default)]
	pub topic: String,
}

/// Emoji library CRUD sub-action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmojiAction {
	Create,
	Update,
	Delete,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmojiParams {
	pub api: EmojiAction,
	pub id: String,
	#[serde(default)]
	pub title: Option<String>,
	#[serde(default)]
	pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReactParams {
	pub channel_id: String,
	/// The broadcast message id.
	pub chat_id: String,
	/// Cross-reference into the persisted copy, when one exists.
	#[serde(default)]
	pub seq_id: Option<String>,
	pub emoji_id: String,
	pub action: ReactionAction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TagsParams {
	pub channel_id: String,
	pub chat_id: String,
	#[serde(default)]
	pub seq_id: Option<String>,
	#[serde(default = "default_tag_action")]
	pub action: TagAction,
	pub tags: String,
	#[serde(default)]
	pub notify_user: bool,
}

fn default_tag_action() -> TagAction {
	TagAction::Add
}

/// Client heartbeat; arbitrary reported fields are merged into connection
/// metadata (`last_event_time` drives multi-device status tie-breaking).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct HeyParams(pub BTreeMap<String, Value>);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EchoReply {
	pub id: String,
}
