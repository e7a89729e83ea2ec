#![forbid(unsafe_code)]

//! The `{cmd, data}` JSON wire protocol: inbound client commands as a
//! closed enum (unknown commands fail decode rather than being silently
//! dropped) and typed server-to-client events.

pub mod commands;
pub mod events;

pub use commands::{
	AuthForm, AuthRequest, BanParams, ClientCommand, DecodeError, EchoReply, EmojiAction, EmojiParams, HeyParams,
	JoinParams, KickParams, LeaveParams, NickParams, PmParams, ReactParams, SayParams, StatusParams, TagsParams,
	TopicParams, TypingParams,
};
pub use events::{
	ChannelUpdatedPayload, ClientConfig, EchoPayload, EmojiUpdatedPayload, ErrorPayload, GoodbyePayload, JoinedPayload,
	LeftPayload, LoginPayload, NoticePayload, PongPayload, ReactedPayload, ServerEvent, StatusPayload,
	TagsUpdatedPayload, TypingPayload, UserDeletedPayload, WelcomePayload,
};
