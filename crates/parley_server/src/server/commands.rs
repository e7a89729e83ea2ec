#![forbid(unsafe_code)]

//! One handler per client command. Shape is uniform: validate privilege,
//! mutate the minimal registry state, then dispatch. Mutation and
//! broadcast are deliberately not transactional with each other.

use parley_domain::{
	ChannelId, ChatMessage, ConnectionId, EmojiInfo, LeaveReason, MessageId, MessageKind, ReactionMap, SeqId,
	UserRecord, Username, display_name,
};
use parley_protocol::{
	BanParams, EmojiAction, EmojiParams, EmojiUpdatedPayload, JoinParams, JoinedPayload, KickParams, LeaveParams,
	NickParams, NoticePayload, PmParams, PongPayload, ReactParams, SayParams, ServerEvent, StatusParams, TagsParams,
	TopicParams, TypingParams, TypingPayload, WelcomePayload,
};
use parley_store::UserPatch;
use tracing::{debug, info};

use crate::server::channels::ChannelPatch;
use crate::server::engine::{CommandError, Engine};
use crate::server::sanitize::{clean_html, truncate_content};
use crate::util::time::{unix_ms_now, unix_secs_now};

fn normalize_channel(raw: &str) -> Result<ChannelId, CommandError> {
	ChannelId::normalize(raw).map_err(|_| CommandError::Validation(format!("Invalid channel ID: {raw}")))
}

fn normalize_user(raw: &str) -> Result<Username, CommandError> {
	Username::normalize(raw).map_err(|_| CommandError::Validation(format!("Invalid username: {raw}")))
}

impl Engine {
	pub(crate) async fn cmd_ping(&self, conn_id: ConnectionId) -> Result<(), CommandError> {
		self.dispatcher
			.to_connection(conn_id, &ServerEvent::Pong(PongPayload { epoch: unix_secs_now() }))
			.await;
		Ok(())
	}

	pub(crate) async fn cmd_join(
		&self,
		_conn_id: ConnectionId,
		username: &Username,
		user: &UserRecord,
		params: JoinParams,
	) -> Result<(), CommandError> {
		let channel_id = normalize_channel(&params.channel_id)?;

		let outcome = self.channels.join(username, user.privileges.admin, &channel_id).await?;
		self.presence.add_live_channel(username, &channel_id).await;

		info!(username = %username, channel = %channel_id, "user is joining channel");

		self.dispatcher
			.to_channel(
				&channel_id,
				&ServerEvent::Joined(Box::new(JoinedPayload {
					channel_id: channel_id.clone(),
					username: username.clone(),
					user: user.clone(),
				})),
			)
			.await;

		// only the user's first connection gets the history notice, so a
		// second device joining stays quiet
		if outcome.first_join {
			let disp = display_name(&user.full_name, &user.nickname);
			self.append_history_notice(&channel_id, username, format!("<b>{disp}</b> has joined the channel."))
				.await;
		}

		// welcome snapshot goes out regardless, so every device converges
		let history = self.channels.history(&channel_id).await;
		let mut channel = outcome.channel;
		channel.users.clear();
		self.dispatcher
			.to_user(
				username,
				&ServerEvent::Welcome(Box::new(WelcomePayload {
					channel_id,
					channel,
					history,
				})),
			)
			.await;

		Ok(())
	}

	async fn append_history_notice(&self, channel_id: &ChannelId, username: &Username, content: String) {
		let message = ChatMessage {
			id: MessageId::new(self.ids.next("n")).expect("generated id is non-empty"),
			channel_id: channel_id.clone(),
			kind: MessageKind::Notice,
			username: Some(username.clone()),
			content,
			date: unix_ms_now(),
			seq_id: None,
			label: Some("User".to_string()),
			to: None,
			reactions: ReactionMap::default(),
			tags: None,
		};
		let _ = self.channels.commit_message(channel_id, message).await;
	}

	pub(crate) async fn cmd_leave(&self, username: &Username, params: LeaveParams) -> Result<(), CommandError> {
		let channel_id = normalize_channel(&params.channel_id)?;

		if !self.channels.exists(&channel_id).await {
			return Err(CommandError::NotFound(format!("Channel not found: {channel_id}")));
		}
		if !self.channels.is_live(&channel_id, username).await {
			return Err(CommandError::Validation(format!(
				"You are not currently in channel: {channel_id}"
			)));
		}

		self.user_leave_channel(username, &channel_id, LeaveReason::SelfLeave, None).await;
		Ok(())
	}

	pub(crate) async fn cmd_say(&self, username: &Username, params: SayParams) -> Result<(), CommandError> {
		let channel_id = normalize_channel(&params.channel_id)?;
		let Some(channel) = self.channels.info(&channel_id).await else {
			return Err(CommandError::NotFound(format!("Channel not found: {channel_id}")));
		};
		if !self.channels.is_live(&channel_id, username).await {
			return Err(CommandError::Validation(format!(
				"You are not currently in channel: {channel_id}"
			)));
		}

		// code blocks pass through verbatim; everything else is cleaned
		let content = if params.kind == MessageKind::Code {
			params.content
		} else {
			clean_html(&params.content)
		};
		let content = truncate_content(&content, self.cfg.max_message_content_length);

		let id = match params.id {
			Some(id) => MessageId::new(id).map_err(|_| CommandError::Validation("Invalid message id.".to_string()))?,
			None => MessageId::new(self.ids.next("s")).expect("generated id is non-empty"),
		};

		let mut message = ChatMessage {
			id,
			channel_id: channel_id.clone(),
			kind: params.kind,
			username: Some(username.clone()),
			content,
			date: unix_ms_now(),
			seq_id: None,
			label: None,
			to: None,
			reactions: ReactionMap::default(),
			tags: None,
		};

		if params.kind == MessageKind::Whisper {
			// delivered to exactly one recipient, never recorded
			let Some(to_raw) = params.to.as_deref() else {
				return Err(CommandError::Validation("Whisper requires a recipient.".to_string()));
			};
			let recipient = normalize_user(to_raw)?;

			if self.presence.profile(&recipient).await.is_none() {
				return Err(CommandError::NotFound(format!("User {recipient} could not be found.")));
			}
			if !self.channels.is_live(&channel_id, &recipient).await {
				return Err(CommandError::Validation(format!(
					"User {recipient} is not currently in channel: {channel_id}"
				)));
			}

			message.to = Some(recipient.clone());
			self.dispatcher.to_user(&recipient, &ServerEvent::Said(Box::new(message))).await;
			return Ok(());
		}

		if !channel.private && !channel.pm && params.kind.is_indexable() {
			message.seq_id = Some(SeqId::new(self.ids.next("")).expect("generated id is non-empty"));
		}

		info!(username = %username, channel = %channel_id, kind = params.kind.as_str(), "user spoke in channel");

		// membership snapshot and history append happen under one guard
		let members = self.channels.commit_message(&channel_id, message.clone()).await?;
		self.dispatcher
			.to_members(&members, &ServerEvent::Said(Box::new(message.clone())))
			.await;

		if self.cfg.indexer_enabled && message.seq_id.is_some() {
			self.spawn_index(message);
		}

		Ok(())
	}

	pub(crate) async fn cmd_pm(&self, username: &Username, params: PmParams) -> Result<(), CommandError> {
		let dest = normalize_user(&params.username)?;
		if dest == *username {
			return Err(CommandError::Validation(format!(
				"Cannot join private IM with self: {dest}"
			)));
		}

		if self.presence.profile(&dest).await.is_none() {
			// fall back to the identity store for users never seen live
			let known = self
				.identity
				.get_user(&dest)
				.await
				.map_err(Self::identity_call_error)?;
			match known {
				Some(user) => self.presence.update_profile(user).await,
				None => return Err(CommandError::NotFound(format!("User not found: {dest}"))),
			}
		}

		let (channel, created) = self.channels.get_or_create_pm(username, &dest, unix_ms_now()).await;
		if created {
			debug!(channel = %channel.id, "created new temp PM channel");
		}

		// announced to the two parties only
		let event = ServerEvent::ChannelUpdated(Box::new(parley_protocol::ChannelUpdatedPayload {
			channel_id: channel.id.clone(),
			channel: Some(channel.clone()),
			deleted: false,
		}));
		self.dispatcher.to_user(username, &event).await;
		self.dispatcher.to_user(&dest, &event).await;

		Ok(())
	}

	pub(crate) async fn cmd_kick(
		&self,
		username: &Username,
		user: &UserRecord,
		params: KickParams,
	) -> Result<(), CommandError> {
		let channel_id = normalize_channel(&params.channel_id)?;
		let Some(channel) = self.channels.info(&channel_id).await else {
			return Err(CommandError::NotFound(format!("Channel not found: {channel_id}")));
		};

		if !user.privileges.admin && !self.channels.is_channel_admin(&channel_id, username).await {
			return Err(CommandError::AccessDenied(format!(
				"You do not have administrator privileges in channel: {}",
				channel.title
			)));
		}

		let target = normalize_user(&params.username)?;
		if !self.channels.is_live(&channel_id, &target).await {
			return Err(CommandError::Validation(format!(
				"User {target} is not currently in channel: {channel_id}"
			)));
		}

		let kicked_by = if user.nickname.is_empty() {
			username.to_string()
		} else {
			user.nickname.clone()
		};
		self.user_leave_channel(&target, &channel_id, LeaveReason::Kick, Some(kicked_by)).await;
		Ok(())
	}

	/// Ban and unban share a shape: global admin only, the account flip is
	/// delegated to the identity provider, and its change stream drives
	/// the forced disconnect.
	pub(crate) async fn cmd_ban(
		&self,
		conn_id: ConnectionId,
		username: &Username,
		user: &UserRecord,
		params: BanParams,
		enable: bool,
	) -> Result<(), CommandError> {
		if !user.privileges.admin {
			return Err(CommandError::AccessDenied(
				"You do not have administrator privileges.".to_string(),
			));
		}

		let target = normalize_user(&params.username)?;
		let verb = if enable { "unbanned" } else { "banned" };

		let result = tokio::time::timeout(self.cfg.identity_timeout, self.identity.set_active(&target, enable)).await;
		match result {
			Ok(Ok(_)) => {
				info!(target = %target, by = %username, "user {verb}");
				self.dispatcher
					.to_connection(
						conn_id,
						&ServerEvent::Notice(NoticePayload {
							content: format!("User successfully {verb}: {target}"),
						}),
					)
					.await;
				Ok(())
			}
			Ok(Err(e)) => Err(CommandError::External(format!("User update failed: {target}: {e}"))),
			Err(_) => Err(CommandError::External(format!("User update timed out: {target}"))),
		}
	}

	pub(crate) async fn cmd_typing(&self, username: &Username, params: TypingParams) -> Result<(), CommandError> {
		let channel_id = normalize_channel(&params.channel_id)?;
		if !self.channels.exists(&channel_id).await {
			return Err(CommandError::NotFound(format!("Channel not found: {channel_id}")));
		}

		// pure fan-out: no state mutation, no persistence
		self.dispatcher
			.to_channel(
				&channel_id,
				&ServerEvent::Typing(TypingPayload {
					channel_id: channel_id.clone(),
					username: username.clone(),
				}),
			)
			.await;
		Ok(())
	}

	pub(crate) async fn cmd_status(
		&self,
		conn_id: ConnectionId,
		username: &Username,
		params: StatusParams,
	) -> Result<(), CommandError> {
		let mut status = params.status;
		let mut hint = params.hint;

		// large_blue_circle is always the default 'Available' status
		if status == "large_blue_circle" {
			status.clear();
			hint.clear();
		}

		// A quiet screensaver transition only applies when this connection
		// saw the user's most recent client activity; otherwise another
		// device is still in use and only the requester is told, so it can
		// keep retrying.
		if status == "desktop_computer" && params.quiet {
			let own_activity = self.connections.metadata_number(conn_id, "last_event_time").await.unwrap_or(0.0);

			for other_id in self.presence.connection_ids(username).await {
				if other_id == conn_id {
					continue;
				}
				let other_activity = self
					.connections
					.metadata_number(other_id, "last_event_time")
					.await
					.unwrap_or(0.0);
				if other_activity > own_activity {
					debug!(
						username = %username,
						conn = %conn_id,
						other = %other_id,
						"ignoring quiet screensaver status, another connection is more recent"
					);
					if let Some(current) = self.presence.profile(username).await {
						self.dispatcher
							.to_connection(conn_id, &ServerEvent::UserUpdated(Box::new(current)))
							.await;
					}
					return Ok(());
				}
			}
		}

		let quiet = params.quiet;
		let updated = tokio::time::timeout(
			self.cfg.identity_timeout,
			self.identity.update_user(
				username,
				UserPatch {
					status: Some((status.clone(), hint.clone())),
					..UserPatch::default()
				},
			),
		)
		.await
		.map_err(|_| CommandError::External(format!("User update timed out: {username}")))?
		.map_err(|e| CommandError::External(format!("User update failed: {username}: {e}")))?;

		self.presence.update_profile(updated.clone()).await;

		if !quiet {
			let status_emoji = if updated.status.is_empty() {
				"large_blue_circle"
			} else {
				updated.status.as_str()
			};
			let status_text = if !updated.status_hint.is_empty() {
				updated.status_hint.clone()
			} else {
				self.cfg
					.status_map
					.get(status_emoji)
					.cloned()
					.unwrap_or_else(|| "Away".to_string())
			};

			let disp = display_name(&updated.full_name, &updated.nickname);
			let content = format!("<b>{disp}</b> is now :{status_emoji}: <b>{status_text}</b>.");

			for channel_id in self.presence.live_channels(username).await {
				self.channel_notice(&channel_id, Some(username.clone()), "User", content.clone()).await;
			}
		}

		Ok(())
	}

	pub(crate) async fn cmd_nick(&self, username: &Username, params: NickParams) -> Result<(), CommandError> {
		if params.nickname.trim().is_empty() {
			return Err(CommandError::Validation("Nickname must be non-empty.".to_string()));
		}

		// the change stream fans the update out to everyone
		let updated = tokio::time::timeout(
			self.cfg.identity_timeout,
			self.identity.update_user(
				username,
				UserPatch {
					nickname: Some(params.nickname.clone()),
					..UserPatch::default()
				},
			),
		)
		.await
		.map_err(|_| CommandError::External(format!("User update timed out: {username}")))?
		.map_err(|e| CommandError::External(format!("User update failed: {username}: {e}")))?;

		info!(username = %username, nickname = %updated.nickname, "user set nick");
		self.presence.update_profile(updated).await;
		Ok(())
	}

	pub(crate) async fn cmd_topic(
		&self,
		username: &Username,
		user: &UserRecord,
		params: TopicParams,
	) -> Result<(), CommandError> {
		let channel_id = normalize_channel(&params.channel_id)?;
		let Some(channel) = self.channels.info(&channel_id).await else {
			return Err(CommandError::NotFound(format!("Channel not found: {channel_id}")));
		};

		if !user.privileges.admin && !self.channels.is_channel_admin(&channel_id, username).await {
			return Err(CommandError::AccessDenied(format!(
				"You do not have administrator privileges in channel: {}",
				channel.title
			)));
		}

		let topic = params.topic;
		let (info, _) = self
			.channels
			.update(
				&channel_id,
				ChannelPatch {
					topic: Some(topic.clone()),
					..ChannelPatch::default()
				},
				unix_ms_now(),
			)
			.await?;

		info!(username = %username, channel = %channel_id, topic = %topic, "user set channel topic");

		self.persist_channel(&info, false).await;
		self.broadcast_channel_update(&info).await;
		self.channel_notice(
			&channel_id,
			Some(username.clone()),
			"Topic",
			format!("<b>{}</b> changed the topic to: <b>{topic}</b>", user.nickname),
		)
		.await;

		Ok(())
	}

	pub(crate) async fn cmd_emoji(
		&self,
		username: &Username,
		user: &UserRecord,
		params: EmojiParams,
	) -> Result<(), CommandError> {
		if !user.privileges.admin && !user.privileges.manage_emoji {
			return Err(CommandError::AccessDenied(
				"You do not have emoji management privileges.".to_string(),
			));
		}

		let id = params.id.trim().to_lowercase();
		if id.is_empty() {
			return Err(CommandError::Validation("Emoji id must be non-empty.".to_string()));
		}

		match params.api {
			EmojiAction::Create | EmojiAction::Update => {
				let existing = self.emoji_get(&id).await;
				if params.api == EmojiAction::Create && existing.is_some() {
					return Err(CommandError::Validation(format!("Emoji already exists: {id}")));
				}
				if params.api == EmojiAction::Update && existing.is_none() {
					return Err(CommandError::NotFound(format!("Emoji not found: {id}")));
				}

				let now = unix_ms_now();
				let info = EmojiInfo {
					id: id.clone(),
					title: params
						.title
						.or_else(|| existing.as_ref().map(|e| e.title.clone()))
						.ok_or_else(|| CommandError::Validation("Emoji title is required.".to_string()))?,
					url: params
						.url
						.or_else(|| existing.as_ref().map(|e| e.url.clone()))
						.ok_or_else(|| CommandError::Validation("Emoji url is required.".to_string()))?,
					created: existing.as_ref().map(|e| e.created).unwrap_or(now),
					modified: now,
				};

				let value = serde_json::to_value(&info)
					.map_err(|e| CommandError::External(format!("Emoji command failed: {e}")))?;
				self.store
					.put(&format!("emoji/{id}"), value)
					.await
					.map_err(|e| CommandError::External(format!("Emoji command failed: {e:#}")))?;
				if existing.is_none() {
					self.store
						.list_push("global/emoji", serde_json::Value::String(id.clone()))
						.await
						.map_err(|e| CommandError::External(format!("Emoji command failed: {e:#}")))?;
				}

				info!(username = %username, emoji = %id, "emoji library updated");
				self.emoji_insert(info.clone()).await;
				self.dispatcher
					.to_all_authenticated(&ServerEvent::EmojiUpdated(EmojiUpdatedPayload {
						id,
						emoji: Some(info),
						deleted: false,
					}))
					.await;
			}
			EmojiAction::Delete => {
				if self.emoji_remove(&id).await.is_none() {
					return Err(CommandError::NotFound(format!("Emoji not found: {id}")));
				}
				self.store
					.delete(&format!("emoji/{id}"))
					.await
					.map_err(|e| CommandError::External(format!("Emoji command failed: {e:#}")))?;

				info!(username = %username, emoji = %id, "emoji deleted");
				self.dispatcher
					.to_all_authenticated(&ServerEvent::EmojiUpdated(EmojiUpdatedPayload {
						id,
						emoji: None,
						deleted: true,
					}))
					.await;
			}
		}

		Ok(())
	}

	pub(crate) async fn cmd_react(&self, username: &Username, params: ReactParams) -> Result<(), CommandError> {
		let channel_id = normalize_channel(&params.channel_id)?;
		let Some(channel) = self.channels.info(&channel_id).await else {
			// sanity: reactions on unknown channels are dropped silently
			debug!(channel = %channel_id, "reaction for unknown channel dropped");
			return Ok(());
		};

		if params.emoji_id.trim().is_empty() {
			return Err(CommandError::Validation("Reaction emoji id must be non-empty.".to_string()));
		}
		let chat_id = MessageId::new(params.chat_id)
			.map_err(|_| CommandError::Validation("Reaction chat id must be non-empty.".to_string()))?;
		let seq_id = match params.seq_id {
			Some(raw) => Some(SeqId::new(raw).map_err(|_| CommandError::Validation("Invalid seq id.".to_string()))?),
			None => None,
		};

		self.annotations
			.react(
				channel,
				chat_id,
				seq_id,
				params.emoji_id,
				params.action,
				username.clone(),
				unix_ms_now(),
			)
			.await;

		Ok(())
	}

	pub(crate) async fn cmd_tags(&self, username: &Username, params: TagsParams) -> Result<(), CommandError> {
		let channel_id = normalize_channel(&params.channel_id)?;
		let Some(channel) = self.channels.info(&channel_id).await else {
			debug!(channel = %channel_id, "tag update for unknown channel dropped");
			return Ok(());
		};

		if params.tags.trim().is_empty() {
			return Err(CommandError::Validation("No tags specified to update.".to_string()));
		}
		let chat_id = MessageId::new(params.chat_id)
			.map_err(|_| CommandError::Validation("Tag chat id must be non-empty.".to_string()))?;
		let Some(seq_raw) = params.seq_id else {
			return Err(CommandError::Validation("No seq_id specified to update.".to_string()));
		};
		let seq_id = SeqId::new(seq_raw).map_err(|_| CommandError::Validation("Invalid seq id.".to_string()))?;

		self.annotations
			.tags(
				channel,
				chat_id,
				seq_id,
				params.action,
				&params.tags,
				params.notify_user,
				username,
			)
			.await;

		Ok(())
	}
}
