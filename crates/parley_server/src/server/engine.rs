#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parley_domain::{
	ChannelId, ChannelInfo, ChatMessage, ConnectionId, EmojiInfo, IdFactory, LeaveReason, MessageId, MessageKind,
	ReactionMap, Username, display_name,
};
use parley_protocol::{
	ClientCommand, ClientConfig, DecodeError, ErrorPayload, GoodbyePayload, LeftPayload, LoginPayload, ServerEvent,
	StatusPayload,
};
use parley_store::{IdentityError, IdentityProvider, IdentitySession, RecordStore, SearchIndex, UserChange};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use crate::server::annotations::AnnotationService;
use crate::server::channels::{ChannelError, ChannelPatch, ChannelRegistry};
use crate::server::connections::ConnectionRegistry;
use crate::server::dispatch::Dispatcher;
use crate::server::presence::PresenceRegistry;
use crate::util::time::{unix_ms_now, unix_secs_now};

/// Per-invocation command failures, reported only to the requesting
/// connection; they never crash the process or touch other connections.
#[derive(Debug, Error)]
pub enum CommandError {
	#[error("{0}")]
	Validation(String),
	#[error("{0}")]
	AccessDenied(String),
	#[error("{0}")]
	NotFound(String),
	/// Identity-provider or library-store delegate failure.
	#[error("{0}")]
	External(String),
}

impl CommandError {
	pub const fn code(&self) -> &'static str {
		match self {
			Self::Validation(_) => "validation",
			Self::AccessDenied(_) => "access_denied",
			Self::NotFound(_) => "not_found",
			Self::External(_) => "external",
		}
	}
}

impl From<ChannelError> for CommandError {
	fn from(err: ChannelError) -> Self {
		match err {
			ChannelError::NotFound(_) => Self::NotFound(err.to_string()),
			ChannelError::AccessDenied(_) => Self::AccessDenied(err.to_string()),
			ChannelError::AlreadyExists(_) | ChannelError::ReservedId(_) => Self::Validation(err.to_string()),
		}
	}
}

/// Process-wide traffic counters, folded in by the heartbeat sweep.
#[derive(Debug, Default)]
pub struct TrafficStats {
	pub bytes_in: AtomicU64,
	pub bytes_out: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub max_message_content_length: usize,
	pub indexer_enabled: bool,
	pub identity_timeout: Duration,
	pub base_app_url: String,
	pub status_map: BTreeMap<String, String>,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			max_message_content_length: 8192,
			indexer_enabled: false,
			identity_timeout: Duration::from_secs(10),
			base_app_url: String::new(),
			status_map: BTreeMap::new(),
		}
	}
}

/// Ties the registries, dispatcher, and external interfaces together and
/// drives the per-connection command state machine.
pub struct Engine {
	pub connections: Arc<ConnectionRegistry>,
	pub presence: Arc<PresenceRegistry>,
	pub channels: Arc<ChannelRegistry>,
	pub dispatcher: Dispatcher,
	pub annotations: AnnotationService,
	pub identity: Arc<dyn IdentityProvider>,
	pub store: Arc<dyn RecordStore>,
	pub search: Arc<dyn SearchIndex>,
	pub ids: IdFactory,
	pub stats: TrafficStats,
	pub(crate) cfg: EngineConfig,
	emoji: Mutex<BTreeMap<String, EmojiInfo>>,
	shutdown: AtomicBool,
}

impl Engine {
	pub fn new(
		identity: Arc<dyn IdentityProvider>,
		store: Arc<dyn RecordStore>,
		search: Arc<dyn SearchIndex>,
		max_history: usize,
		cfg: EngineConfig,
	) -> Arc<Self> {
		let connections = Arc::new(ConnectionRegistry::new());
		let presence = Arc::new(PresenceRegistry::new());
		let channels = Arc::new(ChannelRegistry::new(max_history));
		let dispatcher = Dispatcher::new(Arc::clone(&connections), Arc::clone(&presence), Arc::clone(&channels));
		let annotations = AnnotationService::new(
			Arc::clone(&store),
			Arc::clone(&search),
			Arc::clone(&channels),
			dispatcher.clone(),
			cfg.indexer_enabled,
		);

		Arc::new(Self {
			connections,
			presence,
			channels,
			dispatcher,
			annotations,
			identity,
			store,
			search,
			ids: IdFactory::new(),
			stats: TrafficStats::default(),
			cfg,
			emoji: Mutex::new(BTreeMap::new()),
			shutdown: AtomicBool::new(false),
		})
	}

	/// Refuse new mutating work; the listener closes and the heartbeat
	/// sweep drains what remains.
	pub fn begin_shutdown(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
	}

	pub fn is_shutting_down(&self) -> bool {
		self.shutdown.load(Ordering::SeqCst)
	}

	/// Warm the registries from the store: known users, channel
	/// definitions, the emoji library, and (when indexing is on) recent
	/// public-channel history.
	pub async fn load_state(&self) -> anyhow::Result<()> {
		match self.identity.list_users().await {
			Ok(users) => {
				for user in users {
					self.presence.update_profile(user).await;
				}
			}
			Err(e) => warn!(error = %e, "could not preload users from identity provider"),
		}

		let channel_ids = self.store.list_recent("global/channels", 0).await?;
		for raw in channel_ids {
			let Some(id) = raw.as_str() else { continue };
			let Some(value) = self.store.get(&format!("channels/{id}")).await? else {
				continue;
			};
			match serde_json::from_value::<ChannelInfo>(value) {
				Ok(info) => self.channels.insert_loaded(info).await,
				Err(e) => warn!(channel = id, error = %e, "skipping malformed channel record"),
			}
		}

		let emoji_ids = self.store.list_recent("global/emoji", 0).await?;
		let mut emoji = self.emoji.lock().await;
		for raw in emoji_ids {
			let Some(id) = raw.as_str() else { continue };
			let Some(value) = self.store.get(&format!("emoji/{id}")).await? else {
				continue;
			};
			match serde_json::from_value::<EmojiInfo>(value) {
				Ok(info) => {
					emoji.insert(info.id.clone(), info);
				}
				Err(e) => warn!(emoji = id, error = %e, "skipping malformed emoji record"),
			}
		}
		drop(emoji);

		if self.cfg.indexer_enabled {
			self.preload_history().await;
		}

		Ok(())
	}

	/// Preload recent history for public channels; private channels are
	/// skipped (their messages are never persisted).
	async fn preload_history(&self) {
		for info in self.channels.persistent_infos().await {
			if info.private {
				continue;
			}

			let stubs = match self.store.list_recent(&format!("timeline/{}", info.id), 0).await {
				Ok(stubs) => stubs,
				Err(e) => {
					warn!(channel = %info.id, error = %format!("{e:#}"), "could not read timeline");
					continue;
				}
			};

			let mut messages = Vec::new();
			for stub in stubs {
				let Some(seq) = stub.get("seq_id").and_then(|v| v.as_str()) else {
					continue;
				};
				match self.store.get(&format!("records/messages/{seq}")).await {
					Ok(Some(value)) => match serde_json::from_value::<ChatMessage>(value) {
						Ok(message) => messages.push(message),
						Err(e) => debug!(seq, error = %e, "skipping malformed message record"),
					},
					Ok(None) => {}
					Err(e) => warn!(seq, error = %format!("{e:#}"), "could not load message record"),
				}
			}

			if !messages.is_empty() {
				debug!(channel = %info.id, count = messages.len(), "preloaded channel history");
				self.channels.preload_history(&info.id, messages).await;
			}
		}
	}

	pub async fn emoji_snapshot(&self) -> BTreeMap<String, EmojiInfo> {
		self.emoji.lock().await.clone()
	}

	pub(crate) async fn emoji_insert(&self, info: EmojiInfo) {
		self.emoji.lock().await.insert(info.id.clone(), info);
	}

	pub(crate) async fn emoji_remove(&self, id: &str) -> Option<EmojiInfo> {
		self.emoji.lock().await.remove(id)
	}

	pub(crate) async fn emoji_get(&self, id: &str) -> Option<EmojiInfo> {
		self.emoji.lock().await.get(id).cloned()
	}

	async fn send_error(&self, conn_id: ConnectionId, code: &str, description: String) {
		self.dispatcher
			.to_connection(
				conn_id,
				&ServerEvent::Error(ErrorPayload {
					code: code.to_string(),
					description,
				}),
			)
			.await;
	}

	/// Decode and route one inbound frame from a connection.
	pub async fn handle_frame(&self, conn_id: ConnectionId, text: &str) {
		metrics::counter!("parley_frames_in_total").increment(1);

		let cmd = match ClientCommand::decode(text) {
			Ok(cmd) => cmd,
			Err(DecodeError::Malformed(e)) => {
				debug!(conn = %conn_id, error = %e, "failed to parse frame");
				return;
			}
			Err(e) => {
				debug!(conn = %conn_id, error = %e, "rejecting frame");
				self.send_error(conn_id, "validation", e.to_string()).await;
				return;
			}
		};

		if !matches!(cmd, ClientCommand::Hey(_)) {
			debug!(conn = %conn_id, cmd = cmd.name(), "got command from connection");
		}

		let authenticated = self.connections.is_authenticated(conn_id).await;
		if !authenticated && !cmd.allowed_unauthenticated() {
			self.send_error(conn_id, "access_denied", "Not authenticated.".to_string()).await;
			return;
		}

		// transport/liveness commands, valid in any auth state
		match &cmd {
			ClientCommand::Authenticate(req) => {
				self.cmd_authenticate(conn_id, req.clone()).await;
				return;
			}
			ClientCommand::Hey(fields) => {
				self.connections.touch(conn_id, fields.0.clone(), unix_ms_now()).await;
				return;
			}
			ClientCommand::Echoback(reply) => {
				let now = unix_ms_now();
				if let Some(ping_ms) = self.connections.record_echo_reply(conn_id, &reply.id, now).await {
					debug!(conn = %conn_id, ping_ms, "socket ping");
				}
				return;
			}
			ClientCommand::Logout => {
				self.do_user_logout(conn_id).await;
				return;
			}
			_ => {}
		}

		if self.is_shutting_down() && is_mutating(&cmd) {
			self.send_error(conn_id, "validation", "Server is shutting down.".to_string()).await;
			return;
		}

		let Some(username) = self.connections.username(conn_id).await else {
			self.send_error(conn_id, "access_denied", "Not authenticated.".to_string()).await;
			return;
		};
		let Some(user) = self.presence.profile(&username).await else {
			self.send_error(conn_id, "not_found", "Unknown user.".to_string()).await;
			return;
		};

		let result = match cmd {
			ClientCommand::Join(p) => self.cmd_join(conn_id, &username, &user, p).await,
			ClientCommand::Leave(p) => self.cmd_leave(&username, p).await,
			ClientCommand::Say(p) => self.cmd_say(&username, p).await,
			ClientCommand::Pm(p) => self.cmd_pm(&username, p).await,
			ClientCommand::Kick(p) => self.cmd_kick(&username, &user, p).await,
			ClientCommand::Ban(p) => self.cmd_ban(conn_id, &username, &user, p, false).await,
			ClientCommand::Unban(p) => self.cmd_ban(conn_id, &username, &user, p, true).await,
			ClientCommand::Typing(p) => self.cmd_typing(&username, p).await,
			ClientCommand::Status(p) => self.cmd_status(conn_id, &username, p).await,
			ClientCommand::Nick(p) => self.cmd_nick(&username, p).await,
			ClientCommand::Topic(p) => self.cmd_topic(&username, &user, p).await,
			ClientCommand::Emoji(p) => self.cmd_emoji(&username, &user, p).await,
			ClientCommand::React(p) => self.cmd_react(&username, p).await,
			ClientCommand::Tags(p) => self.cmd_tags(&username, p).await,
			ClientCommand::Ping => self.cmd_ping(conn_id).await,
			ClientCommand::Authenticate(_)
			| ClientCommand::Hey(_)
			| ClientCommand::Echoback(_)
			| ClientCommand::Logout => Ok(()),
		};

		if let Err(err) = result {
			debug!(conn = %conn_id, username = %username, error = %err, "command failed");
			self.send_error(conn_id, err.code(), err.to_string()).await;
		}
	}

	async fn cmd_authenticate(&self, conn_id: ConnectionId, req: parley_protocol::AuthRequest) {
		use parley_protocol::AuthForm;

		let Some(form) = req.form() else {
			// deliberately vague
			self.auth_failure(conn_id, "User not found or invalid password.".to_string()).await;
			return;
		};

		let attempt = async {
			match form {
				AuthForm::Credentials { username, password } => self.identity.authenticate(&username, &password).await,
				AuthForm::Session { token } => self.identity.resume_session(&token).await,
				AuthForm::ApiKey { key } => self.identity.validate_api_key(&key).await,
			}
		};

		match tokio::time::timeout(self.cfg.identity_timeout, attempt).await {
			Ok(Ok(session)) => self.do_user_login(conn_id, session).await,
			Ok(Err(e)) => self.auth_failure(conn_id, e.to_string()).await,
			Err(_) => self.auth_failure(conn_id, "Authentication timed out.".to_string()).await,
		}
	}

	async fn auth_failure(&self, conn_id: ConnectionId, description: String) {
		self.dispatcher
			.to_connection(
				conn_id,
				&ServerEvent::AuthFailure(ErrorPayload {
					code: "auth".to_string(),
					description,
				}),
			)
			.await;
	}

	/// Bind the connection to the user, mark them online, and push the
	/// full state snapshot.
	pub async fn do_user_login(&self, conn_id: ConnectionId, session: IdentitySession) {
		let IdentitySession {
			session_id,
			username,
			user,
		} = session;

		let ip = self.connections.addr(conn_id).await.unwrap_or_else(|| "Unknown".to_string());
		info!(username = %username, conn = %conn_id, ip = %ip, "authentication successful, user has logged in");

		self.connections.bind(conn_id, username.clone(), session_id.clone()).await;
		self.presence
			.attach(&username, conn_id, user.clone(), &ip, unix_ms_now())
			.await;

		let api_keys = match tokio::time::timeout(self.cfg.identity_timeout, self.identity.list_api_keys()).await {
			Ok(Ok(keys)) => keys.into_iter().map(|k| (k.id.clone(), k)).collect(),
			Ok(Err(e)) => {
				warn!(error = %e, "could not list api keys for login snapshot");
				BTreeMap::new()
			}
			Err(_) => {
				warn!("api key listing timed out for login snapshot");
				BTreeMap::new()
			}
		};

		let payload = LoginPayload {
			username: username.clone(),
			session_id,
			user: user.clone(),
			users: self.presence.snapshot_users().await,
			channels: self.channels.visible_for(&user).await,
			emoji: self.emoji_snapshot().await,
			api_keys,
			config: ClientConfig {
				status_map: self.cfg.status_map.clone(),
				base_app_url: self.cfg.base_app_url.clone(),
				max_message_content_length: self.cfg.max_message_content_length,
			},
			epoch: unix_secs_now(),
		};

		self.dispatcher.to_connection(conn_id, &ServerEvent::Login(Box::new(payload))).await;

		let count = self.presence.connection_ids(&username).await.len();
		debug!(username = %username, connections = count, "user connection count");
	}

	/// Explicit logout: the transport stays open but loses its binding.
	pub async fn do_user_logout(&self, conn_id: ConnectionId) {
		self.detach_connection(conn_id, LeaveReason::Logout).await;
	}

	/// Transport closed: run the detach path, then forget the id.
	pub async fn handle_disconnect(&self, conn_id: ConnectionId) {
		self.detach_connection(conn_id, LeaveReason::Disconnect).await;
		self.connections.remove(conn_id).await;
	}

	async fn detach_connection(&self, conn_id: ConnectionId, reason: LeaveReason) {
		let Some(username) = self.connections.username(conn_id).await else {
			return;
		};

		debug!(username = %username, conn = %conn_id, reason = reason.as_str(), "connection detaching");
		self.connections.unbind(conn_id).await;

		let outcome = self.presence.detach(&username, conn_id, unix_ms_now()).await;
		if outcome.went_offline {
			debug!(username = %username, "all connections for user are gone");
			for channel_id in outcome.live_channels {
				self.user_leave_channel(&username, &channel_id, reason, None).await;
			}
		}
	}

	/// The channel-leave path: remove from live-membership, notify the
	/// remaining members, say goodbye to the departing user, and record a
	/// history notice. PM channels evaporate when their last member goes.
	pub async fn user_leave_channel(
		&self,
		username: &Username,
		channel_id: &ChannelId,
		reason: LeaveReason,
		kicked_by: Option<String>,
	) {
		let outcome = match self.channels.leave(username, channel_id).await {
			Ok(outcome) => outcome,
			Err(e) => {
				warn!(username = %username, channel = %channel_id, error = %e, "leave on missing channel");
				return;
			}
		};

		self.presence.remove_live_channel(username, channel_id).await;

		if !outcome.removed {
			// detach raced a forced logout; nothing to announce
			return;
		}

		info!(username = %username, channel = %channel_id, reason = reason.as_str(), "user is leaving channel");

		let nice_reason = reason.notice_text(kicked_by.as_deref());

		self.dispatcher
			.to_channel(
				channel_id,
				&ServerEvent::Left(LeftPayload {
					channel_id: channel_id.clone(),
					username: username.clone(),
					reason,
					nice_reason: nice_reason.clone(),
				}),
			)
			.await;

		if reason.wants_goodbye() {
			self.dispatcher
				.to_user(
					username,
					&ServerEvent::Goodbye(GoodbyePayload {
						channel_id: channel_id.clone(),
						reason,
						nice_reason: nice_reason.clone(),
					}),
				)
				.await;
		}

		if !outcome.pm_deleted {
			let disp = match self.presence.profile(username).await {
				Some(user) => display_name(&user.full_name, &user.nickname),
				None => username.to_string(),
			};
			self.append_notice(channel_id, Some(username.clone()), "User", format!("<b>{disp}</b> {nice_reason}"))
				.await;
		}
	}

	/// Add a notice to channel history without broadcasting it.
	async fn append_notice(&self, channel_id: &ChannelId, username: Option<Username>, label: &str, content: String) {
		let message = self.make_notice(channel_id, username, label, content);
		if let Err(e) = self.channels.commit_message(channel_id, message).await {
			debug!(channel = %channel_id, error = %e, "notice dropped");
		}
	}

	fn make_notice(&self, channel_id: &ChannelId, username: Option<Username>, label: &str, content: String) -> ChatMessage {
		ChatMessage {
			id: MessageId::new(self.ids.next("n")).expect("generated id is non-empty"),
			channel_id: channel_id.clone(),
			kind: MessageKind::Notice,
			username,
			content,
			date: unix_ms_now(),
			seq_id: None,
			label: Some(label.to_string()),
			to: None,
			reactions: ReactionMap::default(),
			tags: None,
		}
	}

	/// Broadcast a notice to a channel and record it in history.
	pub async fn channel_notice(&self, channel_id: &ChannelId, username: Option<Username>, label: &str, content: String) {
		if !self.channels.exists(channel_id).await {
			warn!(channel = %channel_id, "cannot send notice, channel not found");
			return;
		}

		let message = self.make_notice(channel_id, username, label, content);
		match self.channels.commit_message(channel_id, message.clone()).await {
			Ok(members) => {
				self.dispatcher
					.to_members(&members, &ServerEvent::Said(Box::new(message)))
					.await;
			}
			Err(e) => debug!(channel = %channel_id, error = %e, "notice dropped"),
		}
	}

	/// Persist an indexable message: timeline stub, record body, search
	/// document. Fire-and-forget relative to the broadcast.
	pub(crate) fn spawn_index(&self, message: ChatMessage) {
		let store = Arc::clone(&self.store);
		let search = Arc::clone(&self.search);
		tokio::spawn(async move {
			let Some(seq_id) = message.seq_id.clone() else {
				return;
			};

			let value = match serde_json::to_value(&message) {
				Ok(v) => v,
				Err(e) => {
					error!(seq = %seq_id, error = %e, "failed to encode message for indexing");
					return;
				}
			};

			let stub = serde_json::json!({ "seq_id": seq_id.as_str() });
			if let Err(e) = store.list_push(&format!("timeline/{}", message.channel_id), stub).await {
				error!(error = %format!("{e:#}"), "failed to add item to timeline");
				return;
			}
			if let Err(e) = store
				.put(&format!("records/messages/{}", seq_id.as_str()), value.clone())
				.await
			{
				error!(error = %format!("{e:#}"), "failed to store message record");
				return;
			}
			if let Err(e) = search.index("messages", seq_id.as_str(), value).await {
				error!(error = %format!("{e:#}"), "failed to index message");
			}
		});
	}

	/// Create a persistent channel per the registry rules, persist the
	/// definition, and announce it to everyone who can see it.
	pub async fn create_channel(&self, info: ChannelInfo) -> Result<ChannelInfo, CommandError> {
		let info = self.channels.create(info).await?;
		self.persist_channel(&info, true).await;
		self.broadcast_channel_update(&info).await;
		Ok(info)
	}

	/// Patch a channel. A flip to private forces out live users who lack
	/// membership, with reason `private`.
	pub async fn update_channel(&self, channel_id: &ChannelId, patch: ChannelPatch) -> Result<ChannelInfo, CommandError> {
		let (info, evicted) = self.channels.update(channel_id, patch, unix_ms_now()).await?;

		for username in evicted {
			self.user_leave_channel(&username, channel_id, LeaveReason::Private, None).await;
		}

		self.persist_channel(&info, false).await;
		self.broadcast_channel_update(&info).await;
		Ok(info)
	}

	/// Delete a channel, forcing every live member out first.
	pub async fn delete_channel(&self, channel_id: &ChannelId) -> Result<ChannelInfo, CommandError> {
		if !self.channels.exists(channel_id).await {
			return Err(CommandError::NotFound(format!("Channel not found: {channel_id}")));
		}

		for username in self.channels.live_members(channel_id).await {
			self.user_leave_channel(&username, channel_id, LeaveReason::Delete, None).await;
		}

		let info = self.channels.remove(channel_id).await?;
		if let Err(e) = self.store.delete(&format!("channels/{channel_id}")).await {
			error!(channel = %channel_id, error = %format!("{e:#}"), "failed to delete channel record");
		}

		self.dispatcher
			.to_all_authenticated(&ServerEvent::ChannelUpdated(Box::new(parley_protocol::ChannelUpdatedPayload {
				channel_id: channel_id.clone(),
				channel: None,
				deleted: true,
			})))
			.await;

		Ok(info)
	}

	pub(crate) async fn persist_channel(&self, info: &ChannelInfo, created: bool) {
		if info.pm {
			return;
		}

		let value = match serde_json::to_value(info) {
			Ok(v) => v,
			Err(e) => {
				error!(channel = %info.id, error = %e, "failed to encode channel");
				return;
			}
		};

		if let Err(e) = self.store.put(&format!("channels/{}", info.id), value).await {
			error!(channel = %info.id, error = %format!("{e:#}"), "failed to persist channel");
			return;
		}
		if created
			&& let Err(e) = self
				.store
				.list_push("global/channels", serde_json::Value::String(info.id.as_str().to_string()))
				.await
		{
			error!(channel = %info.id, error = %format!("{e:#}"), "failed to register channel id");
		}
	}

	/// Send a channel definition to every user allowed to see it.
	pub(crate) async fn broadcast_channel_update(&self, info: &ChannelInfo) {
		let users = self.presence.snapshot_users().await;
		let event = ServerEvent::ChannelUpdated(Box::new(parley_protocol::ChannelUpdatedPayload {
			channel_id: info.id.clone(),
			channel: Some(info.clone()),
			deleted: false,
		}));

		for (username, user) in users {
			let visible = if info.pm {
				info.users.contains_key(&username)
			} else {
				user.privileges.admin || !info.private || info.users.contains_key(&username)
			};
			if visible {
				self.dispatcher.to_user(&username, &event).await;
			}
		}
	}

	/// Run the normal detach/leave sequence for every connection of a
	/// user, then force the transports closed. Used on ban.
	pub async fn force_disconnect_all(&self, username: &Username) {
		let ids = self.presence.connection_ids(username).await;
		info!(username = %username, connections = ids.len(), "forcing disconnect of all user connections");

		for conn_id in ids {
			self.detach_connection(conn_id, LeaveReason::Logout).await;
			self.connections.force_close(conn_id).await;
		}
	}

	/// Consume the identity provider's change stream: profile fan-out,
	/// ban-triggered forced logout, account deletion.
	pub async fn run_user_changes(self: Arc<Self>, mut rx: broadcast::Receiver<UserChange>) {
		loop {
			match rx.recv().await {
				Ok(UserChange::Updated { user, was_active }) => {
					let username = user.username.clone();
					let banned_now = was_active && !user.active;
					self.presence.update_profile(user.clone()).await;
					self.dispatcher
						.to_all_authenticated(&ServerEvent::UserUpdated(Box::new(user)))
						.await;

					if banned_now && self.presence.is_online(&username).await {
						info!(username = %username, "user has been banned, forcing logout");
						self.force_disconnect_all(&username).await;
					}
				}
				Ok(UserChange::Deleted { username }) => {
					for conn_id in self.presence.connection_ids(&username).await {
						self.detach_connection(conn_id, LeaveReason::Logout).await;
						self.connections.force_close(conn_id).await;
					}
					self.presence.remove(&username).await;
					self.dispatcher
						.to_all_authenticated(&ServerEvent::UserDeleted(parley_protocol::UserDeletedPayload {
							username,
						}))
						.await;
				}
				Err(broadcast::error::RecvError::Lagged(skipped)) => {
					warn!(skipped, "user change stream lagged");
				}
				Err(broadcast::error::RecvError::Closed) => break,
			}
		}
	}

	/// Once-per-second status push to all authenticated connections.
	pub async fn tick(&self) {
		if self.connections.authenticated_count().await > 0 {
			self.dispatcher
				.to_all_authenticated(&ServerEvent::Status(StatusPayload { epoch: unix_secs_now() }))
				.await;
		}
	}

	pub(crate) fn identity_call_error(err: IdentityError) -> CommandError {
		CommandError::External(err.to_string())
	}
}

/// Commands that mutate registry or durable state; refused once shutdown
/// has begun.
fn is_mutating(cmd: &ClientCommand) -> bool {
	matches!(
		cmd,
		ClientCommand::Join(_)
			| ClientCommand::Leave(_)
			| ClientCommand::Say(_)
			| ClientCommand::Pm(_)
			| ClientCommand::Kick(_)
			| ClientCommand::Ban(_)
			| ClientCommand::Unban(_)
			| ClientCommand::Status(_)
			| ClientCommand::Nick(_)
			| ClientCommand::Topic(_)
			| ClientCommand::Emoji(_)
			| ClientCommand::React(_)
			| ClientCommand::Tags(_)
	)
}
