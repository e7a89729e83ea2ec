#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::anyhow;
use parley_domain::{ChannelInfo, ChatMessage, MessageId, ReactionAction, SeqId, TagAction, TagSet, Username};
use parley_protocol::{ReactedPayload, ServerEvent, TagsUpdatedPayload};
use parley_store::{RecordStore, SearchIndex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::server::channels::ChannelRegistry;
use crate::server::dispatch::Dispatcher;

pub fn message_key(seq_id: &SeqId) -> String {
	format!("records/messages/{seq_id}")
}

/// Applies atomic read-modify-write updates (reactions, tags) to persisted
/// messages while keeping the in-memory history cache consistent.
///
/// The optimistic broadcast always goes out first and is never retracted:
/// a failed durable write leaves connected clients ahead of the store
/// until they reload. That latency-over-consistency tradeoff is load-bearing.
pub struct AnnotationService {
	store: Arc<dyn RecordStore>,
	search: Arc<dyn SearchIndex>,
	channels: Arc<ChannelRegistry>,
	dispatcher: Dispatcher,
	indexer_enabled: bool,
}

impl AnnotationService {
	pub fn new(
		store: Arc<dyn RecordStore>,
		search: Arc<dyn SearchIndex>,
		channels: Arc<ChannelRegistry>,
		dispatcher: Dispatcher,
		indexer_enabled: bool,
	) -> Self {
		Self {
			store,
			search,
			channels,
			dispatcher,
			indexer_enabled,
		}
	}

	/// React to a message: broadcast immediately, then persist through an
	/// exclusive per-message transaction. Returns the persistence task, if
	/// one was spawned, so tests can await it.
	#[allow(clippy::too_many_arguments)]
	pub async fn react(
		&self,
		channel: ChannelInfo,
		chat_id: MessageId,
		seq_id: Option<SeqId>,
		emoji_id: String,
		action: ReactionAction,
		acting: Username,
		now_ms: i64,
	) -> Option<JoinHandle<()>> {
		// users expect instant feedback
		self.dispatcher
			.to_channel(
				&channel.id,
				&ServerEvent::Reacted(ReactedPayload {
					channel_id: channel.id.clone(),
					id: chat_id.clone(),
					username: acting.clone(),
					emoji_id: emoji_id.clone(),
					action,
				}),
			)
			.await;

		if !self.indexer_enabled {
			error!("indexer is disabled, cannot save reaction in storage");
			return None;
		}
		if channel.private {
			debug!(channel = %channel.id, "not saving reactions in private channels");
			return None;
		}
		if channel.pm {
			debug!(channel = %channel.id, "not saving reactions in pm channels");
			return None;
		}
		let Some(seq_id) = seq_id else {
			debug!(chat = %chat_id, "reaction without seq_id, nothing to persist");
			return None;
		};

		// keep the cached copy in step so newly-joining connections see a
		// consistent snapshot without waiting on the store round-trip
		{
			let emoji_id = emoji_id.clone();
			let acting = acting.clone();
			self.channels
				.patch_history(&channel.id, &chat_id, move |message| {
					message.reactions.apply(action, &emoji_id, &acting, now_ms);
				})
				.await;
		}

		let store = Arc::clone(&self.store);
		let key = message_key(&seq_id);
		Some(tokio::spawn(async move {
			if let Err(e) = apply_reaction_tx(store.as_ref(), &key, action, &emoji_id, &acting, now_ms).await {
				// rolled back; the optimistic broadcast stands
				error!(key = %key, error = %format!("{e:#}"), "reaction transaction failed, rolled back");
			} else {
				debug!(key = %key, "reaction persisted");
			}
		}))
	}

	/// Update a message's tag set under the per-message exclusive lock and
	/// optionally notify only the acting user's own connections.
	#[allow(clippy::too_many_arguments)]
	pub async fn tags(
		&self,
		channel: ChannelInfo,
		chat_id: MessageId,
		seq_id: SeqId,
		action: TagAction,
		tags_csv: &str,
		notify_user: bool,
		acting: &Username,
	) {
		if !self.indexer_enabled {
			error!("indexer is disabled, cannot update tags in storage");
			return;
		}

		let key = message_key(&seq_id);
		let delta = TagSet::parse_csv(tags_csv);

		let updated_csv = {
			let _guard = self.store.lock(&key).await;

			let loaded = match self.store.get(&key).await {
				Ok(Some(value)) => value,
				Ok(None) => {
					error!(key = %key, "cannot tag message: record not found");
					return;
				}
				Err(e) => {
					error!(key = %key, error = %format!("{e:#}"), "cannot tag message: load failed");
					return;
				}
			};

			let mut message: ChatMessage = match serde_json::from_value(loaded) {
				Ok(m) => m,
				Err(e) => {
					error!(key = %key, error = %e, "cannot tag message: malformed record");
					return;
				}
			};

			let mut tags = TagSet::parse_csv(message.tags.as_deref().unwrap_or(""));
			tags.apply(action, &delta);
			let csv = tags.to_csv();
			message.tags = Some(csv.clone());

			let value = match serde_json::to_value(&message) {
				Ok(v) => v,
				Err(e) => {
					error!(key = %key, error = %e, "cannot tag message: encode failed");
					return;
				}
			};
			if let Err(e) = self.store.put(&key, value.clone()).await {
				error!(key = %key, error = %format!("{e:#}"), "cannot tag message: write failed");
				return;
			}

			if let Err(e) = self.search.index("messages", seq_id.as_str(), value).await {
				error!(key = %key, error = %format!("{e:#}"), "failed to re-index tagged message");
			}

			csv
		};

		let csv_for_cache = updated_csv.clone();
		self.channels
			.patch_history(&channel.id, &chat_id, move |message| {
				message.tags = Some(csv_for_cache);
			})
			.await;

		debug!(key = %key, tags = %updated_csv, "message tagged");

		if notify_user {
			self.dispatcher
				.to_user(
					acting,
					&ServerEvent::TagsUpdated(TagsUpdatedPayload {
						channel_id: channel.id,
						id: chat_id,
						seq_id: Some(seq_id.as_str().to_string()),
						action,
						tags: updated_csv,
					}),
				)
				.await;
		}
	}
}

async fn apply_reaction_tx(
	store: &dyn RecordStore,
	key: &str,
	action: ReactionAction,
	emoji_id: &str,
	acting: &Username,
	now_ms: i64,
) -> anyhow::Result<()> {
	let mut tx = store.begin(key).await?;

	let loaded = match tx.get(key).await {
		Ok(Some(value)) => value,
		Ok(None) => {
			let _ = tx.abort().await;
			return Err(anyhow!("chat record not found: {key}"));
		}
		Err(e) => {
			let _ = tx.abort().await;
			return Err(e);
		}
	};

	let mut message: ChatMessage = match serde_json::from_value(loaded) {
		Ok(m) => m,
		Err(e) => {
			let _ = tx.abort().await;
			return Err(e.into());
		}
	};

	message.reactions.apply(action, emoji_id, acting, now_ms);

	let value = match serde_json::to_value(&message) {
		Ok(v) => v,
		Err(e) => {
			let _ = tx.abort().await;
			return Err(e.into());
		}
	};
	if let Err(e) = tx.put(key, value).await {
		let _ = tx.abort().await;
		return Err(e);
	}

	tx.commit().await
}
