#![forbid(unsafe_code)]

use std::sync::Arc;

use parley_domain::{ChannelId, ConnectionId, Username};
use parley_protocol::ServerEvent;
use tracing::debug;

use crate::server::channels::ChannelRegistry;
use crate::server::connections::ConnectionRegistry;
use crate::server::presence::PresenceRegistry;

/// The four delivery primitives. Side effect only: never mutates domain
/// state, and every target set is snapshotted before iteration so a
/// connection vanishing mid-loop is tolerated.
#[derive(Clone)]
pub struct Dispatcher {
	connections: Arc<ConnectionRegistry>,
	presence: Arc<PresenceRegistry>,
	channels: Arc<ChannelRegistry>,
}

impl Dispatcher {
	pub fn new(
		connections: Arc<ConnectionRegistry>,
		presence: Arc<PresenceRegistry>,
		channels: Arc<ChannelRegistry>,
	) -> Self {
		Self {
			connections,
			presence,
			channels,
		}
	}

	pub async fn to_connection(&self, id: ConnectionId, event: &ServerEvent) {
		self.connections.send(id, event).await;
	}

	/// All of the user's authenticated connections (multi-device).
	pub async fn to_user(&self, username: &Username, event: &ServerEvent) {
		let ids = self.presence.connection_ids(username).await;
		if ids.is_empty() {
			debug!(username = %username, event = event.name(), "user broadcast with no connections");
			return;
		}

		for id in ids {
			self.connections.send_if_authenticated(id, event).await;
		}
	}

	/// Deliver to a precomputed membership snapshot. Used when the caller
	/// already holds a consistent live set from a registry mutation.
	pub async fn to_members(&self, members: &[Username], event: &ServerEvent) {
		for username in members {
			self.to_user(username, event).await;
		}
	}

	/// All live members' connections for a channel.
	pub async fn to_channel(&self, channel_id: &ChannelId, event: &ServerEvent) {
		let members = self.channels.live_members(channel_id).await;
		metrics::counter!("parley_channel_broadcasts_total").increment(1);
		self.to_members(&members, event).await;
	}

	/// Every authenticated connection process-wide.
	pub async fn to_all_authenticated(&self, event: &ServerEvent) {
		let ids = self.connections.authenticated_ids().await;
		for id in ids {
			self.connections.send_if_authenticated(id, event).await;
		}
	}
}
