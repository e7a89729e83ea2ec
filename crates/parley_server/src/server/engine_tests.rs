#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::{
	ChannelId, ChannelInfo, ChatMessage, ConnectionId, LeaveReason, MemberRole, MessageKind, Privileges, SeqId,
	Username,
};
use parley_protocol::ServerEvent;
use parley_store::{Directory, IdentityProvider, MemoryRecordStore, MemorySearchIndex, RecordStore};
use serde_json::json;
use tokio::sync::mpsc;

use crate::server::annotations::message_key;
use crate::server::connections::{Outbound, TrafficCounters};
use crate::server::engine::{Engine, EngineConfig};
use crate::server::heartbeat;
use crate::util::time::unix_ms_now;

fn user(s: &str) -> Username {
	Username::normalize(s).unwrap()
}

fn chan(s: &str) -> ChannelId {
	ChannelId::normalize(s).unwrap()
}

struct TestBed {
	engine: Arc<Engine>,
	directory: Arc<Directory>,
	store: Arc<MemoryRecordStore>,
}

async fn testbed(indexer_enabled: bool) -> TestBed {
	let store = Arc::new(MemoryRecordStore::new());
	let store_dyn: Arc<dyn RecordStore> = store.clone();
	let directory = Arc::new(Directory::new(store_dyn.clone(), "test-secret", 3600));
	let identity: Arc<dyn IdentityProvider> = directory.clone();

	let engine = Engine::new(
		identity,
		store_dyn,
		Arc::new(MemorySearchIndex::default()),
		10,
		EngineConfig {
			max_message_content_length: 256,
			indexer_enabled,
			identity_timeout: Duration::from_secs(5),
			base_app_url: String::new(),
			status_map: BTreeMap::new(),
		},
	);

	TestBed {
		engine,
		directory,
		store,
	}
}

async fn add_user(bed: &TestBed, name: &str, full_name: &str, admin: bool) {
	bed.directory
		.create_user(
			name,
			"pw",
			full_name,
			Privileges {
				admin,
				..Privileges::default()
			},
		)
		.await
		.unwrap();
}

async fn connect(bed: &TestBed) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let id = bed
		.engine
		.connections
		.register("127.0.0.1:0", tx, Arc::new(TrafficCounters::default()), unix_ms_now())
		.await;
	(id, rx)
}

async fn send(bed: &TestBed, conn: ConnectionId, frame: serde_json::Value) {
	bed.engine.handle_frame(conn, &frame.to_string()).await;
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
	let mut items = Vec::new();
	while let Ok(item) = rx.try_recv() {
		items.push(item);
	}
	items
}

fn events(items: &[Outbound]) -> Vec<&ServerEvent> {
	items
		.iter()
		.filter_map(|item| match item {
			Outbound::Event(event) => Some(event),
			Outbound::Close => None,
		})
		.collect()
}

fn has_close(items: &[Outbound]) -> bool {
	items.iter().any(|item| matches!(item, Outbound::Close))
}

async fn login(bed: &TestBed, name: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
	let (conn, mut rx) = connect(bed).await;
	send(bed, conn, json!({"cmd": "authenticate", "data": {"username": name, "password": "pw"}})).await;

	let items = drain(&mut rx);
	let got = events(&items);
	assert!(
		matches!(got.last(), Some(ServerEvent::Login(_))),
		"expected login event, got: {:?}",
		got.iter().map(|e| e.name()).collect::<Vec<_>>()
	);
	(conn, rx)
}

async fn make_channel(bed: &TestBed, id: &str, founder: &str, members: &[(&str, bool)]) {
	let mut users = BTreeMap::new();
	for (name, admin) in members {
		users.insert(user(name), MemberRole { admin: *admin });
	}
	bed.engine
		.create_channel(ChannelInfo {
			id: chan(id),
			title: id.to_string(),
			topic: String::new(),
			private: false,
			pm: false,
			founder: user(founder),
			users,
			created: 0,
			modified: 0,
		})
		.await
		.unwrap();
}

async fn stored_message(bed: &TestBed, seq: &SeqId) -> Option<ChatMessage> {
	bed.store
		.get(&message_key(seq))
		.await
		.unwrap()
		.map(|v| serde_json::from_value(v).unwrap())
}

async fn wait_until<F>(mut check: F)
where
	F: AsyncFnMut() -> bool,
{
	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			if check().await {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("condition not reached in time");
}

#[tokio::test]
async fn login_snapshot_contains_known_state() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	add_user(&bed, "bob", "Bob Smith", false).await;
	bed.engine.load_state().await.unwrap();
	make_channel(&bed, "general", "alice", &[]).await;

	let (conn, mut rx) = connect(&bed).await;
	send(&bed, conn, json!({"cmd": "authenticate", "data": {"username": "alice", "password": "pw"}})).await;

	let items = drain(&mut rx);
	let got = events(&items);
	let ServerEvent::Login(payload) = got.last().unwrap() else {
		panic!("expected login, got: {:?}", got.iter().map(|e| e.name()).collect::<Vec<_>>());
	};

	assert_eq!(payload.username, user("alice"));
	assert!(payload.users.contains_key(&user("bob")), "offline users are in the snapshot");
	assert!(payload.channels.contains_key(&chan("general")));
	assert!(!payload.session_id.is_empty());
	assert_eq!(payload.config.max_message_content_length, 256);
}

#[tokio::test]
async fn bad_credentials_yield_auth_failure() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice", false).await;

	let (conn, mut rx) = connect(&bed).await;
	send(&bed, conn, json!({"cmd": "authenticate", "data": {"username": "alice", "password": "wrong"}})).await;

	let items = drain(&mut rx);
	assert!(matches!(events(&items).as_slice(), [ServerEvent::AuthFailure(_)]));

	// missing form is equally vague
	send(&bed, conn, json!({"cmd": "authenticate", "data": {}})).await;
	let items = drain(&mut rx);
	let got = events(&items);
	let ServerEvent::AuthFailure(failure) = got[0] else {
		panic!("expected auth_failure");
	};
	assert_eq!(failure.description, "User not found or invalid password.");
}

#[tokio::test]
async fn join_delivers_joined_and_welcome_with_history() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (conn, mut rx) = login(&bed, "alice").await;
	send(&bed, conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;

	let items = drain(&mut rx);
	let got = events(&items);

	let ServerEvent::Joined(joined) = got[0] else {
		panic!("expected joined first, got: {:?}", got.iter().map(|e| e.name()).collect::<Vec<_>>());
	};
	assert_eq!(joined.username, user("alice"));

	let ServerEvent::Welcome(welcome) = got[1] else {
		panic!("expected welcome second");
	};
	assert_eq!(welcome.channel_id, chan("general"));
	assert!(welcome.channel.users.is_empty(), "membership map is withheld from welcome");
	assert_eq!(welcome.history.len(), 1);
	assert_eq!(welcome.history[0].kind, MessageKind::Notice);
	assert!(welcome.history[0].content.contains("has joined the channel."));
}

#[tokio::test]
async fn second_device_join_skips_history_notice() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (conn1, _rx1) = login(&bed, "alice").await;
	let (conn2, mut rx2) = login(&bed, "alice").await;

	send(&bed, conn1, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut rx2);
	send(&bed, conn2, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;

	let items = drain(&mut rx2);
	let got = events(&items);
	let welcome = got
		.iter()
		.find_map(|e| match e {
			ServerEvent::Welcome(w) => Some(w),
			_ => None,
		})
		.expect("welcome for second device");

	// still exactly one join notice in history
	let notices = welcome
		.history
		.iter()
		.filter(|m| m.content.contains("has joined the channel."))
		.count();
	assert_eq!(notices, 1);
}

#[tokio::test]
async fn say_is_sanitized_and_broadcast_to_live_members() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	add_user(&bed, "bob", "Bob Smith", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (alice_conn, mut alice_rx) = login(&bed, "alice").await;
	let (bob_conn, mut bob_rx) = login(&bed, "bob").await;
	send(&bed, alice_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	send(&bed, bob_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut alice_rx);
	drain(&mut bob_rx);

	send(
		&bed,
		alice_conn,
		json!({"cmd": "say", "data": {"channel_id": "general", "type": "standard", "content": "<script>bad()</script>hello"}}),
	)
	.await;

	for rx in [&mut alice_rx, &mut bob_rx] {
		let items = drain(rx);
		let got = events(&items);
		let ServerEvent::Said(message) = got[0] else {
			panic!("expected said");
		};
		assert_eq!(message.content, "hello", "script tag must be stripped");
		assert_eq!(message.username, Some(user("alice")));
	}
}

#[tokio::test]
async fn say_requires_live_membership() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (conn, mut rx) = login(&bed, "alice").await;
	send(
		&bed,
		conn,
		json!({"cmd": "say", "data": {"channel_id": "general", "type": "standard", "content": "hi"}}),
	)
	.await;

	let items = drain(&mut rx);
	let got = events(&items);
	let ServerEvent::Error(err) = got[0] else {
		panic!("expected error");
	};
	assert!(err.description.contains("not currently in channel"));
}

#[tokio::test]
async fn whisper_reaches_exactly_one_recipient_and_skips_history() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	add_user(&bed, "bob", "Bob Smith", false).await;
	add_user(&bed, "carol", "Carol Reed", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (alice_conn, mut alice_rx) = login(&bed, "alice").await;
	let (bob_conn, mut bob_rx) = login(&bed, "bob").await;
	let (carol_conn, mut carol_rx) = login(&bed, "carol").await;
	for conn in [alice_conn, bob_conn, carol_conn] {
		send(&bed, conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	}
	drain(&mut alice_rx);
	drain(&mut bob_rx);
	drain(&mut carol_rx);

	let history_before = bed.engine.channels.history(&chan("general")).await.len();

	send(
		&bed,
		alice_conn,
		json!({"cmd": "say", "data": {"channel_id": "general", "type": "whisper", "content": "psst", "to": "bob"}}),
	)
	.await;

	let bob_items = drain(&mut bob_rx);
	let got = events(&bob_items);
	let ServerEvent::Said(message) = got[0] else {
		panic!("expected whisper said");
	};
	assert_eq!(message.kind, MessageKind::Whisper);
	assert_eq!(message.to, Some(user("bob")));
	assert!(message.seq_id.is_none(), "whispers are never persisted");

	assert!(events(&drain(&mut alice_rx)).is_empty(), "sender relies on local echo");
	assert!(events(&drain(&mut carol_rx)).is_empty(), "bystanders see nothing");
	assert_eq!(bed.engine.channels.history(&chan("general")).await.len(), history_before);
}

#[tokio::test]
async fn say_persists_and_reaction_votes_flip() {
	let bed = testbed(true).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (conn, mut rx) = login(&bed, "alice").await;
	send(&bed, conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut rx);

	send(
		&bed,
		conn,
		json!({"cmd": "say", "data": {"channel_id": "general", "type": "standard", "content": "vote on this"}}),
	)
	.await;

	let items = drain(&mut rx);
	let got = events(&items);
	let ServerEvent::Said(message) = got[0] else {
		panic!("expected said");
	};
	let seq = message.seq_id.clone().expect("public standard messages get a seq id");
	let chat_id = message.id.as_str().to_string();

	wait_until(async || stored_message(&bed, &seq).await.is_some()).await;

	send(
		&bed,
		conn,
		json!({"cmd": "react", "data": {"channel_id": "general", "chat_id": chat_id.as_str(), "seq_id": seq.as_str(), "emoji_id": "+1", "action": "add"}}),
	)
	.await;
	wait_until(async || {
		stored_message(&bed, &seq)
			.await
			.map(|m| m.reactions.users_of("+1").is_some_and(|u| u.contains(&user("alice"))))
			.unwrap_or(false)
	})
	.await;

	send(
		&bed,
		conn,
		json!({"cmd": "react", "data": {"channel_id": "general", "chat_id": chat_id.as_str(), "seq_id": seq.as_str(), "emoji_id": "-1", "action": "add"}}),
	)
	.await;
	wait_until(async || {
		stored_message(&bed, &seq)
			.await
			.map(|m| {
				m.reactions.users_of("+1").is_none()
					&& m.reactions.users_of("-1").is_some_and(|u| u.contains(&user("alice")))
			})
			.unwrap_or(false)
	})
	.await;

	// the history cache was patched in step with the store
	let history = bed.engine.channels.history(&chan("general")).await;
	let cached = history.iter().find(|m| m.id.as_str() == chat_id).unwrap();
	assert!(cached.reactions.users_of("+1").is_none());
	assert!(cached.reactions.users_of("-1").is_some());

	// both optimistic broadcasts arrived
	let items = drain(&mut rx);
	let reacted = events(&items)
		.iter()
		.filter(|e| matches!(e, ServerEvent::Reacted(_)))
		.count();
	assert_eq!(reacted, 2);
}

#[tokio::test]
async fn reaction_transaction_failure_is_rolled_back_not_retracted() {
	let bed = testbed(true).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (conn, mut rx) = login(&bed, "alice").await;
	send(&bed, conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut rx);

	let channel = bed.engine.channels.info(&chan("general")).await.unwrap();
	let ghost_seq = SeqId::new("doesnotexist").unwrap();

	let handle = bed
		.engine
		.annotations
		.react(
			channel,
			parley_domain::MessageId::new("m404").unwrap(),
			Some(ghost_seq.clone()),
			"+1".to_string(),
			parley_domain::ReactionAction::Add,
			user("alice"),
			unix_ms_now(),
		)
		.await
		.expect("persistence task spawned");
	handle.await.unwrap();

	// transaction aborted: nothing was written
	assert!(stored_message(&bed, &ghost_seq).await.is_none());

	// but the optimistic broadcast already went out and stands
	let items = drain(&mut rx);
	assert!(events(&items).iter().any(|e| matches!(e, ServerEvent::Reacted(_))));
}

#[tokio::test]
async fn tags_canonicalize_and_notify_acting_user_only() {
	let bed = testbed(true).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	add_user(&bed, "bob", "Bob Smith", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (alice_conn, mut alice_rx) = login(&bed, "alice").await;
	let (bob_conn, mut bob_rx) = login(&bed, "bob").await;
	send(&bed, alice_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	send(&bed, bob_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut alice_rx);
	drain(&mut bob_rx);

	send(
		&bed,
		alice_conn,
		json!({"cmd": "say", "data": {"channel_id": "general", "type": "standard", "content": "tag me"}}),
	)
	.await;
	let items = drain(&mut alice_rx);
	let got = events(&items);
	let ServerEvent::Said(message) = got[0] else {
		panic!("expected said");
	};
	let seq = message.seq_id.clone().unwrap();
	let chat_id = message.id.as_str().to_string();
	drain(&mut bob_rx);

	wait_until(async || stored_message(&bed, &seq).await.is_some()).await;

	send(
		&bed,
		alice_conn,
		json!({"cmd": "tags", "data": {"channel_id": "general", "chat_id": chat_id.as_str(), "seq_id": seq.as_str(), "action": "add", "tags": "beta, alpha, beta", "notify_user": true}}),
	)
	.await;

	assert_eq!(
		stored_message(&bed, &seq).await.unwrap().tags.as_deref(),
		Some("alpha,beta")
	);

	let items = drain(&mut alice_rx);
	let tags_updated = events(&items)
		.iter()
		.filter(|e| matches!(e, ServerEvent::TagsUpdated(_)))
		.count();
	assert_eq!(tags_updated, 1, "acting user is notified");
	assert!(
		events(&drain(&mut bob_rx)).is_empty(),
		"tag updates are never broadcast channel-wide"
	);

	send(
		&bed,
		alice_conn,
		json!({"cmd": "tags", "data": {"channel_id": "general", "chat_id": chat_id.as_str(), "seq_id": seq.as_str(), "action": "remove", "tags": "alpha"}}),
	)
	.await;
	assert_eq!(stored_message(&bed, &seq).await.unwrap().tags.as_deref(), Some("beta"));
}

#[tokio::test]
async fn disconnect_cascades_into_every_live_channel() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	add_user(&bed, "bob", "Bob Smith", false).await;
	make_channel(&bed, "general", "alice", &[]).await;
	make_channel(&bed, "random", "alice", &[]).await;

	let (alice_conn, _alice_rx) = login(&bed, "alice").await;
	let (bob_conn, mut bob_rx) = login(&bed, "bob").await;
	for id in ["general", "random"] {
		send(&bed, alice_conn, json!({"cmd": "join", "data": {"channel_id": id}})).await;
		send(&bed, bob_conn, json!({"cmd": "join", "data": {"channel_id": id}})).await;
	}
	drain(&mut bob_rx);

	bed.engine.handle_disconnect(alice_conn).await;

	let items = drain(&mut bob_rx);
	let mut left_channels: Vec<ChannelId> = events(&items)
		.iter()
		.filter_map(|e| match e {
			ServerEvent::Left(left) => {
				assert_eq!(left.reason, LeaveReason::Disconnect);
				assert_eq!(left.username, user("alice"));
				assert_eq!(left.nice_reason, "has disconnected from the server.");
				Some(left.channel_id.clone())
			}
			_ => None,
		})
		.collect();
	left_channels.sort();
	assert_eq!(left_channels, vec![chan("general"), chan("random")]);

	assert!(!bed.engine.presence.is_online(&user("alice")).await);
	assert!(!bed.engine.channels.is_live(&chan("general"), &user("alice")).await);
}

#[tokio::test]
async fn ban_forces_both_connections_out_without_double_leave() {
	let bed = testbed(false).await;
	add_user(&bed, "ada", "Ada Admin", true).await;
	add_user(&bed, "bob", "Bob Smith", false).await;
	make_channel(&bed, "general", "ada", &[]).await;

	tokio::spawn(Arc::clone(&bed.engine).run_user_changes(bed.directory.subscribe_changes()));

	let (ada_conn, mut ada_rx) = login(&bed, "ada").await;
	let (bob_conn1, mut bob_rx1) = login(&bed, "bob").await;
	let (bob_conn2, mut bob_rx2) = login(&bed, "bob").await;

	send(&bed, ada_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	send(&bed, bob_conn1, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	send(&bed, bob_conn2, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut ada_rx);

	send(&bed, ada_conn, json!({"cmd": "ban", "data": {"username": "bob"}})).await;

	wait_until(async || !bed.engine.presence.is_online(&user("bob")).await).await;

	// keep collecting until the leave broadcast lands, then settle
	let mut ada_items = Vec::new();
	wait_until(async || {
		ada_items.extend(drain(&mut ada_rx));
		events(&ada_items).iter().any(|e| matches!(e, ServerEvent::Left(_)))
	})
	.await;
	tokio::time::sleep(Duration::from_millis(100)).await;
	ada_items.extend(drain(&mut ada_rx));

	let bob1 = drain(&mut bob_rx1);
	let bob2 = drain(&mut bob_rx2);
	assert!(has_close(&bob1), "first connection is force-closed");
	assert!(has_close(&bob2), "second connection is force-closed");

	let got = events(&ada_items);
	assert!(
		got.iter()
			.any(|e| matches!(e, ServerEvent::Notice(n) if n.content.contains("successfully banned"))),
		"admin gets a confirmation notice"
	);

	// identical channel-live state across both connections: exactly one left
	let lefts = got.iter().filter(|e| matches!(e, ServerEvent::Left(_))).count();
	assert_eq!(lefts, 1, "no double-remove for multi-device users");
	assert!(!bed.engine.channels.is_live(&chan("general"), &user("bob")).await);
}

#[tokio::test]
async fn banned_user_cannot_log_back_in() {
	let bed = testbed(false).await;
	add_user(&bed, "ada", "Ada Admin", true).await;
	add_user(&bed, "bob", "Bob Smith", false).await;

	let (ada_conn, _ada_rx) = login(&bed, "ada").await;
	send(&bed, ada_conn, json!({"cmd": "ban", "data": {"username": "bob"}})).await;

	let (conn, mut rx) = connect(&bed).await;
	send(&bed, conn, json!({"cmd": "authenticate", "data": {"username": "bob", "password": "pw"}})).await;
	let items = drain(&mut rx);
	assert!(matches!(events(&items).as_slice(), [ServerEvent::AuthFailure(_)]));
}

#[tokio::test]
async fn pm_channels_open_for_both_parties_and_self_delete() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	add_user(&bed, "bob", "Bob Smith", false).await;

	let (alice_conn, mut alice_rx) = login(&bed, "alice").await;
	let (bob_conn, mut bob_rx) = login(&bed, "bob").await;

	send(&bed, alice_conn, json!({"cmd": "pm", "data": {"username": "bob"}})).await;

	let alice_items = drain(&mut alice_rx);
	let got = events(&alice_items);
	let ServerEvent::ChannelUpdated(update) = got[0] else {
		panic!("expected channel_updated");
	};
	let pm_id = update.channel_id.clone();
	assert!(pm_id.is_pm());
	assert!(update.channel.as_ref().unwrap().pm);

	let bob_items = drain(&mut bob_rx);
	assert!(
		events(&bob_items)
			.iter()
			.any(|e| matches!(e, ServerEvent::ChannelUpdated(u) if u.channel_id == pm_id)),
		"the other party is told about the channel"
	);

	// self-PM is refused
	send(&bed, alice_conn, json!({"cmd": "pm", "data": {"username": "alice"}})).await;
	let items = drain(&mut alice_rx);
	assert!(matches!(events(&items).as_slice(), [ServerEvent::Error(_)]));

	send(&bed, alice_conn, json!({"cmd": "join", "data": {"channel_id": pm_id.as_str()}})).await;
	send(&bed, bob_conn, json!({"cmd": "join", "data": {"channel_id": pm_id.as_str()}})).await;
	send(&bed, alice_conn, json!({"cmd": "leave", "data": {"channel_id": pm_id.as_str()}})).await;
	assert!(bed.engine.channels.exists(&pm_id).await);

	send(&bed, bob_conn, json!({"cmd": "leave", "data": {"channel_id": pm_id.as_str()}})).await;
	assert!(!bed.engine.channels.exists(&pm_id).await, "empty PM channels evaporate");
}

#[tokio::test]
async fn kick_requires_privilege_and_notifies_target() {
	let bed = testbed(false).await;
	add_user(&bed, "ada", "Ada Admin", false).await;
	add_user(&bed, "bob", "Bob Smith", false).await;
	make_channel(&bed, "general", "ada", &[("ada", true)]).await;

	let (ada_conn, mut ada_rx) = login(&bed, "ada").await;
	let (bob_conn, mut bob_rx) = login(&bed, "bob").await;
	send(&bed, ada_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	send(&bed, bob_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut ada_rx);
	drain(&mut bob_rx);

	// bob is not a channel admin
	send(&bed, bob_conn, json!({"cmd": "kick", "data": {"channel_id": "general", "username": "ada"}})).await;
	let items = drain(&mut bob_rx);
	let got = events(&items);
	let ServerEvent::Error(err) = got[0] else {
		panic!("expected error");
	};
	assert_eq!(err.code, "access_denied");

	// ada is
	send(&bed, ada_conn, json!({"cmd": "kick", "data": {"channel_id": "general", "username": "bob"}})).await;

	let bob_items = drain(&mut bob_rx);
	let got = events(&bob_items);
	assert!(
		got.iter().any(|e| matches!(
			e,
			ServerEvent::Goodbye(g) if g.reason == LeaveReason::Kick && g.nice_reason.contains("was kicked by")
		)),
		"target gets a goodbye"
	);

	let ada_items = drain(&mut ada_rx);
	assert!(
		events(&ada_items)
			.iter()
			.any(|e| matches!(e, ServerEvent::Left(l) if l.reason == LeaveReason::Kick)),
		"remaining members see the kick"
	);
	assert!(!bed.engine.channels.is_live(&chan("general"), &user("bob")).await);
}

#[tokio::test]
async fn delete_channel_forces_members_out_first() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	make_channel(&bed, "doomed", "alice", &[]).await;

	let (conn, mut rx) = login(&bed, "alice").await;
	send(&bed, conn, json!({"cmd": "join", "data": {"channel_id": "doomed"}})).await;
	drain(&mut rx);

	bed.engine.delete_channel(&chan("doomed")).await.unwrap();

	let items = drain(&mut rx);
	let got = events(&items);
	assert!(
		got.iter()
			.any(|e| matches!(e, ServerEvent::Goodbye(g) if g.reason == LeaveReason::Delete)),
		"live members are forced out with reason delete"
	);
	assert!(
		got.iter()
			.any(|e| matches!(e, ServerEvent::ChannelUpdated(u) if u.deleted)),
		"deletion is announced"
	);
	assert!(!bed.engine.channels.exists(&chan("doomed")).await);
}

#[tokio::test]
async fn going_private_kicks_non_members() {
	let bed = testbed(false).await;
	add_user(&bed, "member", "Member One", false).await;
	add_user(&bed, "guest", "Guest Two", false).await;
	make_channel(&bed, "lounge", "member", &[("member", true)]).await;

	let (member_conn, mut member_rx) = login(&bed, "member").await;
	let (guest_conn, mut guest_rx) = login(&bed, "guest").await;
	send(&bed, member_conn, json!({"cmd": "join", "data": {"channel_id": "lounge"}})).await;
	send(&bed, guest_conn, json!({"cmd": "join", "data": {"channel_id": "lounge"}})).await;
	drain(&mut member_rx);
	drain(&mut guest_rx);

	bed.engine
		.update_channel(
			&chan("lounge"),
			crate::server::channels::ChannelPatch {
				private: Some(true),
				..Default::default()
			},
		)
		.await
		.unwrap();

	let guest_items = drain(&mut guest_rx);
	assert!(
		events(&guest_items)
			.iter()
			.any(|e| matches!(e, ServerEvent::Goodbye(g) if g.reason == LeaveReason::Private)),
		"non-members are forced out when the channel goes private"
	);
	assert!(bed.engine.channels.is_live(&chan("lounge"), &user("member")).await);
	assert!(!bed.engine.channels.is_live(&chan("lounge"), &user("guest")).await);
}

#[tokio::test]
async fn unknown_and_unauthenticated_commands_are_rejected() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;

	let (conn, mut rx) = connect(&bed).await;

	send(&bed, conn, json!({"cmd": "frobnicate", "data": {}})).await;
	let items = drain(&mut rx);
	let got = events(&items);
	let ServerEvent::Error(err) = got[0] else {
		panic!("expected error for unknown command");
	};
	assert_eq!(err.code, "validation");
	assert!(err.description.contains("unknown command"));

	send(
		&bed,
		conn,
		json!({"cmd": "say", "data": {"channel_id": "general", "type": "standard", "content": "hi"}}),
	)
	.await;
	let items = drain(&mut rx);
	let got = events(&items);
	let ServerEvent::Error(err) = got[0] else {
		panic!("expected error for unauthenticated command");
	};
	assert_eq!(err.code, "access_denied");
}

#[tokio::test]
async fn shutdown_refuses_mutating_commands() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (conn, mut rx) = login(&bed, "alice").await;
	send(&bed, conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut rx);

	bed.engine.begin_shutdown();

	send(
		&bed,
		conn,
		json!({"cmd": "say", "data": {"channel_id": "general", "type": "standard", "content": "hi"}}),
	)
	.await;
	let items = drain(&mut rx);
	let got = events(&items);
	let ServerEvent::Error(err) = got[0] else {
		panic!("expected refusal");
	};
	assert!(err.description.contains("shutting down"));

	// liveness bookkeeping still works while draining
	send(&bed, conn, json!({"cmd": "ping"})).await;
	let items = drain(&mut rx);
	assert!(matches!(events(&items).as_slice(), [ServerEvent::Pong(_)]));
}

#[tokio::test]
async fn quiet_screensaver_status_defers_to_fresher_devices() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;

	let (conn1, mut rx1) = login(&bed, "alice").await;
	let (conn2, mut rx2) = login(&bed, "alice").await;

	send(&bed, conn1, json!({"cmd": "hey", "data": {"last_event_time": 1000}})).await;
	send(&bed, conn2, json!({"cmd": "hey", "data": {"last_event_time": 2000}})).await;

	// stale device tries to go to screensaver quietly: rejected, and only
	// the requester hears about it so it can keep retrying
	send(&bed, conn1, json!({"cmd": "status", "data": {"status": "desktop_computer", "quiet": true}})).await;

	let items = drain(&mut rx1);
	let got = events(&items);
	assert!(matches!(got.as_slice(), [ServerEvent::UserUpdated(_)]));
	assert!(events(&drain(&mut rx2)).is_empty());
	assert_eq!(bed.engine.presence.profile(&user("alice")).await.unwrap().status, "");

	// the device with the freshest activity may apply it
	send(&bed, conn2, json!({"cmd": "status", "data": {"status": "desktop_computer", "quiet": true}})).await;
	assert_eq!(
		bed.engine.presence.profile(&user("alice")).await.unwrap().status,
		"desktop_computer"
	);
}

#[tokio::test]
async fn loud_status_change_posts_channel_notices() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (conn, mut rx) = login(&bed, "alice").await;
	send(&bed, conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut rx);

	send(&bed, conn, json!({"cmd": "status", "data": {"status": "red_circle", "hint": "heads down"}})).await;

	let items = drain(&mut rx);
	let notice = events(&items)
		.iter()
		.find_map(|e| match e {
			ServerEvent::Said(m) if m.kind == MessageKind::Notice => Some((*m).clone()),
			_ => None,
		})
		.expect("status notice in live channel");
	assert!(notice.content.contains(":red_circle:"));
	assert!(notice.content.contains("heads down"));
}

#[tokio::test]
async fn emoji_crud_requires_privilege_and_broadcasts() {
	let bed = testbed(false).await;
	add_user(&bed, "ada", "Ada Admin", true).await;
	add_user(&bed, "bob", "Bob Smith", false).await;

	let (ada_conn, mut ada_rx) = login(&bed, "ada").await;
	let (bob_conn, mut bob_rx) = login(&bed, "bob").await;

	send(
		&bed,
		bob_conn,
		json!({"cmd": "emoji", "data": {"api": "create", "id": "partycat", "title": "Party Cat", "url": "/emoji/partycat.gif"}}),
	)
	.await;
	let items = drain(&mut bob_rx);
	let got = events(&items);
	assert!(matches!(got.as_slice(), [ServerEvent::Error(e)] if e.code == "access_denied"));

	send(
		&bed,
		ada_conn,
		json!({"cmd": "emoji", "data": {"api": "create", "id": "PartyCat", "title": "Party Cat", "url": "/emoji/partycat.gif"}}),
	)
	.await;

	for rx in [&mut ada_rx, &mut bob_rx] {
		let items = drain(rx);
		assert!(
			events(&items)
				.iter()
				.any(|e| matches!(e, ServerEvent::EmojiUpdated(u) if u.id == "partycat" && !u.deleted)),
			"emoji updates reach every authenticated connection"
		);
	}
	assert!(bed.engine.emoji_snapshot().await.contains_key("partycat"));

	send(&bed, ada_conn, json!({"cmd": "emoji", "data": {"api": "delete", "id": "partycat"}})).await;
	let items = drain(&mut ada_rx);
	assert!(
		events(&items)
			.iter()
			.any(|e| matches!(e, ServerEvent::EmojiUpdated(u) if u.deleted))
	);
	assert!(!bed.engine.emoji_snapshot().await.contains_key("partycat"));
}

#[tokio::test]
async fn heartbeat_probes_live_connections_and_evicts_silent_ones() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;

	let (conn, mut rx) = login(&bed, "alice").await;

	// generous timeout: expect a probe, not an eviction
	heartbeat::sweep(&bed.engine, Duration::from_secs(300)).await;
	let items = drain(&mut rx);
	let echo_id = events(&items)
		.iter()
		.find_map(|e| match e {
			ServerEvent::Echo(echo) => Some(echo.id.clone()),
			_ => None,
		})
		.expect("liveness probe sent");

	// a matching reply records the round-trip time
	send(&bed, conn, json!({"cmd": "echoback", "data": {"id": echo_id}})).await;
	let snapshot = bed.engine.connections.snapshot_all().await;
	assert!(snapshot.iter().any(|c| c.id == conn && c.ping_ms >= 0));

	// zero timeout: everyone is overdue and gets closed
	heartbeat::sweep(&bed.engine, Duration::from_secs(0)).await;
	let items = drain(&mut rx);
	assert!(has_close(&items), "silent connections are force-closed");
}

#[tokio::test]
async fn logout_keeps_transport_but_detaches_user() {
	let bed = testbed(false).await;
	add_user(&bed, "alice", "Alice Jones", false).await;
	add_user(&bed, "bob", "Bob Smith", false).await;
	make_channel(&bed, "general", "alice", &[]).await;

	let (alice_conn, _alice_rx) = login(&bed, "alice").await;
	let (bob_conn, mut bob_rx) = login(&bed, "bob").await;
	send(&bed, alice_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	send(&bed, bob_conn, json!({"cmd": "join", "data": {"channel_id": "general"}})).await;
	drain(&mut bob_rx);

	send(&bed, alice_conn, json!({"cmd": "logout"})).await;

	assert!(!bed.engine.presence.is_online(&user("alice")).await);
	assert_eq!(bed.engine.connections.count().await, 2, "transport stays registered");
	assert!(!bed.engine.connections.is_authenticated(alice_conn).await);

	let items = drain(&mut bob_rx);
	assert!(
		events(&items)
			.iter()
			.any(|e| matches!(e, ServerEvent::Left(l) if l.reason == LeaveReason::Logout)),
	);
}
