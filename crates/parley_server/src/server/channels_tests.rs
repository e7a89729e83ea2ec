#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use parley_domain::{
	ChannelId, ChannelInfo, ChatMessage, MemberRole, MessageId, MessageKind, ReactionMap, Username,
};

use crate::server::channels::{ChannelError, ChannelPatch, ChannelRegistry};

fn user(s: &str) -> Username {
	Username::normalize(s).unwrap()
}

fn chan(s: &str) -> ChannelId {
	ChannelId::normalize(s).unwrap()
}

fn info(id: &str, private: bool) -> ChannelInfo {
	ChannelInfo {
		id: chan(id),
		title: id.to_string(),
		topic: String::new(),
		private,
		pm: false,
		founder: user("founder"),
		users: BTreeMap::new(),
		created: 0,
		modified: 0,
	}
}

fn message(id: &str, channel: &str, content: &str) -> ChatMessage {
	ChatMessage {
		id: MessageId::new(id).unwrap(),
		channel_id: chan(channel),
		kind: MessageKind::Standard,
		username: Some(user("alice")),
		content: content.to_string(),
		date: 0,
		seq_id: None,
		label: None,
		to: None,
		reactions: ReactionMap::default(),
		tags: None,
	}
}

#[tokio::test]
async fn create_rejects_duplicates_and_reserved_ids() {
	let registry = ChannelRegistry::new(100);

	registry.create(info("general", false)).await.unwrap();
	assert!(matches!(
		registry.create(info("general", false)).await,
		Err(ChannelError::AlreadyExists(_))
	));

	assert!(matches!(
		registry.create(info("pm_deadbeef", false)).await,
		Err(ChannelError::ReservedId(_))
	));
}

#[tokio::test]
async fn private_join_requires_membership_or_global_admin() {
	let registry = ChannelRegistry::new(100);
	let mut secret = info("secret", true);
	secret.users.insert(user("member"), MemberRole { admin: false });
	registry.create(secret).await.unwrap();

	assert!(matches!(
		registry.join(&user("outsider"), false, &chan("secret")).await,
		Err(ChannelError::AccessDenied(_))
	));

	assert!(registry.join(&user("member"), false, &chan("secret")).await.is_ok());
	assert!(registry.join(&user("rootadmin"), true, &chan("secret")).await.is_ok());

	// invariant: live members of a private channel are members or admins
	let live = registry.live_members(&chan("secret")).await;
	assert!(!live.contains(&user("outsider")));
}

#[tokio::test]
async fn join_is_idempotent_across_devices() {
	let registry = ChannelRegistry::new(100);
	registry.create(info("general", false)).await.unwrap();

	let first = registry.join(&user("alice"), false, &chan("general")).await.unwrap();
	assert!(first.first_join);

	let second = registry.join(&user("alice"), false, &chan("general")).await.unwrap();
	assert!(!second.first_join);
	assert_eq!(registry.live_members(&chan("general")).await.len(), 1);
}

#[tokio::test]
async fn join_on_missing_channel_fails() {
	let registry = ChannelRegistry::new(100);
	assert!(matches!(
		registry.join(&user("alice"), false, &chan("nope")).await,
		Err(ChannelError::NotFound(_))
	));
}

#[tokio::test]
async fn history_is_bounded_fifo() {
	let registry = ChannelRegistry::new(3);
	registry.create(info("general", false)).await.unwrap();

	for n in 0..5 {
		registry
			.commit_message(&chan("general"), message(&format!("m{n}"), "general", &format!("msg {n}")))
			.await
			.unwrap();
	}

	let history = registry.history(&chan("general")).await;
	assert_eq!(history.len(), 3);
	assert_eq!(history[0].content, "msg 2");
	assert_eq!(history[2].content, "msg 4");
}

#[tokio::test]
async fn commit_message_snapshots_live_membership() {
	let registry = ChannelRegistry::new(10);
	registry.create(info("general", false)).await.unwrap();
	registry.join(&user("alice"), false, &chan("general")).await.unwrap();
	registry.join(&user("bob"), false, &chan("general")).await.unwrap();

	let members = registry
		.commit_message(&chan("general"), message("m1", "general", "hi"))
		.await
		.unwrap();
	assert_eq!(members.len(), 2);
}

#[tokio::test]
async fn pm_channels_are_deterministic_and_self_deleting() {
	let registry = ChannelRegistry::new(10);
	let alice = user("alice");
	let bob = user("bob");

	let (first, created) = registry.get_or_create_pm(&alice, &bob, 1000).await;
	assert!(created);
	assert!(first.pm);
	assert!(first.private);
	assert!(first.users.get(&alice).unwrap().admin);
	assert!(first.users.get(&bob).unwrap().admin);

	// idempotent regardless of who initiates
	let (second, created) = registry.get_or_create_pm(&bob, &alice, 2000).await;
	assert!(!created);
	assert_eq!(first.id, second.id);

	registry.join(&alice, false, &first.id).await.unwrap();
	registry.join(&bob, false, &first.id).await.unwrap();

	let out = registry.leave(&alice, &first.id).await.unwrap();
	assert!(out.removed);
	assert!(!out.pm_deleted);

	let out = registry.leave(&bob, &first.id).await.unwrap();
	assert!(out.pm_deleted);
	assert!(!registry.exists(&first.id).await);
}

#[tokio::test]
async fn leave_of_non_live_user_reports_nothing_removed() {
	let registry = ChannelRegistry::new(10);
	registry.create(info("general", false)).await.unwrap();

	let out = registry.leave(&user("ghost"), &chan("general")).await.unwrap();
	assert!(!out.removed);
	assert!(registry.exists(&chan("general")).await);
}

#[tokio::test]
async fn going_private_reports_evicted_live_users() {
	let registry = ChannelRegistry::new(10);
	let mut open = info("lounge", false);
	open.users.insert(user("member"), MemberRole { admin: false });
	registry.create(open).await.unwrap();

	registry.join(&user("member"), false, &chan("lounge")).await.unwrap();
	registry.join(&user("guest"), false, &chan("lounge")).await.unwrap();

	let (updated, evicted) = registry
		.update(
			&chan("lounge"),
			ChannelPatch {
				private: Some(true),
				..ChannelPatch::default()
			},
			5000,
		)
		.await
		.unwrap();

	assert!(updated.private);
	assert_eq!(evicted, vec![user("guest")]);
}

#[tokio::test]
async fn patch_history_updates_cached_message() {
	let registry = ChannelRegistry::new(10);
	registry.create(info("general", false)).await.unwrap();
	registry
		.commit_message(&chan("general"), message("m1", "general", "hi"))
		.await
		.unwrap();

	let patched = registry
		.patch_history(&chan("general"), &MessageId::new("m1").unwrap(), |m| {
			m.tags = Some("starred".to_string());
		})
		.await;
	assert!(patched);
	assert_eq!(registry.history(&chan("general")).await[0].tags.as_deref(), Some("starred"));

	let missing = registry
		.patch_history(&chan("general"), &MessageId::new("m404").unwrap(), |_| {})
		.await;
	assert!(!missing);
}

#[tokio::test]
async fn visibility_filters_pm_and_private_channels() {
	let registry = ChannelRegistry::new(10);
	registry.create(info("public", false)).await.unwrap();

	let mut secret = info("secret", true);
	secret.users.insert(user("member"), MemberRole { admin: false });
	registry.create(secret).await.unwrap();

	registry.get_or_create_pm(&user("member"), &user("alice"), 0).await;

	let mut outsider = parley_domain::UserRecord {
		username: user("outsider"),
		full_name: "Outsider".to_string(),
		nickname: "outsider".to_string(),
		status: String::new(),
		status_hint: String::new(),
		active: true,
		privileges: parley_domain::Privileges::default(),
		created: 0,
		modified: 0,
	};

	let visible = registry.visible_for(&outsider).await;
	assert_eq!(visible.len(), 1);
	assert!(visible.contains_key(&chan("public")));

	outsider.privileges.admin = true;
	let visible = registry.visible_for(&outsider).await;
	// global admins see private channels, but never other people's PMs
	assert_eq!(visible.len(), 2);
}
