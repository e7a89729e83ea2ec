#![forbid(unsafe_code)]

use parley_domain::{ChannelId, LeaveReason, MessageKind, ReactionAction, Username};
use parley_protocol::{AuthForm, ClientCommand, DecodeError, ErrorPayload, LeftPayload, ServerEvent};

#[test]
fn decodes_say_command() {
	let frame = r#"{"cmd":"say","data":{"channel_id":"General","type":"standard","content":"hi there"}}"#;
	let cmd = ClientCommand::decode(frame).expect("decode say");

	match cmd {
		ClientCommand::Say(say) => {
			assert_eq!(say.channel_id, "General");
			assert_eq!(say.kind, MessageKind::Standard);
			assert_eq!(say.content, "hi there");
			assert!(say.to.is_none());
		}
		other => panic!("expected Say, got: {other:?}"),
	}
}

#[test]
fn decodes_whisper_recipient() {
	let frame = r#"{"cmd":"say","data":{"channel_id":"general","type":"whisper","content":"psst","to":"bob"}}"#;
	match ClientCommand::decode(frame).expect("decode whisper") {
		ClientCommand::Say(say) => {
			assert_eq!(say.kind, MessageKind::Whisper);
			assert_eq!(say.to.as_deref(), Some("bob"));
		}
		other => panic!("expected Say, got: {other:?}"),
	}
}

#[test]
fn rejects_unknown_command() {
	let frame = r#"{"cmd":"selfdestruct","data":{}}"#;
	match ClientCommand::decode(frame) {
		Err(DecodeError::UnknownCommand(name)) => assert_eq!(name, "selfdestruct"),
		other => panic!("expected UnknownCommand, got: {other:?}"),
	}
}

#[test]
fn rejects_bad_payload() {
	let frame = r#"{"cmd":"join","data":{"channel":"general"}}"#;
	assert!(matches!(
		ClientCommand::decode(frame),
		Err(DecodeError::InvalidPayload { cmd: "join", .. })
	));
}

#[test]
fn ping_and_logout_need_no_data() {
	assert!(matches!(ClientCommand::decode(r#"{"cmd":"ping"}"#), Ok(ClientCommand::Ping)));
	assert!(matches!(
		ClientCommand::decode(r#"{"cmd":"logout","data":{}}"#),
		Ok(ClientCommand::Logout)
	));
}

#[test]
fn auth_form_precedence() {
	let frame = r#"{"cmd":"authenticate","data":{"username":"alice","password":"hunter2"}}"#;
	let ClientCommand::Authenticate(auth) = ClientCommand::decode(frame).unwrap() else {
		panic!("expected Authenticate");
	};
	assert!(matches!(auth.form(), Some(AuthForm::Credentials { .. })));

	let frame = r#"{"cmd":"authenticate","data":{"session_id":"v1.abc.def"}}"#;
	let ClientCommand::Authenticate(auth) = ClientCommand::decode(frame).unwrap() else {
		panic!("expected Authenticate");
	};
	assert!(matches!(auth.form(), Some(AuthForm::Session { .. })));

	let frame = r#"{"cmd":"authenticate","data":{}}"#;
	let ClientCommand::Authenticate(auth) = ClientCommand::decode(frame).unwrap() else {
		panic!("expected Authenticate");
	};
	assert!(auth.form().is_none());
}

#[test]
fn react_action_decodes() {
	let frame = r#"{"cmd":"react","data":{"channel_id":"general","chat_id":"s01","emoji_id":"+1","action":"add"}}"#;
	match ClientCommand::decode(frame).unwrap() {
		ClientCommand::React(react) => {
			assert_eq!(react.emoji_id, "+1");
			assert_eq!(react.action, ReactionAction::Add);
			assert!(react.seq_id.is_none());
		}
		other => panic!("expected React, got: {other:?}"),
	}
}

#[test]
fn unauthenticated_allowlist() {
	let auth = ClientCommand::decode(r#"{"cmd":"authenticate","data":{}}"#).unwrap();
	assert!(auth.allowed_unauthenticated());

	let say = ClientCommand::decode(r#"{"cmd":"say","data":{"channel_id":"g","type":"standard"}}"#).unwrap();
	assert!(!say.allowed_unauthenticated());
}

#[test]
fn event_envelope_shape() {
	let event = ServerEvent::Left(LeftPayload {
		channel_id: ChannelId::normalize("general").unwrap(),
		username: Username::normalize("alice").unwrap(),
		reason: LeaveReason::Disconnect,
		nice_reason: LeaveReason::Disconnect.notice_text(None),
	});

	let json: serde_json::Value = serde_json::from_str(&event.encode()).unwrap();
	assert_eq!(json["cmd"], "left");
	assert_eq!(json["data"]["channel_id"], "general");
	assert_eq!(json["data"]["reason"], "disconnect");
	assert_eq!(json["data"]["nice_reason"], "has disconnected from the server.");
	assert_eq!(event.name(), "left");
}

#[test]
fn error_event_shape() {
	let event = ServerEvent::Error(ErrorPayload {
		code: "channel".to_string(),
		description: "Channel not found.".to_string(),
	});
	let json: serde_json::Value = serde_json::from_str(&event.encode()).unwrap();
	assert_eq!(json["cmd"], "error");
	assert_eq!(json["data"]["code"], "channel");
}
