#![forbid(unsafe_code)]

use forum_domain::UserId;
use forum_protocol::{
	ChatFrame, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_OUTBOUND_FRAME_SIZE, Event, FramingError, UserListEntry, decode_chat_frame, encode_event,
	encode_event_default,
};
use proptest::prelude::*;

fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

fn users_list() -> Event {
	Event::UsersListSnapshot {
		users: vec![
			UserListEntry {
				id: uid("u-1"),
				nickname: "alice".to_string(),
				is_online: true,
				profile_pic: String::new(),
			},
			UserListEntry {
				id: uid("u-2"),
				nickname: "bob".to_string(),
				is_online: false,
				profile_pic: "/static/bob.png".to_string(),
			},
		],
	}
}

#[test]
fn users_list_encoding_is_stable() {
	let a = encode_event_default(&users_list()).expect("encode");
	let b = encode_event_default(&users_list()).expect("encode");
	assert_eq!(a, b);
	assert!(a.starts_with(r#"{"type":"users_list","users":[{"ID":"u-1","UserName":"alice","isOnline":true"#));
}

#[test]
fn encoded_events_decode_back_as_events() {
	let ev = Event::RefreshUsers {
		sender_id: uid("a"),
		receiver_id: uid("b"),
	};
	let text = encode_event_default(&ev).expect("encode");
	let back: Event = serde_json::from_str(&text).expect("decode");
	assert_eq!(back, ev);
	assert_eq!(back.kind(), "refresh_users");
}

#[test]
fn decode_enforces_size_limit_before_parsing() {
	let text = format!(r#"{{"type":"typing","sender":"{}","recipient":"b"}}"#, "a".repeat(64));
	let err = decode_chat_frame(&text, 16).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => {
			assert_eq!(max, 16);
			assert!(len > max);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn default_encode_fits_users_lists_beyond_the_inbound_limit() {
	let users = (0..2000)
		.map(|i| UserListEntry {
			id: uid(&format!("user-{i:05}")),
			nickname: format!("member number {i} of a busy forum"),
			is_online: i % 3 == 0,
			profile_pic: format!("/static/avatars/{i}.png"),
		})
		.collect();
	let text = encode_event_default(&Event::UsersListSnapshot { users }).expect("encode");
	assert!(text.len() > DEFAULT_MAX_FRAME_SIZE);
	assert!(text.len() <= DEFAULT_MAX_OUTBOUND_FRAME_SIZE);
}

#[test]
fn encode_limit_applies_to_whole_frame() {
	let err = encode_event(&users_list(), 32).unwrap_err();
	assert!(matches!(err, FramingError::FrameTooLarge { .. }));
}

proptest! {
	#[test]
	fn arbitrary_input_never_panics(s in ".{0,256}") {
		let _ = decode_chat_frame(&s, DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	fn unknown_tags_are_reported_as_unknown(tag in "[a-z_]{1,16}") {
		prop_assume!(!matches!(tag.as_str(), "message" | "typing" | "stop_typing"));
		let text = serde_json::json!({ "type": tag, "sender": "a", "recipient": "b" }).to_string();
		let err = decode_chat_frame(&text, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		prop_assert!(err.is_unknown_type());
	}

	#[test]
	fn typing_frames_keep_participants(sender in "[a-z0-9]{1,24}", recipient in "[a-z0-9]{1,24}") {
		let text = serde_json::json!({ "type": "stop_typing", "sender": sender, "recipient": recipient }).to_string();
		match decode_chat_frame(&text, DEFAULT_MAX_FRAME_SIZE) {
			Ok(ChatFrame::StopTyping(t)) => {
				prop_assert_eq!(t.sender, sender);
				prop_assert_eq!(t.recipient, recipient);
			}
			other => prop_assert!(false, "unexpected decode result: {:?}", other),
		}
	}
}
