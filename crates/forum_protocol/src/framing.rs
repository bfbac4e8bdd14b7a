#![forbid(unsafe_code)]

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::events::{ChatFrame, Event, OutgoingChatMessage, TypingIndicator};

/// Default maximum inbound frame size, in bytes.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

/// Default maximum outbound frame size, in bytes. Server events such as
/// `users_list` grow with the user base, so this sits at the websocket
/// layer's own frame limit rather than the inbound one.
pub const DEFAULT_MAX_OUTBOUND_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("frame has no string `type` field")]
	MissingType,

	#[error("unknown frame type: {0}")]
	UnknownType(String),

	#[error("json decode error: {0}")]
	Decode(#[source] serde_json::Error),

	#[error("json encode error: {0}")]
	Encode(#[source] serde_json::Error),
}

impl FramingError {
	/// Whether the frame was well-formed JSON with a tag this server does not handle.
	pub fn is_unknown_type(&self) -> bool {
		matches!(self, FramingError::UnknownType(_))
	}
}

/// Encode an event into one text frame.
pub fn encode_event(event: &Event, max_frame_size: usize) -> Result<String, FramingError> {
	let text = serde_json::to_string(event).map_err(FramingError::Encode)?;
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}
	Ok(text)
}

/// Encode a frame using `DEFAULT_MAX_OUTBOUND_FRAME_SIZE`.
pub fn encode_event_default(event: &Event) -> Result<String, FramingError> {
	encode_event(event, DEFAULT_MAX_OUTBOUND_FRAME_SIZE)
}

#[derive(Deserialize)]
struct MessageEnvelope {
	message: OutgoingChatMessage,
}

/// Classify and decode one inbound text frame.
pub fn decode_chat_frame(text: &str, max_frame_size: usize) -> Result<ChatFrame, FramingError> {
	if text.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: text.len(),
			max: max_frame_size,
		});
	}

	let value: Value = serde_json::from_str(text).map_err(FramingError::Decode)?;
	let kind = value
		.get("type")
		.and_then(Value::as_str)
		.ok_or(FramingError::MissingType)?
		.to_string();

	match kind.as_str() {
		"message" => {
			let env: MessageEnvelope = serde_json::from_value(value).map_err(FramingError::Decode)?;
			Ok(ChatFrame::Message(env.message))
		}
		"typing" => {
			let t: TypingIndicator = serde_json::from_value(value).map_err(FramingError::Decode)?;
			Ok(ChatFrame::Typing(t))
		}
		"stop_typing" => {
			let t: TypingIndicator = serde_json::from_value(value).map_err(FramingError::Decode)?;
			Ok(ChatFrame::StopTyping(t))
		}
		_ => Err(FramingError::UnknownType(kind)),
	}
}

#[cfg(test)]
mod tests {
	use forum_domain::{MessageId, UserId};

	use super::*;
	use crate::events::MessageRecord;

	fn uid(s: &str) -> UserId {
		UserId::new(s).expect("valid user id")
	}

	#[test]
	fn presence_event_matches_wire_shape() {
		let ev = Event::PresenceChanged {
			user_id: uid("alice"),
			is_online: true,
		};
		assert_eq!(
			encode_event_default(&ev).unwrap(),
			r#"{"type":"user_status","user_id":"alice","is_online":true}"#
		);
	}

	#[test]
	fn message_read_uses_camel_case_ids() {
		let ev = Event::MessageRead {
			sender_id: uid("a"),
			receiver_id: uid("b"),
		};
		assert_eq!(
			encode_event_default(&ev).unwrap(),
			r#"{"type":"message_read","senderID":"a","receiverID":"b"}"#
		);
	}

	#[test]
	fn new_message_nests_record() {
		let ev = Event::NewMessage {
			message: MessageRecord {
				id: MessageId(3),
				sender: uid("a"),
				recipient: uid("b"),
				content: "hi".to_string(),
				timestamp: "2024-05-01T10:00:00+00:00".to_string(),
				read: false,
			},
		};
		assert_eq!(
			encode_event_default(&ev).unwrap(),
			r#"{"type":"message","message":{"id":3,"sender":"a","recipient":"b","content":"hi","timestamp":"2024-05-01T10:00:00+00:00","read":false}}"#
		);
	}

	#[test]
	fn encode_rejects_oversized_frames() {
		let ev = Event::Typing {
			sender: uid("a"),
			recipient: uid("b"),
		};
		let err = encode_event(&ev, 8).unwrap_err();
		assert!(matches!(err, FramingError::FrameTooLarge { max: 8, .. }));
	}

	#[test]
	fn decodes_message_frame() {
		let frame = decode_chat_frame(
			r#"{"type":"message","message":{"sender":"a","recipient":"b","content":"hi","timestamp":"2024-05-01T10:00:00Z"}}"#,
			DEFAULT_MAX_FRAME_SIZE,
		)
		.unwrap();
		match frame {
			ChatFrame::Message(m) => {
				assert_eq!(m.sender, "a");
				assert_eq!(m.recipient, "b");
				assert_eq!(m.content, "hi");
				assert_eq!(m.timestamp.as_deref(), Some("2024-05-01T10:00:00Z"));
			}
			other => panic!("expected message frame, got {other:?}"),
		}
	}

	#[test]
	fn decodes_typing_frames() {
		let t = decode_chat_frame(r#"{"type":"typing","sender":"a","recipient":"b"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap();
		assert_eq!(t.kind(), "typing");
		assert_eq!(t.sender(), "a");

		let s = decode_chat_frame(r#"{"type":"stop_typing","sender":"a","recipient":"b"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap();
		assert_eq!(s.kind(), "stop_typing");
	}

	#[test]
	fn unknown_and_untyped_frames_are_classified() {
		let err = decode_chat_frame(r#"{"type":"wave","sender":"a"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(err.is_unknown_type());

		let err = decode_chat_frame(r#"{"sender":"a"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::MissingType));

		let err = decode_chat_frame("not json", DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::Decode(_)));
	}

	#[test]
	fn message_frame_without_body_is_malformed() {
		let err = decode_chat_frame(r#"{"type":"message"}"#, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::Decode(_)));
	}
}
