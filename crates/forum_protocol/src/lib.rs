#![forbid(unsafe_code)]

pub mod events;
pub mod framing;

pub use events::{ChatFrame, Event, MessageRecord, NewUserInfo, NotificationPayload, OutgoingChatMessage, TypingIndicator, UserListEntry};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_OUTBOUND_FRAME_SIZE, FramingError, decode_chat_frame, encode_event,
	encode_event_default,
};
