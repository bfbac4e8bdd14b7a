#![forbid(unsafe_code)]

use forum_domain::{MessageId, NotificationId, NotificationKind, UserId};
use serde::{Deserialize, Serialize};

/// Server-to-client events. One JSON object per frame, discriminated by `type`.
///
/// Variants carry only what the client renders; never a connection handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
	/// A user went online or offline.
	#[serde(rename = "user_status")]
	PresenceChanged { user_id: UserId, is_online: bool },

	/// A user account was created.
	NewUser { user: NewUserInfo },

	/// A message was exchanged between two users; clients re-sort their user lists.
	RefreshUsers { sender_id: UserId, receiver_id: UserId },

	/// A notification was persisted for `receiver_id`.
	NewNotification {
		notification: NotificationPayload,
		unread_count: i64,
		receiver_id: UserId,
	},

	/// Full users list, sent after every state-changing event so clients can reconcile.
	#[serde(rename = "users_list")]
	UsersListSnapshot { users: Vec<UserListEntry> },

	/// Canonical, persisted chat message.
	#[serde(rename = "message")]
	NewMessage { message: MessageRecord },

	Typing { sender: UserId, recipient: UserId },

	StopTyping { sender: UserId, recipient: UserId },

	/// `receiver_id` has read the messages `sender_id` sent them.
	MessageRead {
		#[serde(rename = "senderID")]
		sender_id: UserId,
		#[serde(rename = "receiverID")]
		receiver_id: UserId,
	},
}

impl Event {
	/// Wire tag, also used as a log/metric label.
	pub const fn kind(&self) -> &'static str {
		match self {
			Event::PresenceChanged { .. } => "user_status",
			Event::NewUser { .. } => "new_user",
			Event::RefreshUsers { .. } => "refresh_users",
			Event::NewNotification { .. } => "new_notification",
			Event::UsersListSnapshot { .. } => "users_list",
			Event::NewMessage { .. } => "message",
			Event::Typing { .. } => "typing",
			Event::StopTyping { .. } => "stop_typing",
			Event::MessageRead { .. } => "message_read",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUserInfo {
	pub id: UserId,
	pub nickname: String,
	pub is_online: bool,
}

/// One row of the `users_list` snapshot. Keys follow what the SPA reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserListEntry {
	#[serde(rename = "ID")]
	pub id: UserId,
	#[serde(rename = "UserName")]
	pub nickname: String,
	#[serde(rename = "isOnline")]
	pub is_online: bool,
	#[serde(rename = "ProfilePic")]
	pub profile_pic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
	pub id: MessageId,
	pub sender: UserId,
	pub recipient: UserId,
	pub content: String,
	/// RFC3339.
	pub timestamp: String,
	pub read: bool,
}

/// Notification as rendered by the client (actor profile already resolved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
	pub id: NotificationId,
	#[serde(rename = "type")]
	pub kind: NotificationKind,
	#[serde(rename = "actorID")]
	pub actor_id: UserId,
	#[serde(rename = "actorName")]
	pub actor_name: String,
	#[serde(rename = "actorProfilePic")]
	pub actor_profile_pic: String,
	#[serde(rename = "postID", default, skip_serializing_if = "Option::is_none")]
	pub post_id: Option<i64>,
	#[serde(rename = "isRead")]
	pub is_read: bool,
	#[serde(rename = "createdAt")]
	pub created_at: String,
}

/// Client-to-server frames on the chat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatFrame {
	Message(OutgoingChatMessage),
	Typing(TypingIndicator),
	StopTyping(TypingIndicator),
}

impl ChatFrame {
	pub const fn kind(&self) -> &'static str {
		match self {
			ChatFrame::Message(_) => "message",
			ChatFrame::Typing(_) => "typing",
			ChatFrame::StopTyping(_) => "stop_typing",
		}
	}

	/// Claimed sender, as written by the client.
	pub fn sender(&self) -> &str {
		match self {
			ChatFrame::Message(m) => &m.sender,
			ChatFrame::Typing(t) | ChatFrame::StopTyping(t) => &t.sender,
		}
	}
}

/// Body of an inbound `message` frame. Fields are raw; validation happens on delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingChatMessage {
	#[serde(default)]
	pub sender: String,
	#[serde(default)]
	pub recipient: String,
	#[serde(default)]
	pub content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingIndicator {
	#[serde(default)]
	pub sender: String,
	#[serde(default)]
	pub recipient: String,
}
