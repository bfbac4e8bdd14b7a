#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted length of a user identifier, in bytes.
pub const MAX_USER_ID_LEN: usize = 128;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("value too long: len={len} max={max}")]
	TooLong { len: usize, max: usize },
	#[error("unknown notification kind: {0}")]
	UnknownKind(String),
}

/// Authenticated user identity. This is the connection registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`. Surrounding whitespace is stripped.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let trimmed = id.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() > MAX_USER_ID_LEN {
			return Err(ParseIdError::TooLong {
				len: trimmed.len(),
				max: MAX_USER_ID_LEN,
			});
		}
		if trimmed.len() == id.len() {
			Ok(Self(id))
		} else {
			Ok(Self(trimmed.to_string()))
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Store-assigned chat message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Store-assigned notification identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct NotificationId(pub i64);

impl fmt::Display for NotificationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Process-local identity of one live connection.
///
/// Two connections for the same user always get different ids, which is what
/// lets a late deregister tell its own entry apart from a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "conn-{}", self.0)
	}
}

/// What triggered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum NotificationKind {
	Message,
	Like,
	Dislike,
	Comment,
}

impl NotificationKind {
	/// Stable string identifier, also the persisted `type` column.
	pub const fn as_str(self) -> &'static str {
		match self {
			NotificationKind::Message => "message",
			NotificationKind::Like => "like",
			NotificationKind::Dislike => "dislike",
			NotificationKind::Comment => "comment",
		}
	}

	/// Whether this kind refers to a post.
	pub const fn is_post_related(self) -> bool {
		!matches!(self, NotificationKind::Message)
	}
}

impl fmt::Display for NotificationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NotificationKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"message" => Ok(NotificationKind::Message),
			"like" => Ok(NotificationKind::Like),
			"dislike" => Ok(NotificationKind::Dislike),
			"comment" => Ok(NotificationKind::Comment),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_id_trims_and_rejects_empty() {
		assert_eq!(UserId::new("  alice ").unwrap().as_str(), "alice");
		assert_eq!(UserId::new("bob").unwrap().to_string(), "bob");
		assert_eq!(UserId::new("   "), Err(ParseIdError::Empty));
		assert!("".parse::<UserId>().is_err());
	}

	#[test]
	fn user_id_rejects_oversized_values() {
		let long = "x".repeat(MAX_USER_ID_LEN + 1);
		assert!(matches!(UserId::new(long), Err(ParseIdError::TooLong { .. })));
	}

	#[test]
	fn notification_kind_parse_and_display() {
		assert_eq!("message".parse::<NotificationKind>().unwrap(), NotificationKind::Message);
		assert_eq!("Comment".parse::<NotificationKind>().unwrap(), NotificationKind::Comment);
		assert_eq!(NotificationKind::Like.to_string(), "like");
		assert!(NotificationKind::Dislike.is_post_related());
		assert!(!NotificationKind::Message.is_post_related());
		assert!("poke".parse::<NotificationKind>().is_err());
	}

	#[test]
	fn connection_ids_display_with_prefix() {
		assert_eq!(ConnectionId(7).to_string(), "conn-7");
	}
}
