#![forbid(unsafe_code)]

use std::sync::Arc;

use forum_domain::{NotificationKind, UserId};
use forum_protocol::{ChatFrame, Event, MessageRecord, OutgoingChatMessage, TypingIndicator};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::server::broadcast::{Broadcaster, Delivery};
use crate::server::notify::NotificationComposer;
use crate::server::store::{ForumStore, StoreError, StoredMessage};
use crate::util::time::client_timestamp_or_now;

#[derive(Debug, Error)]
pub enum ChatError {
	#[error("invalid message: {0}")]
	Invalid(String),

	#[error("failed to persist: {0}")]
	Persistence(#[source] StoreError),
}

impl ChatError {
	pub fn is_client_error(&self) -> bool {
		matches!(self, ChatError::Invalid(_))
	}
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
	pub max_message_chars: usize,
	pub history_default_limit: u32,
	pub history_max_limit: u32,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			max_message_chars: 5000,
			history_default_limit: 10,
			history_max_limit: 100,
		}
	}
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
	/// Message persisted and delivered where possible.
	Sent(MessageRecord),
	/// Typing indicator relayed (or not) to the recipient.
	Relayed(Delivery),
	Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
	/// Claimed sender is not the connection's user.
	SenderMismatch,
	Invalid,
	PersistFailed,
}

/// Routes inbound chat frames to persistence and targeted delivery.
#[derive(Clone)]
pub struct ChatService {
	store: Arc<dyn ForumStore>,
	broadcaster: Broadcaster,
	notifier: NotificationComposer,
	settings: ChatSettings,
}

impl ChatService {
	pub fn new(
		store: Arc<dyn ForumStore>,
		broadcaster: Broadcaster,
		notifier: NotificationComposer,
		settings: ChatSettings,
	) -> Self {
		Self {
			store,
			broadcaster,
			notifier,
			settings,
		}
	}

	pub fn settings(&self) -> &ChatSettings {
		&self.settings
	}

	/// Handle one decoded frame from `conn_user`'s connection.
	pub async fn handle_frame(&self, conn_user: &UserId, frame: ChatFrame) -> FrameOutcome {
		if frame.sender() != conn_user.as_str() {
			warn!(
				user_id = %conn_user,
				claimed = frame.sender(),
				kind = frame.kind(),
				"dropping frame with foreign sender"
			);
			return FrameOutcome::Dropped(DropReason::SenderMismatch);
		}

		match frame {
			ChatFrame::Message(msg) => match self.send_message(conn_user, &msg).await {
				Ok(record) => FrameOutcome::Sent(record),
				Err(ChatError::Invalid(reason)) => {
					debug!(user_id = %conn_user, %reason, "dropping invalid message frame");
					FrameOutcome::Dropped(DropReason::Invalid)
				}
				Err(ChatError::Persistence(_)) => FrameOutcome::Dropped(DropReason::PersistFailed),
			},
			ChatFrame::Typing(t) => self.relay_typing(conn_user, t, true).await,
			ChatFrame::StopTyping(t) => self.relay_typing(conn_user, t, false).await,
		}
	}

	async fn relay_typing(&self, sender: &UserId, t: TypingIndicator, typing: bool) -> FrameOutcome {
		let Ok(recipient) = UserId::new(t.recipient) else {
			return FrameOutcome::Dropped(DropReason::Invalid);
		};

		let event = if typing {
			Event::Typing {
				sender: sender.clone(),
				recipient: recipient.clone(),
			}
		} else {
			Event::StopTyping {
				sender: sender.clone(),
				recipient: recipient.clone(),
			}
		};
		FrameOutcome::Relayed(self.broadcaster.unicast(&recipient, &event).await)
	}

	/// Persist a message from `sender` and deliver it.
	///
	/// Nothing is pushed unless the row was written. Shared by the socket and
	/// the HTTP send endpoint.
	pub async fn send_message(&self, sender: &UserId, msg: &OutgoingChatMessage) -> Result<MessageRecord, ChatError> {
		let recipient = UserId::new(msg.recipient.as_str()).map_err(|e| ChatError::Invalid(format!("recipient: {e}")))?;
		// Whitespace only decides emptiness and length; the body is stored as sent.
		let trimmed = msg.content.trim();
		if trimmed.is_empty() {
			return Err(ChatError::Invalid("content is empty".to_string()));
		}
		let chars = trimmed.chars().count();
		if chars > self.settings.max_message_chars {
			return Err(ChatError::Invalid(format!(
				"content too long: {chars} > {} characters",
				self.settings.max_message_chars
			)));
		}

		let sent_at = client_timestamp_or_now(msg.timestamp.as_deref());
		let id = self
			.store
			.save_message(sender, &recipient, &msg.content, sent_at)
			.await
			.map_err(|e| {
				error!(sender = %sender, recipient = %recipient, error = %e, "failed to persist message");
				ChatError::Persistence(e)
			})?;
		metrics::counter!("forum_server_messages_persisted_total").increment(1);

		let record = MessageRecord::from(StoredMessage {
			id,
			sender: sender.clone(),
			recipient: recipient.clone(),
			content: msg.content.clone(),
			sent_at,
			read: false,
		});
		let event = Event::NewMessage { message: record.clone() };

		let echo = self.broadcaster.unicast(sender, &event).await;
		let forward = if recipient != *sender {
			self.broadcaster.unicast(&recipient, &event).await
		} else {
			echo
		};
		debug!(message_id = %id, sender = %sender, recipient = %recipient, ?echo, ?forward, "message delivered");

		self.broadcaster.broadcast_with_refresh(Event::RefreshUsers {
			sender_id: sender.clone(),
			receiver_id: recipient.clone(),
		});

		if recipient != *sender {
			if let Err(e) = self.notifier.notify(&recipient, sender, NotificationKind::Message, None).await {
				// Already logged by the composer; the message itself stands.
				debug!(message_id = %id, recipient = %recipient, error = %e, "message sent without notification");
			}
		}

		Ok(record)
	}

	/// `reader` has read everything `sender` sent them.
	pub async fn mark_read(&self, sender: &UserId, reader: &UserId) -> Result<u64, ChatError> {
		let changed = self
			.store
			.mark_messages_read(sender, reader)
			.await
			.map_err(ChatError::Persistence)?;

		if changed > 0 {
			let receipt = Event::MessageRead {
				sender_id: sender.clone(),
				receiver_id: reader.clone(),
			};
			self.broadcaster.unicast(sender, &receipt).await;
			self.broadcaster.refresh_users_list();
		}

		Ok(changed)
	}

	/// One page of the conversation between `a` and `b`, oldest first.
	pub async fn history(
		&self,
		a: &UserId,
		b: &UserId,
		page: Option<u32>,
		limit: Option<u32>,
	) -> Result<Vec<MessageRecord>, ChatError> {
		let page = page.unwrap_or(1).max(1);
		let limit = limit
			.unwrap_or(self.settings.history_default_limit)
			.clamp(1, self.settings.history_max_limit.max(1));

		let messages = self
			.store
			.fetch_chat_history(a, b, page, limit)
			.await
			.map_err(ChatError::Persistence)?;
		Ok(messages.into_iter().map(MessageRecord::from).collect())
	}
}
