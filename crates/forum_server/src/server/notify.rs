#![forbid(unsafe_code)]

use std::sync::Arc;

use forum_domain::{NotificationId, NotificationKind, UserId};
use forum_protocol::{Event, NotificationPayload};
use tracing::{debug, error, warn};

use crate::server::broadcast::{Broadcaster, Delivery};
use crate::server::store::{ForumStore, NewNotification, StoreError};
use crate::util::time::{now_ms_precision, to_rfc3339};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationOutcome {
	pub id: NotificationId,
	pub unread_count: i64,
	pub delivery: Delivery,
}

/// Persists a notification for the affected user and nudges them live.
#[derive(Clone)]
pub struct NotificationComposer {
	store: Arc<dyn ForumStore>,
	broadcaster: Broadcaster,
}

impl NotificationComposer {
	pub fn new(store: Arc<dyn ForumStore>, broadcaster: Broadcaster) -> Self {
		Self { store, broadcaster }
	}

	/// Persist, recount, then push `new_notification` if the recipient is
	/// connected. Nothing is pushed unless the row was written.
	pub async fn notify(
		&self,
		recipient: &UserId,
		actor: &UserId,
		kind: NotificationKind,
		post_id: Option<i64>,
	) -> Result<NotificationOutcome, StoreError> {
		let created_at = now_ms_precision();
		let record = NewNotification {
			recipient: recipient.clone(),
			actor: actor.clone(),
			kind,
			post_id: if kind.is_post_related() { post_id } else { None },
			created_at,
		};

		let id = self.store.save_notification(&record).await.map_err(|e| {
			error!(recipient = %recipient, actor = %actor, kind = kind.as_str(), error = %e, "failed to persist notification");
			e
		})?;
		metrics::counter!("forum_server_notifications_total", "kind" => kind.as_str()).increment(1);

		let unread_count = self.store.unread_notification_count(recipient).await.map_err(|e| {
			warn!(recipient = %recipient, error = %e, "failed to count unread notifications");
			e
		})?;

		let (actor_name, actor_profile_pic) = match self.store.user_profile(actor).await {
			Ok(Some(profile)) => (profile.nickname, profile.profile_pic.unwrap_or_default()),
			Ok(None) => (actor.to_string(), String::new()),
			Err(e) => {
				warn!(actor = %actor, error = %e, "failed to load actor profile");
				(actor.to_string(), String::new())
			}
		};

		let event = Event::NewNotification {
			notification: NotificationPayload {
				id,
				kind,
				actor_id: actor.clone(),
				actor_name,
				actor_profile_pic,
				post_id: record.post_id,
				is_read: false,
				created_at: to_rfc3339(created_at),
			},
			unread_count,
			receiver_id: recipient.clone(),
		};

		let delivery = self.broadcaster.unicast(recipient, &event).await;
		debug!(recipient = %recipient, notification_id = %id, unread_count, ?delivery, "notification composed");

		Ok(NotificationOutcome {
			id,
			unread_count,
			delivery,
		})
	}

	/// Current unread count for `user`.
	pub async fn unread_count(&self, user: &UserId) -> Result<i64, StoreError> {
		self.store.unread_notification_count(user).await
	}
}
