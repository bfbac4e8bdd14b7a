#![forbid(unsafe_code)]

use std::sync::Arc;

use forum_domain::UserId;
use forum_protocol::{Event, NewUserInfo};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::broadcast::{BroadcastError, BroadcastReport, Broadcaster};
use crate::server::store::ForumStore;

pub type PresenceBroadcast = JoinHandle<Result<BroadcastReport, BroadcastError>>;

/// Online/offline transitions driven by registry changes.
///
/// Each transition re-reads the registry and persists under one lock, so the
/// stored flag always matches the registry state the last transition saw. A
/// late offline from a session that was already superseded by a reconnect
/// finds the new entry and does nothing.
#[derive(Clone)]
pub struct PresenceTracker {
	store: Arc<dyn ForumStore>,
	broadcaster: Broadcaster,
	transitions: Arc<Mutex<()>>,
}

impl PresenceTracker {
	pub fn new(store: Arc<dyn ForumStore>, broadcaster: Broadcaster) -> Self {
		Self {
			store,
			broadcaster,
			transitions: Arc::new(Mutex::new(())),
		}
	}

	/// Called after a successful register. Returns `None` if the user has no
	/// live connection by the time the transition runs.
	pub async fn went_online(&self, user_id: &UserId) -> Option<PresenceBroadcast> {
		self.transition(user_id, true).await
	}

	/// Called only when the registry actually removed this user's entry.
	/// Returns `None` if the user has reconnected in the meantime.
	pub async fn went_offline(&self, user_id: &UserId) -> Option<PresenceBroadcast> {
		self.transition(user_id, false).await
	}

	async fn transition(&self, user_id: &UserId, is_online: bool) -> Option<PresenceBroadcast> {
		{
			let _guard = self.transitions.lock().await;
			let connected = self.broadcaster.registry().lookup(user_id).await.is_some();
			if connected != is_online {
				debug!(user_id = %user_id, is_online, "presence: superseded transition skipped");
				return None;
			}

			info!(user_id = %user_id, is_online, "presence: transition");
			if let Err(e) = self.store.set_user_online(user_id, is_online).await {
				warn!(user_id = %user_id, is_online, error = %e, "presence: failed to persist status");
			}
		}

		Some(self.broadcaster.broadcast_with_refresh(Event::PresenceChanged {
			user_id: user_id.clone(),
			is_online,
		}))
	}

	/// Tell everyone a new account exists, then refresh the list. The
	/// account has just signed in, so it is announced as online.
	pub fn announce_new_user(&self, user_id: &UserId, nickname: &str) -> PresenceBroadcast {
		info!(user_id = %user_id, "presence: announcing new user");
		self.broadcaster.broadcast_with_refresh(Event::NewUser {
			user: NewUserInfo {
				id: user_id.clone(),
				nickname: nickname.to_string(),
				is_online: true,
			},
		})
	}
}
