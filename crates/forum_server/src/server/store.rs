#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use forum_domain::{MessageId, NotificationId, NotificationKind, UserId};
use forum_protocol::{MessageRecord, UserListEntry};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::util::time::{now_ms_precision, to_rfc3339};

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("migration error: {0}")]
	Migrate(#[from] sqlx::migrate::MigrateError),

	#[error("store unavailable: {0}")]
	Unavailable(&'static str),

	#[error("corrupt row: {0}")]
	Corrupt(String),
}

/// A user as the realtime layer needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
	pub id: UserId,
	pub nickname: String,
	pub is_online: bool,
	pub profile_pic: Option<String>,
}

impl From<UserSummary> for UserListEntry {
	fn from(u: UserSummary) -> Self {
		UserListEntry {
			id: u.id,
			nickname: u.nickname,
			is_online: u.is_online,
			profile_pic: u.profile_pic.unwrap_or_default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: MessageId,
	pub sender: UserId,
	pub recipient: UserId,
	pub content: String,
	pub sent_at: DateTime<Utc>,
	pub read: bool,
}

impl From<StoredMessage> for MessageRecord {
	fn from(m: StoredMessage) -> Self {
		MessageRecord {
			id: m.id,
			sender: m.sender,
			recipient: m.recipient,
			content: m.content,
			timestamp: to_rfc3339(m.sent_at),
			read: m.read,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
	pub recipient: UserId,
	pub actor: UserId,
	pub kind: NotificationKind,
	pub post_id: Option<i64>,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredNotification {
	pub id: NotificationId,
	pub recipient: UserId,
	pub actor: UserId,
	pub kind: NotificationKind,
	pub post_id: Option<i64>,
	pub is_read: bool,
	pub created_at: DateTime<Utc>,
}

/// Persistence collaborator used by the realtime core.
#[async_trait::async_trait]
pub trait ForumStore: Send + Sync {
	async fn save_message(
		&self,
		sender: &UserId,
		recipient: &UserId,
		content: &str,
		sent_at: DateTime<Utc>,
	) -> Result<MessageId, StoreError>;

	/// Mark every unread message `sender` sent to `recipient` as read.
	async fn mark_messages_read(&self, sender: &UserId, recipient: &UserId) -> Result<u64, StoreError>;

	async fn set_user_online(&self, user: &UserId, online: bool) -> Result<(), StoreError>;

	/// Mark every user offline. Run at startup, before any connection is
	/// accepted, to clear flags left behind by an unclean stop.
	async fn reset_presence(&self) -> Result<u64, StoreError>;

	async fn save_notification(&self, notification: &NewNotification) -> Result<NotificationId, StoreError>;

	async fn unread_notification_count(&self, user: &UserId) -> Result<i64, StoreError>;

	/// One page of the conversation between `a` and `b`, oldest first.
	/// `page` starts at 1.
	async fn fetch_chat_history(
		&self,
		a: &UserId,
		b: &UserId,
		page: u32,
		limit: u32,
	) -> Result<Vec<StoredMessage>, StoreError>;

	/// All users ordered by nickname.
	async fn list_users(&self) -> Result<Vec<UserSummary>, StoreError>;

	async fn user_profile(&self, user: &UserId) -> Result<Option<UserSummary>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
	users: BTreeMap<UserId, UserSummary>,
	messages: Vec<StoredMessage>,
	notifications: Vec<StoredNotification>,
	sessions: HashMap<String, (UserId, DateTime<Utc>)>,
	next_message_id: i64,
	next_notification_id: i64,
}

/// Process-local store. Used when persistence is disabled and in tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<MemoryState>,
	fail_writes: AtomicBool,
	fail_notifications: AtomicBool,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Make every write fail with `StoreError::Unavailable` until reset.
	pub fn set_fail_writes(&self, fail: bool) {
		self.fail_writes.store(fail, Ordering::Relaxed);
	}

	/// Make only notification writes fail.
	pub fn set_fail_notifications(&self, fail: bool) {
		self.fail_notifications.store(fail, Ordering::Relaxed);
	}

	fn check_writable(&self) -> Result<(), StoreError> {
		if self.fail_writes.load(Ordering::Relaxed) {
			return Err(StoreError::Unavailable("writes disabled"));
		}
		Ok(())
	}

	pub async fn upsert_user(&self, id: &UserId, nickname: &str, profile_pic: Option<&str>) {
		let mut inner = self.inner.lock().await;
		let entry = inner.users.entry(id.clone()).or_insert_with(|| UserSummary {
			id: id.clone(),
			nickname: String::new(),
			is_online: false,
			profile_pic: None,
		});
		entry.nickname = nickname.to_string();
		entry.profile_pic = profile_pic.map(str::to_string);
	}

	/// Issue an opaque session token for `user` valid for `ttl`.
	pub async fn create_session(&self, user: &UserId, ttl: Duration) -> String {
		let token = uuid::Uuid::new_v4().to_string();
		let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
		let expires_at = now_ms_precision() + ttl;
		self.inner
			.lock()
			.await
			.sessions
			.insert(token.clone(), (user.clone(), expires_at));
		token
	}

	pub(crate) async fn session_owner(&self, token: &str) -> Option<(UserId, DateTime<Utc>)> {
		self.inner.lock().await.sessions.get(token).cloned()
	}

	pub async fn notifications_for(&self, user: &UserId) -> Vec<StoredNotification> {
		let inner = self.inner.lock().await;
		inner
			.notifications
			.iter()
			.filter(|n| &n.recipient == user)
			.cloned()
			.collect()
	}

	pub async fn message_count(&self) -> usize {
		self.inner.lock().await.messages.len()
	}
}

#[async_trait::async_trait]
impl ForumStore for InMemoryStore {
	async fn save_message(
		&self,
		sender: &UserId,
		recipient: &UserId,
		content: &str,
		sent_at: DateTime<Utc>,
	) -> Result<MessageId, StoreError> {
		self.check_writable()?;
		let mut inner = self.inner.lock().await;
		inner.next_message_id += 1;
		let id = MessageId(inner.next_message_id);
		inner.messages.push(StoredMessage {
			id,
			sender: sender.clone(),
			recipient: recipient.clone(),
			content: content.to_string(),
			sent_at,
			read: false,
		});
		Ok(id)
	}

	async fn mark_messages_read(&self, sender: &UserId, recipient: &UserId) -> Result<u64, StoreError> {
		self.check_writable()?;
		let mut inner = self.inner.lock().await;
		let mut changed = 0;
		for m in inner
			.messages
			.iter_mut()
			.filter(|m| &m.sender == sender && &m.recipient == recipient && !m.read)
		{
			m.read = true;
			changed += 1;
		}
		Ok(changed)
	}

	async fn set_user_online(&self, user: &UserId, online: bool) -> Result<(), StoreError> {
		self.check_writable()?;
		if let Some(u) = self.inner.lock().await.users.get_mut(user) {
			u.is_online = online;
		}
		Ok(())
	}

	async fn reset_presence(&self) -> Result<u64, StoreError> {
		self.check_writable()?;
		let mut inner = self.inner.lock().await;
		let mut changed = 0;
		for u in inner.users.values_mut().filter(|u| u.is_online) {
			u.is_online = false;
			changed += 1;
		}
		Ok(changed)
	}

	async fn save_notification(&self, notification: &NewNotification) -> Result<NotificationId, StoreError> {
		self.check_writable()?;
		if self.fail_notifications.load(Ordering::Relaxed) {
			return Err(StoreError::Unavailable("notification writes disabled"));
		}
		let mut inner = self.inner.lock().await;
		inner.next_notification_id += 1;
		let id = NotificationId(inner.next_notification_id);
		inner.notifications.push(StoredNotification {
			id,
			recipient: notification.recipient.clone(),
			actor: notification.actor.clone(),
			kind: notification.kind,
			post_id: notification.post_id,
			is_read: false,
			created_at: notification.created_at,
		});
		Ok(id)
	}

	async fn unread_notification_count(&self, user: &UserId) -> Result<i64, StoreError> {
		let inner = self.inner.lock().await;
		Ok(inner
			.notifications
			.iter()
			.filter(|n| &n.recipient == user && !n.is_read)
			.count() as i64)
	}

	async fn fetch_chat_history(
		&self,
		a: &UserId,
		b: &UserId,
		page: u32,
		limit: u32,
	) -> Result<Vec<StoredMessage>, StoreError> {
		let inner = self.inner.lock().await;
		let mut conversation: Vec<_> = inner
			.messages
			.iter()
			.filter(|m| (&m.sender == a && &m.recipient == b) || (&m.sender == b && &m.recipient == a))
			.cloned()
			.collect();
		// Newest first, then page, then back to chronological.
		conversation.sort_by(|x, y| y.sent_at.cmp(&x.sent_at).then(y.id.0.cmp(&x.id.0)));
		let offset = (page.max(1) as usize - 1) * limit as usize;
		let mut page: Vec<_> = conversation.into_iter().skip(offset).take(limit as usize).collect();
		page.reverse();
		Ok(page)
	}

	async fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
		let inner = self.inner.lock().await;
		let mut users: Vec<_> = inner.users.values().cloned().collect();
		users.sort_by(|a, b| a.nickname.cmp(&b.nickname).then_with(|| a.id.cmp(&b.id)));
		Ok(users)
	}

	async fn user_profile(&self, user: &UserId) -> Result<Option<UserSummary>, StoreError> {
		Ok(self.inner.lock().await.users.get(user).cloned())
	}
}
