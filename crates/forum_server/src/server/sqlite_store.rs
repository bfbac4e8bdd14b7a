#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use forum_domain::{MessageId, NotificationId, UserId};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::server::store::{ForumStore, NewNotification, StoreError, StoredMessage, UserSummary};
use crate::util::time::{from_unix_ms, unix_ms_now};

/// `ForumStore` backed by sqlite through sqlx.
#[derive(Clone)]
pub struct SqliteStore {
	pool: SqlitePool,
}

type MessageRow = (i64, String, String, String, i64, bool);
type UserRow = (String, String, bool, Option<String>);

impl SqliteStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (only sqlite: is supported)"));
		}

		// Every connection to `:memory:` is a separate database.
		let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
		let pool = SqlitePoolOptions::new()
			.max_connections(max_connections)
			.connect(database_url)
			.await
			.context("connect sqlite")?;

		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		Ok(Self { pool })
	}

	pub async fn upsert_user(&self, id: &UserId, nickname: &str, profile_pic: Option<&str>) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO users (id, nickname, profile_pic) VALUES (?, ?, ?) \
			ON CONFLICT(id) DO UPDATE SET nickname = excluded.nickname, profile_pic = excluded.profile_pic",
		)
		.bind(id.as_str())
		.bind(nickname)
		.bind(profile_pic)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	pub async fn create_session(&self, user: &UserId, ttl: Duration) -> Result<String, StoreError> {
		let token = uuid::Uuid::new_v4().to_string();
		let expires_at = unix_ms_now().saturating_add(ttl.as_millis() as i64);
		sqlx::query("INSERT INTO sessions (id, user_id, expires_at) VALUES (?, ?, ?)")
			.bind(&token)
			.bind(user.as_str())
			.bind(expires_at)
			.execute(&self.pool)
			.await?;
		Ok(token)
	}

	/// Owner of a session that has not expired yet.
	pub(crate) async fn live_session_owner(&self, token: &str) -> Result<Option<String>, StoreError> {
		let row: Option<(String,)> = sqlx::query_as("SELECT user_id FROM sessions WHERE id = ? AND expires_at > ?")
			.bind(token)
			.bind(unix_ms_now())
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.map(|(user_id,)| user_id))
	}

	pub async fn delete_expired_sessions(&self) -> Result<u64, StoreError> {
		let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
			.bind(unix_ms_now())
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}
}

fn user_id_column(raw: String) -> Result<UserId, StoreError> {
	UserId::new(&raw).map_err(|e| StoreError::Corrupt(format!("user id {raw:?}: {e}")))
}

fn message_from_row((id, sender, recipient, content, sent_at, read): MessageRow) -> Result<StoredMessage, StoreError> {
	Ok(StoredMessage {
		id: MessageId(id),
		sender: user_id_column(sender)?,
		recipient: user_id_column(recipient)?,
		content,
		sent_at: from_unix_ms(sent_at),
		read,
	})
}

fn user_from_row((id, nickname, is_online, profile_pic): UserRow) -> Result<UserSummary, StoreError> {
	Ok(UserSummary {
		id: user_id_column(id)?,
		nickname,
		is_online,
		profile_pic,
	})
}

#[async_trait::async_trait]
impl ForumStore for SqliteStore {
	async fn save_message(
		&self,
		sender: &UserId,
		recipient: &UserId,
		content: &str,
		sent_at: DateTime<Utc>,
	) -> Result<MessageId, StoreError> {
		let result = sqlx::query("INSERT INTO messages (sender_id, receiver_id, content, sent_at, read) VALUES (?, ?, ?, ?, 0)")
			.bind(sender.as_str())
			.bind(recipient.as_str())
			.bind(content)
			.bind(sent_at.timestamp_millis())
			.execute(&self.pool)
			.await?;
		Ok(MessageId(result.last_insert_rowid()))
	}

	async fn mark_messages_read(&self, sender: &UserId, recipient: &UserId) -> Result<u64, StoreError> {
		let result = sqlx::query("UPDATE messages SET read = 1 WHERE sender_id = ? AND receiver_id = ? AND read = 0")
			.bind(sender.as_str())
			.bind(recipient.as_str())
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}

	async fn set_user_online(&self, user: &UserId, online: bool) -> Result<(), StoreError> {
		sqlx::query("UPDATE users SET is_online = ?, last_seen = ? WHERE id = ?")
			.bind(online)
			.bind(unix_ms_now())
			.bind(user.as_str())
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	async fn reset_presence(&self) -> Result<u64, StoreError> {
		let result = sqlx::query("UPDATE users SET is_online = 0 WHERE is_online <> 0")
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected())
	}

	async fn save_notification(&self, n: &NewNotification) -> Result<NotificationId, StoreError> {
		let result = sqlx::query(
			"INSERT INTO notifications (user_id, actor_id, post_id, type, created_at, is_read) VALUES (?, ?, ?, ?, ?, 0)",
		)
		.bind(n.recipient.as_str())
		.bind(n.actor.as_str())
		.bind(n.post_id)
		.bind(n.kind.as_str())
		.bind(n.created_at.timestamp_millis())
		.execute(&self.pool)
		.await?;
		Ok(NotificationId(result.last_insert_rowid()))
	}

	async fn unread_notification_count(&self, user: &UserId) -> Result<i64, StoreError> {
		let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0")
			.bind(user.as_str())
			.fetch_one(&self.pool)
			.await?;
		Ok(count)
	}

	async fn fetch_chat_history(
		&self,
		a: &UserId,
		b: &UserId,
		page: u32,
		limit: u32,
	) -> Result<Vec<StoredMessage>, StoreError> {
		let offset = i64::from(page.max(1) - 1) * i64::from(limit);
		let rows: Vec<MessageRow> = sqlx::query_as(
			"SELECT id, sender_id, receiver_id, content, sent_at, read FROM messages \
			WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?) \
			ORDER BY sent_at DESC, id DESC LIMIT ? OFFSET ?",
		)
		.bind(a.as_str())
		.bind(b.as_str())
		.bind(b.as_str())
		.bind(a.as_str())
		.bind(i64::from(limit))
		.bind(offset)
		.fetch_all(&self.pool)
		.await?;

		let mut messages = rows.into_iter().map(message_from_row).collect::<Result<Vec<_>, _>>()?;
		messages.reverse();
		Ok(messages)
	}

	async fn list_users(&self) -> Result<Vec<UserSummary>, StoreError> {
		let rows: Vec<UserRow> =
			sqlx::query_as("SELECT id, nickname, is_online, profile_pic FROM users ORDER BY nickname ASC, id ASC")
				.fetch_all(&self.pool)
				.await?;
		rows.into_iter().map(user_from_row).collect()
	}

	async fn user_profile(&self, user: &UserId) -> Result<Option<UserSummary>, StoreError> {
		let row: Option<UserRow> = sqlx::query_as("SELECT id, nickname, is_online, profile_pic FROM users WHERE id = ?")
			.bind(user.as_str())
			.fetch_optional(&self.pool)
			.await?;
		row.map(user_from_row).transpose()
	}
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;
	use forum_domain::NotificationKind;

	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).expect("valid user id")
	}

	async fn store() -> SqliteStore {
		SqliteStore::connect("sqlite::memory:").await.expect("in-memory sqlite")
	}

	#[tokio::test]
	async fn messages_round_trip_through_history() {
		let store = store().await;
		let (a, b) = (uid("a"), uid("b"));
		let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();

		let first = store.save_message(&a, &b, "hello", t0).await.unwrap();
		let second = store
			.save_message(&b, &a, "hi back", t0 + chrono::Duration::seconds(5))
			.await
			.unwrap();
		assert!(second.0 > first.0);

		let history = store.fetch_chat_history(&a, &b, 1, 10).await.unwrap();
		assert_eq!(history.len(), 2);
		assert_eq!(history[0].content, "hello");
		assert_eq!(history[0].sent_at, t0);
		assert_eq!(history[1].sender, b);

		assert_eq!(store.mark_messages_read(&a, &b).await.unwrap(), 1);
		assert_eq!(store.mark_messages_read(&a, &b).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn notifications_count_unread_per_recipient() {
		let store = store().await;
		let (a, b) = (uid("a"), uid("b"));
		let n = NewNotification {
			recipient: b.clone(),
			actor: a.clone(),
			kind: NotificationKind::Message,
			post_id: None,
			created_at: Utc::now(),
		};
		store.save_notification(&n).await.unwrap();
		store.save_notification(&n).await.unwrap();

		assert_eq!(store.unread_notification_count(&b).await.unwrap(), 2);
		assert_eq!(store.unread_notification_count(&a).await.unwrap(), 0);
	}

	#[tokio::test]
	async fn presence_and_profiles_follow_users_table() {
		let store = store().await;
		store.upsert_user(&uid("u-2"), "zed", None).await.unwrap();
		store.upsert_user(&uid("u-1"), "amy", Some("/p/amy.png")).await.unwrap();
		store.set_user_online(&uid("u-2"), true).await.unwrap();

		let users = store.list_users().await.unwrap();
		assert_eq!(users.len(), 2);
		assert_eq!(users[0].nickname, "amy");
		assert!(users[1].is_online);

		let profile = store.user_profile(&uid("u-1")).await.unwrap().expect("profile");
		assert_eq!(profile.profile_pic.as_deref(), Some("/p/amy.png"));
		assert!(store.user_profile(&uid("nobody")).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn reset_presence_clears_stale_online_flags() {
		let store = store().await;
		store.upsert_user(&uid("a"), "amy", None).await.unwrap();
		store.upsert_user(&uid("b"), "bob", None).await.unwrap();
		store.set_user_online(&uid("a"), true).await.unwrap();

		assert_eq!(store.reset_presence().await.unwrap(), 1);
		assert_eq!(store.reset_presence().await.unwrap(), 0);
		let users = store.list_users().await.unwrap();
		assert!(users.iter().all(|u| !u.is_online));
	}

	#[tokio::test]
	async fn expired_sessions_are_not_live() {
		let store = store().await;
		let a = uid("a");
		let live = store.create_session(&a, Duration::from_secs(60)).await.unwrap();
		let dead = store.create_session(&a, Duration::ZERO).await.unwrap();

		assert_eq!(store.live_session_owner(&live).await.unwrap().as_deref(), Some("a"));
		assert!(store.live_session_owner(&dead).await.unwrap().is_none());
		assert_eq!(store.delete_expired_sessions().await.unwrap(), 1);
	}
}
