#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use forum_domain::{ConnectionId, UserId};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::server::dispatcher::{CloseReason, ConnectionHandle};

/// Live connections keyed by authenticated user. At most one entry per user.
///
/// The lock is only held for map operations. Anything that writes to a
/// transport (closing a replaced handle, broadcasting) runs after the guard
/// is dropped.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
	entries: RwLock<HashMap<UserId, Arc<ConnectionHandle>>>,
	next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn next_connection_id(&self) -> ConnectionId {
		ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1)
	}

	/// Install `handle` as the live connection for its user.
	///
	/// A previous handle for the same user is released under the lock (so no
	/// writer can use it afterwards) and then closed outside it.
	/// Returns the replaced handle, if any.
	pub async fn register(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
		let user_id = handle.user_id().clone();
		let replaced = {
			let mut entries = self.entries.write().await;
			let previous = entries.insert(user_id.clone(), Arc::clone(&handle));
			let previous = previous.filter(|p| p.id() != handle.id());
			if let Some(p) = &previous {
				p.release();
			}
			metrics::gauge!("forum_server_registered_users").set(entries.len() as f64);
			previous
		};

		match &replaced {
			Some(old) => {
				info!(user_id = %user_id, old_conn = %old.id(), new_conn = %handle.id(), "registry: replacing connection");
				old.close(CloseReason::Replaced).await;
			}
			None => debug!(user_id = %user_id, conn_id = %handle.id(), "registry: registered"),
		}

		replaced
	}

	/// Remove the entry for `handle`'s user, but only if it is still `handle`.
	/// Returns `true` if an entry was removed.
	pub async fn deregister(&self, handle: &ConnectionHandle) -> bool {
		let mut entries = self.entries.write().await;
		let is_current = entries
			.get(handle.user_id())
			.is_some_and(|current| current.id() == handle.id());

		if !is_current {
			debug!(user_id = %handle.user_id(), conn_id = %handle.id(), "registry: stale deregister ignored");
			return false;
		}

		entries.remove(handle.user_id());
		metrics::gauge!("forum_server_registered_users").set(entries.len() as f64);
		debug!(user_id = %handle.user_id(), conn_id = %handle.id(), "registry: deregistered");
		true
	}

	pub async fn lookup(&self, user_id: &UserId) -> Option<Arc<ConnectionHandle>> {
		self.entries.read().await.get(user_id).cloned()
	}

	/// Copy of the current entries, sorted by user id.
	pub async fn snapshot(&self) -> Vec<(UserId, Arc<ConnectionHandle>)> {
		let mut out: Vec<_> = {
			let entries = self.entries.read().await;
			entries.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
		};
		out.sort_by(|a, b| a.0.cmp(&b.0));
		out
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}

	/// Close every live connection. Each read loop then deregisters itself.
	pub async fn close_all(&self, reason: CloseReason) {
		let snapshot = self.snapshot().await;
		info!(connections = snapshot.len(), ?reason, "registry: closing all connections");
		for (_, handle) in snapshot {
			handle.close(reason).await;
		}
	}
}
