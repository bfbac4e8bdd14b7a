#![forbid(unsafe_code)]

use std::sync::Arc;

use forum_domain::UserId;
use forum_protocol::{Event, FramingError, UserListEntry, encode_event};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::server::registry::ConnectionRegistry;
use crate::server::store::{ForumStore, StoreError};

/// Outcome of a single targeted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	Delivered,
	/// No live connection for the user; the event was dropped.
	NotConnected,
	/// The connection exists but the write failed.
	Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
	pub delivered: usize,
	pub failed: usize,
}

/// Why a broadcast reached nobody.
#[derive(Debug, Error)]
pub enum BroadcastError {
	#[error("encode failed: {0}")]
	Encode(#[from] FramingError),

	#[error("users list unavailable: {0}")]
	Store(#[from] StoreError),
}

/// Fans events out to registered connections.
#[derive(Clone)]
pub struct Broadcaster {
	registry: Arc<ConnectionRegistry>,
	store: Arc<dyn ForumStore>,
	max_outbound_bytes: usize,
}

impl Broadcaster {
	pub fn new(registry: Arc<ConnectionRegistry>, store: Arc<dyn ForumStore>, max_outbound_bytes: usize) -> Self {
		Self {
			registry,
			store,
			max_outbound_bytes,
		}
	}

	pub fn registry(&self) -> &Arc<ConnectionRegistry> {
		&self.registry
	}

	/// Send `event` to one user if connected. Absence is not an error.
	pub async fn unicast(&self, user_id: &UserId, event: &Event) -> Delivery {
		let Some(handle) = self.registry.lookup(user_id).await else {
			debug!(user_id = %user_id, kind = event.kind(), "unicast: user not connected, dropping");
			return Delivery::NotConnected;
		};

		match handle.send(event).await {
			Ok(()) => Delivery::Delivered,
			Err(e) => {
				warn!(user_id = %user_id, conn_id = %handle.id(), kind = event.kind(), error = %e, "unicast failed");
				Delivery::Failed
			}
		}
	}

	/// Send `event` to every registered connection, in the calling task.
	///
	/// The registry is snapshotted before the first write, and one failing
	/// peer never stops delivery to the rest. An event that cannot be encoded
	/// reaches nobody and is returned as an error.
	pub async fn broadcast_now(&self, event: &Event) -> Result<BroadcastReport, FramingError> {
		let frame = encode_event(event, self.max_outbound_bytes).inspect_err(|e| {
			metrics::counter!("forum_server_broadcast_encode_errors_total", "kind" => event.kind()).increment(1);
			error!(kind = event.kind(), error = %e, "broadcast: failed to encode event");
		})?;

		let peers = self.registry.snapshot().await;
		let mut report = BroadcastReport::default();
		for (user_id, handle) in peers {
			match handle.send_frame(&frame).await {
				Ok(()) => report.delivered += 1,
				Err(e) => {
					report.failed += 1;
					warn!(user_id = %user_id, conn_id = %handle.id(), kind = event.kind(), error = %e, "broadcast: skipping peer");
				}
			}
		}

		metrics::counter!("forum_server_broadcasts_total", "kind" => event.kind()).increment(1);
		debug!(kind = event.kind(), delivered = report.delivered, failed = report.failed, "broadcast done");
		Ok(report)
	}

	/// `broadcast_now` on a separate task so the caller never waits on slow peers.
	pub fn broadcast_all(&self, event: Event) -> JoinHandle<Result<BroadcastReport, FramingError>> {
		let this = self.clone();
		tokio::spawn(async move { this.broadcast_now(&event).await })
	}

	/// Current users list as a `users_list` event.
	pub async fn users_list_event(&self) -> Result<Event, StoreError> {
		let users = self.store.list_users().await?;
		Ok(Event::UsersListSnapshot {
			users: users.into_iter().map(UserListEntry::from).collect(),
		})
	}

	/// Broadcast the users list now. Failures are logged and returned.
	pub async fn refresh_users_list_now(&self) -> Result<BroadcastReport, BroadcastError> {
		let event = self.users_list_event().await.inspect_err(|e| {
			warn!(error = %e, "users list refresh: failed to load users");
		})?;
		Ok(self.broadcast_now(&event).await?)
	}

	pub fn refresh_users_list(&self) -> JoinHandle<Result<BroadcastReport, BroadcastError>> {
		let this = self.clone();
		tokio::spawn(async move { this.refresh_users_list_now().await })
	}

	/// Broadcast a state-changing event, then the users list so clients can
	/// reconcile anything they missed. Runs on its own task.
	///
	/// The refresh is attempted even when the event itself cannot be encoded.
	/// The report covers the event; the first error wins.
	pub fn broadcast_with_refresh(&self, event: Event) -> JoinHandle<Result<BroadcastReport, BroadcastError>> {
		let this = self.clone();
		tokio::spawn(async move {
			let report = this.broadcast_now(&event).await;
			let refreshed = this.refresh_users_list_now().await;
			let report = report?;
			refreshed?;
			Ok(report)
		})
	}
}
