#![forbid(unsafe_code)]

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use forum_domain::{ConnectionId, UserId};
use forum_protocol::{Event, FramingError, encode_event};
use futures::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

/// Write half of one client transport.
pub type BoxFrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("connection is closed")]
	Closed,

	#[error("transport write failed: {0}")]
	Transport(#[source] WsError),

	#[error("peer did not accept frame within {0:?}")]
	Timeout(Duration),

	#[error(transparent)]
	Encode(#[from] FramingError),
}

/// Why the server is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
	/// The read loop ended (client close or read error).
	Normal,
	/// A newer connection for the same user took over the registry entry.
	Replaced,
	/// Process shutdown.
	ShuttingDown,
}

impl CloseReason {
	fn frame(self) -> CloseFrame {
		let (code, reason) = match self {
			CloseReason::Normal => (CloseCode::Normal, "bye"),
			CloseReason::Replaced => (CloseCode::Policy, "replaced by a newer connection"),
			CloseReason::ShuttingDown => (CloseCode::Away, "server shutting down"),
		};
		CloseFrame {
			code,
			reason: reason.into(),
		}
	}
}

/// One live client connection, with its writes serialized behind a lock.
///
/// Once a handle is closed (explicitly, by replacement, or after a failed
/// write) every further `send` returns `DispatchError::Closed` and the
/// connection's read loop is signalled to stop.
pub struct ConnectionHandle {
	id: ConnectionId,
	user_id: UserId,
	sink: Mutex<BoxFrameSink>,
	closed: watch::Sender<bool>,
	close_sent: AtomicBool,
	write_timeout: Duration,
	max_outbound_bytes: usize,
}

impl std::fmt::Debug for ConnectionHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionHandle")
			.field("id", &self.id)
			.field("user_id", &self.user_id)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl ConnectionHandle {
	pub fn new<S>(id: ConnectionId, user_id: UserId, sink: S, write_timeout: Duration, max_outbound_bytes: usize) -> Arc<Self>
	where
		S: Sink<Message, Error = WsError> + Send + 'static,
	{
		let (closed, _) = watch::channel(false);
		Arc::new(Self {
			id,
			user_id,
			sink: Mutex::new(Box::pin(sink)),
			closed,
			close_sent: AtomicBool::new(false),
			write_timeout,
			max_outbound_bytes,
		})
	}

	pub fn id(&self) -> ConnectionId {
		self.id
	}

	pub fn user_id(&self) -> &UserId {
		&self.user_id
	}

	pub fn is_closed(&self) -> bool {
		*self.closed.borrow()
	}

	/// Resolves once the handle is closed. Used by the read loop.
	pub fn closed_signal(&self) -> watch::Receiver<bool> {
		self.closed.subscribe()
	}

	/// Encode and write one event.
	pub async fn send(&self, event: &Event) -> Result<(), DispatchError> {
		let frame = encode_event(event, self.max_outbound_bytes)?;
		self.send_frame(&frame).await
	}

	/// Write one pre-encoded frame. Encoding happens outside the lock so
	/// broadcasts can encode once and reuse the text for every peer.
	pub async fn send_frame(&self, frame: &str) -> Result<(), DispatchError> {
		if self.is_closed() {
			return Err(DispatchError::Closed);
		}

		let mut sink = self.sink.lock().await;
		// Another writer may have failed while we waited for the lock.
		if self.is_closed() {
			return Err(DispatchError::Closed);
		}

		match timeout(self.write_timeout, sink.send(Message::text(frame.to_owned()))).await {
			Ok(Ok(())) => {
				metrics::counter!("forum_server_events_out_total").increment(1);
				Ok(())
			}
			Ok(Err(e)) => {
				self.release();
				metrics::counter!("forum_server_dispatch_errors_total", "cause" => "transport").increment(1);
				Err(DispatchError::Transport(e))
			}
			Err(_) => {
				self.release();
				metrics::counter!("forum_server_dispatch_errors_total", "cause" => "timeout").increment(1);
				Err(DispatchError::Timeout(self.write_timeout))
			}
		}
	}

	/// Mark the handle closed without touching the transport.
	/// Returns `true` if this call performed the transition.
	pub(crate) fn release(&self) -> bool {
		!self.closed.send_replace(true)
	}

	/// Release the handle and send a close frame. Idempotent.
	pub async fn close(&self, reason: CloseReason) {
		self.release();
		if self.close_sent.swap(true, Ordering::AcqRel) {
			return;
		}

		let mut sink = self.sink.lock().await;
		let result = timeout(self.write_timeout, async {
			sink.send(Message::Close(Some(reason.frame()))).await?;
			sink.close().await
		})
		.await;

		match result {
			Ok(Ok(())) => debug!(conn_id = %self.id, user_id = %self.user_id, ?reason, "connection closed"),
			Ok(Err(e)) => debug!(conn_id = %self.id, user_id = %self.user_id, ?reason, error = %e, "close on dead transport"),
			Err(_) => debug!(conn_id = %self.id, user_id = %self.user_id, ?reason, "close timed out"),
		}
	}
}
