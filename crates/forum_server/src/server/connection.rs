#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use forum_domain::{ConnectionId, UserId};
use forum_protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_OUTBOUND_FRAME_SIZE, decode_chat_frame};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::dispatcher::{CloseReason, ConnectionHandle};
use crate::server::state::AppState;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Largest accepted client frame.
	pub max_frame_bytes: usize,
	/// Largest event the server will encode for a client.
	pub max_outbound_frame_bytes: usize,
	pub write_timeout: Duration,

	/// Inbound chat frames: burst size. 0 disables limiting.
	pub chat_rate_limit_burst: u32,
	/// Inbound chat frames: sustained frames per minute. 0 disables limiting.
	pub chat_rate_limit_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			max_outbound_frame_bytes: DEFAULT_MAX_OUTBOUND_FRAME_SIZE,
			write_timeout: Duration::from_secs(5),
			chat_rate_limit_burst: 20,
			chat_rate_limit_per_minute: 120,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Serve one upgraded client connection until it closes.
///
/// Registers the connection, drives presence, feeds text frames to chat
/// delivery, and deregisters exactly once on the way out.
pub async fn run_session<S>(app: Arc<AppState>, conn_id: ConnectionId, user_id: UserId, ws: WebSocketStream<S>)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("forum_server_active_connections").decrement(1.0);
		}
	}

	let _session = app.session_tasks.track();
	metrics::counter!("forum_server_connections_total").increment(1);
	metrics::gauge!("forum_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let settings = app.connection_settings();
	let (sink, mut stream) = ws.split();
	let handle = ConnectionHandle::new(
		conn_id,
		user_id.clone(),
		sink,
		settings.write_timeout,
		settings.max_outbound_frame_bytes,
	);

	app.registry.register(Arc::clone(&handle)).await;
	app.presence.went_online(&user_id).await;
	info!(conn_id = %conn_id, user_id = %user_id, "connection established");

	let mut closed = handle.closed_signal();
	let mut shutdown = app.shutdown_signal();
	let mut rate_limiter = TokenBucket::new(settings.chat_rate_limit_burst, settings.chat_rate_limit_per_minute);

	let close_reason = loop {
		let next = tokio::select! {
			_ = closed.wait_for(|closed| *closed) => break CloseReason::Normal,
			_ = shutdown.wait_for(|stop| *stop) => break CloseReason::ShuttingDown,
			next = stream.next() => next,
		};

		let text = match next {
			None => break CloseReason::Normal,
			Some(Err(e)) => {
				debug!(conn_id = %conn_id, user_id = %user_id, error = %e, "read failed");
				break CloseReason::Normal;
			}
			Some(Ok(Message::Text(text))) => text,
			Some(Ok(Message::Close(_))) => break CloseReason::Normal,
			Some(Ok(Message::Binary(_))) => {
				debug!(conn_id = %conn_id, "ignoring binary frame");
				continue;
			}
			Some(Ok(_)) => continue,
		};

		metrics::counter!("forum_server_frames_in_total").increment(1);

		if let Some(bucket) = rate_limiter.as_mut()
			&& !bucket.allow()
		{
			warn!(conn_id = %conn_id, user_id = %user_id, "chat rate limit exceeded; dropping frame");
			continue;
		}

		match decode_chat_frame(text.as_str(), settings.max_frame_bytes) {
			Ok(frame) => {
				let outcome = app.chat.handle_frame(&user_id, frame).await;
				debug!(conn_id = %conn_id, user_id = %user_id, ?outcome, "frame handled");
			}
			Err(e) if e.is_unknown_type() => {
				debug!(conn_id = %conn_id, user_id = %user_id, error = %e, "ignoring frame");
			}
			Err(e) => {
				metrics::counter!("forum_server_frame_decode_errors_total").increment(1);
				warn!(conn_id = %conn_id, user_id = %user_id, error = %e, "malformed frame");
			}
		}
	};

	let removed = app.registry.deregister(&handle).await;
	handle.close(close_reason).await;
	if removed {
		app.presence.went_offline(&user_id).await;
	}
	info!(conn_id = %conn_id, user_id = %user_id, replaced = !removed, "connection closed");
}
