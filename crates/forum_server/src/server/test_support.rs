#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use forum_domain::UserId;
use forum_protocol::{DEFAULT_MAX_OUTBOUND_FRAME_SIZE, Event};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;

use crate::server::dispatcher::ConnectionHandle;
use crate::server::registry::ConnectionRegistry;
use crate::server::state::{AppSettings, AppState};
use crate::server::store::InMemoryStore;

pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_millis(200);
const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const SILENCE: Duration = Duration::from_millis(100);

pub(crate) fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

/// A connection whose outbound frames land in a channel the test can read.
pub(crate) struct TestPeer {
	pub handle: Arc<ConnectionHandle>,
	rx: mpsc::UnboundedReceiver<Message>,
}

impl TestPeer {
	pub fn new(registry: &ConnectionRegistry, user: &str) -> Self {
		let (tx, rx) = mpsc::unbounded::<Message>();
		let sink = tx.sink_map_err(|_| WsError::ConnectionClosed);
		let handle = ConnectionHandle::new(
			registry.next_connection_id(),
			uid(user),
			sink,
			WRITE_TIMEOUT,
			DEFAULT_MAX_OUTBOUND_FRAME_SIZE,
		);
		Self { handle, rx }
	}

	/// Register this peer's handle.
	pub async fn connect(registry: &ConnectionRegistry, user: &str) -> Self {
		let peer = Self::new(registry, user);
		registry.register(Arc::clone(&peer.handle)).await;
		peer
	}

	/// Simulate the client vanishing: every later write fails.
	pub fn kill(&mut self) {
		self.rx.close();
	}

	pub async fn next_message(&mut self) -> Message {
		timeout(RECV_TIMEOUT, self.rx.next())
			.await
			.expect("expected a frame within timeout")
			.expect("peer channel open")
	}

	pub async fn next_text(&mut self) -> String {
		match self.next_message().await {
			Message::Text(text) => text.as_str().to_owned(),
			other => panic!("expected text frame, got {other:?}"),
		}
	}

	pub async fn next_event(&mut self) -> Event {
		let text = self.next_text().await;
		serde_json::from_str(&text).expect("server frames are valid events")
	}

	/// Next event with the given wire tag, skipping anything else.
	pub async fn next_event_of(&mut self, kind: &str) -> Event {
		loop {
			let event = self.next_event().await;
			if event.kind() == kind {
				return event;
			}
		}
	}

	/// Every text event received until the peer goes quiet.
	pub async fn drain_events(&mut self) -> Vec<Event> {
		let mut out = Vec::new();
		while let Ok(Some(msg)) = timeout(SILENCE, self.rx.next()).await {
			if let Message::Text(text) = msg {
				out.push(serde_json::from_str(text.as_str()).expect("valid event"));
			}
		}
		out
	}

	pub async fn expect_silence(&mut self) {
		let got = timeout(SILENCE, self.rx.next()).await;
		assert!(got.is_err(), "expected no frame, got {got:?}");
	}
}

pub(crate) struct Harness {
	pub store: Arc<InMemoryStore>,
	pub app: Arc<AppState>,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_settings(AppSettings::default())
	}

	pub fn with_settings(settings: AppSettings) -> Self {
		let store = Arc::new(InMemoryStore::new());
		let app = AppState::new(store.clone(), store.clone(), settings);
		Self { store, app }
	}

	/// Seed users so presence and list snapshots have rows to show.
	pub async fn with_users(users: &[(&str, &str)]) -> Self {
		let h = Self::new();
		for (id, nickname) in users {
			h.store.upsert_user(&uid(id), nickname, None).await;
		}
		h
	}

	pub async fn connect(&self, user: &str) -> TestPeer {
		TestPeer::connect(&self.app.registry, user).await
	}
}
