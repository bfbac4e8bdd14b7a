#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::server::auth::SessionValidator;
use crate::server::broadcast::Broadcaster;
use crate::server::chat::{ChatService, ChatSettings};
use crate::server::connection::ConnectionSettings;
use crate::server::dispatcher::CloseReason;
use crate::server::health::HealthState;
use crate::server::notify::NotificationComposer;
use crate::server::presence::PresenceTracker;
use crate::server::registry::ConnectionRegistry;
use crate::server::store::ForumStore;

/// Everything a request or connection task needs, shared behind one `Arc`.
pub struct AppState {
	pub registry: Arc<ConnectionRegistry>,
	pub broadcaster: Broadcaster,
	pub presence: PresenceTracker,
	pub notifier: NotificationComposer,
	pub chat: ChatService,
	pub store: Arc<dyn ForumStore>,
	pub sessions: Arc<dyn SessionValidator>,
	pub health: HealthState,
	pub session_cookie: String,
	pub session_tasks: SessionTracker,
	connection: ConnectionSettings,
	shutdown: watch::Sender<bool>,
}

/// Counts live session tasks so shutdown can wait for their final
/// deregister and presence writes, not only for the registry to drain.
#[derive(Debug, Clone)]
pub struct SessionTracker {
	active: Arc<watch::Sender<usize>>,
}

/// Held by one session task; releases its slot on drop.
#[derive(Debug)]
pub struct SessionGuard {
	active: Arc<watch::Sender<usize>>,
}

impl Drop for SessionGuard {
	fn drop(&mut self) {
		self.active.send_modify(|n| *n = n.saturating_sub(1));
	}
}

impl Default for SessionTracker {
	fn default() -> Self {
		let (active, _) = watch::channel(0);
		Self { active: Arc::new(active) }
	}
}

impl SessionTracker {
	pub fn track(&self) -> SessionGuard {
		self.active.send_modify(|n| *n += 1);
		SessionGuard {
			active: Arc::clone(&self.active),
		}
	}

	pub fn active(&self) -> usize {
		*self.active.borrow()
	}

	/// Resolves once every guard has been dropped.
	pub async fn wait_idle(&self) {
		let mut rx = self.active.subscribe();
		// The sender lives in `self`, so this cannot observe a closed channel.
		let _ = rx.wait_for(|n| *n == 0).await;
	}
}

/// Inputs for `AppState::new`.
#[derive(Debug, Clone)]
pub struct AppSettings {
	pub connection: ConnectionSettings,
	pub chat: ChatSettings,
	pub session_cookie: String,
}

impl Default for AppSettings {
	fn default() -> Self {
		Self {
			connection: ConnectionSettings::default(),
			chat: ChatSettings::default(),
			session_cookie: "session_token".to_string(),
		}
	}
}

impl AppState {
	pub fn new(store: Arc<dyn ForumStore>, sessions: Arc<dyn SessionValidator>, settings: AppSettings) -> Arc<Self> {
		let registry = Arc::new(ConnectionRegistry::new());
		let broadcaster = Broadcaster::new(
			Arc::clone(&registry),
			Arc::clone(&store),
			settings.connection.max_outbound_frame_bytes,
		);
		let presence = PresenceTracker::new(Arc::clone(&store), broadcaster.clone());
		let notifier = NotificationComposer::new(Arc::clone(&store), broadcaster.clone());
		let chat = ChatService::new(Arc::clone(&store), broadcaster.clone(), notifier.clone(), settings.chat);
		let (shutdown, _) = watch::channel(false);

		Arc::new(Self {
			registry,
			broadcaster,
			presence,
			notifier,
			chat,
			store,
			sessions,
			health: HealthState::new(),
			session_cookie: settings.session_cookie,
			session_tasks: SessionTracker::default(),
			connection: settings.connection,
			shutdown,
		})
	}

	pub fn connection_settings(&self) -> ConnectionSettings {
		self.connection.clone()
	}

	pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
		self.shutdown.subscribe()
	}

	pub fn is_shutting_down(&self) -> bool {
		*self.shutdown.borrow()
	}

	/// Stop accepting work and close every live connection.
	pub async fn begin_shutdown(&self) {
		if self.shutdown.send_replace(true) {
			return;
		}
		info!("shutdown requested");
		self.registry.close_all(CloseReason::ShuttingDown).await;
	}
}
