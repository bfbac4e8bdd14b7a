#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use forum_protocol::{Event, NewUserInfo};
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::server::broadcast::BroadcastReport;
use crate::server::connection::run_session;
use crate::server::presence::PresenceBroadcast;
use crate::server::store::ForumStore;
use crate::server::test_support::{Harness, TestPeer, uid};

type ClientWs = WebSocketStream<DuplexStream>;

/// Start `run_session` for `user` over an in-memory pipe and return the client end.
async fn open_session(h: &Harness, user: &str) -> (ClientWs, JoinHandle<()>) {
	let (client_io, server_io) = tokio::io::duplex(64 * 1024);
	let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
	let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

	let app = Arc::clone(&h.app);
	let conn_id = app.registry.next_connection_id();
	let task = tokio::spawn(run_session(app, conn_id, uid(user), server_ws));
	(client_ws, task)
}

async fn wait_for_registration(h: &Harness, user: &str) {
	timeout(Duration::from_secs(1), async {
		while h.app.registry.lookup(&uid(user)).await.is_none() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("session registered");
}

fn status_events(events: &[Event], user: &str, online: bool) -> usize {
	events
		.iter()
		.filter(|e| {
			matches!(e, Event::PresenceChanged { user_id, is_online } if user_id.as_str() == user && *is_online == online)
		})
		.count()
}

/// Run a transition that is expected to apply and wait for its broadcast.
async fn settle(transition: Option<PresenceBroadcast>) -> BroadcastReport {
	transition
		.expect("transition applied")
		.await
		.expect("broadcast task")
		.expect("broadcast")
}

async fn is_online(h: &Harness, user: &str) -> bool {
	h.store
		.user_profile(&uid(user))
		.await
		.unwrap()
		.expect("seeded user")
		.is_online
}

#[tokio::test]
async fn going_online_persists_and_broadcasts_then_lists() {
	let h = Harness::with_users(&[("a", "Ann"), ("b", "Ben")]).await;
	let _a = h.connect("a").await;
	let mut b = h.connect("b").await;

	let report = settle(h.app.presence.went_online(&uid("a")).await).await;
	assert_eq!(report.delivered, 2);
	assert!(is_online(&h, "a").await);

	assert_eq!(
		b.next_event().await,
		Event::PresenceChanged {
			user_id: uid("a"),
			is_online: true,
		}
	);
	match b.next_event().await {
		Event::UsersListSnapshot { users } => {
			let ann = users.iter().find(|u| u.id == uid("a")).expect("ann listed");
			assert!(ann.is_online);
			assert_eq!(ann.nickname, "Ann");
		}
		other => panic!("expected users_list, got {other:?}"),
	}
}

#[tokio::test]
async fn going_offline_clears_the_flag() {
	let h = Harness::with_users(&[("a", "Ann"), ("b", "Ben")]).await;
	let a = h.connect("a").await;
	let mut b = h.connect("b").await;

	settle(h.app.presence.went_online(&uid("a")).await).await;
	assert!(h.app.registry.deregister(&a.handle).await);
	settle(h.app.presence.went_offline(&uid("a")).await).await;
	assert!(!is_online(&h, "a").await);

	let events = b.drain_events().await;
	assert_eq!(status_events(&events, "a", true), 1);
	assert_eq!(status_events(&events, "a", false), 1);
}

#[tokio::test]
async fn presence_still_broadcasts_when_the_store_is_down() {
	let h = Harness::with_users(&[("a", "Ann")]).await;
	let mut watcher = h.connect("watcher").await;
	let _a = h.connect("a").await;
	h.store.set_fail_writes(true);

	settle(h.app.presence.went_online(&uid("a")).await).await;
	assert_eq!(watcher.next_event_of("user_status").await.kind(), "user_status");
	assert!(!is_online(&h, "a").await);
}

#[tokio::test]
async fn announce_new_user_reaches_everyone() {
	let h = Harness::new();
	let mut watcher = h.connect("watcher").await;

	h.app
		.presence
		.announce_new_user(&uid("newbie"), "Newbie")
		.await
		.expect("broadcast task")
		.expect("broadcast");
	match watcher.next_event().await {
		Event::NewUser { user } => {
			assert_eq!(user.id, uid("newbie"));
			assert_eq!(user.nickname, "Newbie");
			assert!(user.is_online);
		}
		other => panic!("expected new_user, got {other:?}"),
	}
}

#[tokio::test]
async fn late_offline_from_a_replaced_session_is_ignored() {
	let h = Harness::with_users(&[("a", "Ann")]).await;
	let mut watcher = h.connect("watcher").await;

	let old = h.connect("a").await;
	settle(h.app.presence.went_online(&uid("a")).await).await;

	// The old session deregisters, then the user reconnects and goes online
	// before the old session gets to its offline transition.
	assert!(h.app.registry.deregister(&old.handle).await);
	let _new = h.connect("a").await;
	settle(h.app.presence.went_online(&uid("a")).await).await;

	assert!(h.app.presence.went_offline(&uid("a")).await.is_none());
	assert!(is_online(&h, "a").await);

	let events = watcher.drain_events().await;
	assert_eq!(status_events(&events, "a", true), 2);
	assert_eq!(status_events(&events, "a", false), 0);
}

#[tokio::test]
async fn offline_that_lands_before_the_reconnect_online_is_overtaken() {
	let h = Harness::with_users(&[("a", "Ann")]).await;
	let mut watcher = h.connect("watcher").await;

	let old = h.connect("a").await;
	settle(h.app.presence.went_online(&uid("a")).await).await;
	assert!(h.app.registry.deregister(&old.handle).await);

	settle(h.app.presence.went_offline(&uid("a")).await).await;
	assert!(!is_online(&h, "a").await);
	let _new = h.connect("a").await;
	settle(h.app.presence.went_online(&uid("a")).await).await;

	assert!(is_online(&h, "a").await);
	let events = watcher.drain_events().await;
	assert_eq!(status_events(&events, "a", false), 1);
	assert_eq!(status_events(&events, "a", true), 2);
	assert!(matches!(
		events.iter().rev().find(|e| e.kind() == "user_status"),
		Some(Event::PresenceChanged { is_online: true, .. })
	));
}

#[tokio::test]
async fn online_for_a_user_that_already_left_is_skipped() {
	let h = Harness::with_users(&[("a", "Ann")]).await;
	let mut watcher = h.connect("watcher").await;

	assert!(h.app.presence.went_online(&uid("a")).await.is_none());
	assert!(!is_online(&h, "a").await);
	watcher.expect_silence().await;
}

#[tokio::test]
async fn session_lifecycle_goes_online_chats_and_goes_offline_once() {
	let h = Harness::with_users(&[("a", "Ann"), ("watcher", "Wat")]).await;
	let mut watcher = h.connect("watcher").await;

	let (mut client, task) = open_session(&h, "a").await;
	wait_for_registration(&h, "a").await;
	assert_eq!(
		watcher.next_event_of("user_status").await,
		Event::PresenceChanged {
			user_id: uid("a"),
			is_online: true,
		}
	);
	assert!(is_online(&h, "a").await);

	// Junk and unknown frames are skipped without dropping the connection.
	client.send(Message::text("not json")).await.unwrap();
	client.send(Message::text(r#"{"type":"wave","sender":"a"}"#)).await.unwrap();
	client
		.send(Message::text(
			r#"{"type":"message","message":{"sender":"a","recipient":"watcher","content":"hi"}}"#,
		))
		.await
		.unwrap();

	match watcher.next_event_of("message").await {
		Event::NewMessage { message } => {
			assert_eq!(message.sender, uid("a"));
			assert_eq!(message.content, "hi");
		}
		other => panic!("unexpected event {other:?}"),
	}

	client.close(None).await.unwrap();
	timeout(Duration::from_secs(2), task)
		.await
		.expect("session ends after close")
		.expect("session task");

	assert!(h.app.registry.lookup(&uid("a")).await.is_none());
	assert!(!is_online(&h, "a").await);

	let events = watcher.drain_events().await;
	assert_eq!(status_events(&events, "a", false), 1);
	assert_eq!(status_events(&events, "a", true), 0);
}

#[tokio::test]
async fn replaced_session_ends_without_an_offline_transition() {
	let h = Harness::with_users(&[("a", "Ann"), ("watcher", "Wat")]).await;
	let mut watcher = h.connect("watcher").await;

	let (mut first, first_task) = open_session(&h, "a").await;
	wait_for_registration(&h, "a").await;
	let first_id = h.app.registry.lookup(&uid("a")).await.expect("first").id();

	let (_second, _second_task) = open_session(&h, "a").await;
	timeout(Duration::from_secs(1), async {
		while h.app.registry.lookup(&uid("a")).await.map(|c| c.id()) == Some(first_id) {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("second session registered");

	// The old client is told why it was dropped.
	let close = timeout(Duration::from_secs(1), async {
		loop {
			match first.next().await {
				Some(Ok(Message::Close(frame))) => return frame,
				Some(Ok(_)) => continue,
				other => panic!("expected close frame, got {other:?}"),
			}
		}
	})
	.await
	.expect("close frame");
	assert_eq!(close.map(|f| f.code), Some(CloseCode::Policy));

	timeout(Duration::from_secs(2), first_task)
		.await
		.expect("replaced session ends")
		.expect("session task");

	let current = h.app.registry.lookup(&uid("a")).await.expect("second stays registered");
	assert_ne!(current.id(), first_id);
	assert!(is_online(&h, "a").await);

	let events = watcher.drain_events().await;
	assert_eq!(status_events(&events, "a", false), 0);
}

#[tokio::test]
async fn shutdown_closes_every_session() {
	let h = Harness::with_users(&[("a", "Ann")]).await;
	let (_client, task) = open_session(&h, "a").await;
	wait_for_registration(&h, "a").await;

	assert!(is_online(&h, "a").await);
	assert_eq!(h.app.session_tasks.active(), 1);

	h.app.begin_shutdown().await;
	timeout(Duration::from_secs(2), h.app.session_tasks.wait_idle())
		.await
		.expect("sessions finish on shutdown");

	// Once the tracker is idle the offline write has already landed.
	assert_eq!(h.app.session_tasks.active(), 0);
	assert!(h.app.registry.is_empty().await);
	assert!(!is_online(&h, "a").await);
	timeout(Duration::from_secs(1), task)
		.await
		.expect("session task ends")
		.expect("session task");
}

#[tokio::test]
async fn dead_peer_detected_on_broadcast_is_deregistered() {
	let h = Harness::new();
	let mut dead = TestPeer::connect(&h.app.registry, "ghost").await;
	dead.kill();

	let event = Event::NewUser {
		user: NewUserInfo {
			id: uid("x"),
			nickname: "x".to_string(),
			is_online: false,
		},
	};
	let report = h.app.broadcaster.broadcast_now(&event).await.expect("encodes");
	assert_eq!(report.failed, 1);
	assert!(dead.handle.is_closed());

	// The read loop owns deregistration; emulate it here.
	assert!(h.app.registry.deregister(&dead.handle).await);
	assert!(h.app.registry.is_empty().await);
}
