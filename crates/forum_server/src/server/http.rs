#![forbid(unsafe_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use forum_domain::{NotificationKind, UserId};
use forum_protocol::OutgoingChatMessage;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{
	CONNECTION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
	SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, info, warn};

use crate::server::auth::{AuthError, extract_session_token};
use crate::server::chat::ChatError;
use crate::server::connection::run_session;
use crate::server::state::AppState;
use crate::server::store::StoreError;

type Body = Full<Bytes>;

const MAX_JSON_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ApiError {
	#[error("not found")]
	NotFound,

	#[error("method not allowed")]
	MethodNotAllowed,

	#[error("bad request: {0}")]
	BadRequest(String),

	#[error(transparent)]
	Unauthorized(#[from] AuthError),

	#[error("forbidden: {0}")]
	Forbidden(&'static str),

	#[error(transparent)]
	Chat(#[from] ChatError),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error("service unavailable")]
	Unavailable,
}

impl ApiError {
	pub fn status(&self) -> StatusCode {
		match self {
			ApiError::NotFound => StatusCode::NOT_FOUND,
			ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
			ApiError::Unauthorized(AuthError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
			ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
			ApiError::Chat(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
			ApiError::Chat(_) | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
			ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
		}
	}

	fn into_response(self) -> Response<Body> {
		let status = self.status();
		let message = if status.is_server_error() {
			warn!(error = %self, "request failed");
			status.canonical_reason().unwrap_or("internal error").to_string()
		} else {
			self.to_string()
		};
		json_response(status, &json!({ "error": message }))
	}
}

/// Accept HTTP connections until shutdown is signalled.
pub async fn serve(listener: TcpListener, app: Arc<AppState>) -> anyhow::Result<()> {
	let mut shutdown = app.shutdown_signal();
	app.health.mark_ready();
	if let Ok(addr) = listener.local_addr() {
		info!(%addr, "http server listening");
	}

	loop {
		let (stream, remote) = tokio::select! {
			_ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
			accepted = listener.accept() => match accepted {
				Ok(accepted) => accepted,
				Err(e) => {
					warn!(error = %e, "accept failed");
					tokio::time::sleep(Duration::from_millis(50)).await;
					continue;
				}
			},
		};

		let io = TokioIo::new(stream);
		let app = Arc::clone(&app);
		tokio::spawn(async move {
			let service = service_fn(move |req| route(req, Arc::clone(&app)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
				debug!(%remote, error = %err, "http connection error");
			}
		});
	}

	app.health.mark_not_ready();
	info!("http server stopped accepting");
	Ok(())
}

async fn route(req: Request<Incoming>, app: Arc<AppState>) -> Result<Response<Body>, Infallible> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	let result = match (&method, path.as_str()) {
		(&Method::GET, "/healthz") => Ok(text_response(StatusCode::OK, "ok")),
		(&Method::GET, "/readyz") => Ok(if app.health.is_ready() {
			text_response(StatusCode::OK, "ready")
		} else {
			text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
		}),
		(&Method::GET, "/ws") => upgrade_websocket(req, &app).await,
		(&Method::POST, "/api/chat/send") => send_message(req, &app).await,
		(&Method::POST, "/api/chat/read") => mark_read(req, &app).await,
		(&Method::GET, "/api/chat/history") => chat_history(req, &app).await,
		(&Method::POST, "/api/users/refresh") => refresh_users(req, &app).await,
		(&Method::POST, "/api/users/announce") => announce_user(req, &app).await,
		(&Method::POST, "/api/notifications") => create_notification(req, &app).await,
		(&Method::GET, "/api/notifications/count") => notification_count(req, &app).await,
		(
			_,
			"/healthz" | "/readyz" | "/ws" | "/api/chat/send" | "/api/chat/read" | "/api/chat/history"
			| "/api/users/refresh" | "/api/users/announce" | "/api/notifications" | "/api/notifications/count",
		) => Err(ApiError::MethodNotAllowed),
		_ => Err(ApiError::NotFound),
	};

	Ok(result.unwrap_or_else(ApiError::into_response))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Body> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
	match serde_json::to_vec(value) {
		Ok(bytes) => {
			let mut resp = Response::new(Full::new(Bytes::from(bytes)));
			*resp.status_mut() = status;
			resp.headers_mut()
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
			resp
		}
		Err(e) => {
			warn!(error = %e, "failed to encode response body");
			text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
		}
	}
}

async fn authenticate(req: &Request<Incoming>, app: &AppState) -> Result<UserId, ApiError> {
	let token =
		extract_session_token(req.headers(), req.uri().query(), &app.session_cookie).ok_or(AuthError::Missing)?;
	Ok(app.sessions.validate_session(&token).await?)
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, ApiError> {
	let body = Limited::new(req.into_body(), MAX_JSON_BODY_BYTES)
		.collect()
		.await
		.map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?
		.to_bytes();
	serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid json: {e}")))
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
	headers
		.get_all(name)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Authenticate, then answer `101 Switching Protocols` and hand the upgraded
/// socket to a session task. Failed auth never reaches the registry.
async fn upgrade_websocket(mut req: Request<Incoming>, app: &Arc<AppState>) -> Result<Response<Body>, ApiError> {
	if app.is_shutting_down() {
		return Err(ApiError::Unavailable);
	}

	let headers = req.headers();
	if !header_has_token(headers, CONNECTION, "upgrade") || !header_has_token(headers, UPGRADE, "websocket") {
		return Err(ApiError::BadRequest("expected a websocket upgrade".to_string()));
	}
	if headers.get(SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes) != Some(b"13".as_slice()) {
		return Err(ApiError::BadRequest("unsupported websocket version".to_string()));
	}
	let accept = headers
		.get(SEC_WEBSOCKET_KEY)
		.map(|key| derive_accept_key(key.as_bytes()))
		.ok_or_else(|| ApiError::BadRequest("missing sec-websocket-key".to_string()))?;
	let accept = HeaderValue::from_str(&accept).map_err(|_| ApiError::BadRequest("bad websocket key".to_string()))?;

	let user_id = authenticate(&req, app).await.inspect_err(|e| {
		debug!(error = %e, "websocket upgrade rejected");
	})?;

	let conn_id = app.registry.next_connection_id();
	let on_upgrade = hyper::upgrade::on(&mut req);
	// Covers the gap between the 101 and the session loop starting.
	let pending = app.session_tasks.track();
	let app = Arc::clone(app);
	tokio::spawn(async move {
		let _pending = pending;
		match on_upgrade.await {
			Ok(upgraded) => {
				let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
				run_session(app, conn_id, user_id, ws).await;
			}
			Err(e) => warn!(conn_id = %conn_id, error = %e, "websocket upgrade failed"),
		}
	});

	let mut resp = Response::new(Full::new(Bytes::new()));
	*resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
	let h = resp.headers_mut();
	h.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
	h.insert(UPGRADE, HeaderValue::from_static("websocket"));
	h.insert(SEC_WEBSOCKET_ACCEPT, accept);
	Ok(resp)
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
	sender_id: String,
	receiver_id: String,
	content: String,
	#[serde(default)]
	timestamp: Option<String>,
}

async fn send_message(req: Request<Incoming>, app: &AppState) -> Result<Response<Body>, ApiError> {
	let user_id = authenticate(&req, app).await?;
	let body: SendMessageRequest = read_json(req).await?;
	if body.sender_id != user_id.as_str() {
		return Err(ApiError::Forbidden("sender_id does not match session"));
	}

	let message = OutgoingChatMessage {
		sender: body.sender_id,
		recipient: body.receiver_id,
		content: body.content,
		timestamp: body.timestamp,
	};
	let record = app.chat.send_message(&user_id, &message).await?;
	Ok(json_response(StatusCode::OK, &json!({ "success": true, "message": record })))
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
	sender_id: String,
	receiver_id: String,
}

async fn mark_read(req: Request<Incoming>, app: &AppState) -> Result<Response<Body>, ApiError> {
	let user_id = authenticate(&req, app).await?;
	let body: MarkReadRequest = read_json(req).await?;
	if body.receiver_id != user_id.as_str() {
		return Err(ApiError::Forbidden("only the recipient can mark messages read"));
	}
	let sender = UserId::new(body.sender_id).map_err(|e| ApiError::BadRequest(format!("sender_id: {e}")))?;

	let changed = app.chat.mark_read(&sender, &user_id).await?;
	Ok(json_response(
		StatusCode::OK,
		&json!({ "success": true, "rowsAffected": changed }),
	))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
	query.and_then(|q| {
		url::form_urlencoded::parse(q.as_bytes())
			.find(|(k, _)| k == name)
			.map(|(_, v)| v.into_owned())
	})
}

fn parse_u32_param(query: Option<&str>, name: &str) -> Result<Option<u32>, ApiError> {
	query_param(query, name)
		.map(|v| {
			v.trim()
				.parse::<u32>()
				.map_err(|_| ApiError::BadRequest(format!("{name} must be a positive integer")))
		})
		.transpose()
}

async fn chat_history(req: Request<Incoming>, app: &AppState) -> Result<Response<Body>, ApiError> {
	let user_id = authenticate(&req, app).await?;
	let query = req.uri().query();

	let user1 = query_param(query, "user1").ok_or_else(|| ApiError::BadRequest("user1 is required".to_string()))?;
	let user2 = query_param(query, "user2").ok_or_else(|| ApiError::BadRequest("user2 is required".to_string()))?;
	let user1 = UserId::new(user1).map_err(|e| ApiError::BadRequest(format!("user1: {e}")))?;
	let user2 = UserId::new(user2).map_err(|e| ApiError::BadRequest(format!("user2: {e}")))?;
	if user_id != user1 && user_id != user2 {
		return Err(ApiError::Forbidden("not a participant in this conversation"));
	}

	let page = parse_u32_param(query, "page")?;
	let limit = parse_u32_param(query, "limit")?;
	let messages = app.chat.history(&user1, &user2, page, limit).await?;
	Ok(json_response(StatusCode::OK, &messages))
}

async fn refresh_users(req: Request<Incoming>, app: &AppState) -> Result<Response<Body>, ApiError> {
	authenticate(&req, app).await?;
	app.broadcaster.refresh_users_list();
	Ok(json_response(StatusCode::OK, &json!({ "success": true })))
}

/// Announce the session user to everyone. Called once by the client right
/// after sign-up, when the account row already exists.
async fn announce_user(req: Request<Incoming>, app: &AppState) -> Result<Response<Body>, ApiError> {
	let user_id = authenticate(&req, app).await?;
	let profile = app.store.user_profile(&user_id).await?.ok_or(ApiError::NotFound)?;
	app.presence.announce_new_user(&user_id, &profile.nickname);
	Ok(json_response(StatusCode::OK, &json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
struct CreateNotificationRequest {
	receiver_id: String,
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	post_id: Option<i64>,
}

/// Record a post reaction or comment by the session user and notify the
/// post's author.
async fn create_notification(req: Request<Incoming>, app: &AppState) -> Result<Response<Body>, ApiError> {
	let actor = authenticate(&req, app).await?;
	let body: CreateNotificationRequest = read_json(req).await?;
	let recipient = UserId::new(body.receiver_id).map_err(|e| ApiError::BadRequest(format!("receiver_id: {e}")))?;
	let kind: NotificationKind = body
		.kind
		.parse()
		.map_err(|e| ApiError::BadRequest(format!("type: {e}")))?;
	if kind.is_post_related() && body.post_id.is_none() {
		return Err(ApiError::BadRequest(format!("post_id is required for {kind} notifications")));
	}
	if recipient == actor {
		return Ok(json_response(StatusCode::OK, &json!({ "success": true, "skipped": true })));
	}

	let outcome = app.notifier.notify(&recipient, &actor, kind, body.post_id).await?;
	Ok(json_response(
		StatusCode::OK,
		&json!({ "success": true, "id": outcome.id, "unreadCount": outcome.unread_count }),
	))
}

async fn notification_count(req: Request<Incoming>, app: &AppState) -> Result<Response<Body>, ApiError> {
	let user_id = authenticate(&req, app).await?;
	let count = app.notifier.unread_count(&user_id).await?;
	Ok(json_response(StatusCode::OK, &json!({ "count": count })))
}
