#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use forum_domain::UserId;
use forum_util::secret::SecretString;
use hmac::{Hmac, Mac};
use hyper::HeaderMap;
use hyper::header::{AUTHORIZATION, COOKIE};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::server::sqlite_store::SqliteStore;
use crate::server::store::{InMemoryStore, StoreError};
use crate::util::time::now_ms_precision;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("no session token")]
	Missing,

	#[error("invalid session token: {0}")]
	Invalid(&'static str),

	#[error("session expired")]
	Expired,

	#[error("session backend error: {0}")]
	Backend(#[from] StoreError),
}

/// Resolves an opaque session token to the authenticated user.
#[async_trait::async_trait]
pub trait SessionValidator: Send + Sync {
	async fn validate_session(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Stateless `v1.<payload>.<signature>` tokens signed with a shared secret.
#[derive(Debug, Clone)]
pub struct HmacSessions {
	secret: SecretString,
}

impl HmacSessions {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	/// Mint a token for `sub` that expires at `exp` (Unix seconds).
	pub fn mint(&self, sub: &UserId, exp: u64) -> Result<String, AuthError> {
		let claims = AuthClaims {
			sub: sub.to_string(),
			exp,
		};
		let payload = serde_json::to_vec(&claims).map_err(|_| AuthError::Invalid("unencodable claims"))?;
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes())?;
		Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
	}

	pub fn verify(&self, token: &str) -> Result<AuthClaims, AuthError> {
		verify_hmac_token(token, self.secret.expose())
	}
}

#[async_trait::async_trait]
impl SessionValidator for HmacSessions {
	async fn validate_session(&self, token: &str) -> Result<UserId, AuthError> {
		let claims = self.verify(token)?;
		UserId::new(claims.sub).map_err(|_| AuthError::Invalid("bad subject"))
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Invalid("format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|_| AuthError::Invalid("payload encoding"))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|_| AuthError::Invalid("signature encoding"))?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::Invalid("signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| AuthError::Invalid("claims"))?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Result<Vec<u8>, AuthError> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| AuthError::Invalid("hmac key"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[async_trait::async_trait]
impl SessionValidator for InMemoryStore {
	async fn validate_session(&self, token: &str) -> Result<UserId, AuthError> {
		let (user, expires_at) = self.session_owner(token).await.ok_or(AuthError::Invalid("unknown session"))?;
		if expires_at <= now_ms_precision() {
			return Err(AuthError::Expired);
		}
		Ok(user)
	}
}

#[async_trait::async_trait]
impl SessionValidator for SqliteStore {
	async fn validate_session(&self, token: &str) -> Result<UserId, AuthError> {
		let owner = self
			.live_session_owner(token)
			.await?
			.ok_or(AuthError::Invalid("unknown or expired session"))?;
		UserId::new(owner).map_err(|_| AuthError::Invalid("bad session owner"))
	}
}

/// Find the session token on an upgrade or API request: the session cookie
/// first, then `?token=`, then `Authorization: Bearer`.
pub fn extract_session_token(headers: &HeaderMap, query: Option<&str>, cookie_name: &str) -> Option<String> {
	let from_cookie = headers
		.get_all(COOKIE)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(';'))
		.filter_map(|pair| pair.trim().split_once('='))
		.find(|(name, _)| *name == cookie_name)
		.map(|(_, value)| value.trim().to_string());

	let from_query = || {
		query.and_then(|q| {
			url::form_urlencoded::parse(q.as_bytes())
				.find(|(k, _)| k == "token")
				.map(|(_, v)| v.into_owned())
		})
	};

	let from_bearer = || {
		headers
			.get(AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.strip_prefix("Bearer "))
			.map(|v| v.trim().to_string())
	};

	from_cookie
		.or_else(from_query)
		.or_else(from_bearer)
		.filter(|t| !t.is_empty())
}
