#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use forum_protocol::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_OUTBOUND_FRAME_SIZE};
use forum_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::chat::ChatSettings;
use crate::server::connection::ConnectionSettings;
use crate::server::state::AppSettings;

pub const DEFAULT_BIND: &str = "http://127.0.0.1:8000";
pub const DEFAULT_SESSION_COOKIE: &str = "session_token";

/// Default config path: `~/.forum/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".forum").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
	pub realtime: RealtimeSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP bind endpoint (`http://host:port`).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// When set, sessions are stateless HMAC tokens instead of store rows.
	pub hmac_secret: Option<SecretString>,
	pub session_cookie: String,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			hmac_secret: None,
			session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// Database URL (sqlite: only).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
	pub write_timeout: Duration,
	pub max_frame_bytes: usize,
	pub max_outbound_frame_bytes: usize,
	pub max_message_chars: usize,
	pub chat_rate_limit_burst: u32,
	pub chat_rate_limit_per_minute: u32,
	pub history_default_limit: u32,
	pub history_max_limit: u32,
}

impl Default for RealtimeSettings {
	fn default() -> Self {
		let conn = ConnectionSettings::default();
		let chat = ChatSettings::default();
		Self {
			write_timeout: conn.write_timeout,
			max_frame_bytes: conn.max_frame_bytes,
			max_outbound_frame_bytes: conn.max_outbound_frame_bytes,
			max_message_chars: chat.max_message_chars,
			chat_rate_limit_burst: conn.chat_rate_limit_burst,
			chat_rate_limit_per_minute: conn.chat_rate_limit_per_minute,
			history_default_limit: chat.history_default_limit,
			history_max_limit: chat.history_max_limit,
		}
	}
}

impl ServerConfig {
	pub fn app_settings(&self) -> AppSettings {
		let rt = &self.realtime;
		AppSettings {
			connection: ConnectionSettings {
				max_frame_bytes: rt.max_frame_bytes,
				max_outbound_frame_bytes: rt.max_outbound_frame_bytes,
				write_timeout: rt.write_timeout,
				chat_rate_limit_burst: rt.chat_rate_limit_burst,
				chat_rate_limit_per_minute: rt.chat_rate_limit_per_minute,
			},
			chat: ChatSettings {
				max_message_chars: rt.max_message_chars,
				history_default_limit: rt.history_default_limit,
				history_max_limit: rt.history_max_limit,
			},
			session_cookie: self.auth.session_cookie.clone(),
		}
	}

	fn from_file(file: FileConfig) -> Self {
		let defaults = RealtimeSettings::default();
		let rt = file.realtime;

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_BIND.to_string()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			auth: AuthSettings {
				hmac_secret: file.auth.hmac_secret.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				session_cookie: file
					.auth
					.session_cookie
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string()),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			realtime: RealtimeSettings {
				write_timeout: rt
					.write_timeout_ms
					.filter(|ms| *ms > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.write_timeout),
				max_frame_bytes: rt
					.max_frame_bytes
					.filter(|n| *n > 0)
					.unwrap_or(DEFAULT_MAX_FRAME_SIZE),
				max_outbound_frame_bytes: rt
					.max_outbound_frame_bytes
					.filter(|n| *n > 0)
					.unwrap_or(DEFAULT_MAX_OUTBOUND_FRAME_SIZE),
				max_message_chars: rt
					.max_message_chars
					.filter(|n| *n > 0)
					.unwrap_or(defaults.max_message_chars),
				chat_rate_limit_burst: rt.chat_rate_limit_burst.unwrap_or(defaults.chat_rate_limit_burst),
				chat_rate_limit_per_minute: rt
					.chat_rate_limit_per_minute
					.unwrap_or(defaults.chat_rate_limit_per_minute),
				history_default_limit: rt
					.history_default_limit
					.filter(|n| *n > 0)
					.unwrap_or(defaults.history_default_limit),
				history_max_limit: rt
					.history_max_limit
					.filter(|n| *n > 0)
					.unwrap_or(defaults.history_max_limit),
			},
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	realtime: FileRealtimeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
	session_cookie: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRealtimeSettings {
	write_timeout_ms: Option<u64>,
	max_frame_bytes: Option<usize>,
	max_outbound_frame_bytes: Option<usize>,
	max_message_chars: Option<usize>,
	chat_rate_limit_burst: Option<u32>,
	chat_rate_limit_per_minute: Option<u32>,
	history_default_limit: Option<u32>,
	history_max_limit: Option<u32>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("FORUM_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("FORUM_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("FORUM_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("server auth: hmac_secret overridden by env");
	}

	if let Some(v) = env_string("FORUM_SESSION_COOKIE") {
		cfg.auth.session_cookie = v;
		info!("server auth: session_cookie overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("FORUM_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_WRITE_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
		&& ms > 0
	{
		cfg.realtime.write_timeout = Duration::from_millis(ms);
		info!(ms, "realtime: write_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.realtime.max_frame_bytes = bytes;
		info!(bytes, "realtime: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_MAX_OUTBOUND_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.realtime.max_outbound_frame_bytes = bytes;
		info!(bytes, "realtime: max_outbound_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_MAX_MESSAGE_CHARS")
		&& let Ok(chars) = v.trim().parse::<usize>()
		&& chars > 0
	{
		cfg.realtime.max_message_chars = chars;
		info!(chars, "realtime: max_message_chars overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_CHAT_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.realtime.chat_rate_limit_burst = burst;
		info!(burst, "realtime: chat_rate_limit_burst overridden by env");
	}

	if let Ok(v) = std::env::var("FORUM_CHAT_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.realtime.chat_rate_limit_per_minute = rate;
		info!(rate, "realtime: chat_rate_limit_per_minute overridden by env");
	}

	if cfg.realtime.history_default_limit > cfg.realtime.history_max_limit {
		warn!(
			default = cfg.realtime.history_default_limit,
			max = cfg.realtime.history_max_limit,
			"realtime: history_default_limit > history_max_limit; clamping"
		);
		cfg.realtime.history_default_limit = cfg.realtime.history_max_limit;
	}

	if cfg.persistence.enabled && cfg.persistence.database_url.is_none() {
		warn!("persistence enabled but no database_url configured");
	}
}
