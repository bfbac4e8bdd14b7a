#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use forum_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use forum_server::server::auth::{HmacSessions, SessionValidator};
use forum_server::server::http::serve;
use forum_server::server::sqlite_store::SqliteStore;
use forum_server::server::store::{ForumStore, InMemoryStore};
use forum_server::AppState;
use forum_util::endpoint::HttpEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: forum_server [--bind http://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: http://127.0.0.1:8000)\n\
\t          Format: http://host:port\n\
\t--config   Config file (default: ~/.forum/config.toml)\n\
\t--help     Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn resolve_bind(bind: &str) -> SocketAddr {
	let endpoint = HttpEndpoint::parse(bind).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	endpoint.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,forum_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("forum_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

/// Store plus the session validator that goes with the configuration.
async fn build_backends(cfg: &ServerConfig) -> anyhow::Result<(Arc<dyn ForumStore>, Arc<dyn SessionValidator>)> {
	let hmac = cfg
		.auth
		.hmac_secret
		.clone()
		.map(|secret| Arc::new(HmacSessions::new(secret)) as Arc<dyn SessionValidator>);

	if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow!("persistence enabled but no database_url configured"));
		};
		let store = Arc::new(SqliteStore::connect(database_url).await?);
		info!("persistence: sqlite store ready");

		let sweeper = store.as_ref().clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
			loop {
				ticker.tick().await;
				match sweeper.delete_expired_sessions().await {
					Ok(0) => {}
					Ok(n) => info!(removed = n, "expired sessions removed"),
					Err(e) => warn!(error = %e, "session sweep failed"),
				}
			}
		});

		let sessions = hmac.unwrap_or_else(|| Arc::clone(&store) as Arc<dyn SessionValidator>);
		let store: Arc<dyn ForumStore> = store;
		Ok((store, sessions))
	} else {
		warn!("persistence disabled: using in-memory store (data is lost on restart)");
		let store = Arc::new(InMemoryStore::new());
		let sessions = hmac.unwrap_or_else(|| Arc::clone(&store) as Arc<dyn SessionValidator>);
		let store: Arc<dyn ForumStore> = store;
		Ok((store, sessions))
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => default_config_path()?,
	};
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let bind_addr = resolve_bind(args.bind.as_deref().unwrap_or(&server_cfg.server.bind));

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let (store, sessions) = build_backends(&server_cfg).await?;
	// No connection survives a restart, so any stored online flag is stale.
	match store.reset_presence().await {
		Ok(0) => {}
		Ok(n) => info!(users = n, "presence: cleared stale online flags"),
		Err(e) => warn!(error = %e, "presence: failed to clear stale online flags"),
	}
	let app = AppState::new(store, sessions, server_cfg.app_settings());

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;

	let server = tokio::spawn(serve(listener, Arc::clone(&app)));

	tokio::signal::ctrl_c().await.context("install ctrl-c handler")?;
	app.begin_shutdown().await;

	match server.await {
		Ok(result) => result?,
		Err(e) => warn!(error = %e, "http server task failed"),
	}

	// Let every session finish deregistering and persisting its offline state.
	if tokio::time::timeout(SHUTDOWN_GRACE, app.session_tasks.wait_idle()).await.is_err() {
		warn!(active = app.session_tasks.active(), "sessions still running at shutdown deadline");
	}

	info!("forum_server: stopped");
	Ok(())
}
