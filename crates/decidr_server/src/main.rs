#![forbid(unsafe_code)]

mod config;
mod server;

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use decidr_store::{ChatStore, MemoryStore, SqlStore};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::auth::TokenVerifier;
use crate::server::core::ChatCore;
use crate::server::gateway::{GatewaySettings, socket_router};
use crate::server::presence::{PresenceCache, PresenceTtls, RedisPresence};
use crate::server::rest::http_router;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: decidr_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file path (default: ~/.decidr/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,decidr_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let store: Arc<dyn ChatStore> = match cfg.persistence.database_url.as_deref() {
		Some(database_url) => {
			let store = SqlStore::connect(database_url).await?;
			info!("durable store connected");
			Arc::new(store)
		}
		None => {
			warn!("no database_url configured; using an ephemeral in-memory store");
			Arc::new(MemoryStore::new())
		}
	};

	let presence = match cfg.presence.redis_url.as_deref() {
		Some(redis_url) => {
			let backend = RedisPresence::connect(redis_url).await?;
			info!("presence cache connected (redis)");
			PresenceCache::new(Arc::new(backend), PresenceTtls::default())
		}
		None => {
			info!("presence cache: in-process");
			PresenceCache::in_memory()
		}
	};

	let public_key_path = cfg
		.auth
		.public_key_path
		.as_deref()
		.context("auth.public_key_path is required (Ed25519 public key PEM)")?;
	let verifier = Arc::new(TokenVerifier::from_public_key_path(public_key_path)?);

	let settings = GatewaySettings {
		session_queue_capacity: cfg.server.session_queue_capacity,
		rate_limit_per_conn_burst: cfg.server.rate_limit_per_conn_burst,
		rate_limit_per_conn_per_minute: cfg.server.rate_limit_per_conn_per_minute,
		rate_limit_per_group_burst: cfg.server.rate_limit_per_group_burst,
		rate_limit_per_group_per_minute: cfg.server.rate_limit_per_group_per_minute,
	};

	let core = ChatCore::new(store, presence, verifier, settings);

	let socket_listener = TcpListener::bind(&cfg.server.socket_bind)
		.await
		.with_context(|| format!("bind socket listener on {}", cfg.server.socket_bind))?;
	let http_listener = TcpListener::bind(&cfg.server.http_bind)
		.await
		.with_context(|| format!("bind http listener on {}", cfg.server.http_bind))?;

	info!(addr = %cfg.server.socket_bind, "socket gateway listening");
	info!(addr = %cfg.server.http_bind, "http server listening");

	core.health.mark_ready();

	let socket_app = socket_router(core.clone());
	let http_app = http_router(core);

	tokio::select! {
		result = axum::serve(socket_listener, socket_app).into_future() => {
			result.context("socket server exited")?;
		}
		result = axum::serve(http_listener, http_app).into_future() => {
			result.context("http server exited")?;
		}
	}

	Ok(())
}
