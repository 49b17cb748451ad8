#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.decidr/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".decidr").join("config.toml"))
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

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
	pub presence: PresenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Bind address for the socket gateway.
	pub socket_bind: String,
	/// Bind address for the REST surface.
	pub http_bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Bounded outbound queue per session.
	pub session_queue_capacity: usize,
	/// Rate limiting: per-connection burst size.
	pub rate_limit_per_conn_burst: u32,
	/// Rate limiting: per-connection events per minute.
	pub rate_limit_per_conn_per_minute: u32,
	/// Rate limiting: per-group burst size.
	pub rate_limit_per_group_burst: u32,
	/// Rate limiting: per-group events per minute.
	pub rate_limit_per_group_per_minute: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// PEM path of the Ed25519 public key access tokens are verified with.
	pub public_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). Absent means the ephemeral
	/// in-memory store.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceSettings {
	/// Redis URL for the presence cache. Absent means the in-process cache.
	pub redis_url: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			socket_bind: "0.0.0.0:8001".to_string(),
			http_bind: "0.0.0.0:3000".to_string(),
			metrics_bind: None,
			session_queue_capacity: 256,
			rate_limit_per_conn_burst: 0,
			rate_limit_per_conn_per_minute: 0,
			rate_limit_per_group_burst: 0,
			rate_limit_per_group_per_minute: 0,
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
	presence: FilePresenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	socket_bind: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	session_queue_capacity: Option<usize>,
	rate_limit_per_conn_burst: Option<u32>,
	rate_limit_per_conn_per_minute: Option<u32>,
	rate_limit_per_group_burst: Option<u32>,
	rate_limit_per_group_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	public_key_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePresenceSettings {
	redis_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				socket_bind: file
					.server
					.socket_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.socket_bind),
				http_bind: file
					.server
					.http_bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.http_bind),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				session_queue_capacity: file
					.server
					.session_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(defaults.session_queue_capacity),
				rate_limit_per_conn_burst: file.server.rate_limit_per_conn_burst.unwrap_or(0),
				rate_limit_per_conn_per_minute: file.server.rate_limit_per_conn_per_minute.unwrap_or(0),
				rate_limit_per_group_burst: file.server.rate_limit_per_group_burst.unwrap_or(0),
				rate_limit_per_group_per_minute: file.server.rate_limit_per_group_per_minute.unwrap_or(0),
			},
			auth: AuthSettings {
				public_key_path: file
					.auth
					.public_key_path
					.filter(|s| !s.trim().is_empty())
					.map(PathBuf::from),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			presence: PresenceSettings {
				redis_url: file.presence.redis_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("SOCKET_PORT")
		&& let Ok(port) = v.trim().parse::<u16>()
	{
		cfg.server.socket_bind = format!("0.0.0.0:{port}");
		info!(port, "server config: socket port overridden by env");
	}

	if let Ok(v) = std::env::var("HTTP_PORT")
		&& let Ok(port) = v.trim().parse::<u16>()
	{
		cfg.server.http_bind = format!("0.0.0.0:{port}");
		info!(port, "server config: http port overridden by env");
	}

	if let Ok(v) = std::env::var("DECIDR_SOCKET_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.socket_bind = v;
			info!("server config: socket_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DECIDR_HTTP_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.http_bind = v;
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DECIDR_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DECIDR_SESSION_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.session_queue_capacity = capacity;
		info!(capacity, "server config: session_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("DECIDR_RATE_LIMIT_PER_CONN_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.rate_limit_per_conn_burst = burst;
		info!(burst, "server config: rate_limit_per_conn_burst overridden by env");
	}

	if let Ok(v) = std::env::var("DECIDR_RATE_LIMIT_PER_CONN_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.rate_limit_per_conn_per_minute = rate;
		info!(rate, "server config: rate_limit_per_conn_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("DECIDR_RATE_LIMIT_PER_GROUP_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.rate_limit_per_group_burst = burst;
		info!(burst, "server config: rate_limit_per_group_burst overridden by env");
	}

	if let Ok(v) = std::env::var("DECIDR_RATE_LIMIT_PER_GROUP_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.rate_limit_per_group_per_minute = rate;
		info!(rate, "server config: rate_limit_per_group_per_minute overridden by env");
	}

	if let Ok(v) = std::env::var("DECIDR_ACCESS_PUBLIC_KEY_PATH") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.public_key_path = Some(PathBuf::from(v));
			info!("auth config: public_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DECIDR_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("DECIDR_REDIS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.presence.redis_url = Some(v);
			info!("presence config: redis_url overridden by env");
		}
	}
}
