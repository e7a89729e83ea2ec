#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub limits: LimitSettings,
	pub client: ClientSettings,
	pub bootstrap: BootstrapSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for session tokens. A random ephemeral secret is used
	/// when unset, which invalidates sessions across restarts.
	pub session_hmac_secret: Option<String>,
	/// Session token lifetime.
	pub session_ttl_secs: u64,
	/// Liveness sweep interval.
	pub heartbeat_interval_secs: u64,
	/// Connections silent for longer than this are force-closed.
	pub heartbeat_timeout_secs: u64,
	/// Timeout for identity-provider calls.
	pub identity_timeout_secs: u64,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			health_bind: None,
			session_hmac_secret: None,
			session_ttl_secs: 30 * 86_400,
			heartbeat_interval_secs: 60,
			heartbeat_timeout_secs: 300,
			identity_timeout_secs: 10,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Store records in SQLite instead of process memory.
	pub enabled: bool,
	/// Database URL (sqlite:).
	pub database_url: Option<String>,
	/// Persist and index chat messages; annotations require this.
	pub indexer_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct LimitSettings {
	/// Bounded per-channel history length.
	pub max_recent_channel_history: usize,
	/// Chat content is truncated past this many bytes.
	pub max_message_content_length: usize,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			max_recent_channel_history: 100,
			max_message_content_length: 8192,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
	pub base_app_url: String,
	/// Status emoji id -> display text.
	pub status_map: BTreeMap<String, String>,
}

impl Default for ClientSettings {
	fn default() -> Self {
		let mut status_map = BTreeMap::new();
		status_map.insert("large_blue_circle".to_string(), "Available".to_string());
		status_map.insert("red_circle".to_string(), "Do Not Disturb".to_string());
		status_map.insert("hourglass".to_string(), "Away".to_string());
		status_map.insert("desktop_computer".to_string(), "Screen Saver".to_string());

		Self {
			base_app_url: String::new(),
			status_map,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapSettings {
	/// Created at startup if missing; intended for first-run setups.
	pub admin_username: Option<String>,
	pub admin_password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	client: FileClientSettings,

	#[serde(default)]
	bootstrap: FileBootstrapSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	session_hmac_secret: Option<String>,
	session_ttl_secs: Option<u64>,
	heartbeat_interval_secs: Option<u64>,
	heartbeat_timeout_secs: Option<u64>,
	identity_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
	indexer_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	max_recent_channel_history: Option<usize>,
	max_message_content_length: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileClientSettings {
	base_app_url: Option<String>,
	#[serde(default)]
	status_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBootstrapSettings {
	admin_username: Option<String>,
	admin_password: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let limit_defaults = LimitSettings::default();
		let client_defaults = ClientSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				session_hmac_secret: file.server.session_hmac_secret.filter(|s| !s.trim().is_empty()),
				session_ttl_secs: file.server.session_ttl_secs.unwrap_or(defaults.session_ttl_secs),
				heartbeat_interval_secs: file
					.server
					.heartbeat_interval_secs
					.unwrap_or(defaults.heartbeat_interval_secs),
				heartbeat_timeout_secs: file.server.heartbeat_timeout_secs.unwrap_or(defaults.heartbeat_timeout_secs),
				identity_timeout_secs: file.server.identity_timeout_secs.unwrap_or(defaults.identity_timeout_secs),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
				indexer_enabled: file.persistence.indexer_enabled.unwrap_or(false),
			},
			limits: LimitSettings {
				max_recent_channel_history: file
					.limits
					.max_recent_channel_history
					.unwrap_or(limit_defaults.max_recent_channel_history),
				max_message_content_length: file
					.limits
					.max_message_content_length
					.unwrap_or(limit_defaults.max_message_content_length),
			},
			client: ClientSettings {
				base_app_url: file.client.base_app_url.unwrap_or_default(),
				status_map: if file.client.status_map.is_empty() {
					client_defaults.status_map
				} else {
					file.client.status_map
				},
			},
			bootstrap: BootstrapSettings {
				admin_username: file.bootstrap.admin_username.filter(|s| !s.trim().is_empty()),
				admin_password: file.bootstrap.admin_password.filter(|s| !s.trim().is_empty()),
			},
		}
	}
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
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_SESSION_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.session_hmac_secret = Some(v);
			info!("server auth: session_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_SESSION_TTL_SECS")
		&& let Ok(ttl) = v.trim().parse::<u64>()
	{
		cfg.server.session_ttl_secs = ttl;
		info!(ttl, "server auth: session_ttl_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_HEARTBEAT_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.heartbeat_interval_secs = secs;
		info!(secs, "server config: heartbeat_interval_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_HEARTBEAT_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.heartbeat_timeout_secs = secs;
		info!(secs, "server config: heartbeat_timeout_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_INDEXER_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.indexer_enabled = enabled;
		info!(enabled, "persistence: indexer_enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_MAX_HISTORY")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.limits.max_recent_channel_history = max;
		info!(max, "limits: max_recent_channel_history overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_MAX_MESSAGE_CONTENT_LENGTH")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.limits.max_message_content_length = max;
		info!(max, "limits: max_message_content_length overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_BOOTSTRAP_ADMIN_USERNAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bootstrap.admin_username = Some(v);
			info!("bootstrap: admin_username overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_BOOTSTRAP_ADMIN_PASSWORD") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bootstrap.admin_password = Some(v);
			info!("bootstrap: admin_password overridden by env");
		}
	}
}
