#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::Privileges;
use parley_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use parley_server::server::engine::{Engine, EngineConfig};
use parley_server::server::health::{HealthState, spawn_health_server};
use parley_server::server::heartbeat::{spawn_heartbeat, spawn_status_tick};
use parley_server::util::endpoint::WsEndpoint;
use parley_server::ws::run_listener;
use parley_store::{Directory, IdentityProvider, MemoryRecordStore, NullSearchIndex, RecordStore, SqliteRecordStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:18700)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "ws://127.0.0.1:18700".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("parley_server");
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

async fn build_store(cfg: &ServerConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
	if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		info!(%database_url, "using sqlite record store");
		Ok(Arc::new(SqliteRecordStore::connect(database_url).await?))
	} else {
		info!("using in-memory record store (state is lost on restart)");
		Ok(Arc::new(MemoryRecordStore::new()))
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = default_config_path()?;
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = build_store(&server_cfg).await?;

	let secret = match server_cfg.server.session_hmac_secret.clone() {
		Some(secret) => secret,
		None => {
			warn!("no session_hmac_secret configured; sessions will not survive a restart");
			uuid::Uuid::new_v4().to_string()
		}
	};

	let directory = Arc::new(Directory::new(
		Arc::clone(&store),
		secret,
		server_cfg.server.session_ttl_secs,
	));

	if let (Some(username), Some(password)) = (
		server_cfg.bootstrap.admin_username.as_deref(),
		server_cfg.bootstrap.admin_password.as_deref(),
	) {
		let normalized = parley_domain::Username::normalize(username)
			.map_err(|e| anyhow::anyhow!("invalid bootstrap admin username: {e}"))?;
		if directory.get_user(&normalized).await.map(|u| u.is_none()).unwrap_or(false) {
			directory
				.create_user(
					username,
					password,
					username,
					Privileges {
						admin: true,
						manage_emoji: true,
						create_channels: true,
						edit_channels: true,
						delete_channels: true,
					},
				)
				.await
				.map_err(|e| anyhow::anyhow!("bootstrap admin creation failed: {e}"))?;
			info!(username, "bootstrap admin created");
		}
	}

	let identity: Arc<dyn IdentityProvider> = directory.clone();
	let changes = identity.subscribe_changes();

	let engine = Engine::new(
		Arc::clone(&identity),
		Arc::clone(&store),
		Arc::new(NullSearchIndex),
		server_cfg.limits.max_recent_channel_history,
		EngineConfig {
			max_message_content_length: server_cfg.limits.max_message_content_length,
			indexer_enabled: server_cfg.persistence.indexer_enabled,
			identity_timeout: Duration::from_secs(server_cfg.server.identity_timeout_secs),
			base_app_url: server_cfg.client.base_app_url.clone(),
			status_map: server_cfg.client.status_map.clone(),
		},
	);
	engine.load_state().await?;

	tokio::spawn(Arc::clone(&engine).run_user_changes(changes));
	spawn_heartbeat(
		Arc::clone(&engine),
		Duration::from_secs(server_cfg.server.heartbeat_interval_secs),
		Duration::from_secs(server_cfg.server.heartbeat_timeout_secs),
	);
	spawn_status_tick(Arc::clone(&engine));

	let listener = TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "websocket listener ready");
	health_state.mark_ready();

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	{
		let engine = Arc::clone(&engine);
		let health_state = health_state.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				info!("shutdown signal received, draining");
				engine.begin_shutdown();
				health_state.mark_draining();
				let _ = shutdown_tx.send(true);
			}
		});
	}

	run_listener(engine, listener, shutdown_rx).await
}
