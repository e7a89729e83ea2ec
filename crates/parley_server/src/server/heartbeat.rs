#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parley_protocol::{EchoPayload, ServerEvent};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::server::engine::Engine;
use crate::util::time::unix_ms_now;

/// Periodic liveness sweep: evict connections that have gone silent past
/// the timeout window, probe the rest with a fresh correlation id, and
/// fold per-connection byte deltas into the process-wide counters.
pub fn spawn_heartbeat(engine: Arc<Engine>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			ticker.tick().await;
			sweep(&engine, timeout).await;
		}
	})
}

pub async fn sweep(engine: &Arc<Engine>, timeout: Duration) {
	let now_ms = unix_ms_now();
	let timeout_ms = timeout.as_millis() as i64;

	for conn in engine.connections.snapshot_all().await {
		if conn.authenticated {
			let (delta_in, delta_out) = engine.connections.take_traffic_delta(conn.id).await;
			engine.stats.bytes_in.fetch_add(delta_in, Ordering::Relaxed);
			engine.stats.bytes_out.fetch_add(delta_out, Ordering::Relaxed);
			metrics::counter!("parley_bytes_in_total").increment(delta_in);
			metrics::counter!("parley_bytes_out_total").increment(delta_out);
		}

		if now_ms - conn.last_heartbeat_ms >= timeout_ms {
			// silent too long; closing the transport drives the normal
			// deregistration -> detach -> channel-leave cascade
			info!(conn = %conn.id, addr = %conn.addr, "socket ping death, closing");
			engine.connections.force_close(conn.id).await;
		} else {
			let echo_id = engine.ids.next("e");
			engine.connections.set_echo(conn.id, echo_id.clone(), now_ms).await;
			engine
				.dispatcher
				.to_connection(conn.id, &ServerEvent::Echo(EchoPayload { id: echo_id }))
				.await;
		}
	}

	let connection_count = engine.connections.count().await;
	debug!(
		connections = connection_count,
		"heartbeat sweep complete"
	);
}

/// Once-per-second status tick to every authenticated connection.
pub fn spawn_status_tick(engine: Arc<Engine>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut ticker = tokio::time::interval(Duration::from_secs(1));
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			ticker.tick().await;
			engine.tick().await;
		}
	})
}
