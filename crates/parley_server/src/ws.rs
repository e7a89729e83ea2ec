#![forbid(unsafe_code)]

//! WebSocket listener and per-connection transport tasks. The reader
//! feeds frames into the engine; the writer drains the connection's
//! outbound queue so per-connection send order is preserved and a slow
//! socket never blocks a command handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::connections::{Outbound, TrafficCounters};
use crate::server::engine::Engine;
use crate::util::time::unix_ms_now;

/// Accept loop. Returns when the shutdown signal fires; connections
/// already accepted keep running and drain through the heartbeat sweep.
pub async fn run_listener(
	engine: Arc<Engine>,
	listener: TcpListener,
	mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, addr)) => {
						metrics::counter!("parley_connections_total").increment(1);
						let engine = Arc::clone(&engine);
						tokio::spawn(handle_socket(engine, stream, addr));
					}
					Err(e) => warn!(error = %e, "accept failed"),
				}
			}
			_ = shutdown.changed() => {
				info!("listener closing, no new connections accepted");
				return Ok(());
			}
		}
	}
}

pub async fn handle_socket(engine: Arc<Engine>, stream: TcpStream, addr: SocketAddr) {
	let ws = match tokio_tungstenite::accept_async(stream).await {
		Ok(ws) => ws,
		Err(e) => {
			warn!(remote = %addr, error = %e, "websocket handshake failed");
			return;
		}
	};

	let (mut sink, mut source) = ws.split();
	let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
	let traffic = Arc::new(TrafficCounters::default());

	let conn_id = engine
		.connections
		.register(addr.to_string(), tx, Arc::clone(&traffic), unix_ms_now())
		.await;
	info!(conn = %conn_id, remote = %addr, "new websocket client connected");

	let writer_traffic = Arc::clone(&traffic);
	let writer = tokio::spawn(async move {
		while let Some(item) = rx.recv().await {
			match item {
				Outbound::Event(event) => {
					let text = event.encode();
					writer_traffic.bytes_out.fetch_add(text.len() as u64, Ordering::Relaxed);
					if sink.send(Message::Text(text.into())).await.is_err() {
						break;
					}
				}
				Outbound::Close => {
					let _ = sink.send(Message::Close(None)).await;
					let _ = sink.close().await;
					break;
				}
			}
		}
	});

	while let Some(message) = source.next().await {
		match message {
			Ok(Message::Text(text)) => {
				traffic.bytes_in.fetch_add(text.len() as u64, Ordering::Relaxed);
				engine.handle_frame(conn_id, &text).await;
			}
			Ok(Message::Close(_)) => break,
			Ok(_) => {}
			Err(e) => {
				debug!(conn = %conn_id, error = %e, "websocket read error");
				break;
			}
		}
	}

	// detach before the id is forgotten
	engine.handle_disconnect(conn_id).await;
	writer.abort();
	info!(conn = %conn_id, remote = %addr, "websocket client disconnected");
}
