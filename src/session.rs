//! Session Manager (§4.8).
//!
//! Accepts streaming client sessions over `axum`'s WebSocket transport, pumps
//! each connection's outbound queue, and enforces liveness via heartbeats. Per
//! the design notes in SPEC_FULL §9 / spec §9 ("each connection owns a logical
//! task; cross-connection isolation is mandatory"), the pump is one task per
//! connection rather than a single loop walking every connection — a slow
//! transport send on one connection can never delay another's delivery.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::domain::{ConnectionState, MessageKind};
use crate::metrics::MetricsRegistry;
use crate::queue::{BackpressurePolicy, OutboundQueueManager};

/// Client-to-server frame (§6).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Ack { sequence: u64 },
    Ping,
    Pong,
    App {
        #[serde(default)]
        data: Option<Value>,
    },
}

/// An inbound frame the Session Manager doesn't handle itself, returned to the
/// caller for application-level handling (§4.8).
#[derive(Debug, Clone, Serialize)]
pub struct AppFrame {
    pub connection_id: String,
    pub tenant_id: String,
    pub data: Option<Value>,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Server-to-client envelope (§6).
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sequence: u64,
    pub timestamp_iso8601: chrono::DateTime<Utc>,
    pub data: Value,
    pub is_final: bool,
    pub tenant_id: String,
}

struct ConnectionLiveness {
    last_send_activity: tokio::sync::Mutex<std::time::Instant>,
    last_pong: tokio::sync::Mutex<std::time::Instant>,
}

/// Owns the Session surface: accepts connections, pumps their queues, dispatches
/// inbound frames.
pub struct SessionManager {
    queues: Arc<OutboundQueueManager>,
    clock: Arc<dyn Clock>,
    metrics: MetricsRegistry,
    app_frames: mpsc::UnboundedSender<AppFrame>,
    policies: DashMap<String, BackpressurePolicy>,
    session_config: tokio::sync::RwLock<SessionConfig>,
}

impl SessionManager {
    pub fn new(
        queues: Arc<OutboundQueueManager>,
        clock: Arc<dyn Clock>,
        metrics: MetricsRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<AppFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                queues,
                clock,
                metrics,
                app_frames: tx,
                policies: DashMap::new(),
                session_config: tokio::sync::RwLock::new(SessionConfig::default()),
            },
            rx,
        )
    }

    /// Administrative override of a tenant's backpressure policy; `config.rs`
    /// populates this from the live config on load and hot-reload.
    pub fn set_tenant_policy(&self, tenant_id: &str, policy: BackpressurePolicy) {
        self.policies.insert(tenant_id.to_string(), policy);
    }

    fn policy_for(&self, tenant_id: &str) -> BackpressurePolicy {
        self.policies.get(tenant_id).map(|p| *p).unwrap_or_default()
    }

    /// Replaces the pump/heartbeat/stale/send-deadline tunables; `config.rs`
    /// applies this from `[session]` on load and hot-reload.
    pub async fn set_session_config(&self, config: SessionConfig) {
        *self.session_config.write().await = config;
    }

    async fn session_config(&self) -> SessionConfig {
        *self.session_config.read().await
    }

    /// Number of currently open connections, across all tenants.
    pub fn connection_count(&self) -> usize {
        self.queues.connection_count()
    }

    /// `open(session_id, tenant_id) -> ConnectionState` (§4.8).
    pub async fn open(&self, connection_id: &str, tenant_id: &str) -> ConnectionState {
        self.queues
            .open(connection_id, tenant_id, self.policy_for(tenant_id))
            .await;
        self.metrics
            .set_active_connections(tenant_id, self.queues.connection_count() as f64);
        self.queues
            .connection_state(connection_id)
            .await
            .expect("connection was just opened")
    }

    /// `close(connection_id)` (§4.8): persists remaining queue contents.
    pub async fn close(&self, connection_id: &str, tenant_id: &str) {
        self.queues.close(connection_id).await;
        self.metrics
            .set_active_connections(tenant_id, self.queues.connection_count() as f64);
    }

    /// `push(connection_id, payload, kind, is_final, priority)` (§4.8).
    pub async fn push(
        &self,
        connection_id: &str,
        payload: Value,
        kind: MessageKind,
        is_final: bool,
        priority: i32,
    ) -> bool {
        self.queues.enqueue(connection_id, payload, kind, is_final, priority).await
    }

    /// `on_inbound(connection_id, frame)` (§4.8): handles `ack`/`ping`/`pong`
    /// directly; forwards everything else to the application channel.
    pub async fn on_inbound(&self, connection_id: &str, tenant_id: &str, frame: InboundFrame) {
        match frame {
            InboundFrame::Ack { sequence } => self.queues.ack(connection_id, sequence).await,
            InboundFrame::Ping => {
                self.push(
                    connection_id,
                    Value::Null,
                    MessageKind::Heartbeat,
                    false,
                    0,
                )
                .await;
            }
            InboundFrame::Pong => {
                // Liveness bookkeeping lives on the per-connection task (see
                // `run_connection`); this no-op path exists so unit tests can
                // call `on_inbound` without spinning up a real socket.
            }
            InboundFrame::App { data } => {
                let _ = self.app_frames.send(AppFrame {
                    connection_id: connection_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    data,
                    timestamp: self.clock.now_utc(),
                });
            }
        }
    }

    /// Drives one accepted WebSocket end-to-end: opens the connection, spawns the
    /// pump loop, reads inbound frames until the socket closes or goes stale.
    pub async fn run_connection(self: Arc<Self>, connection_id: String, tenant_id: String, socket: WebSocket) {
        self.open(&connection_id, &tenant_id).await;
        let (mut sink, mut stream) = socket.split();

        let liveness = Arc::new(ConnectionLiveness {
            last_send_activity: tokio::sync::Mutex::new(std::time::Instant::now()),
            last_pong: tokio::sync::Mutex::new(std::time::Instant::now()),
        });

        let pump_manager = self.clone();
        let pump_connection_id = connection_id.clone();
        let pump_tenant_id = tenant_id.clone();
        let pump_liveness = liveness.clone();
        let pump = tokio::spawn(async move {
            loop {
                let cfg = pump_manager.session_config().await;
                tokio::time::sleep(Duration::from_millis(cfg.pump_cadence_ms)).await;

                let stale = {
                    let last_pong = *pump_liveness.last_pong.lock().await;
                    last_pong.elapsed() > Duration::from_secs(cfg.stale_timeout_s)
                };
                if stale {
                    break;
                }

                let silent = {
                    let last_send = *pump_liveness.last_send_activity.lock().await;
                    last_send.elapsed() > Duration::from_secs(cfg.heartbeat_silence_s)
                };
                if silent {
                    pump_manager
                        .push(&pump_connection_id, Value::Null, MessageKind::Heartbeat, false, 0)
                        .await;
                }

                let mut sent_any = false;
                for _ in 0..cfg.messages_per_tick {
                    let Some(message) = pump_manager.queues.dequeue(&pump_connection_id).await else {
                        break;
                    };
                    let envelope = OutboundEnvelope {
                        id: message.message_id.clone(),
                        kind: message.kind,
                        sequence: message.sequence_number,
                        timestamp_iso8601: pump_manager.clock.now_utc(),
                        data: message.payload.clone(),
                        is_final: message.is_final,
                        tenant_id: pump_tenant_id.clone(),
                    };
                    let Ok(text) = serde_json::to_string(&envelope) else {
                        continue;
                    };
                    let send_deadline = Duration::from_secs(cfg.send_deadline_s);
                    let send_result = timeout(send_deadline, sink.send(Message::Text(text.into()))).await;
                    match send_result {
                        Ok(Ok(())) => {
                            sent_any = true;
                            pump_manager
                                .metrics
                                .record_message_sent(&pump_tenant_id, kind_label(message.kind));
                        }
                        _ => {
                            pump_manager.metrics.record_send_error(&pump_tenant_id);
                            pump_manager.close(&pump_connection_id, &pump_tenant_id).await;
                            return;
                        }
                    }
                }
                if sent_any {
                    *pump_liveness.last_send_activity.lock().await = std::time::Instant::now();
                }
                pump_manager.metrics.set_queue_size(
                    &pump_tenant_id,
                    &pump_connection_id,
                    pump_manager.queues.queue_len(&pump_connection_id).await as f64,
                );
            }
            pump_manager.close(&pump_connection_id, &pump_tenant_id).await;
        });

        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    if let Ok(frame) = serde_json::from_str::<InboundFrame>(&text) {
                        if matches!(frame, InboundFrame::Pong) {
                            *liveness.last_pong.lock().await = std::time::Instant::now();
                        }
                        self.on_inbound(&connection_id, &tenant_id, frame).await;
                    } else {
                        tracing::debug!(%connection_id, "dropped malformed inbound frame");
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        pump.abort();
        self.close(&connection_id, &tenant_id).await;
    }
}

fn kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Intermediate => "intermediate",
        MessageKind::Final => "final",
        MessageKind::Heartbeat => "heartbeat",
        MessageKind::Resume => "resume",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::InMemoryKvStore;

    fn manager() -> (Arc<SessionManager>, mpsc::UnboundedReceiver<AppFrame>) {
        let queues = Arc::new(OutboundQueueManager::new(
            Arc::new(InMemoryKvStore::new()),
            Arc::new(SystemClock::new()),
            MetricsRegistry::install().unwrap(),
        ));
        let (mgr, rx) = SessionManager::new(queues, Arc::new(SystemClock::new()), MetricsRegistry::install().unwrap());
        (Arc::new(mgr), rx)
    }

    #[tokio::test]
    async fn open_then_push_then_ack_updates_queue_state() {
        let (mgr, _rx) = manager();
        mgr.open("c1", "t1").await;
        mgr.push("c1", serde_json::json!({"x": 1}), MessageKind::Intermediate, false, 0)
            .await;
        mgr.on_inbound("c1", "t1", InboundFrame::Ack { sequence: 1 }).await;
        let state = mgr.queues.connection_state("c1").await.unwrap();
        assert_eq!(state.last_acked_seq, 1);
    }

    #[tokio::test]
    async fn app_frame_is_forwarded_to_application_channel() {
        let (mgr, mut rx) = manager();
        mgr.open("c1", "t1").await;
        mgr.on_inbound(
            "c1",
            "t1",
            InboundFrame::App {
                data: Some(serde_json::json!({"custom": true})),
            },
        )
        .await;
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.connection_id, "c1");
    }

    #[tokio::test]
    async fn ping_is_answered_with_a_heartbeat_push() {
        let (mgr, _rx) = manager();
        mgr.open("c1", "t1").await;
        mgr.on_inbound("c1", "t1", InboundFrame::Ping).await;
        let message = mgr.queues.dequeue("c1").await.unwrap();
        assert_eq!(message.kind, MessageKind::Heartbeat);
    }
}
