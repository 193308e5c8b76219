//! Per-connection streaming transport.
//!
//! Each connection runs three activities over two bounded queues:
//!
//! ```text
//!  POST /messages ──► inbox ──► pump ──► ProtocolEngine ─┐
//!                                                        ├─► outbox ──► generator ──► SSE
//!                              heartbeat ticker ─────────┘
//! ```
//!
//! The ticker and the pump are spawned tasks tied to a per-session
//! cancellation token. The generator owns a [`SessionGuard`]; whichever way
//! the stream ends, the guard cancels both tasks, joins them and only then
//! removes the session record.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use chrono::Utc;
use futures::{FutureExt, Stream};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use beacon_core::SessionId;
use beacon_engine::{ProtocolEngine, ServerIdentity, ToolRegistry};
use beacon_telemetry::MetricsRecorder;

use crate::sessions::SessionManager;

const ACTIVE_GAUGE: &str = "sse_connections_active";
const CONNECTIONS_TOTAL: &str = "sse_connections_total";

/// One named server-push event.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundEvent {
    Connection {
        connection_id: SessionId,
        server_info: Value,
        timestamp: String,
    },
    /// A serialized protocol response, forwarded verbatim.
    Message(String),
    Heartbeat { timestamp: String },
    Error { error: String, timestamp: String },
}

impl OutboundEvent {
    pub fn heartbeat() -> Self {
        Self::Heartbeat { timestamp: now() }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            timestamp: now(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Message(_) => "message",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Error { .. } => "error",
        }
    }

    /// The `data:` payload of the event.
    pub fn data(&self) -> String {
        match self {
            Self::Connection {
                connection_id,
                server_info,
                timestamp,
            } => json!({
                "type": "connection",
                "connection_id": connection_id,
                "timestamp": timestamp,
                "server_info": server_info,
            })
            .to_string(),
            Self::Message(raw) => raw.clone(),
            Self::Heartbeat { timestamp } => json!({
                "type": "heartbeat",
                "timestamp": timestamp,
            })
            .to_string(),
            Self::Error { error, timestamp } => json!({
                "type": "error",
                "error": error,
                "timestamp": timestamp,
            })
            .to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub heartbeat_interval: Duration,
    /// Depth of both the inbound and the outbound queue.
    pub queue_capacity: usize,
    pub tool_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 256,
            tool_timeout: beacon_engine::DEFAULT_TOOL_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct StreamTransport {
    sessions: Arc<SessionManager>,
    registry: Arc<ToolRegistry>,
    identity: ServerIdentity,
    metrics: Arc<MetricsRecorder>,
    config: TransportConfig,
    shutdown: CancellationToken,
}

enum Step {
    Emit(OutboundEvent),
    Idle,
    Stop,
}

impl StreamTransport {
    pub fn new(
        sessions: Arc<SessionManager>,
        registry: Arc<ToolRegistry>,
        metrics: Arc<MetricsRecorder>,
        config: TransportConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sessions,
            registry,
            identity: ServerIdentity::default(),
            metrics,
            config,
            shutdown,
        }
    }

    pub fn with_identity(mut self, identity: ServerIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Open a session and stream its events until the client goes away or
    /// the server shuts down.
    ///
    /// The first event is always `connection`, unless admission fails, in
    /// which case the only event is a terminal `error`.
    pub fn serve(&self, connection_id: Option<SessionId>) -> impl Stream<Item = OutboundEvent> + Send + 'static {
        let this = self.clone();
        stream! {
            let id = connection_id.unwrap_or_default();
            let capacity = this.config.queue_capacity.max(1);
            let (inbox_tx, inbox_rx) = mpsc::channel::<String>(capacity);

            if let Err(e) = this.sessions.add(id.clone(), inbox_tx) {
                this.metrics.counter_inc(CONNECTIONS_TOTAL, &[("status", "rejected")], 1);
                yield OutboundEvent::error(e.to_string());
                return;
            }
            this.metrics.counter_inc(CONNECTIONS_TOTAL, &[("status", "accepted")], 1);
            this.metrics.gauge_inc(ACTIVE_GAUGE, &[], 1.0);

            let cancel = this.shutdown.child_token();
            let (outbox_tx, mut outbox_rx) = mpsc::channel::<OutboundEvent>(capacity);
            let engine = ProtocolEngine::new(Arc::clone(&this.registry))
                .with_identity(this.identity.clone())
                .with_tool_timeout(this.config.tool_timeout)
                .with_metrics(Arc::clone(&this.metrics));

            let heartbeat = tokio::spawn(heartbeat_loop(
                id.clone(),
                Arc::clone(&this.sessions),
                outbox_tx.clone(),
                this.config.heartbeat_interval,
                cancel.clone(),
            ));
            let pump = tokio::spawn(pump_loop(id.clone(), engine, inbox_rx, outbox_tx, cancel.clone()));
            let guard = SessionGuard::new(
                id.clone(),
                Arc::clone(&this.sessions),
                Arc::clone(&this.metrics),
                cancel.clone(),
                vec![heartbeat, pump],
            );

            info!(session_id = %id, "stream opened");
            this.sessions.increment_messages(&id);
            yield OutboundEvent::Connection {
                connection_id: id.clone(),
                server_info: json!(this.identity),
                timestamp: now(),
            };

            let idle = this.config.heartbeat_interval.saturating_mul(2);
            loop {
                let step = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Step::Stop,
                    next = time::timeout(idle, outbox_rx.recv()) => match next {
                        Err(_) => Step::Idle,
                        Ok(None) => Step::Stop,
                        Ok(Some(event)) => Step::Emit(event),
                    },
                };
                match step {
                    Step::Idle => {
                        debug!(session_id = %id, "outbound queue idle");
                        continue;
                    }
                    Step::Stop => break,
                    Step::Emit(event) => {
                        this.sessions.increment_messages(&id);
                        yield event;
                    }
                }
            }

            guard.close().await;
        }
    }
}

async fn heartbeat_loop(
    id: SessionId,
    sessions: Arc<SessionManager>,
    outbox: mpsc::Sender<OutboundEvent>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sessions.touch_heartbeat(&id);
                if outbox.send(OutboundEvent::heartbeat()).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(session_id = %id, "heartbeat stopped");
}

/// Feeds inbound frames to the engine one at a time, so responses leave in
/// the order their requests arrived.
async fn pump_loop(
    id: SessionId,
    engine: ProtocolEngine,
    mut inbox: mpsc::Receiver<String>,
    outbox: mpsc::Sender<OutboundEvent>,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = inbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let handled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            handled = AssertUnwindSafe(engine.handle_message(&raw)).catch_unwind() => handled,
        };

        let event = match handled {
            Ok(response) if response.is_empty() => continue,
            Ok(response) => OutboundEvent::Message(response),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(session_id = %id, error = %msg, "message handler panicked");
                OutboundEvent::error(format!("Message processing failed: {msg}"))
            }
        };
        if outbox.send(event).await.is_err() {
            break;
        }
    }
    debug!(session_id = %id, "message pump stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Owns a session's teardown. Runs at most once, from [`SessionGuard::close`]
/// or from `Drop` when the stream is dropped mid-flight.
struct SessionGuard {
    inner: Option<Teardown>,
}

struct Teardown {
    id: SessionId,
    sessions: Arc<SessionManager>,
    metrics: Arc<MetricsRecorder>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionGuard {
    fn new(
        id: SessionId,
        sessions: Arc<SessionManager>,
        metrics: Arc<MetricsRecorder>,
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            inner: Some(Teardown {
                id,
                sessions,
                metrics,
                cancel,
                tasks,
            }),
        }
    }

    async fn close(mut self) {
        if let Some(teardown) = self.inner.take() {
            teardown.start();
            teardown.finish().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(teardown) = self.inner.take() else {
            return;
        };
        teardown.start();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn(teardown.finish());
            }
            Err(_) => teardown.abort(),
        }
    }
}

impl Teardown {
    fn start(&self) {
        self.sessions.mark_closing(&self.id);
        self.cancel.cancel();
    }

    async fn finish(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(session_id = %self.id, "session task panicked during teardown");
                }
            }
        }
        self.release();
    }

    fn abort(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.release();
    }

    fn release(&self) {
        self.sessions.remove(&self.id);
        self.metrics.gauge_inc(ACTIVE_GAUGE, &[], -1.0);
        info!(session_id = %self.id, "stream closed");
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use beacon_core::tools::{Tool, ToolError};

    struct Echo;

    #[async_trait::async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    fn transport(max: usize, heartbeat: Duration) -> StreamTransport {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        StreamTransport::new(
            Arc::new(SessionManager::new(max)),
            Arc::new(registry),
            Arc::new(MetricsRecorder::new()),
            TransportConfig {
                heartbeat_interval: heartbeat,
                queue_capacity: 8,
                tool_timeout: Duration::from_secs(5),
            },
            CancellationToken::new(),
        )
    }

    async fn wait_until_removed(sessions: &SessionManager, id: &SessionId) {
        for _ in 0..100 {
            if !sessions.contains(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} was never removed");
    }

    #[tokio::test]
    async fn first_event_is_connection() {
        let t = transport(4, Duration::from_secs(30));
        let mut stream = Box::pin(t.serve(Some(SessionId::from_raw("conn-1"))));

        let first = stream.next().await.unwrap();
        assert_eq!(first.name(), "connection");
        let data: Value = serde_json::from_str(&first.data()).unwrap();
        assert_eq!(data["type"], "connection");
        assert_eq!(data["connection_id"], "conn-1");
        assert_eq!(data["server_info"]["name"], "beacon");
        assert!(t.sessions().contains(&SessionId::from_raw("conn-1")));
    }

    #[tokio::test]
    async fn generates_id_when_absent() {
        let t = transport(4, Duration::from_secs(30));
        let mut stream = Box::pin(t.serve(None));
        let OutboundEvent::Connection { connection_id, .. } = stream.next().await.unwrap() else {
            panic!("expected connection event");
        };
        assert!(connection_id.as_str().starts_with("sess_"));
    }

    #[tokio::test]
    async fn admission_failure_is_a_single_error_event() {
        let t = transport(1, Duration::from_secs(30));
        let mut first = Box::pin(t.serve(None));
        first.next().await.unwrap();

        let rejected: Vec<OutboundEvent> = t.serve(None).collect().await;
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].name(), "error");
        let data: Value = serde_json::from_str(&rejected[0].data()).unwrap();
        assert_eq!(data["error"], "Maximum connections (1) reached");
        assert_eq!(t.sessions().count(), 1);
    }

    #[tokio::test]
    async fn responses_follow_request_order() {
        let t = transport(4, Duration::from_secs(30));
        let id = SessionId::from_raw("ordered");
        let mut stream = Box::pin(t.serve(Some(id.clone())));
        stream.next().await.unwrap();

        let sessions = t.sessions();
        sessions
            .deliver(&id, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string())
            .unwrap();
        sessions
            .deliver(&id, json!({"jsonrpc": "2.0", "method": "notifications/progress"}).to_string())
            .unwrap();
        sessions.deliver(&id, "{not json".into()).unwrap();

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        let OutboundEvent::Message(first) = first else { panic!("expected message") };
        let OutboundEvent::Message(second) = second else { panic!("expected message") };
        let first: Value = serde_json::from_str(&first).unwrap();
        let second: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(first["result"]["status"], "pong");
        assert_eq!(second["error"]["code"], -32700);

        assert_eq!(sessions.get(&id).unwrap().messages_sent, 3);
    }

    #[tokio::test]
    async fn tool_call_round_trip() {
        let t = transport(4, Duration::from_secs(30));
        let id = SessionId::from_raw("tools");
        let mut stream = Box::pin(t.serve(Some(id.clone())));
        stream.next().await.unwrap();

        let sessions = t.sessions();
        sessions
            .deliver(&id, json!({"jsonrpc": "2.0", "id": "a", "method": "initialize", "params": {}}).to_string())
            .unwrap();
        sessions
            .deliver(
                &id,
                json!({"jsonrpc": "2.0", "id": "b", "method": "tools/call",
                       "params": {"name": "echo", "arguments": {"x": 1}}})
                .to_string(),
            )
            .unwrap();

        stream.next().await.unwrap();
        let OutboundEvent::Message(raw) = stream.next().await.unwrap() else {
            panic!("expected message");
        };
        let resp: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(resp["id"], "b");
        assert_eq!(resp["result"]["isError"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_receives_heartbeats() {
        let t = transport(4, Duration::from_secs(10));
        let id = SessionId::from_raw("idle");
        let mut stream = Box::pin(t.serve(Some(id.clone())));
        stream.next().await.unwrap();
        let created = t.sessions().get(&id).unwrap().last_heartbeat_at;

        let mut heartbeats = 0;
        let mut last_seen = created;
        let deadline = Instant::now() + Duration::from_secs(30);
        while Instant::now() < deadline {
            match time::timeout_at(deadline, stream.next()).await {
                Ok(Some(OutboundEvent::Heartbeat { .. })) => {
                    heartbeats += 1;
                    let record = t.sessions().get(&id).unwrap();
                    assert!(record.last_heartbeat_at >= last_seen);
                    last_seen = record.last_heartbeat_at;
                }
                Ok(Some(other)) => panic!("unexpected event {other:?}"),
                Ok(None) => panic!("stream ended"),
                Err(_) => break,
            }
        }
        assert!(heartbeats >= 2, "got {heartbeats} heartbeats");
        assert!(t.sessions().get(&id).unwrap().heartbeats >= 2);
    }

    #[tokio::test]
    async fn dropping_the_stream_removes_the_session() {
        let t = transport(1, Duration::from_secs(30));
        let id = SessionId::from_raw("dropped");
        let mut stream = Box::pin(t.serve(Some(id.clone())));
        stream.next().await.unwrap();
        assert_eq!(t.metrics.gauge_get(ACTIVE_GAUGE, &[]), 1.0);

        drop(stream);
        wait_until_removed(t.sessions(), &id).await;
        assert_eq!(t.metrics.gauge_get(ACTIVE_GAUGE, &[]), 0.0);

        let mut again = Box::pin(t.serve(None));
        assert_eq!(again.next().await.unwrap().name(), "connection");
    }

    #[tokio::test]
    async fn shutdown_ends_the_stream_and_cleans_up() {
        let t = transport(4, Duration::from_secs(30));
        let id = SessionId::from_raw("shutdown");
        let mut stream = Box::pin(t.serve(Some(id.clone())));
        stream.next().await.unwrap();

        t.shutdown.cancel();
        assert!(stream.next().await.is_none());
        assert!(!t.sessions().contains(&id));
        assert_eq!(t.metrics.gauge_get(ACTIVE_GAUGE, &[]), 0.0);
    }

    #[test]
    fn event_payloads() {
        let hb = OutboundEvent::heartbeat();
        assert_eq!(hb.name(), "heartbeat");
        let data: Value = serde_json::from_str(&hb.data()).unwrap();
        assert_eq!(data["type"], "heartbeat");
        assert!(data["timestamp"].is_string());

        let msg = OutboundEvent::Message("{\"jsonrpc\":\"2.0\"}".into());
        assert_eq!(msg.data(), "{\"jsonrpc\":\"2.0\"}");

        let err = OutboundEvent::error("boom");
        let data: Value = serde_json::from_str(&err.data()).unwrap();
        assert_eq!(data["error"], "boom");
    }
}
