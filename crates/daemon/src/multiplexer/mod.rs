//! Session multiplexer.
//!
//! Connects many observer connections to many sessions. The multiplexer owns
//! the [`SessionRegistry`] together with the set of connected clients and the
//! per-session subscriber sets, all behind a single async mutex so that
//! membership and session state always change together.
//!
//! ```text
//!   observers ──ClientMessage──▶ Multiplexer ──▶ SessionRegistry ──▶ PtyProcess
//!       ▲                            │                                  │
//!       └───────ServerEvent──────────┴──◀── event pump ◀──PtyEvent──────┘
//! ```
//!
//! Routing rules:
//! - process output goes to that session's subscribers only;
//! - created, deleted, exit and notification events go to every connection;
//! - errors go back to the connection that caused them.

mod client;
mod notify;

pub use client::{ClientHandle, ClientId, ClientStats, DEFAULT_CLIENT_QUEUE};
pub use notify::NotifyOutcome;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use termhub_protocol::{
    decode_client_message, ClientMessage, Inbound, ServerEvent, SessionId, SessionInfo,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::history::HistoryStore;
use crate::session::{PtyEvent, PtyEventReceiver, SessionError, SessionRegistry};

/// Everything guarded by the multiplexer lock.
struct HubState {
    registry: SessionRegistry,
    clients: HashMap<ClientId, ClientHandle>,
    subscriptions: HashMap<SessionId, HashSet<ClientId>>,
}

impl HubState {
    /// Sends an event to every connection, dropping the ones that are gone.
    fn broadcast(&mut self, event: ServerEvent) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;

        for (client_id, handle) in self.clients.iter_mut() {
            if handle.send(event.clone()) {
                delivered += 1;
            } else {
                closed.push(client_id.clone());
            }
        }

        for client_id in closed {
            self.remove_client(&client_id);
        }
        delivered
    }

    /// Sends an event to one session's subscribers.
    fn send_to_subscribers(&mut self, session_id: &str, event: ServerEvent) -> usize {
        let Some(subscribers) = self.subscriptions.get(session_id) else {
            return 0;
        };

        let mut closed = Vec::new();
        let mut delivered = 0;
        for client_id in subscribers {
            let sent = self
                .clients
                .get_mut(client_id)
                .map(|handle| handle.send(event.clone()))
                .unwrap_or(false);
            if sent {
                delivered += 1;
            } else {
                closed.push(client_id.clone());
            }
        }

        for client_id in closed {
            self.remove_client(&client_id);
        }
        delivered
    }

    /// Sends an event to a single connection.
    fn send_to(&mut self, client_id: &str, event: ServerEvent) -> bool {
        let sent = self
            .clients
            .get_mut(client_id)
            .map(|handle| handle.send(event))
            .unwrap_or(false);
        if !sent {
            self.remove_client(client_id);
        }
        sent
    }

    fn remove_client(&mut self, client_id: &str) -> Option<ClientStats> {
        for subscribers in self.subscriptions.values_mut() {
            subscribers.remove(client_id);
        }
        self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        self.clients.remove(client_id).map(|handle| handle.stats())
    }
}

/// Routes commands from observers to sessions and events from sessions to observers.
pub struct Multiplexer {
    state: Mutex<HubState>,
    history: Arc<HistoryStore>,
    next_client: AtomicU64,
    client_queue: usize,
}

impl Multiplexer {
    /// Takes ownership of `registry` and wires its creations into `history`.
    pub fn new(mut registry: SessionRegistry, history: Arc<HistoryStore>) -> Self {
        let recorder = Arc::clone(&history);
        registry.add_post_create_hook(move |session: &SessionInfo| {
            recorder.record_created(session);
        });

        Self {
            state: Mutex::new(HubState {
                registry,
                clients: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            history,
            next_client: AtomicU64::new(1),
            client_queue: DEFAULT_CLIENT_QUEUE,
        }
    }

    /// Sets how many events a connection may have queued before it is dropped.
    pub fn with_client_queue(mut self, capacity: usize) -> Self {
        self.client_queue = capacity.max(1);
        self
    }

    /// The history store sessions are recorded in.
    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    // ---- connections ----

    /// Registers a new connection.
    ///
    /// Returns its id and the receiver of events addressed to it. A connection
    /// that lets its queue fill up is removed and its receiver closes.
    pub async fn connect(&self) -> (ClientId, mpsc::Receiver<ServerEvent>) {
        let client_id = format!("client-{}", self.next_client.fetch_add(1, Ordering::Relaxed));
        let (handle, rx) = ClientHandle::with_capacity(client_id.clone(), self.client_queue);

        let mut state = self.state.lock().await;
        state.clients.insert(client_id.clone(), handle);
        tracing::debug!(client_id = %client_id, clients = state.clients.len(), "Client connected");

        (client_id, rx)
    }

    /// Removes a connection from the global set and every subscriber set.
    pub async fn disconnect(&self, client_id: &str) -> Option<ClientStats> {
        let mut state = self.state.lock().await;
        let stats = state.remove_client(client_id);
        if let Some(stats) = &stats {
            tracing::debug!(
                client_id = %client_id,
                messages_sent = stats.messages_sent,
                "Client disconnected"
            );
        }
        stats
    }

    /// Decodes and handles one text frame from a connection.
    ///
    /// Malformed frames and unknown kinds are logged and dropped; the
    /// connection stays open.
    pub async fn handle_text(&self, client_id: &str, text: &str) {
        match decode_client_message(text) {
            Ok(Inbound::Message(message)) => self.handle_message(client_id, message).await,
            Ok(Inbound::Unknown(kind)) => {
                tracing::debug!(client_id = %client_id, kind = %kind, "Ignoring unknown message kind");
            }
            Err(e) => {
                tracing::warn!(client_id = %client_id, error = %e, "Dropping malformed message");
            }
        }
    }

    /// Handles one decoded command from a connection.
    pub async fn handle_message(&self, client_id: &str, message: ClientMessage) {
        let mut state = self.state.lock().await;
        let state = &mut *state;

        match message {
            ClientMessage::Subscribe { session_id } => {
                if !state.registry.contains(&session_id) {
                    state.send_to(
                        client_id,
                        ServerEvent::session_error(&session_id, "Session not found"),
                    );
                    return;
                }
                if !state.clients.contains_key(client_id) {
                    return;
                }

                let newly_added = state
                    .subscriptions
                    .entry(session_id.clone())
                    .or_default()
                    .insert(client_id.to_string());
                tracing::debug!(client_id = %client_id, session_id = %session_id, "Subscribed");

                // Replay under the same lock so it precedes any live output.
                if newly_added {
                    if let Some(replay) = state.registry.output_text(&session_id) {
                        if !replay.is_empty() {
                            state.send_to(
                                client_id,
                                ServerEvent::SessionData {
                                    session_id,
                                    data: replay,
                                },
                            );
                        }
                    }
                }
            }
            ClientMessage::Unsubscribe { session_id } => {
                if let Some(subscribers) = state.subscriptions.get_mut(&session_id) {
                    subscribers.remove(client_id);
                    if subscribers.is_empty() {
                        state.subscriptions.remove(&session_id);
                    }
                }
                tracing::debug!(client_id = %client_id, session_id = %session_id, "Unsubscribed");
            }
            ClientMessage::Input { session_id, data } => {
                if !state.registry.write(&session_id, data.as_bytes()) {
                    state.send_to(
                        client_id,
                        ServerEvent::session_error(&session_id, "Session not found or terminated"),
                    );
                }
            }
            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => {
                if !state.registry.resize(&session_id, cols, rows) {
                    state.send_to(
                        client_id,
                        ServerEvent::session_error(&session_id, "Session not found or terminated"),
                    );
                }
            }
        }
    }

    // ---- session lifecycle ----

    /// Creates a session and announces it to every connection.
    pub async fn create_session(&self, working_directory: &str) -> Result<SessionInfo, SessionError> {
        let session = {
            let mut state = self.state.lock().await;
            let session = state.registry.create(working_directory)?;
            state.broadcast(ServerEvent::SessionCreated {
                session: session.clone(),
            });
            session
        };

        // The post-create hook already recorded it; write it out.
        self.history.flush().await;
        Ok(session)
    }

    /// Kills and removes a session, then announces the deletion.
    ///
    /// Returns false for unknown ids.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        let output_size = {
            let mut state = self.state.lock().await;
            let output_size = state.registry.output_size(session_id).unwrap_or(0);
            if !state.registry.delete(session_id) {
                return false;
            }
            state.subscriptions.remove(session_id);
            output_size
        };

        self.history.end_session(session_id, output_size).await;

        let mut state = self.state.lock().await;
        state.broadcast(ServerEvent::SessionDeleted {
            session_id: session_id.to_string(),
        });
        true
    }

    /// Handles one event from the PTY channel.
    pub async fn handle_pty_event(&self, event: PtyEvent) {
        match event {
            PtyEvent::Output { session_id, data } => {
                let mut state = self.state.lock().await;
                if !state.registry.contains(&session_id) {
                    return;
                }
                state.registry.append_output(&session_id, data.as_bytes());
                let event = ServerEvent::SessionData {
                    session_id: session_id.clone(),
                    data,
                };
                state.send_to_subscribers(&session_id, event);
            }
            PtyEvent::Exit {
                session_id,
                exit_code,
            } => {
                let output_size = {
                    let mut state = self.state.lock().await;
                    // Deleted sessions have already been announced.
                    if state.registry.mark_exited(&session_id).is_none() {
                        return;
                    }
                    state.registry.output_size(&session_id).unwrap_or(0)
                };
                tracing::info!(session_id = %session_id, exit_code, "Session process exited");

                self.history.end_session(&session_id, output_size).await;

                let mut state = self.state.lock().await;
                // Deleted while history was being written; already announced.
                if !state.registry.contains(&session_id) {
                    return;
                }
                state.broadcast(ServerEvent::SessionExit {
                    session_id,
                    exit_code,
                });
            }
        }
    }

    /// Drains the PTY event channel until it closes or `cancel` fires.
    pub async fn run_event_pump(self: Arc<Self>, mut events: PtyEventReceiver, cancel: CancellationToken) {
        tracing::debug!("Event pump started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_pty_event(event).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Event pump stopped");
    }

    // ---- queries ----

    /// All sessions, oldest first.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.state.lock().await.registry.list()
    }

    pub async fn get_session(&self, session_id: &str) -> Option<SessionInfo> {
        self.state.lock().await.registry.get(session_id)
    }

    /// Buffered output of a session as text.
    pub async fn session_output(&self, session_id: &str) -> Option<String> {
        self.state.lock().await.registry.output_text(session_id)
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Number of connections subscribed to a session.
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .await
            .subscriptions
            .get(session_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub async fn client_stats(&self, client_id: &str) -> Option<ClientStats> {
        self.state
            .lock()
            .await
            .clients
            .get(client_id)
            .map(|h| h.stats())
    }

    /// Kills every session and records their end in history.
    ///
    /// Returns the number of sessions torn down.
    pub async fn teardown(&self) -> usize {
        let ended: Vec<(SessionId, usize)> = {
            let mut state = self.state.lock().await;
            let sizes: Vec<(SessionId, usize)> = state
                .registry
                .list()
                .into_iter()
                .map(|s| {
                    let size = state.registry.output_size(&s.id).unwrap_or(0);
                    (s.id, size)
                })
                .collect();
            state.registry.teardown();
            state.subscriptions.clear();
            sizes
        };

        for (session_id, output_size) in &ended {
            self.history.end_session(session_id, *output_size).await;
        }
        ended.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::{RegistryConfig, ScriptedBackend, SessionRegistry};
    use std::time::Duration;
    use tempfile::TempDir;
    use termhub_protocol::SessionStatus;
    use tokio::time::timeout;

    pub(crate) struct Harness {
        pub mux: Arc<Multiplexer>,
        pub backend: ScriptedBackend,
        pub cancel: CancellationToken,
        _dir: TempDir,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    pub(crate) fn harness_with(config: RegistryConfig) -> Harness {
        harness_with_queue(config, DEFAULT_CLIENT_QUEUE)
    }

    pub(crate) fn harness_with_queue(config: RegistryConfig, client_queue: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(Arc::new(backend.clone()), tx, config);
        let history = Arc::new(HistoryStore::new(dir.path().join("history.json")));
        let mux = Arc::new(Multiplexer::new(registry, history).with_client_queue(client_queue));
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&mux).run_event_pump(rx, cancel.clone()));
        Harness {
            mux,
            backend,
            cancel,
            _dir: dir,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(RegistryConfig {
            shell: "sh".to_string(),
            ..RegistryConfig::default()
        })
    }

    pub(crate) async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed")
    }

    pub(crate) async fn assert_silent(rx: &mut mpsc::Receiver<ServerEvent>) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "unexpected event");
    }

    async fn wait_for_output(mux: &Multiplexer, session_id: &str, expected: &str) {
        for _ in 0..100 {
            if mux.session_output(session_id).await.as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("output never became {expected:?}");
    }

    fn data(session_id: &str, data: &str) -> ServerEvent {
        ServerEvent::SessionData {
            session_id: session_id.to_string(),
            data: data.to_string(),
        }
    }

    fn subscribe(session_id: &str) -> ClientMessage {
        ClientMessage::Subscribe {
            session_id: session_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_broadcasts_and_records_history() {
        let h = harness();
        let (_c1, mut rx1) = h.mux.connect().await;
        let (_c2, mut rx2) = h.mux.connect().await;

        let session = h.mux.create_session("/x").await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(
                recv(rx).await,
                ServerEvent::SessionCreated {
                    session: session.clone()
                }
            );
        }
        let record = h.mux.history().get(&session.id).unwrap();
        assert_eq!(record.working_directory, "/x");
        assert!(h.mux.history().path().exists());
    }

    #[tokio::test]
    async fn test_failed_create_broadcasts_nothing() {
        let h = harness();
        let (_c, mut rx) = h.mux.connect().await;
        h.backend.fail_spawns(true);

        assert!(h.mux.create_session("/x").await.is_err());
        assert_eq!(h.mux.session_count().await, 0);
        assert!(h.mux.history().is_empty());
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_subscribe_replays_buffer_before_live_data() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        h.backend.emit(&session.id, "hello ");
        wait_for_output(&h.mux, &session.id, "hello ").await;

        let (client, mut rx) = h.mux.connect().await;
        h.mux.handle_message(&client, subscribe(&session.id)).await;
        h.backend.emit(&session.id, "world");

        assert_eq!(recv(&mut rx).await, data(&session.id, "hello "));
        assert_eq!(recv(&mut rx).await, data(&session.id, "world"));
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_subscribe_to_empty_session_sends_no_replay() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (client, mut rx) = h.mux.connect().await;

        h.mux.handle_message(&client, subscribe(&session.id)).await;

        assert_silent(&mut rx).await;
        assert_eq!(h.mux.subscriber_count(&session.id).await, 1);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_session_errors() {
        let h = harness();
        let (client, mut rx) = h.mux.connect().await;

        h.mux.handle_message(&client, subscribe("ghost")).await;

        match recv(&mut rx).await {
            ServerEvent::Error { session_id, .. } => assert_eq!(session_id.as_deref(), Some("ghost")),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.mux.subscriber_count("ghost").await, 0);
    }

    #[tokio::test]
    async fn test_no_cross_talk_between_sessions() {
        let h = harness();
        let a = h.mux.create_session("/x").await.unwrap();
        let b = h.mux.create_session("/y").await.unwrap();
        let (c1, mut rx1) = h.mux.connect().await;
        let (c2, mut rx2) = h.mux.connect().await;
        h.mux.handle_message(&c1, subscribe(&a.id)).await;
        h.mux.handle_message(&c2, subscribe(&b.id)).await;

        h.backend.emit(&a.id, "from-a");
        h.backend.emit(&b.id, "from-b");

        assert_eq!(recv(&mut rx1).await, data(&a.id, "from-a"));
        assert_eq!(recv(&mut rx2).await, data(&b.id, "from-b"));
        assert_silent(&mut rx1).await;
        assert_silent(&mut rx2).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_data() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (client, mut rx) = h.mux.connect().await;
        h.mux.handle_message(&client, subscribe(&session.id)).await;

        h.mux
            .handle_message(
                &client,
                ClientMessage::Unsubscribe {
                    session_id: session.id.clone(),
                },
            )
            .await;
        // Unsubscribing twice is harmless.
        h.mux
            .handle_message(
                &client,
                ClientMessage::Unsubscribe {
                    session_id: session.id.clone(),
                },
            )
            .await;
        h.backend.emit(&session.id, "ignored");
        wait_for_output(&h.mux, &session.id, "ignored").await;

        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_input_and_resize_reach_process() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (client, mut rx) = h.mux.connect().await;

        h.mux
            .handle_message(
                &client,
                ClientMessage::Input {
                    session_id: session.id.clone(),
                    data: "ls\r".to_string(),
                },
            )
            .await;
        h.mux
            .handle_message(
                &client,
                ClientMessage::Resize {
                    session_id: session.id.clone(),
                    cols: 90,
                    rows: 20,
                },
            )
            .await;

        assert_eq!(h.backend.input_text(&session.id), "ls\r");
        assert_eq!(h.backend.size(&session.id), Some((90, 20)));
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_input_to_deleted_session_errors_to_sender_only() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        assert!(h.mux.delete_session(&session.id).await);
        let (c1, mut rx1) = h.mux.connect().await;
        let (_c2, mut rx2) = h.mux.connect().await;

        h.mux
            .handle_message(
                &c1,
                ClientMessage::Input {
                    session_id: session.id.clone(),
                    data: "x".to_string(),
                },
            )
            .await;

        assert_eq!(
            recv(&mut rx1).await,
            ServerEvent::session_error(&session.id, "Session not found or terminated")
        );
        assert_silent(&mut rx2).await;
    }

    #[tokio::test]
    async fn test_resize_of_missing_session_errors_to_sender_only() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        assert!(h.mux.delete_session(&session.id).await);
        let (c1, mut rx1) = h.mux.connect().await;
        let (_c2, mut rx2) = h.mux.connect().await;

        for session_id in [session.id.clone(), "unknown".to_string()] {
            h.mux
                .handle_message(
                    &c1,
                    ClientMessage::Resize {
                        session_id: session_id.clone(),
                        cols: 80,
                        rows: 24,
                    },
                )
                .await;

            assert_eq!(
                recv(&mut rx1).await,
                ServerEvent::session_error(&session_id, "Session not found or terminated")
            );
        }
        assert_silent(&mut rx2).await;
        assert_eq!(h.backend.kill_count(&session.id), 1);
    }

    #[tokio::test]
    async fn test_stalled_client_is_disconnected() {
        let config = RegistryConfig {
            shell: "sh".to_string(),
            ..RegistryConfig::default()
        };
        let h = harness_with_queue(config, 4);
        let session = h.mux.create_session("/x").await.unwrap();
        let (stalled, mut stalled_rx) = h.mux.connect().await;
        let (reader, mut reader_rx) = h.mux.connect().await;
        h.mux.handle_message(&stalled, subscribe(&session.id)).await;
        h.mux.handle_message(&reader, subscribe(&session.id)).await;

        let chunk = "x".repeat(64 * 1024);
        for _ in 0..8 {
            h.backend.emit(&session.id, &chunk);
            assert_eq!(recv(&mut reader_rx).await, data(&session.id, &chunk));
        }

        assert_eq!(h.mux.client_count().await, 1);
        assert_eq!(h.mux.subscriber_count(&session.id).await, 1);
        assert!(h.mux.client_stats(&stalled).await.is_none());

        // What was queued is delivered in order, then the queue closes.
        let mut delivered = 0;
        while let Some(event) = stalled_rx.recv().await {
            assert_eq!(event, data(&session.id, &chunk));
            delivered += 1;
        }
        assert_eq!(delivered, 4);
    }

    #[tokio::test]
    async fn test_exit_racing_delete_is_not_announced() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (_client, mut rx) = h.mux.connect().await;

        let gate = h.mux.history().hold_writes().await;
        h.backend.exit(&session.id, 0);
        for _ in 0..100 {
            if h.mux.history().get(&session.id).unwrap().ended_at.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.mux.history().get(&session.id).unwrap().ended_at.is_some());

        // History already holds the end, so delete does not wait on the gate.
        assert!(h.mux.delete_session(&session.id).await);
        assert_eq!(
            recv(&mut rx).await,
            ServerEvent::SessionDeleted {
                session_id: session.id.clone()
            }
        );

        drop(gate);
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_dropped() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (client, mut rx) = h.mux.connect().await;

        h.mux.handle_text(&client, "{not json").await;
        h.mux.handle_text(&client, r#"{"kind":"dance","sessionId":"x"}"#).await;
        h.mux.handle_text(&client, r#"{"kind":"input","sessionId":"x"}"#).await;
        assert_silent(&mut rx).await;
        assert_eq!(h.mux.client_count().await, 1);

        let frame = format!(r#"{{"kind":"input","sessionId":"{}","data":"ok"}}"#, session.id);
        h.mux.handle_text(&client, &frame).await;
        assert_eq!(h.backend.input_text(&session.id), "ok");
    }

    #[tokio::test]
    async fn test_disconnect_removes_subscriptions() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (client, rx) = h.mux.connect().await;
        h.mux.handle_message(&client, subscribe(&session.id)).await;
        assert_eq!(h.mux.subscriber_count(&session.id).await, 1);

        assert!(h.mux.disconnect(&client).await.is_some());
        drop(rx);

        assert_eq!(h.mux.subscriber_count(&session.id).await, 0);
        assert_eq!(h.mux.client_count().await, 0);
        assert!(h.mux.disconnect(&client).await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_broadcast() {
        let h = harness();
        let (_client, rx) = h.mux.connect().await;
        drop(rx);

        h.mux.create_session("/x").await.unwrap();
        assert_eq!(h.mux.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_broadcasts_and_ends_history() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (client, mut rx) = h.mux.connect().await;
        h.mux.handle_message(&client, subscribe(&session.id)).await;

        assert!(h.mux.delete_session(&session.id).await);
        assert!(!h.mux.delete_session(&session.id).await);

        assert_eq!(
            recv(&mut rx).await,
            ServerEvent::SessionDeleted {
                session_id: session.id.clone()
            }
        );
        // The kill's exit event belongs to a removed session and is not announced.
        assert_silent(&mut rx).await;
        assert_eq!(h.backend.kill_count(&session.id), 1);
        assert_eq!(h.mux.subscriber_count(&session.id).await, 0);
        assert!(h.mux.history().get(&session.id).unwrap().ended_at.is_some());
    }

    #[tokio::test]
    async fn test_process_exit_completes_session() {
        let h = harness();
        let session = h.mux.create_session("/x").await.unwrap();
        let (_client, mut rx) = h.mux.connect().await;
        h.backend.emit(&session.id, "bye");

        h.backend.exit(&session.id, 3);

        assert_eq!(
            recv(&mut rx).await,
            ServerEvent::SessionExit {
                session_id: session.id.clone(),
                exit_code: 3
            }
        );
        let info = h.mux.get_session(&session.id).await.unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(h.mux.session_output(&session.id).await.as_deref(), Some("bye"));

        let record = h.mux.history().get(&session.id).unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert!(record.ended_at.is_some());
        assert_eq!(record.output_size, 3);
    }

    #[tokio::test]
    async fn test_teardown_kills_all_sessions() {
        let h = harness();
        let a = h.mux.create_session("/a").await.unwrap();
        let b = h.mux.create_session("/b").await.unwrap();

        assert_eq!(h.mux.teardown().await, 2);

        assert_eq!(h.mux.session_count().await, 0);
        assert!(!h.backend.is_alive(&a.id));
        assert!(!h.backend.is_alive(&b.id));
        assert!(h
            .mux
            .history()
            .get_history()
            .iter()
            .all(|r| r.ended_at.is_some()));
    }
}
