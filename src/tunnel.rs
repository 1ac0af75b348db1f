//! Outbound tunnel to the remote relay.
//!
//! `Disconnected → Connecting → Registered → Disconnected(retry) → …`
//! Relay frames addressed to local peers are handed back to the gateway over
//! an mpsc channel; they are never echoed into the relay.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    events::{EventEmitter, LifecycleEvent},
    protocol::{RemoteMessage, RemoteTarget, TunnelInbound, TunnelOutbound},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Registered,
}

#[derive(Debug, Clone)]
pub enum TunnelControl {
    Shutdown,
}

/// What the gateway must do with an inbound relay frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelEvent {
    Deliver(RemoteMessage),
    ConnectionsRequested,
}

#[derive(Debug, Clone, PartialEq)]
enum RelayAction {
    Reply(TunnelOutbound),
    Forward(TunnelEvent),
    Ignore,
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub url: String,
    pub server_id: String,
    pub app_token: Option<String>,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

#[derive(Clone)]
pub struct TunnelClient {
    options: Arc<TunnelOptions>,
    state: Arc<watch::Sender<TunnelState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<TunnelOutbound>>>>,
    control: Arc<Mutex<Option<mpsc::Sender<TunnelControl>>>>,
    attempts: Arc<AtomicU32>,
    stopped: Arc<AtomicBool>,
    events: EventEmitter,
}

impl TunnelClient {
    /// Constructed disconnected; call [`TunnelClient::start_connection`].
    pub fn new(options: TunnelOptions, events: EventEmitter) -> Self {
        let (state, _) = watch::channel(TunnelState::Disconnected);
        Self {
            options: Arc::new(options),
            state: Arc::new(state),
            outbound: Arc::new(Mutex::new(None)),
            control: Arc::new(Mutex::new(None)),
            attempts: Arc::new(AtomicU32::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TunnelState::Registered && self.outbound.lock().is_some()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Start the connect/reconnect loop. Relay traffic for local peers is
    /// sent to `inbound_tx`.
    pub fn start_connection(&self, inbound_tx: mpsc::Sender<TunnelEvent>) -> JoinHandle<()> {
        let (control_tx, control_rx) = mpsc::channel(4);
        *self.control.lock() = Some(control_tx);
        self.stopped.store(false, Ordering::SeqCst);
        let client = self.clone();
        tokio::spawn(async move { client.run(inbound_tx, control_rx).await })
    }

    /// Manual stop: closes the socket and suppresses reconnects.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let control = self.control.lock().take();
        if let Some(control) = control {
            let _ = control.send(TunnelControl::Shutdown).await;
        }
    }

    pub fn forward_agent_message(&self, agent_id: Option<&str>, payload: Value) -> bool {
        self.send(TunnelOutbound::ForwardFromAgent {
            agent_id: agent_id.map(ToOwned::to_owned),
            app_token: self.options.app_token.clone(),
            payload,
        })
    }

    pub fn forward_app_message(&self, app_id: Option<&str>, payload: Value) -> bool {
        self.send(TunnelOutbound::ForwardFromApp {
            app_id: app_id.map(ToOwned::to_owned),
            app_token: self.options.app_token.clone(),
            payload,
        })
    }

    pub fn forward_tui_message(&self, tui_id: Option<&str>, payload: Value) -> bool {
        self.send(TunnelOutbound::ForwardFromTui {
            app_id: tui_id.map(ToOwned::to_owned),
            app_token: self.options.app_token.clone(),
            payload,
        })
    }

    pub fn send_connections_snapshot(&self, data: Value) -> bool {
        self.send(TunnelOutbound::ConnectionsSnapshot { data })
    }

    /// Queue a frame. Returns `false` (and drops the frame) when the socket is
    /// not currently open.
    fn send(&self, frame: TunnelOutbound) -> bool {
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => {
                tracing::debug!(
                    target = "agent_gateway::tunnel",
                    "tunnel not open, dropping outbound frame"
                );
                false
            }
        }
    }

    fn set_state(&self, state: TunnelState) {
        self.state.send_replace(state);
        self.events.emit(LifecycleEvent::Tunnel { state });
    }

    async fn run(
        &self,
        inbound_tx: mpsc::Sender<TunnelEvent>,
        mut control_rx: mpsc::Receiver<TunnelControl>,
    ) {
        let url = normalize_relay_url(&self.options.url);

        loop {
            self.set_state(TunnelState::Connecting);
            let mut shutdown = false;

            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    let (mut write, mut read) = ws.split();
                    let register = TunnelOutbound::RegisterGateway {
                        server_id: self.options.server_id.clone(),
                        app_token: self.options.app_token.clone(),
                        timestamp: Utc::now().timestamp_millis(),
                    };
                    match write.send(Message::Text(to_text(&register))).await {
                        Ok(()) => {
                            let (out_tx, mut out_rx) = mpsc::unbounded_channel();
                            *self.outbound.lock() = Some(out_tx);
                            self.attempts.store(0, Ordering::SeqCst);
                            self.set_state(TunnelState::Registered);
                            tracing::info!(
                                target = "agent_gateway::tunnel",
                                url = %url,
                                server_id = %self.options.server_id,
                                "registered with relay"
                            );

                            loop {
                                tokio::select! {
                                    ctrl = control_rx.recv() => {
                                        match ctrl {
                                            Some(TunnelControl::Shutdown) | None => {
                                                let _ = write.close().await;
                                                shutdown = true;
                                                break;
                                            }
                                        }
                                    }
                                    Some(frame) = out_rx.recv() => {
                                        if let Err(error) = write.send(Message::Text(to_text(&frame))).await {
                                            tracing::warn!(target = "agent_gateway::tunnel", error = %error, "relay write failed");
                                            break;
                                        }
                                    }
                                    frame = read.next() => {
                                        match frame {
                                            Some(Ok(Message::Text(text))) => {
                                                match interpret_frame(&text) {
                                                    RelayAction::Reply(reply) => {
                                                        if let Err(error) = write.send(Message::Text(to_text(&reply))).await {
                                                            tracing::warn!(target = "agent_gateway::tunnel", error = %error, "relay reply failed");
                                                            break;
                                                        }
                                                    }
                                                    RelayAction::Forward(event) => {
                                                        if inbound_tx.send(event).await.is_err() {
                                                            tracing::warn!(target = "agent_gateway::tunnel", "gateway inbound channel closed");
                                                        }
                                                    }
                                                    RelayAction::Ignore => {}
                                                }
                                            }
                                            Some(Ok(Message::Close(_))) | None => break,
                                            Some(Err(error)) => {
                                                tracing::warn!(target = "agent_gateway::tunnel", error = %error, "relay read error");
                                                break;
                                            }
                                            Some(Ok(_)) => {}
                                        }
                                    }
                                }
                            }
                            self.outbound.lock().take();
                        }
                        Err(error) => {
                            tracing::warn!(target = "agent_gateway::tunnel", error = %error, "failed to send relay registration");
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target = "agent_gateway::tunnel",
                        url = %url,
                        error = %error,
                        "relay connect failed"
                    );
                }
            }

            self.set_state(TunnelState::Disconnected);
            if shutdown || self.stopped.load(Ordering::SeqCst) {
                tracing::info!(target = "agent_gateway::tunnel", "tunnel stopped");
                break;
            }

            let attempts = self.attempts.load(Ordering::SeqCst);
            if !should_retry(attempts, self.options.max_reconnect_attempts) {
                tracing::error!(
                    target = "agent_gateway::tunnel",
                    attempts,
                    max = self.options.max_reconnect_attempts,
                    "giving up on relay after max reconnect attempts"
                );
                break;
            }
            self.attempts.store(attempts + 1, Ordering::SeqCst);
            tracing::info!(
                target = "agent_gateway::tunnel",
                attempt = attempts + 1,
                delay_ms = self.options.reconnect_delay.as_millis() as u64,
                "scheduling relay reconnect"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                _ = control_rx.recv() => {
                    tracing::info!(target = "agent_gateway::tunnel", "tunnel stopped during reconnect wait");
                    break;
                }
            }
        }
    }
}

/// Whether a reconnect may be scheduled after `attempts` earlier retries.
pub fn should_retry(attempts: u32, max_attempts: u32) -> bool {
    attempts < max_attempts
}

/// Relay URLs may be given as http(s); the tunnel speaks ws(s).
pub fn normalize_relay_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with("wss://") || raw.starts_with("ws://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{raw}")
    }
}

fn to_text(frame: &TunnelOutbound) -> String {
    serde_json::to_string(frame).unwrap_or_default()
}

fn interpret_frame(text: &str) -> RelayAction {
    let frame = match serde_json::from_str::<TunnelInbound>(text) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::debug!(
                target = "agent_gateway::tunnel",
                raw = %text,
                error = %error,
                "ignoring unrecognised relay frame"
            );
            return RelayAction::Ignore;
        }
    };

    match frame {
        TunnelInbound::Ping { .. } => RelayAction::Reply(TunnelOutbound::Pong {
            timestamp: Utc::now().timestamp_millis(),
        }),
        TunnelInbound::ForwardToAgent {
            agent_id,
            application_id,
            payload,
            ..
        } => RelayAction::Forward(TunnelEvent::Deliver(RemoteMessage {
            target: RemoteTarget::Agent {
                agent_id,
                parent_id: application_id,
            },
            payload,
        })),
        TunnelInbound::ForwardToApp { app_id, payload, .. } => {
            RelayAction::Forward(TunnelEvent::Deliver(RemoteMessage {
                target: RemoteTarget::App { app_id },
                payload,
            }))
        }
        TunnelInbound::BroadcastToApps { payload } => {
            RelayAction::Forward(TunnelEvent::Deliver(RemoteMessage {
                target: RemoteTarget::AllApps,
                payload,
            }))
        }
        TunnelInbound::RequestConnections {} => {
            RelayAction::Forward(TunnelEvent::ConnectionsRequested)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn options(url: String, max: u32) -> TunnelOptions {
        TunnelOptions {
            url,
            server_id: "srv-1".into(),
            app_token: Some("tok".into()),
            max_reconnect_attempts: max,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn normalizes_http_schemes() {
        assert_eq!(normalize_relay_url("https://relay.dev/ws"), "wss://relay.dev/ws");
        assert_eq!(normalize_relay_url("http://localhost:3001"), "ws://localhost:3001");
        assert_eq!(normalize_relay_url("ws://localhost:3001"), "ws://localhost:3001");
        assert_eq!(normalize_relay_url(" relay.dev "), "wss://relay.dev");
    }

    #[test]
    fn retry_stops_exactly_at_max() {
        let max = 3;
        let retries = (0..10).take_while(|a| should_retry(*a, max)).count();
        assert_eq!(retries, 3);
        assert!(!should_retry(3, 3));
        assert!(!should_retry(0, 0));
    }

    #[test]
    fn interprets_relay_frames() {
        assert!(matches!(
            interpret_frame(r#"{"type":"ping"}"#),
            RelayAction::Reply(TunnelOutbound::Pong { .. })
        ));
        assert_eq!(
            interpret_frame(r#"{"type":"request_connections"}"#),
            RelayAction::Forward(TunnelEvent::ConnectionsRequested)
        );
        assert_eq!(
            interpret_frame(r#"{"type":"broadcast_to_apps","payload":{"type":"n"}}"#),
            RelayAction::Forward(TunnelEvent::Deliver(RemoteMessage {
                target: RemoteTarget::AllApps,
                payload: json!({"type":"n"}),
            }))
        );
        assert_eq!(interpret_frame(r#"{"type":"mystery"}"#), RelayAction::Ignore);
        assert_eq!(interpret_frame("garbage"), RelayAction::Ignore);
    }

    #[test]
    fn forwarding_while_disconnected_is_a_noop() {
        let client = TunnelClient::new(options("ws://127.0.0.1:1".into(), 0), EventEmitter::default());
        assert_eq!(client.state(), TunnelState::Disconnected);
        assert!(!client.is_open());
        assert!(!client.forward_agent_message(Some("X"), json!({"type":"t"})));
        assert!(!client.forward_app_message(None, json!({"type":"t"})));
    }

    #[tokio::test]
    async fn gives_up_after_max_reconnect_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TunnelClient::new(options(format!("http://{addr}"), 2), EventEmitter::default());
        let (tx, _rx) = mpsc::channel(8);
        let handle = client.start_connection(tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconnect loop should terminate")
            .unwrap();

        assert_eq!(client.reconnect_attempts(), 2);
        assert_eq!(client.state(), TunnelState::Disconnected);
    }

    #[tokio::test]
    async fn registers_answers_ping_and_forwards_relay_traffic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let register = ws.next().await.unwrap().unwrap().into_text().unwrap();
            let register: Value = serde_json::from_str(&register).unwrap();
            assert_eq!(register["type"], "register_gateway");
            assert_eq!(register["serverId"], "srv-1");
            assert_eq!(register["appToken"], "tok");

            ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
            let pong = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert!(pong.contains(r#""type":"pong""#));

            ws.send(Message::Text(
                r#"{"type":"forward_to_agent","agentId":"X","applicationId":"A","payload":{"type":"task"}}"#.into(),
            ))
            .await
            .unwrap();

            let forwarded = ws.next().await.unwrap().unwrap().into_text().unwrap();
            let forwarded: Value = serde_json::from_str(&forwarded).unwrap();
            assert_eq!(forwarded["type"], "forward_from_agent");
            assert_eq!(forwarded["agentId"], "X");
            assert_eq!(forwarded["payload"]["type"], "reply");
        });

        let client = TunnelClient::new(options(format!("http://{addr}"), 0), EventEmitter::default());
        let (tx, mut rx) = mpsc::channel(8);
        let handle = client.start_connection(tx);

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            TunnelEvent::Deliver(RemoteMessage {
                target: RemoteTarget::Agent {
                    agent_id: Some("X".into()),
                    parent_id: Some("A".into()),
                },
                payload: json!({"type":"task"}),
            })
        );
        assert!(client.is_open());
        assert!(client.forward_agent_message(Some("X"), json!({"type":"reply"})));

        relay.await.unwrap();
        client.stop().await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.state(), TunnelState::Disconnected);
    }
}
