//! Process-wide collaborators, built once at startup and shared by reference.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{
    events::EventEmitter,
    origins::RequestOriginCache,
    pending::PendingRequests,
    protocol::{ConnectionCounts, ConnectionRole},
    registry::{Connection, ConnectionRegistry},
    supervisor::AgentLauncher,
    tunnel::TunnelClient,
};

const ORIGIN_TTL: Duration = Duration::from_secs(600);
const ORIGIN_MAX_ENTRIES: usize = 8192;
const REGISTRATION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub server_id: String,
    pub default_agent: Option<String>,
    pub request_timeout: Duration,
    pub agent_ready_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            default_agent: None,
            request_timeout: Duration::from_secs(30),
            agent_ready_timeout: Duration::from_secs(30),
        }
    }
}

/// A newly registered connection, announced to readiness waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub role: ConnectionRole,
    pub id: String,
}

pub struct GatewayContext {
    pub settings: GatewaySettings,
    pub registry: Mutex<ConnectionRegistry>,
    pub pending: PendingRequests,
    pub origins: Mutex<RequestOriginCache>,
    pub launcher: Arc<dyn AgentLauncher>,
    pub tunnel: Option<TunnelClient>,
    pub events: EventEmitter,
    registrations: broadcast::Sender<Registered>,
    serial: AtomicU64,
    started_at: Instant,
}

impl GatewayContext {
    pub fn new(
        settings: GatewaySettings,
        launcher: Arc<dyn AgentLauncher>,
        tunnel: Option<TunnelClient>,
        events: EventEmitter,
    ) -> Self {
        let (registrations, _) = broadcast::channel(REGISTRATION_CHANNEL_CAPACITY);
        Self {
            pending: PendingRequests::new(settings.request_timeout),
            registry: Mutex::new(ConnectionRegistry::new(events.clone())),
            origins: Mutex::new(RequestOriginCache::new(ORIGIN_TTL, ORIGIN_MAX_ENTRIES)),
            settings,
            launcher,
            tunnel,
            events,
            registrations,
            serial: AtomicU64::new(1),
            started_at: Instant::now(),
        }
    }

    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Register and announce. The announcement is sent after the registry
    /// lock is released.
    pub fn register(&self, connection: Connection) -> Option<Connection> {
        let announce = Registered {
            role: connection.role,
            id: connection.id.clone(),
        };
        let replaced = self.registry.lock().register(connection);
        let _ = self.registrations.send(announce);
        replaced
    }

    pub fn subscribe_registrations(&self) -> broadcast::Receiver<Registered> {
        self.registrations.subscribe()
    }

    pub fn counts(&self) -> ConnectionCounts {
        self.registry.lock().counts()
    }

    pub fn record_origin(&self, request_id: &str, agent_id: &str) {
        self.origins.lock().record(request_id, agent_id, Instant::now());
    }

    pub fn take_origin(&self, request_id: &str) -> Option<String> {
        self.origins.lock().take(request_id, Instant::now())
    }

    pub fn info(&self) -> Value {
        json!({
            "serverId": self.settings.server_id,
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeMs": self.started_at.elapsed().as_millis() as u64,
            "tunnel": self.tunnel.as_ref().map(|t| json!({
                "state": t.state(),
                "reconnectAttempts": t.reconnect_attempts(),
            })),
            "counts": self.counts(),
            "pendingRequests": self.pending.len(),
            "cachedOrigins": self.origins.lock().len(),
            "runningAgents": self.launcher.running(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{context, FakeLauncher};
    use super::*;
    use crate::registry::SocketHandle;

    #[tokio::test]
    async fn register_announces_after_insert() {
        let ctx = context(Arc::new(FakeLauncher::default()));
        let mut rx = ctx.subscribe_registrations();
        let (socket, _out) = SocketHandle::channel(ctx.next_serial());
        ctx.register(Connection::new("X", ConnectionRole::Agent, socket));

        let announced = rx.recv().await.unwrap();
        assert_eq!(announced.id, "X");
        assert!(ctx.registry.lock().contains(ConnectionRole::Agent, "X"));
    }

    #[test]
    fn info_reports_counts_and_no_tunnel() {
        let ctx = context(Arc::new(FakeLauncher::default()));
        let info = ctx.info();
        assert_eq!(info["serverId"], "test-server");
        assert_eq!(info["counts"]["total"], 0);
        assert!(info["tunnel"].is_null());
        assert_eq!(info["cachedOrigins"], 0);
    }

    #[test]
    fn serials_are_unique() {
        let ctx = context(Arc::new(FakeLauncher::default()));
        assert_ne!(ctx.next_serial(), ctx.next_serial());
    }
}
