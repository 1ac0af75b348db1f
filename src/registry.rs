//! Connection registry for apps, agents and TUIs.
//!
//! Each role has its own sub-registry keyed by connection id. Agents that
//! declare a parent are additionally indexed in a bidirectional
//! parent → children / child → parent mapping. Both sides of that mapping are
//! updated inside the same `&mut self` call, and the registry itself is only
//! ever reached through a single mutex, so readers never see one side without
//! the other.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::{
    error::DeliveryError,
    events::{EventEmitter, LifecycleEvent},
    protocol::{ConnectionCounts, ConnectionRole, ProjectInfo},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Send/close capability for one socket. The writer task owns the receiving
/// half; everything else only ever holds clones of this handle.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    serial: u64,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    state: Arc<watch::Sender<SocketState>>,
}

impl SocketHandle {
    pub fn channel(serial: u64) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SocketState::Connecting);
        (
            Self {
                serial,
                tx,
                state: Arc::new(state),
            },
            rx,
        )
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open && !self.tx.is_closed()
    }

    pub fn mark_open(&self) {
        self.state.send_replace(SocketState::Open);
    }

    pub fn mark_closed(&self) {
        self.state.send_replace(SocketState::Closed);
    }

    /// Wait until the socket leaves `Connecting`. Returns whether it is open.
    pub async fn wait_open(&self, limit: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(limit, async {
            rx.wait_for(|state| *state != SocketState::Connecting)
                .await
                .map(|state| *state)
        })
        .await;
        matches!(settled, Ok(Ok(SocketState::Open))) && !self.tx.is_closed()
    }

    pub fn send_text(&self, text: String, connection_id: &str) -> Result<(), DeliveryError> {
        if self.state() == SocketState::Closed {
            return Err(DeliveryError::SocketClosed(connection_id.to_string()));
        }
        self.tx
            .send(OutboundFrame::Text(text))
            .map_err(|_| DeliveryError::SocketClosed(connection_id.to_string()))
    }

    pub fn send_json(&self, value: &Value, connection_id: &str) -> Result<(), DeliveryError> {
        self.send_text(value.to_string(), connection_id)
    }

    pub fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub role: ConnectionRole,
    pub socket: SocketHandle,
    pub parent_id: Option<String>,
    pub instance_id: Option<String>,
    pub current_project: Option<ProjectInfo>,
    pub thread_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(id: impl Into<String>, role: ConnectionRole, socket: SocketHandle) -> Self {
        Self {
            id: id.into(),
            role,
            socket,
            parent_id: None,
            instance_id: None,
            current_project: None,
            thread_id: None,
            connected_at: Utc::now(),
        }
    }

    fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "type": self.role,
            "parentId": self.parent_id,
            "instanceId": self.instance_id,
            "currentProject": self.current_project,
            "connectedAt": self.connected_at.to_rfc3339(),
            "state": self.socket.state(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRef {
    pub child_id: String,
    pub instance_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    apps: HashMap<String, Connection>,
    agents: HashMap<String, Connection>,
    tuis: HashMap<String, Connection>,
    children: HashMap<String, BTreeMap<String, ChildRef>>,
    parents: HashMap<String, String>,
    events: EventEmitter,
}

impl ConnectionRegistry {
    pub fn new(events: EventEmitter) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    fn table(&self, role: ConnectionRole) -> &HashMap<String, Connection> {
        match role {
            ConnectionRole::App => &self.apps,
            ConnectionRole::Agent => &self.agents,
            ConnectionRole::Tui => &self.tuis,
        }
    }

    fn table_mut(&mut self, role: ConnectionRole) -> &mut HashMap<String, Connection> {
        match role {
            ConnectionRole::App => &mut self.apps,
            ConnectionRole::Agent => &mut self.agents,
            ConnectionRole::Tui => &mut self.tuis,
        }
    }

    /// Register a connection, replacing any prior entry with the same id in
    /// the same role. Returns the replaced entry.
    pub fn register(&mut self, connection: Connection) -> Option<Connection> {
        let role = connection.role;
        let id = connection.id.clone();

        if role == ConnectionRole::Agent {
            self.unlink_child(&id);
            if let Some(parent) = connection.parent_id.clone() {
                self.children.entry(parent.clone()).or_default().insert(
                    id.clone(),
                    ChildRef {
                        child_id: id.clone(),
                        instance_id: connection.instance_id.clone(),
                    },
                );
                self.parents.insert(id.clone(), parent);
            }
        }

        self.events.emit(LifecycleEvent::ConnectionRegistered {
            id: id.clone(),
            role,
            parent_id: connection.parent_id.clone(),
        });
        tracing::info!(
            target = "agent_gateway::registry",
            id = %id,
            role = %role,
            parent = ?connection.parent_id,
            "connection registered"
        );

        self.table_mut(role).insert(id, connection)
    }

    /// Remove `id` from every sub-registry. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: &str) -> Vec<Connection> {
        [
            ConnectionRole::Agent,
            ConnectionRole::App,
            ConnectionRole::Tui,
        ]
        .into_iter()
        .filter_map(|role| self.remove_role(role, id))
        .collect()
    }

    pub fn remove_role(&mut self, role: ConnectionRole, id: &str) -> Option<Connection> {
        let removed = self.table_mut(role).remove(id)?;
        match role {
            ConnectionRole::Agent => self.unlink_child(id),
            ConnectionRole::App | ConnectionRole::Tui => self.unlink_parent(id),
        }
        self.events.emit(LifecycleEvent::ConnectionRemoved {
            id: id.to_string(),
            role,
        });
        tracing::info!(
            target = "agent_gateway::registry",
            id = %id,
            role = %role,
            "connection removed"
        );
        Some(removed)
    }

    /// Remove the entry only if it is still backed by the socket with `serial`.
    /// A peer that reconnected under the same id keeps its newer entry.
    pub fn remove_if_current(
        &mut self,
        role: ConnectionRole,
        id: &str,
        serial: u64,
    ) -> Option<Connection> {
        let current = self.table(role).get(id)?.socket.serial() == serial;
        if !current {
            tracing::debug!(
                target = "agent_gateway::registry",
                id = %id,
                role = %role,
                serial,
                "skipping removal of replaced connection"
            );
            return None;
        }
        self.remove_role(role, id)
    }

    fn unlink_child(&mut self, child_id: &str) {
        let Some(parent) = self.parents.remove(child_id) else {
            return;
        };
        if let Some(set) = self.children.get_mut(&parent) {
            set.remove(child_id);
            if set.is_empty() {
                self.children.remove(&parent);
            }
        }
    }

    fn unlink_parent(&mut self, parent_id: &str) {
        let Some(set) = self.children.remove(parent_id) else {
            return;
        };
        for child in set.keys() {
            if self.parents.get(child).map(String::as_str) == Some(parent_id) {
                self.parents.remove(child);
            }
        }
    }

    /// Look up by id across roles, agents first.
    pub fn get(&self, id: &str) -> Option<&Connection> {
        self.agents
            .get(id)
            .or_else(|| self.apps.get(id))
            .or_else(|| self.tuis.get(id))
    }

    pub fn get_role(&self, role: ConnectionRole, id: &str) -> Option<&Connection> {
        self.table(role).get(id)
    }

    pub fn contains(&self, role: ConnectionRole, id: &str) -> bool {
        self.table(role).contains_key(id)
    }

    pub fn list_by_role(&self, role: ConnectionRole) -> Vec<&Connection> {
        let mut list: Vec<&Connection> = self.table(role).values().collect();
        list.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn ids_by_role(&self, role: ConnectionRole) -> Vec<String> {
        self.list_by_role(role)
            .into_iter()
            .map(|conn| conn.id.clone())
            .collect()
    }

    pub fn children_of(&self, parent_id: &str) -> Vec<ChildRef> {
        self.children
            .get(parent_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn parent_of(&self, child_id: &str) -> Option<&str> {
        self.parents.get(child_id).map(String::as_str)
    }

    pub fn update_project(&mut self, id: &str, project: ProjectInfo) -> bool {
        let Some(conn) = self
            .agents
            .get_mut(id)
            .or_else(|| self.apps.get_mut(id))
            .or_else(|| self.tuis.get_mut(id))
        else {
            return false;
        };
        tracing::debug!(
            target = "agent_gateway::registry",
            id = %id,
            path = %project.path,
            "project updated"
        );
        conn.current_project = Some(project);
        true
    }

    pub fn socket(&self, role: ConnectionRole, id: &str) -> Option<SocketHandle> {
        self.table(role).get(id).map(|conn| conn.socket.clone())
    }

    /// Sockets of every connection in `role`, ordered by connect time.
    pub fn sockets(&self, role: ConnectionRole) -> Vec<(String, SocketHandle)> {
        self.list_by_role(role)
            .into_iter()
            .map(|conn| (conn.id.clone(), conn.socket.clone()))
            .collect()
    }

    pub fn counts(&self) -> ConnectionCounts {
        let (apps, agents, tuis) = (self.apps.len(), self.agents.len(), self.tuis.len());
        ConnectionCounts {
            apps,
            agents,
            tuis,
            total: apps + agents + tuis,
        }
    }

    pub fn snapshot(&self) -> Value {
        let list = |role| -> Vec<Value> {
            self.list_by_role(role)
                .into_iter()
                .map(Connection::summary)
                .collect()
        };
        let relationships: BTreeMap<&String, Vec<&ChildRef>> = self
            .children
            .iter()
            .map(|(parent, set)| (parent, set.values().collect()))
            .collect();
        json!({
            "counts": self.counts(),
            "apps": list(ConnectionRole::App),
            "agents": list(ConnectionRole::Agent),
            "tuis": list(ConnectionRole::Tui),
            "relationships": relationships,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str, role: ConnectionRole, serial: u64) -> Connection {
        let (socket, _rx) = SocketHandle::channel(serial);
        Connection::new(id, role, socket)
    }

    fn agent(id: &str, parent: Option<&str>, serial: u64) -> Connection {
        let mut c = conn(id, ConnectionRole::Agent, serial);
        c.parent_id = parent.map(ToOwned::to_owned);
        c.instance_id = Some(format!("{id}-inst"));
        c
    }

    fn child_ids(reg: &ConnectionRegistry, parent: &str) -> Vec<String> {
        reg.children_of(parent)
            .into_iter()
            .map(|c| c.child_id)
            .collect()
    }

    #[test]
    fn agent_with_parent_is_indexed_both_ways() {
        let mut reg = ConnectionRegistry::default();
        reg.register(conn("A", ConnectionRole::App, 1));
        reg.register(agent("X", Some("A"), 2));

        assert_eq!(child_ids(&reg, "A"), vec!["X"]);
        assert_eq!(reg.parent_of("X"), Some("A"));
        assert_eq!(
            reg.children_of("A")[0].instance_id.as_deref(),
            Some("X-inst")
        );
    }

    #[test]
    fn removing_parent_keeps_child_connection() {
        let mut reg = ConnectionRegistry::default();
        reg.register(conn("A", ConnectionRole::App, 1));
        reg.register(agent("X", Some("A"), 2));

        let removed = reg.remove("A");
        assert_eq!(removed.len(), 1);
        assert!(reg.children_of("A").is_empty());
        assert_eq!(reg.parent_of("X"), None);
        assert!(reg.contains(ConnectionRole::Agent, "X"));
    }

    #[test]
    fn removing_one_sibling_leaves_the_other_linked() {
        let mut reg = ConnectionRegistry::default();
        reg.register(conn("A", ConnectionRole::App, 1));
        reg.register(agent("X", Some("A"), 2));
        reg.register(agent("Y", Some("A"), 3));

        reg.remove("X");
        assert_eq!(child_ids(&reg, "A"), vec!["Y"]);
        assert_eq!(reg.parent_of("Y"), Some("A"));
        assert_eq!(reg.parent_of("X"), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = ConnectionRegistry::default();
        assert!(reg.remove("ghost").is_empty());
        reg.register(conn("A", ConnectionRole::App, 1));
        assert_eq!(reg.remove("A").len(), 1);
        assert!(reg.remove("A").is_empty());
    }

    #[test]
    fn reregistering_agent_moves_it_to_new_parent() {
        let mut reg = ConnectionRegistry::default();
        reg.register(agent("X", Some("A"), 1));
        let replaced = reg.register(agent("X", Some("B"), 2));

        assert!(replaced.is_some());
        assert!(reg.children_of("A").is_empty());
        assert_eq!(child_ids(&reg, "B"), vec!["X"]);
        assert_eq!(reg.counts().agents, 1);
    }

    #[test]
    fn stale_socket_does_not_remove_replacement() {
        let mut reg = ConnectionRegistry::default();
        reg.register(agent("X", Some("A"), 1));
        reg.register(agent("X", Some("A"), 2));

        assert!(reg
            .remove_if_current(ConnectionRole::Agent, "X", 1)
            .is_none());
        assert!(reg.contains(ConnectionRole::Agent, "X"));
        assert_eq!(child_ids(&reg, "A"), vec!["X"]);

        assert!(reg
            .remove_if_current(ConnectionRole::Agent, "X", 2)
            .is_some());
        assert!(reg.children_of("A").is_empty());
    }

    #[test]
    fn agent_may_reference_parent_that_connects_later() {
        let mut reg = ConnectionRegistry::default();
        reg.register(agent("X", Some("A"), 1));
        assert_eq!(child_ids(&reg, "A"), vec!["X"]);
        reg.register(conn("A", ConnectionRole::App, 2));
        assert_eq!(child_ids(&reg, "A"), vec!["X"]);
    }

    #[test]
    fn tui_parent_removal_cascades_too() {
        let mut reg = ConnectionRegistry::default();
        reg.register(conn("T", ConnectionRole::Tui, 1));
        reg.register(agent("X", Some("T"), 2));
        reg.remove_role(ConnectionRole::Tui, "T");
        assert_eq!(reg.parent_of("X"), None);
    }

    #[test]
    fn update_project_and_counts() {
        let mut reg = ConnectionRegistry::default();
        reg.register(conn("A", ConnectionRole::App, 1));
        reg.register(conn("T", ConnectionRole::Tui, 2));
        reg.register(agent("X", None, 3));

        assert!(reg.update_project(
            "A",
            ProjectInfo {
                path: "/repo".into(),
                name: None,
                project_type: None
            }
        ));
        assert!(!reg.update_project(
            "nope",
            ProjectInfo {
                path: "/repo".into(),
                name: None,
                project_type: None
            }
        ));
        assert_eq!(
            reg.get("A").unwrap().current_project.as_ref().unwrap().path,
            "/repo"
        );
        assert_eq!(
            reg.counts(),
            ConnectionCounts {
                apps: 1,
                agents: 1,
                tuis: 1,
                total: 3
            }
        );
        let snap = reg.snapshot();
        assert_eq!(snap["counts"]["total"], 3);
        assert_eq!(snap["agents"][0]["id"], "X");
    }

    #[test]
    fn register_and_remove_emit_lifecycle_events() {
        let (events, store) = EventEmitter::capturing();
        let mut reg = ConnectionRegistry::new(events);
        reg.register(agent("X", Some("A"), 1));
        reg.remove("X");
        reg.remove("X");

        let lines = store.lock();
        let kinds: Vec<&str> = lines.iter().map(|l| l["event"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["connection_registered", "connection_removed"]);
        assert_eq!(lines[0]["parentId"], "A");
    }

    #[tokio::test]
    async fn socket_handle_tracks_open_state() {
        let (socket, mut rx) = SocketHandle::channel(1);
        assert!(!socket.is_open());
        assert!(!socket.wait_open(Duration::from_millis(20)).await);

        let waiter = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.wait_open(Duration::from_secs(2)).await })
        };
        socket.mark_open();
        assert!(waiter.await.unwrap());

        socket.send_json(&json!({"type":"ping"}), "c1").unwrap();
        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::Text(r#"{"type":"ping"}"#.into()))
        );

        socket.mark_closed();
        assert!(matches!(
            socket.send_json(&json!({}), "c1"),
            Err(DeliveryError::SocketClosed(_))
        ));
    }
}
