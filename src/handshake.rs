//! Connection parameters and role classification for newly accepted sockets.

use serde::Deserialize;
use uuid::Uuid;

use crate::protocol::{ConnectionRole, ManualRegistration, ProjectInfo, RegistrationType};

/// Query parameters a peer supplies when opening its socket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub agent_id: Option<String>,
    pub parent_id: Option<String>,
    pub client_type: Option<String>,
    pub app_id: Option<String>,
    pub tui_id: Option<String>,
    pub current_project: Option<String>,
    pub project_name: Option<String>,
    pub project_type: Option<String>,
    pub thread_id: Option<String>,
    pub connection_id: Option<String>,
}

/// The outcome of classifying a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub role: ConnectionRole,
    pub id: String,
    pub parent_id: Option<String>,
    pub instance_id: String,
    pub project: Option<ProjectInfo>,
    pub thread_id: Option<String>,
    pub registration_type: RegistrationType,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

impl ConnectionParams {
    pub fn project(&self) -> Option<ProjectInfo> {
        non_empty(&self.current_project).map(|path| ProjectInfo {
            path,
            name: non_empty(&self.project_name),
            project_type: non_empty(&self.project_type),
        })
    }

    /// Classify the connection. First match wins:
    /// agent id + parent id, `clientType=app`, `clientType=tui`,
    /// bare agent id, and finally app.
    pub fn classify(&self, provisional_id: &str) -> Registration {
        let agent_id = non_empty(&self.agent_id);
        let parent_id = non_empty(&self.parent_id);
        let hint = non_empty(&self.client_type)
            .as_deref()
            .and_then(ConnectionRole::from_hint);
        let instance_id =
            non_empty(&self.connection_id).unwrap_or_else(|| Uuid::new_v4().to_string());

        let (role, id, parent_id) = match (agent_id, parent_id, hint) {
            (Some(agent), Some(parent), _) => (ConnectionRole::Agent, agent, Some(parent)),
            (_, _, Some(ConnectionRole::App)) => (
                ConnectionRole::App,
                non_empty(&self.app_id).unwrap_or_else(|| provisional_id.to_string()),
                None,
            ),
            (_, _, Some(ConnectionRole::Tui)) => (
                ConnectionRole::Tui,
                non_empty(&self.tui_id).unwrap_or_else(|| provisional_id.to_string()),
                None,
            ),
            (Some(agent), None, _) => (ConnectionRole::Agent, agent, None),
            _ => (
                ConnectionRole::App,
                non_empty(&self.app_id).unwrap_or_else(|| provisional_id.to_string()),
                None,
            ),
        };

        Registration {
            role,
            id,
            parent_id,
            instance_id,
            project: self.project(),
            thread_id: non_empty(&self.thread_id),
            registration_type: RegistrationType::Auto,
        }
    }
}

impl Registration {
    /// Build a registration from an in-band `register` frame.
    pub fn manual(request: &ManualRegistration, current_id: &str) -> Self {
        Self {
            role: request.role,
            id: request
                .id
                .clone()
                .unwrap_or_else(|| current_id.to_string()),
            parent_id: request.parent_id.clone(),
            instance_id: request
                .instance_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            project: None,
            thread_id: None,
            registration_type: RegistrationType::Manual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> ConnectionParams {
        let value = serde_json::Value::Object(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::from(*v)))
                .collect(),
        );
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn agent_with_parent_wins_over_client_type() {
        let reg = params(&[("agentId", "X"), ("parentId", "A"), ("clientType", "app")])
            .classify("prov-1");
        assert_eq!(reg.role, ConnectionRole::Agent);
        assert_eq!(reg.id, "X");
        assert_eq!(reg.parent_id.as_deref(), Some("A"));
    }

    #[test]
    fn app_uses_declared_id_or_provisional() {
        let reg = params(&[("clientType", "app"), ("appId", "A")]).classify("prov-1");
        assert_eq!((reg.role, reg.id.as_str()), (ConnectionRole::App, "A"));

        let reg = params(&[("clientType", "app")]).classify("prov-1");
        assert_eq!(reg.id, "prov-1");
    }

    #[test]
    fn tui_hint_registers_tui() {
        let reg = params(&[("clientType", "TUI"), ("tuiId", "T1")]).classify("prov-1");
        assert_eq!(reg.role, ConnectionRole::Tui);
        assert_eq!(reg.id, "T1");
    }

    #[test]
    fn agent_without_parent_keeps_agent_role() {
        let reg = params(&[("agentId", "X")]).classify("prov-1");
        assert_eq!(reg.role, ConnectionRole::Agent);
        assert_eq!(reg.parent_id, None);
    }

    #[test]
    fn unknown_hint_defaults_to_app() {
        let reg = params(&[("clientType", "browser")]).classify("prov-9");
        assert_eq!(reg.role, ConnectionRole::App);
        assert_eq!(reg.id, "prov-9");
        assert_eq!(reg.registration_type, RegistrationType::Auto);
    }

    #[test]
    fn connection_id_becomes_instance_id_and_project_is_parsed() {
        let reg = params(&[
            ("clientType", "app"),
            ("connectionId", "inst-7"),
            ("currentProject", "/work/repo"),
            ("projectName", "repo"),
            ("threadId", "th-1"),
        ])
        .classify("prov-1");
        assert_eq!(reg.instance_id, "inst-7");
        assert_eq!(reg.thread_id.as_deref(), Some("th-1"));
        let project = reg.project.unwrap();
        assert_eq!(project.path, "/work/repo");
        assert_eq!(project.name.as_deref(), Some("repo"));
        assert_eq!(project.project_type, None);
    }

    #[test]
    fn blank_values_are_ignored() {
        let reg = params(&[("agentId", " "), ("parentId", "A")]).classify("prov-1");
        assert_eq!(reg.role, ConnectionRole::App);
    }
}
