//! Delivery to apps, TUIs, agents and the remote relay, with fallbacks.

use serde_json::Value;
use tokio::{
    sync::broadcast::error::RecvError,
    time::{timeout_at, Instant},
};

use crate::{
    context::GatewayContext,
    error::DeliveryError,
    protocol::ConnectionRole,
    registry::SocketHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    Local,
    /// Handed to the relay because the client is not connected here.
    Remote,
}

fn unreachable(role: ConnectionRole) -> DeliveryError {
    match role {
        ConnectionRole::Tui => DeliveryError::NoTuis,
        ConnectionRole::Agent => DeliveryError::NoAgents,
        ConnectionRole::App => DeliveryError::NoApps,
    }
}

/// Write straight to a connected client's socket, no fallback.
pub fn send_local(
    ctx: &GatewayContext,
    role: ConnectionRole,
    id: &str,
    frame: &Value,
) -> Result<(), DeliveryError> {
    let socket = ctx
        .registry
        .lock()
        .socket(role, id)
        .ok_or_else(|| unreachable(role))?;
    socket.send_json(frame, id)
}

/// Relay fallback for an agent frame whose client is not here.
fn agent_frame_to_relay(
    ctx: &GatewayContext,
    role: ConnectionRole,
    agent_id: &str,
    frame: &Value,
) -> Result<Delivered, DeliveryError> {
    let Some(tunnel) = &ctx.tunnel else {
        return Err(unreachable(role));
    };
    tracing::debug!(
        target = "agent_gateway::delivery",
        role = %role,
        agent = %agent_id,
        "client not local, forwarding agent message to relay"
    );
    tunnel.forward_agent_message(Some(agent_id), frame.clone());
    Ok(Delivered::Remote)
}

fn send_to_client(
    ctx: &GatewayContext,
    role: ConnectionRole,
    id: &str,
    frame: &Value,
    from_agent: Option<&str>,
) -> Result<Delivered, DeliveryError> {
    match send_local(ctx, role, id, frame) {
        Ok(()) => Ok(Delivered::Local),
        Err(error) => match from_agent {
            Some(agent_id) => agent_frame_to_relay(ctx, role, agent_id, frame),
            None => Err(error),
        },
    }
}

/// Deliver to an app. Agent-originated frames fall back to the relay.
pub fn send_to_app(
    ctx: &GatewayContext,
    app_id: &str,
    frame: &Value,
    from_agent: Option<&str>,
) -> Result<Delivered, DeliveryError> {
    send_to_client(ctx, ConnectionRole::App, app_id, frame, from_agent)
}

pub fn send_to_tui(
    ctx: &GatewayContext,
    tui_id: &str,
    frame: &Value,
    from_agent: Option<&str>,
) -> Result<Delivered, DeliveryError> {
    send_to_client(ctx, ConnectionRole::Tui, tui_id, frame, from_agent)
}

/// Best-effort write to every connected app except `skip`.
pub fn broadcast_to_apps(ctx: &GatewayContext, frame: &Value, skip: Option<&str>) -> usize {
    let sockets = ctx.registry.lock().sockets(ConnectionRole::App);
    let text = frame.to_string();
    sockets
        .into_iter()
        .filter(|(id, _)| Some(id.as_str()) != skip)
        .filter(|(id, socket)| socket.send_text(text.clone(), id).is_ok())
        .count()
}

/// Deliver to one agent, starting it on demand.
///
/// A connected but not-yet-open agent is waited for. An unknown agent is
/// started exactly once, then awaited until it registers and its socket
/// opens. Both waits share the configured agent-ready timeout.
pub async fn send_to_specific_agent(
    ctx: &GatewayContext,
    agent_id: &str,
    parent_id: Option<&str>,
    frame: &Value,
) -> Result<(), DeliveryError> {
    let limit = ctx.settings.agent_ready_timeout;
    let deadline = Instant::now() + limit;
    let not_ready = || DeliveryError::AgentNotReady {
        agent_id: agent_id.to_string(),
        waited_ms: limit.as_millis() as u64,
    };

    // Subscribe before looking, so a registration racing the lookup is seen.
    let mut registrations = ctx.subscribe_registrations();
    let existing = ctx.registry.lock().socket(ConnectionRole::Agent, agent_id);

    let socket = match existing {
        Some(socket) => socket,
        None => {
            tracing::info!(
                target = "agent_gateway::delivery",
                agent = %agent_id,
                parent = ?parent_id,
                "agent not connected, starting it"
            );
            ctx.launcher
                .start_agent(agent_id, parent_id)
                .await
                .map_err(|source| DeliveryError::Supervisor {
                    agent_id: agent_id.to_string(),
                    source,
                })?;
            wait_for_registration(ctx, &mut registrations, agent_id, deadline)
                .await
                .ok_or_else(not_ready)?
        }
    };

    if !socket.is_open() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !socket.wait_open(remaining).await {
            tracing::warn!(
                target = "agent_gateway::delivery",
                agent = %agent_id,
                "agent socket never opened"
            );
            return Err(not_ready());
        }
    }
    socket.send_json(frame, agent_id)
}

async fn wait_for_registration(
    ctx: &GatewayContext,
    registrations: &mut tokio::sync::broadcast::Receiver<crate::context::Registered>,
    agent_id: &str,
    deadline: Instant,
) -> Option<SocketHandle> {
    loop {
        let found = ctx.registry.lock().socket(ConnectionRole::Agent, agent_id);
        if found.is_some() {
            return found;
        }
        match timeout_at(deadline, registrations.recv()).await {
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) | Err(_) => return None,
        }
    }
}

/// Hand a frame to the relay. With `required`, a missing tunnel is an error;
/// otherwise it is logged and dropped.
pub fn send_to_remote(
    ctx: &GatewayContext,
    origin_role: ConnectionRole,
    origin_id: Option<&str>,
    frame: &Value,
    required: bool,
) -> Result<(), DeliveryError> {
    let Some(tunnel) = &ctx.tunnel else {
        if required {
            return Err(DeliveryError::TunnelUnavailable);
        }
        tracing::warn!(
            target = "agent_gateway::delivery",
            origin = %origin_role,
            "no remote tunnel configured, dropping frame"
        );
        return Ok(());
    };
    let frame = frame.clone();
    let queued = match origin_role {
        ConnectionRole::Agent => tunnel.forward_agent_message(origin_id, frame),
        ConnectionRole::App => tunnel.forward_app_message(origin_id, frame),
        ConnectionRole::Tui => tunnel.forward_tui_message(origin_id, frame),
    };
    if !queued {
        tracing::debug!(
            target = "agent_gateway::delivery",
            origin = %origin_role,
            "tunnel not open, frame not queued"
        );
    }
    Ok(())
}

/// Agent traffic goes to its local client through the app/TUI senders, and a
/// copy goes to the relay. When the client is not here the sender's relay
/// fallback already carries the frame, so it is not mirrored twice.
pub fn deliver_local_and_mirror_remote(
    ctx: &GatewayContext,
    agent_id: &str,
    target: Option<(ConnectionRole, &str)>,
    frame: &Value,
) -> Result<Delivered, DeliveryError> {
    let outcome = match target {
        Some((ConnectionRole::Tui, id)) => send_to_tui(ctx, id, frame, Some(agent_id)),
        Some((_, id)) => send_to_app(ctx, id, frame, Some(agent_id)),
        None => agent_frame_to_relay(ctx, ConnectionRole::App, agent_id, frame),
    };
    if let (Ok(Delivered::Local), Some(tunnel)) = (&outcome, &ctx.tunnel) {
        tunnel.forward_agent_message(Some(agent_id), frame.clone());
    }
    outcome
}
