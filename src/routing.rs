//! Routing for frames from agents, from apps/TUIs, and from the relay.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::{
    context::GatewayContext,
    delivery::{
        broadcast_to_apps, deliver_local_and_mirror_remote, send_local, send_to_app,
        send_to_remote, send_to_specific_agent, Delivered,
    },
    error::{DeliveryError, PendingError},
    fs_ops,
    protocol::{error_envelope, ConnectionRole, Envelope, MessageKind, RemoteMessage, RemoteTarget},
    tunnel::TunnelEvent,
};

fn reply(ctx: &GatewayContext, role: ConnectionRole, id: &str, frame: &Value) {
    if let Err(error) = send_local(ctx, role, id, frame) {
        tracing::warn!(
            target = "agent_gateway::routing",
            role = %role,
            id = %id,
            error = %error,
            "failed to reply"
        );
    }
}

fn reply_error(
    ctx: &GatewayContext,
    role: ConnectionRole,
    id: &str,
    request_id: Option<&str>,
    error: &DeliveryError,
) {
    let frame = error_envelope(request_id.unwrap_or(id), error);
    reply(ctx, role, id, &frame);
}

/// The client an agent's traffic should go to: its registered parent, the
/// client the supervisor started it for, then any TUI.
fn resolve_agent_client(ctx: &GatewayContext, agent_id: &str) -> Option<(ConnectionRole, String)> {
    let from_supervisor = ctx.launcher.client_for(agent_id);
    let registry = ctx.registry.lock();
    let connected = |id: &str| {
        [ConnectionRole::App, ConnectionRole::Tui]
            .into_iter()
            .find(|role| registry.contains(*role, id))
            .map(|role| (role, id.to_string()))
    };

    registry
        .parent_of(agent_id)
        .and_then(connected)
        .or_else(|| from_supervisor.as_deref().and_then(connected))
        .or_else(|| {
            registry
                .ids_by_role(ConnectionRole::Tui)
                .into_iter()
                .next()
                .map(|id| (ConnectionRole::Tui, id))
        })
}

/// A frame from an agent asking its client to do something.
pub async fn route_agent_message(ctx: &Arc<GatewayContext>, agent_id: &str, mut envelope: Envelope) {
    let request_id = envelope.request_id.clone();
    tracing::trace!(
        target = "agent_gateway::routing",
        agent = %agent_id,
        msg_type = %envelope.msg_type,
        "agent frame"
    );

    match &envelope.kind {
        MessageKind::ReadFile { file_path } => {
            let response = fs_ops::read_file(request_id.as_deref(), file_path).await;
            reply(ctx, ConnectionRole::Agent, agent_id, &response.to_value());
            return;
        }
        MessageKind::WriteFile { file_path, content } => {
            let response = fs_ops::write_file(request_id.as_deref(), file_path, content).await;
            reply(ctx, ConnectionRole::Agent, agent_id, &response.to_value());
            return;
        }
        _ => {}
    }

    if envelope.agent_id.is_none() {
        envelope.set("agentId", agent_id);
    }
    let frame = envelope.into_value();
    let target = resolve_agent_client(ctx, agent_id);

    // Registered before sending so a fast response cannot miss it.
    let waiter = match (&target, &request_id) {
        (Some(_), Some(request_id)) => {
            ctx.record_origin(request_id, agent_id);
            match ctx.pending.register(request_id, agent_id) {
                Ok(waiter) => Some(waiter),
                Err(error) => {
                    tracing::debug!(
                        target = "agent_gateway::routing",
                        agent = %agent_id,
                        error = %error,
                        "not correlating agent request"
                    );
                    None
                }
            }
        }
        _ => None,
    };

    let outcome = deliver_local_and_mirror_remote(
        ctx,
        agent_id,
        target.as_ref().map(|(role, id)| (*role, id.as_str())),
        &frame,
    );

    match (&outcome, waiter) {
        (Ok(Delivered::Local), Some(waiter)) => {
            // The response itself is written by the client router; the waiter
            // only bounds how long the entry stays pending.
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                match waiter.wait().await {
                    Ok(_) | Err(PendingError::Timeout { .. }) => {}
                    Err(error) => tracing::debug!(
                        target = "agent_gateway::routing",
                        agent = %agent_id,
                        error = %error,
                        "agent request abandoned"
                    ),
                }
            });
        }
        (_, Some(waiter)) => {
            ctx.pending.cancel(waiter.request_id());
        }
        _ => {}
    }

    if let Err(error) = outcome {
        tracing::debug!(
            target = "agent_gateway::routing",
            agent = %agent_id,
            error = %error,
            "no local client for agent message"
        );
        reply_error(ctx, ConnectionRole::Agent, agent_id, request_id.as_deref(), &error);
    }
}

/// A frame from an app or TUI: a response, an initial prompt, or a message
/// for an agent.
pub async fn route_client_message(
    ctx: &Arc<GatewayContext>,
    role: ConnectionRole,
    client_id: &str,
    envelope: Envelope,
) {
    tracing::trace!(
        target = "agent_gateway::routing",
        role = %role,
        client = %client_id,
        msg_type = %envelope.msg_type,
        "client frame"
    );

    if let Some(request_id) = envelope.request_id.as_deref() {
        let frame = envelope.to_value();
        if let Some(origin) = ctx.pending.resolve(request_id, frame.clone()) {
            ctx.take_origin(request_id);
            // Written before returning so it precedes the client's next frame.
            reply(ctx, ConnectionRole::Agent, &origin, &frame);
            return;
        }
    }

    if envelope.kind == MessageKind::InitialPrompt {
        route_initial_prompt(ctx, role, client_id, envelope).await;
        return;
    }

    let request_id = envelope.request_id.clone();
    let addressed = envelope
        .agent_id
        .clone()
        .or_else(|| request_id.as_deref().and_then(|id| ctx.take_origin(id)));
    let frame = envelope.into_value();

    let target = {
        let registry = ctx.registry.lock();
        addressed
            .filter(|id| registry.contains(ConnectionRole::Agent, id))
            .or_else(|| {
                registry
                    .children_of(client_id)
                    .into_iter()
                    .map(|child| child.child_id)
                    .find(|id| registry.contains(ConnectionRole::Agent, id))
            })
            .or_else(|| registry.ids_by_role(ConnectionRole::Agent).into_iter().next())
    };

    if let Some(agent_id) = target {
        match send_local(ctx, ConnectionRole::Agent, &agent_id, &frame) {
            Ok(()) => return,
            Err(error) => tracing::warn!(
                target = "agent_gateway::routing",
                agent = %agent_id,
                error = %error,
                "agent delivery failed, trying relay"
            ),
        }
    }

    if send_to_remote(ctx, role, Some(client_id), &frame, true).is_err() {
        reply_error(ctx, role, client_id, request_id.as_deref(), &DeliveryError::NoAgents);
    }
}

fn selected_agent(envelope: &Envelope) -> Option<String> {
    if let Some(agent_id) = &envelope.agent_id {
        return Some(agent_id.clone());
    }
    let selected = envelope
        .get("selectedAgent")
        .or_else(|| envelope.payload().and_then(|p| p.get("selectedAgent")))?;
    selected
        .get("id")
        .or_else(|| selected.get("agentId"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
}

fn with_agent(envelope: &Envelope, agent_id: &str) -> Value {
    let mut envelope = envelope.clone();
    envelope.set("agentId", agent_id);
    if envelope.get("selectedAgent").is_none() {
        envelope.set("selectedAgent", json!({ "id": agent_id }));
    }
    envelope.into_value()
}

async fn route_initial_prompt(
    ctx: &Arc<GatewayContext>,
    role: ConnectionRole,
    client_id: &str,
    envelope: Envelope,
) {
    let request_id = envelope.request_id.clone();

    if let Some(agent_id) = selected_agent(&envelope) {
        let frame = with_agent(&envelope, &agent_id);
        if let Err(error) = send_to_specific_agent(ctx, &agent_id, Some(client_id), &frame).await {
            tracing::warn!(
                target = "agent_gateway::routing",
                agent = %agent_id,
                client = %client_id,
                error = %error,
                "initial prompt not delivered"
            );
            reply_error(ctx, role, client_id, request_id.as_deref(), &error);
        }
        return;
    }

    let targets = {
        let registry = ctx.registry.lock();
        let children: Vec<String> = registry
            .children_of(client_id)
            .into_iter()
            .map(|child| child.child_id)
            .filter(|id| registry.contains(ConnectionRole::Agent, id))
            .collect();
        if children.is_empty() {
            registry.ids_by_role(ConnectionRole::Agent)
        } else {
            children
        }
    };

    let delivered = targets
        .iter()
        .filter(|agent_id| {
            send_local(ctx, ConnectionRole::Agent, agent_id, &with_agent(&envelope, agent_id)).is_ok()
        })
        .count();
    if delivered > 0 {
        tracing::debug!(
            target = "agent_gateway::routing",
            client = %client_id,
            delivered,
            "initial prompt broadcast to agents"
        );
        return;
    }

    if let Some(default_agent) = ctx.settings.default_agent.clone() {
        let frame = with_agent(&envelope, &default_agent);
        if let Err(error) =
            send_to_specific_agent(ctx, &default_agent, Some(client_id), &frame).await
        {
            reply_error(ctx, role, client_id, request_id.as_deref(), &error);
        }
        return;
    }

    let frame = envelope.into_value();
    if send_to_remote(ctx, role, Some(client_id), &frame, true).is_err() {
        reply_error(ctx, role, client_id, request_id.as_deref(), &DeliveryError::NoAgents);
    }
}

/// Relay traffic addressed to local peers. Never sent back into the relay.
pub async fn route_remote(ctx: &Arc<GatewayContext>, message: RemoteMessage) {
    let target = message.target.clone();
    let frame = message.into_local_frame();

    let result = match target {
        RemoteTarget::Agent {
            agent_id: Some(agent_id),
            parent_id,
        } => send_to_specific_agent(ctx, &agent_id, parent_id.as_deref(), &frame).await,
        RemoteTarget::Agent { agent_id: None, .. } => {
            let first = ctx.registry.lock().ids_by_role(ConnectionRole::Agent).into_iter().next();
            match first {
                Some(agent_id) => send_local(ctx, ConnectionRole::Agent, &agent_id, &frame),
                None => Err(DeliveryError::NoAgents),
            }
        }
        RemoteTarget::App { app_id: Some(app_id) } => {
            send_to_app(ctx, &app_id, &frame, None).map(|_| ())
        }
        RemoteTarget::App { app_id: None } => {
            let first = ctx.registry.lock().ids_by_role(ConnectionRole::App).into_iter().next();
            match first {
                Some(app_id) => send_local(ctx, ConnectionRole::App, &app_id, &frame),
                None => Err(DeliveryError::NoApps),
            }
        }
        RemoteTarget::AllApps => {
            let reached = broadcast_to_apps(ctx, &frame, None);
            tracing::debug!(target = "agent_gateway::routing", reached, "relay broadcast to apps");
            Ok(())
        }
    };

    if let Err(error) = result {
        tracing::warn!(
            target = "agent_gateway::routing",
            error = %error,
            "relay message not delivered locally"
        );
    }
}

pub async fn handle_tunnel_event(ctx: &Arc<GatewayContext>, event: TunnelEvent) {
    match event {
        TunnelEvent::Deliver(message) => route_remote(ctx, message).await,
        TunnelEvent::ConnectionsRequested => {
            if let Some(tunnel) = &ctx.tunnel {
                tunnel.send_connections_snapshot(json!({
                    "serverId": ctx.settings.server_id,
                    "counts": ctx.counts(),
                }));
            }
        }
    }
}
