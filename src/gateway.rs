//! Websocket accept loop: classify, register, dispatch, clean up.

use std::{collections::HashMap, future::Future, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{
    api,
    context::GatewayContext,
    delivery::broadcast_to_apps,
    handshake::{ConnectionParams, Registration},
    protocol::{
        disconnect_notice, error_envelope, ConnectionRole, Envelope, ManualRegistration,
        MessageKind, RegisteredConfirmation, RemoteMessage, RemoteTarget,
    },
    registry::{Connection, OutboundFrame, SocketHandle},
    routing,
    tunnel::TunnelEvent,
};

pub fn router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/", get(gateway_ws))
        .merge(api::routes())
        .with_state(ctx)
}

pub async fn serve<F>(listener: TcpListener, ctx: Arc<GatewayContext>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Feed relay traffic into local routing in arrival order. Frames for a named
/// agent run on that agent's own queue, so an agent start holds back only the
/// frames behind it for the same agent.
pub fn spawn_tunnel_pump(
    ctx: Arc<GatewayContext>,
    mut events: mpsc::Receiver<TunnelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut agent_queues: HashMap<String, mpsc::UnboundedSender<RemoteMessage>> =
            HashMap::new();
        while let Some(event) = events.recv().await {
            let event = match event {
                TunnelEvent::Deliver(message) => match addressed_agent(&message) {
                    Some(agent_id) => {
                        enqueue_for_agent(&ctx, &mut agent_queues, agent_id, message);
                        continue;
                    }
                    None => TunnelEvent::Deliver(message),
                },
                other => other,
            };
            routing::handle_tunnel_event(&ctx, event).await;
        }
    })
}

fn addressed_agent(message: &RemoteMessage) -> Option<String> {
    match &message.target {
        RemoteTarget::Agent {
            agent_id: Some(agent_id),
            ..
        } => Some(agent_id.clone()),
        _ => None,
    }
}

fn enqueue_for_agent(
    ctx: &Arc<GatewayContext>,
    queues: &mut HashMap<String, mpsc::UnboundedSender<RemoteMessage>>,
    agent_id: String,
    message: RemoteMessage,
) {
    let queue = queues
        .entry(agent_id)
        .or_insert_with(|| spawn_agent_queue(ctx));
    if let Err(mpsc::error::SendError(message)) = queue.send(message) {
        // Worker is gone; start a fresh one for this agent.
        let fresh = spawn_agent_queue(ctx);
        let _ = fresh.send(message);
        *queue = fresh;
    }
}

fn spawn_agent_queue(ctx: &Arc<GatewayContext>) -> mpsc::UnboundedSender<RemoteMessage> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            routing::route_remote(&ctx, message).await;
        }
    });
    tx
}

async fn gateway_ws(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<GatewayContext>>,
    Query(params): Query<ConnectionParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(ctx, socket, params))
}

/// Identity the socket is currently bound to; changes on manual registration.
struct Binding {
    role: ConnectionRole,
    id: String,
}

async fn handle_socket(ctx: Arc<GatewayContext>, socket: WebSocket, params: ConnectionParams) {
    let serial = ctx.next_serial();
    let provisional_id = Uuid::new_v4().to_string();
    let registration = params.classify(&provisional_id);

    let (handle, outbound) = SocketHandle::channel(serial);
    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound, handle.clone()));

    let mut binding = bind(&ctx, &registration, &handle);
    handle.mark_open();

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    let _ = handle.send_json(
                        &error_envelope(&binding.id, "Invalid message format: binary frame is not UTF-8"),
                        &binding.id,
                    );
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(error) => {
                tracing::debug!(
                    target = "agent_gateway::gateway",
                    id = %binding.id,
                    error = %error,
                    "socket read error"
                );
                break;
            }
        };
        handle_frame(&ctx, &mut binding, &handle, &text).await;
    }

    handle.mark_closed();
    disconnect(&ctx, &binding, serial);
    handle.close();
    if let Err(error) = writer.await {
        tracing::debug!(target = "agent_gateway::gateway", error = %error, "writer task failed");
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    handle: SocketHandle,
) {
    while let Some(frame) = outbound.recv().await {
        let result = match frame {
            OutboundFrame::Text(text) => sink.send(Message::Text(text.into())).await,
            OutboundFrame::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if let Err(error) = result {
            tracing::debug!(target = "agent_gateway::gateway", error = %error, "socket write failed");
            break;
        }
    }
    handle.mark_closed();
}

/// Register the socket under `registration` and confirm to the peer.
fn bind(ctx: &GatewayContext, registration: &Registration, handle: &SocketHandle) -> Binding {
    let mut connection = Connection::new(registration.id.clone(), registration.role, handle.clone());
    connection.parent_id = registration.parent_id.clone();
    connection.instance_id = Some(registration.instance_id.clone());
    connection.current_project = registration.project.clone();
    connection.thread_id = registration.thread_id.clone();
    ctx.register(connection);

    let mut confirmation = RegisteredConfirmation::new(
        &registration.id,
        registration.role,
        registration.registration_type,
        Some(registration.instance_id.clone()),
    );
    if registration.role == ConnectionRole::Agent {
        confirmation.parent_id = registration.parent_id.clone();
    }
    confirmation.thread_id = registration.thread_id.clone();

    match serde_json::to_value(&confirmation) {
        Ok(value) => {
            if let Err(error) = handle.send_json(&value, &registration.id) {
                tracing::warn!(
                    target = "agent_gateway::gateway",
                    id = %registration.id,
                    error = %error,
                    "failed to send registration confirmation"
                );
            }
        }
        Err(error) => tracing::error!(
            target = "agent_gateway::gateway",
            error = %error,
            "failed to encode registration confirmation"
        ),
    }

    Binding {
        role: registration.role,
        id: registration.id.clone(),
    }
}

fn rebind(
    ctx: &GatewayContext,
    binding: &mut Binding,
    handle: &SocketHandle,
    request: &ManualRegistration,
) {
    let previous = ctx
        .registry
        .lock()
        .remove_if_current(binding.role, &binding.id, handle.serial());
    let mut registration = Registration::manual(request, &binding.id);
    if let Some(previous) = previous {
        registration.project = previous.current_project;
        registration.thread_id = previous.thread_id;
    }
    tracing::info!(
        target = "agent_gateway::gateway",
        from_role = %binding.role,
        from_id = %binding.id,
        role = %registration.role,
        id = %registration.id,
        "manual registration"
    );
    *binding = bind(ctx, &registration, handle);
}

async fn handle_frame(
    ctx: &Arc<GatewayContext>,
    binding: &mut Binding,
    handle: &SocketHandle,
    text: &str,
) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::debug!(
                target = "agent_gateway::gateway",
                id = %binding.id,
                error = %error,
                "rejecting malformed frame"
            );
            let _ = handle.send_json(&error_envelope(&binding.id, &error), &binding.id);
            return;
        }
    };

    match envelope.kind.clone() {
        MessageKind::Register(request) => rebind(ctx, binding, handle, &request),
        MessageKind::UpdateProject(project) => {
            ctx.registry.lock().update_project(&binding.id, project);
        }
        _ => match binding.role {
            ConnectionRole::Agent => {
                routing::route_agent_message(ctx, &binding.id, envelope).await
            }
            role @ (ConnectionRole::App | ConnectionRole::Tui) => {
                routing::route_client_message(ctx, role, &binding.id, envelope).await
            }
        },
    }
}

fn disconnect(ctx: &GatewayContext, binding: &Binding, serial: u64) {
    let current = ctx
        .registry
        .lock()
        .get_role(binding.role, &binding.id)
        .is_some_and(|conn| conn.socket.serial() == serial);
    if !current {
        tracing::debug!(
            target = "agent_gateway::gateway",
            id = %binding.id,
            "closed socket was already replaced"
        );
        return;
    }

    let notice = disconnect_notice(&binding.id, binding.role);
    broadcast_to_apps(ctx, &notice, Some(&binding.id));
    ctx.registry
        .lock()
        .remove_if_current(binding.role, &binding.id, serial);
}
