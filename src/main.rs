use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, oneshot};

use agent_gateway::{
    config::Config,
    context::{GatewayContext, GatewaySettings},
    events::{init_logging, EventEmitter},
    gateway,
    supervisor::{ProcessSupervisor, SupervisorOptions},
    tunnel::{TunnelClient, TunnelOptions},
};

const AGENT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(&config.log_level)?;

    let events = EventEmitter::new(config.json_events);
    let server_id = config
        .server_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let supervisor = Arc::new(ProcessSupervisor::new(SupervisorOptions {
        agents_dir: config.agents_dir(),
        registry_url: config.registry_url.clone(),
        runtime: config.agent_runtime.clone(),
        gateway_url: format!("ws://{}:{}", config.host, config.port),
        stop_timeout: AGENT_STOP_TIMEOUT,
    }));

    let tunnel = config.remote_url().map(|url| {
        TunnelClient::new(
            TunnelOptions {
                url: url.to_string(),
                server_id: server_id.clone(),
                app_token: config.app_token.clone(),
                max_reconnect_attempts: config.max_reconnect_attempts,
                reconnect_delay: config.reconnect_delay(),
            },
            events.clone(),
        )
    });

    let ctx = Arc::new(GatewayContext::new(
        GatewaySettings {
            server_id: server_id.clone(),
            default_agent: config.default_agent.clone(),
            request_timeout: config.request_timeout(),
            agent_ready_timeout: config.agent_ready_timeout(),
        },
        supervisor.clone(),
        tunnel.clone(),
        events,
    ));

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind gateway on {}:{}", config.host, config.port))?;
    eprintln!(
        "[agent-gateway] listening on ws://{}:{} (server id {server_id})",
        config.host, config.port
    );

    let tunnel_tasks = tunnel.as_ref().map(|tunnel| {
        let (event_tx, event_rx) = mpsc::channel(256);
        let client = tunnel.start_connection(event_tx);
        let pump = gateway::spawn_tunnel_pump(ctx.clone(), event_rx);
        (client, pump)
    });
    if tunnel_tasks.is_none() {
        tracing::info!("no remote url configured, running without relay tunnel");
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(gateway::serve(listener, ctx.clone(), async move {
        let _ = shutdown_rx.await;
    }));

    tokio::select! {
        result = shutdown_signal() => {
            if let Err(error) = result {
                tracing::warn!(error = %error, "signal handling failed, shutting down");
            }
        }
        result = &mut server => {
            report_server_exit(result);
        }
    }

    // Cleanup
    if let Some(tunnel) = &tunnel {
        tunnel.stop().await;
    }
    supervisor.stop_all().await;
    let rejected = ctx.pending.reject_all("gateway shutting down");
    if rejected > 0 {
        tracing::info!(rejected, "rejected pending requests on shutdown");
    }

    let _ = shutdown_tx.send(());
    if !server.is_finished() {
        match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server).await {
            Ok(result) => report_server_exit(result),
            Err(_) => {
                tracing::warn!("server did not drain in time, aborting");
                server.abort();
            }
        }
    }
    if let Some((client, pump)) = tunnel_tasks {
        pump.abort();
        let _ = client.await;
    }

    eprintln!("[agent-gateway] stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl-C, shutting down");
    Ok(())
}

fn report_server_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => tracing::info!("gateway server exited"),
        Ok(Err(error)) => tracing::error!(error = %error, "gateway server error"),
        Err(error) => tracing::error!(error = %error, "gateway server task failed"),
    }
}
