use std::{
    io::{self, Write},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{protocol::ConnectionRole, tunnel::TunnelState};

/// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")
}

/// Registry and tunnel lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    ConnectionRegistered {
        id: String,
        role: ConnectionRole,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    ConnectionRemoved {
        id: String,
        role: ConnectionRole,
    },
    Tunnel {
        state: TunnelState,
    },
}

#[derive(Serialize)]
struct EventLine<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a LifecycleEvent,
}

#[derive(Clone, Debug, Default)]
enum Sink {
    #[default]
    Off,
    Stderr,
    Capture(Arc<Mutex<Vec<Value>>>),
}

/// Advisory lifecycle events, written as JSON lines on stderr when enabled.
/// Nothing depends on them for correctness.
#[derive(Clone, Debug, Default)]
pub struct EventEmitter {
    sink: Sink,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self {
            sink: if json_output { Sink::Stderr } else { Sink::Off },
        }
    }

    /// An emitter that records events in memory.
    pub fn capturing() -> (Self, Arc<Mutex<Vec<Value>>>) {
        let store = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sink: Sink::Capture(Arc::clone(&store)),
            },
            store,
        )
    }

    pub fn emit(&self, event: LifecycleEvent) {
        if matches!(self.sink, Sink::Off) {
            return;
        }
        let line = EventLine {
            ts: Utc::now().to_rfc3339(),
            event: &event,
        };
        let Ok(value) = serde_json::to_value(&line) else {
            return;
        };
        match &self.sink {
            Sink::Off => {}
            Sink::Stderr => {
                let mut stderr = io::stderr().lock();
                let _ = writeln!(stderr, "{value}");
            }
            Sink::Capture(store) => store.lock().push(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_emitter_records_nothing() {
        let emitter = EventEmitter::default();
        emitter.emit(LifecycleEvent::Tunnel {
            state: TunnelState::Connecting,
        });
        EventEmitter::new(true).emit(LifecycleEvent::ConnectionRemoved {
            id: "A".into(),
            role: ConnectionRole::App,
        });
    }

    #[test]
    fn captured_lines_are_flat_json() {
        let (emitter, store) = EventEmitter::capturing();
        emitter.emit(LifecycleEvent::ConnectionRegistered {
            id: "X".into(),
            role: ConnectionRole::Agent,
            parent_id: Some("A".into()),
        });
        emitter.emit(LifecycleEvent::Tunnel {
            state: TunnelState::Registered,
        });

        let lines = store.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "connection_registered");
        assert_eq!(lines[0]["parentId"], "A");
        assert_eq!(lines[0]["role"], "agent");
        assert!(lines[0]["ts"].is_string());
        assert_eq!(lines[1]["state"], "registered");
    }
}
