//! Correlation of asynchronous request/response pairs by `requestId`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::PendingError;

type Outcome = Result<Value, String>;
type Waiters = Arc<Mutex<HashMap<String, Waiter>>>;

struct Waiter {
    /// Connection the eventual response belongs to.
    origin: String,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Clone)]
pub struct PendingRequests {
    waiters: Waiters,
    timeout: Duration,
}

impl PendingRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Register `request_id` on behalf of `origin`. A request id may only be
    /// pending once.
    pub fn register(&self, request_id: &str, origin: &str) -> Result<PendingResponse, PendingError> {
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(request_id) {
            return Err(PendingError::Duplicate(request_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(
            request_id.to_string(),
            Waiter {
                origin: origin.to_string(),
                tx,
            },
        );
        tracing::trace!(
            target = "agent_gateway::pending",
            request_id = %request_id,
            pending = waiters.len(),
            "request registered"
        );
        Ok(PendingResponse {
            request_id: request_id.to_string(),
            rx,
            waiters: Arc::clone(&self.waiters),
            timeout: self.timeout,
        })
    }

    /// Hand `response` to the waiter and return the origin it was registered
    /// for. `None` when nothing was pending, which makes a second resolve of
    /// the same id a no-op.
    pub fn resolve(&self, request_id: &str, response: Value) -> Option<String> {
        let waiter = self.waiters.lock().remove(request_id)?;
        // The waiter may have given up already; the entry is gone either way.
        let _ = waiter.tx.send(Ok(response));
        Some(waiter.origin)
    }

    /// Drop a pending entry without completing it.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.waiters.lock().remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.waiters.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    /// Reject everything still pending, e.g. on shutdown.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.waiters.lock().drain().collect();
        let count = drained.len();
        for (_, waiter) in drained {
            let _ = waiter.tx.send(Err(reason.to_string()));
        }
        count
    }
}

/// The suspended side of a registered request.
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<Outcome>,
    waiters: Waiters,
    timeout: Duration,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the response. On timeout the entry is removed so it cannot leak.
    pub async fn wait(self) -> Result<Value, PendingError> {
        let PendingResponse {
            request_id,
            rx,
            waiters,
            timeout,
        } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(reason))) => Err(PendingError::Rejected { request_id, reason }),
            Ok(Err(_)) => Err(PendingError::Dropped(request_id)),
            Err(_) => {
                waiters.lock().remove(&request_id);
                tracing::warn!(
                    target = "agent_gateway::pending",
                    request_id = %request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(PendingError::Timeout {
                    request_id,
                    waited_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let pending = PendingRequests::new(Duration::from_secs(5));
        let waiter = pending.register("r1", "X").unwrap();

        assert_eq!(pending.resolve("r1", json!({"ok": 1})).as_deref(), Some("X"));
        assert_eq!(pending.resolve("r1", json!({"ok": 2})), None);

        assert_eq!(waiter.wait().await.unwrap(), json!({"ok": 1}));
        assert!(pending.is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let pending = PendingRequests::new(Duration::from_secs(5));
        let _first = pending.register("r1", "X").unwrap();
        assert!(matches!(
            pending.register("r1", "Y"),
            Err(PendingError::Duplicate(id)) if id == "r1"
        ));
    }

    #[tokio::test]
    async fn timeout_removes_entry() {
        let pending = PendingRequests::new(Duration::from_millis(20));
        let waiter = pending.register("r1", "X").unwrap();
        assert!(matches!(
            waiter.wait().await,
            Err(PendingError::Timeout { .. })
        ));
        assert!(!pending.contains("r1"));
        assert_eq!(pending.resolve("r1", json!(null)), None);
    }

    #[tokio::test]
    async fn cancel_drops_the_waiter() {
        let pending = PendingRequests::new(Duration::from_secs(5));
        let waiter = pending.register("r2", "X").unwrap();
        assert!(pending.cancel("r2"));
        assert_eq!(
            waiter.wait().await.unwrap_err(),
            PendingError::Dropped("r2".into())
        );
    }

    #[tokio::test]
    async fn reject_all_drains() {
        let pending = PendingRequests::new(Duration::from_secs(5));
        let a = pending.register("a", "X").unwrap();
        let _b = pending.register("b", "Y").unwrap();
        assert_eq!(pending.reject_all("shutdown"), 2);
        assert!(pending.is_empty());
        assert_eq!(
            a.wait().await.unwrap_err(),
            PendingError::Rejected {
                request_id: "a".into(),
                reason: "shutdown".into()
            }
        );
    }
}
