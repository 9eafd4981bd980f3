//! In-flight request bookkeeping.
//!
//! [`PendingRequests`] maps request IDs to single-slot delivery channels. It
//! is owned by the client's connection state and only ever touched under that
//! mutex; delivery itself (`send().await`) happens after the lock is released.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;

use gatewatch_core::prelude::*;

use crate::protocol::ResponseFrame;

/// A registered request waiting for its response.
struct PendingRequest {
    /// Single-slot channel used to deliver responses to the caller.
    response_tx: mpsc::Sender<ResponseFrame>,
    /// Method name, for logging.
    method: String,
    /// Timestamp of registration.
    created_at: Instant,
}

/// Tracks in-flight requests and matches them to responses.
#[derive(Default)]
pub struct PendingRequests {
    pending: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    /// Create a new, empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending slot for `id`.
    ///
    /// # Errors
    ///
    /// [`Error::Protocol`] if `id` is already pending; IDs are never reused
    /// while in flight.
    pub fn register(
        &mut self,
        id: &str,
        method: &str,
    ) -> Result<mpsc::Receiver<ResponseFrame>> {
        if self.pending.contains_key(id) {
            return Err(Error::protocol(format!("request id {id} is already pending")));
        }
        let (tx, rx) = mpsc::channel(1);
        self.pending.insert(
            id.to_string(),
            PendingRequest {
                response_tx: tx,
                method: method.to_string(),
                created_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Find the delivery channel for `response`.
    ///
    /// Interim acknowledgments keep the entry registered so the terminal
    /// response can follow under the same ID; any other response removes it.
    /// Returns `None` for unknown IDs.
    pub fn route(&mut self, response: &ResponseFrame) -> Option<mpsc::Sender<ResponseFrame>> {
        if response.is_interim() {
            return self
                .pending
                .get(&response.id)
                .map(|p| p.response_tx.clone());
        }
        self.pending.remove(&response.id).map(|p| {
            trace!(
                "Request {} ({}) answered after {:?}",
                response.id,
                p.method,
                p.created_at.elapsed()
            );
            p.response_tx
        })
    }

    /// Deregister `id` (timeout or send failure). Returns `true` if it was
    /// pending.
    pub fn remove(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Drop every pending slot so all waiters observe a closed channel.
    ///
    /// Returns how many requests were failed.
    pub fn drain(&mut self) -> usize {
        let count = self.pending.len();
        for (id, request) in self.pending.drain() {
            debug!(
                "Failing pending request {} ({}) after {:?}: connection closed",
                id,
                request.method,
                request.created_at.elapsed()
            );
        }
        count
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str, payload: serde_json::Value) -> ResponseFrame {
        ResponseFrame {
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    #[test]
    fn test_register_rejects_duplicate_id() {
        let mut pending = PendingRequests::new();
        let _rx = pending.register("a", "health").unwrap();
        assert!(pending.register("a", "health").is_err());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_route_terminal_response_removes_entry() {
        let mut pending = PendingRequests::new();
        let mut rx = pending.register("a", "health").unwrap();

        let res = response("a", json!({ "ok": true }));
        let tx = pending.route(&res).expect("registered id routes");
        assert!(!pending.contains("a"));

        tx.send(res).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_interim_response_keeps_entry() {
        let mut pending = PendingRequests::new();
        let mut rx = pending.register("c", "connect").unwrap();

        let ack = response("c", json!({ "status": "accepted" }));
        let tx = pending.route(&ack).unwrap();
        assert!(pending.contains("c"));
        tx.send(ack).await.unwrap();
        assert!(rx.recv().await.unwrap().is_interim());

        let done = response("c", json!({}));
        let tx = pending.route(&done).unwrap();
        assert!(pending.is_empty());
        tx.send(done).await.unwrap();
        assert!(!rx.recv().await.unwrap().is_interim());
    }

    #[test]
    fn test_route_unknown_id() {
        let mut pending = PendingRequests::new();
        assert!(pending.route(&response("nope", json!({}))).is_none());
    }

    #[tokio::test]
    async fn test_drain_closes_all_waiters() {
        let mut pending = PendingRequests::new();
        let mut receivers: Vec<_> = (0..5)
            .map(|i| pending.register(&format!("r{i}"), "sessions.list").unwrap())
            .collect();

        assert_eq!(pending.drain(), 5);
        assert!(pending.is_empty());
        for rx in &mut receivers {
            assert!(rx.recv().await.is_none());
        }
    }

    #[test]
    fn test_remove() {
        let mut pending = PendingRequests::new();
        let _rx = pending.register("x", "health").unwrap();
        assert!(pending.remove("x"));
        assert!(!pending.remove("x"));
    }
}
