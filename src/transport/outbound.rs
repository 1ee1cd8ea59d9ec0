//! Outbound reply routing
//!
//! [`OutboundSender`] is the only handle the agent loop and capabilities
//! hold on the transport side: it routes a reply to the worker of the
//! surface it is addressed to. Each worker keeps an [`OutboundQueue`] for
//! replies that arrive while it is not connected.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::error::{PocketclawError, Result};
use crate::transport::OutboundReply;

/// Bounded FIFO of replies waiting for a connection
#[derive(Debug)]
pub struct OutboundQueue {
    depth: usize,
    items: VecDeque<OutboundReply>,
}

impl OutboundQueue {
    /// Create a queue holding at most `depth` replies
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            items: VecDeque::new(),
        }
    }

    /// Enqueue at the back; returns the oldest reply if it had to be dropped
    pub fn push(&mut self, reply: OutboundReply) -> Option<OutboundReply> {
        let dropped = if self.items.len() >= self.depth {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(reply);
        dropped
    }

    /// Put a reply that failed to send back at the front
    pub fn requeue(&mut self, reply: OutboundReply) -> Option<OutboundReply> {
        let dropped = if self.items.len() >= self.depth {
            self.items.pop_back()
        } else {
            None
        };
        self.items.push_front(reply);
        dropped
    }

    /// Take the oldest reply
    pub fn pop(&mut self) -> Option<OutboundReply> {
        self.items.pop_front()
    }

    /// Number of queued replies
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

type Routes = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<OutboundReply>>>>;

/// Routes replies to the worker of their destination surface
#[derive(Debug, Clone, Default)]
pub struct OutboundSender {
    routes: Routes,
}

impl OutboundSender {
    /// Create a sender with no routes
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the worker channel for `surface_id`
    pub(crate) fn register(&self, surface_id: &str, tx: mpsc::UnboundedSender<OutboundReply>) {
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(surface_id.to_string(), tx);
        }
    }

    /// Remove the route for `surface_id`
    pub(crate) fn unregister(&self, surface_id: &str) {
        if let Ok(mut routes) = self.routes.write() {
            routes.remove(surface_id);
        }
    }

    /// True when `surface_id` has a live worker
    pub fn has_route(&self, surface_id: &str) -> bool {
        self.routes
            .read()
            .map(|routes| routes.contains_key(surface_id))
            .unwrap_or(false)
    }

    /// Hand `reply` to its surface worker
    ///
    /// Never waits on the network: the worker sends, or queues the reply
    /// until the surface reconnects.
    ///
    /// # Errors
    ///
    /// Returns `PocketclawError::Transport` when the surface is unknown,
    /// disabled, or shut down
    pub fn send(&self, reply: OutboundReply) -> Result<()> {
        let tx = {
            let routes = self.routes.read().map_err(|_| {
                PocketclawError::Internal("outbound routes lock poisoned".to_string())
            })?;
            routes.get(&reply.surface_id).cloned()
        };
        let surface = reply.surface_id.clone();
        let tx = tx.ok_or_else(|| PocketclawError::Transport {
            surface: surface.clone(),
            message: "no such surface".to_string(),
        })?;
        tx.send(reply).map_err(|_| PocketclawError::Transport {
            surface,
            message: "surface is no longer running".to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(n: usize) -> OutboundReply {
        OutboundReply::new("s", "u", format!("reply {}", n))
    }

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let mut queue = OutboundQueue::new(2);
        assert!(queue.push(reply(1)).is_none());
        assert!(queue.push(reply(2)).is_none());
        let dropped = queue.push(reply(3)).unwrap();

        assert_eq!(dropped.text, "reply 1");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().text, "reply 2");
        assert_eq!(queue.pop().unwrap().text, "reply 3");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_keeps_order() {
        let mut queue = OutboundQueue::new(3);
        queue.push(reply(2));
        queue.requeue(reply(1));
        assert_eq!(queue.pop().unwrap().text, "reply 1");
        assert_eq!(queue.pop().unwrap().text, "reply 2");
    }

    #[tokio::test]
    async fn test_sender_routes_by_surface() {
        let sender = OutboundSender::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sender.register("s", tx);

        sender.send(reply(1)).unwrap();
        assert_eq!(rx.recv().await.unwrap().text, "reply 1");

        let unknown = sender.send(OutboundReply::new("other", "u", "x"));
        assert!(unknown.is_err());

        sender.unregister("s");
        assert!(!sender.has_route("s"));
        assert!(sender.send(reply(2)).is_err());
    }
}
