//! Transport primitives for a single node.
//!
//! A [`Node`] never touches stdout itself. Every outbound message goes onto
//! an unbounded channel that a single writer task drains, so handlers on
//! different tasks can `send`, `reply` and `rpc` without coordinating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;

use crate::message::{Body, Message, NodeId, Payload};

/// Invoked with the reply to an [`Node::rpc`] request, at most once.
pub type RpcCallback = Box<dyn FnOnce(Message) -> Result<()> + Send>;

pub struct Node {
    id: NodeId,
    node_ids: Vec<NodeId>,
    next_msg_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Message>,
    callbacks: Mutex<HashMap<u64, RpcCallback>>,
}

impl Node {
    /// Creates a node that writes every outbound message to `outbound`.
    pub fn new(
        id: impl Into<NodeId>,
        node_ids: Vec<NodeId>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            id: id.into(),
            node_ids,
            next_msg_id: AtomicU64::new(1),
            outbound,
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Every node in the cluster, as announced by `init`.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    /// Sends `payload` to `dest` without expecting a reply.
    pub fn send(&self, dest: &str, payload: &Payload) -> Result<()> {
        let mut body = Body::from_payload(payload)?;
        body.msg_id = Some(self.next_msg_id());
        self.enqueue(dest, body)
    }

    /// Answers `request`, addressing its sender and echoing its `msg_id`.
    pub fn reply(&self, request: &Message, payload: &Payload) -> Result<()> {
        let mut body = Body::from_payload(payload)?;
        body.msg_id = Some(self.next_msg_id());
        body.in_reply_to = request.body.msg_id;
        self.enqueue(&request.src, body)
    }

    /// Sends `payload` to `dest` and registers `callback` for the matching reply.
    ///
    /// Returns the request's `msg_id`. The callback runs when
    /// [`Node::handle_reply`] sees a message whose `in_reply_to` matches. If no
    /// reply ever arrives the callback stays registered until
    /// [`Node::cancel_rpc`] removes it.
    pub fn rpc<F>(&self, dest: &str, payload: &Payload, callback: F) -> Result<u64>
    where
        F: FnOnce(Message) -> Result<()> + Send + 'static,
    {
        let msg_id = self.next_msg_id();
        let mut body = Body::from_payload(payload)?;
        body.msg_id = Some(msg_id);

        self.callbacks().insert(msg_id, Box::new(callback));
        if let Err(err) = self.enqueue(dest, body) {
            self.callbacks().remove(&msg_id);
            return Err(err);
        }
        Ok(msg_id)
    }

    /// Drops the callback for `msg_id` without running it. Returns `false` if
    /// it already ran or was never registered.
    pub fn cancel_rpc(&self, msg_id: u64) -> bool {
        self.callbacks().remove(&msg_id).is_some()
    }

    /// Routes a reply to its registered callback.
    ///
    /// Returns `None` when nothing is waiting for this reply, e.g. a second
    /// answer to a request whose callback already ran.
    pub fn handle_reply(&self, reply: Message) -> Option<Result<()>> {
        let in_reply_to = reply.body.in_reply_to?;
        let callback = self.callbacks().remove(&in_reply_to)?;
        Some(callback(reply))
    }

    /// Number of RPCs still waiting for a reply.
    pub fn pending_rpcs(&self) -> usize {
        self.callbacks().len()
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, dest: &str, body: Body) -> Result<()> {
        self.outbound
            .send(Message::new(self.id.clone(), dest, body))
            .map_err(|_| anyhow!("outbound channel closed, cannot reach {dest}"))
    }

    fn callbacks(&self) -> MutexGuard<'_, HashMap<u64, RpcCallback>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
