//! Request handlers for `broadcast`, `read` and `topology`.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::gossip::{self, GossipConfig};
use crate::message::{Message, NOT_SUPPORTED, Payload};
use crate::node::Node;
use crate::store::MessageStore;
use crate::topology::{self, TopologyManager};

pub struct BroadcastServer {
    node: Arc<Node>,
    store: MessageStore,
    topology: TopologyManager,
    config: GossipConfig,
}

impl BroadcastServer {
    pub fn new(node: Arc<Node>, config: GossipConfig) -> Self {
        Self {
            node,
            store: MessageStore::new(),
            topology: TopologyManager::new(),
            config,
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    /// Handles one inbound request, keyed by its `type`.
    ///
    /// Broadcasts of new values do not return until dissemination finishes.
    pub async fn handle(&self, request: Message) -> Result<()> {
        match request.body.kind.as_str() {
            "broadcast" => self.handle_broadcast(&request).await,
            "read" => self.handle_read(&request),
            "topology" => self.handle_topology(&request),
            _ => self.reject_unsupported(&request),
        }
    }

    async fn handle_broadcast(&self, request: &Message) -> Result<()> {
        let Payload::Broadcast { message } = decode(request)? else {
            bail!("broadcast body decoded to another payload");
        };

        if !self.store.add(message.clone()) {
            debug!(%message, src = %request.src, "value already present");
            return self.node.reply(request, &Payload::BroadcastOk);
        }

        gossip::disseminate(&self.node, &self.topology, &self.config, request, message).await?;
        Ok(())
    }

    fn handle_read(&self, request: &Message) -> Result<()> {
        let Payload::Read = decode(request)? else {
            bail!("read body decoded to another payload");
        };

        self.node.reply(
            request,
            &Payload::ReadOk {
                messages: self.store.snapshot(),
            },
        )
    }

    fn handle_topology(&self, request: &Message) -> Result<()> {
        let Payload::Topology { topology } = decode(request)? else {
            bail!("topology body decoded to another payload");
        };

        let neighbors = topology::neighbors_for(&topology, self.node.id());
        info!(neighbors = ?neighbors, "topology updated");
        self.topology.set_neighbors(neighbors);

        self.node.reply(request, &Payload::TopologyOk)
    }

    fn reject_unsupported(&self, request: &Message) -> Result<()> {
        warn!(kind = %request.body.kind, src = %request.src, "no handler for message type");
        self.node.reply(
            request,
            &Payload::Error {
                code: NOT_SUPPORTED,
                text: format!("unsupported message type {}", request.body.kind),
            },
        )
    }
}

fn decode(request: &Message) -> Result<Payload> {
    request.body.payload().inspect_err(|err| {
        debug!(src = %request.src, error = %format!("{err:#}"), "rejecting malformed request");
    })
}
