//! Process loop for a node speaking JSON lines over a reader/writer pair.
//!
//! - **Reader** (the caller's task): parses one message per line. Replies to
//!   our own RPCs are resolved inline; every other message gets its own task.
//! - **Writer task**: the only thing that writes output. It drains the node's
//!   outbound channel one line at a time.
//! - **Handler tasks**: one per inbound request, running concurrently. A
//!   broadcast handler lives as long as its dissemination does.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gossip::GossipConfig;
use crate::message::{Message, Payload, read_message, write_message};
use crate::node::Node;
use crate::server::BroadcastServer;

/// How long the writer gets to flush queued output once input has closed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// A node plus the handlers serving it.
#[derive(Clone)]
pub struct NodeRuntime {
    node: Arc<Node>,
    server: Arc<BroadcastServer>,
}

impl NodeRuntime {
    pub fn new(node: Arc<Node>, config: GossipConfig) -> Self {
        let server = Arc::new(BroadcastServer::new(Arc::clone(&node), config));
        Self { node, server }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn server(&self) -> &Arc<BroadcastServer> {
        &self.server
    }

    /// Routes one inbound message.
    ///
    /// Replies go to their RPC callback on the calling task and return
    /// `None`. Requests are handled on a new task whose handle is returned.
    /// Handler errors are logged there and go no further.
    pub fn dispatch(&self, message: Message) -> Option<JoinHandle<()>> {
        if message.is_reply() {
            self.resolve_reply(message);
            return None;
        }

        let server = Arc::clone(&self.server);
        Some(tokio::spawn(async move {
            let src = message.src.clone();
            let kind = message.body.kind.clone();
            if let Err(err) = server.handle(message).await {
                warn!(%src, %kind, error = %format!("{err:#}"), "handler failed");
            }
        }))
    }

    fn resolve_reply(&self, reply: Message) {
        let src = reply.src.clone();
        let in_reply_to = reply.body.in_reply_to;
        match self.node.handle_reply(reply) {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                warn!(%src, ?in_reply_to, error = %format!("{err:#}"), "reply callback failed");
            }
            None => debug!(%src, ?in_reply_to, "dropping reply with no pending request"),
        }
    }
}

/// Runs a node until `reader` reaches end of input.
///
/// The first message must be `init`; it fixes the node's id before anything
/// else is dispatched.
pub async fn run<R, W>(mut reader: R, writer: W, config: GossipConfig) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let init = wait_for_init(&mut reader).await?;
    let Payload::Init { node_id, node_ids } = init.body.payload()? else {
        bail!("init body decoded to another payload");
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_outbound(writer, outbound_rx));

    let node = Arc::new(Node::new(node_id, node_ids, outbound_tx));
    node.reply(&init, &Payload::InitOk)?;
    info!(node = node.id(), cluster = node.node_ids().len(), "node initialised");

    let runtime = NodeRuntime::new(node, config);
    loop {
        match read_message::<_, Message>(&mut reader).await {
            Ok(Some(message)) => {
                runtime.dispatch(message);
            }
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %err, "skipping malformed message");
            }
            Err(err) => return Err(err).context("failed to read input"),
        }
    }

    info!("input closed, shutting down");
    drop(runtime);
    match tokio::time::timeout(SHUTDOWN_GRACE, writer_task).await {
        Ok(joined) => joined
            .context("outbound writer panicked")?
            .context("failed to write output"),
        Err(_) => {
            debug!("handlers still running at shutdown");
            Ok(())
        }
    }
}

async fn wait_for_init<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncBufRead + Unpin,
{
    let message = read_message::<_, Message>(reader)
        .await
        .context("failed to read init message")?
        .ok_or_else(|| anyhow!("input closed before init"))?;
    if message.body.kind != "init" {
        bail!("expected init as the first message, got {}", message.body.kind);
    }
    Ok(message)
}

async fn write_outbound<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        write_message(&mut writer, &message).await?;
    }
    Ok(())
}
