//! Dissemination of newly learned values to this node's neighbors.
//!
//! A dissemination runs in rounds. Each round sends the value to every
//! neighbor that has not acknowledged it yet, then sleeps for the retry
//! interval. Acknowledgments arrive through RPC callbacks that update the
//! operation's [`AckSet`]. The next round rescans it, so a lost request or a
//! lost reply is simply retried. Receivers dedup on their own store, which
//! makes re-sending an already delivered value harmless.
//!
//! The loop ends when a round finds nothing left to send. With no round
//! limit configured, a neighbor that never answers keeps the loop alive
//! forever, and the handler driving it never completes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::ack::AckSet;
use crate::message::{Message, NodeId, Payload, Value};
use crate::node::Node;
use crate::topology::TopologyManager;

/// Pause between gossip rounds.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipConfig {
    pub retry_interval: Duration,
    /// Abort after this many rounds. `None` retries until every neighbor acknowledges.
    pub max_rounds: Option<u32>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_rounds: None,
        }
    }
}

/// Why a dissemination gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisseminationError {
    /// A neighbor answered with something other than `broadcast_ok`.
    NeighborRejected { neighbor: NodeId, reply_type: String },
    /// A neighbor's reply could not be decoded.
    ReplyUndecodable { neighbor: NodeId, reason: String },
    /// The request could not be handed to the transport.
    SendFailed { neighbor: NodeId, reason: String },
    /// `max_rounds` ran out with neighbors still unacknowledged.
    RoundsExhausted { rounds: u32, pending: Vec<NodeId> },
}

impl fmt::Display for DisseminationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeighborRejected {
                neighbor,
                reply_type,
            } => write!(f, "broadcast to neighbor \"{neighbor}\" failed: replied {reply_type}"),
            Self::ReplyUndecodable { neighbor, reason } => {
                write!(f, "broadcast to neighbor \"{neighbor}\" failed: {reason}")
            }
            Self::SendFailed { neighbor, reason } => {
                write!(f, "could not send broadcast to neighbor \"{neighbor}\": {reason}")
            }
            Self::RoundsExhausted { rounds, pending } => write!(
                f,
                "gave up after {rounds} rounds, still waiting on {}",
                pending.join(", ")
            ),
        }
    }
}

impl std::error::Error for DisseminationError {}

/// Outcome of a dissemination that every neighbor acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisseminationReport {
    pub rounds: u32,
    pub neighbors: usize,
}

/// Gossips `value` to the current neighbors until all of them acknowledge it.
///
/// Only call this for a value the store has just accepted as new. The
/// requester gets `broadcast_ok` straight away, and a second `broadcast_ok`
/// once every neighbor has acknowledged. If a neighbor rejects the value, the
/// requester gets `broadcast_not_okay` and the error is returned.
/// The sender of `request` is never gossiped back to.
pub async fn disseminate(
    node: &Node,
    topology: &TopologyManager,
    config: &GossipConfig,
    request: &Message,
    value: Value,
) -> Result<DisseminationReport> {
    if let Err(err) = node.reply(request, &Payload::BroadcastOk) {
        warn!(%value, error = %err, "failed to acknowledge broadcast");
    }

    let neighbors: Vec<NodeId> = topology
        .neighbors()
        .into_iter()
        .filter(|neighbor| *neighbor != request.src)
        .collect();
    let acks = Arc::new(AckSet::new(neighbors));
    let gossip = Payload::Broadcast {
        message: value.clone(),
    };

    let mut issued = Vec::new();
    let outcome = run_rounds(node, config, &acks, &gossip, &mut issued).await;
    // Requests superseded by a later round, or cut short by an abort, never get their reply read.
    let dropped = issued.into_iter().filter(|id| node.cancel_rpc(*id)).count();
    if dropped > 0 {
        debug!(%value, dropped, "dropped callbacks for unanswered gossip");
    }

    match outcome {
        Ok(rounds) => {
            info!(%value, rounds, neighbors = acks.neighbors().len(), "dissemination complete");
            node.reply(request, &Payload::BroadcastOk)
                .context("failed to send final broadcast_ok")?;
            Ok(DisseminationReport {
                rounds,
                neighbors: acks.neighbors().len(),
            })
        }
        Err(err) => {
            warn!(%value, error = %err, "dissemination aborted");
            if let Err(reply_err) = node.reply(request, &Payload::BroadcastNotOkay) {
                warn!(%value, error = %reply_err, "failed to report aborted broadcast");
            }
            Err(anyhow::Error::new(err).context(format!("dissemination of {value} aborted")))
        }
    }
}

async fn run_rounds(
    node: &Node,
    config: &GossipConfig,
    acks: &Arc<AckSet>,
    gossip: &Payload,
    issued: &mut Vec<u64>,
) -> Result<u32, DisseminationError> {
    let mut rounds = 0;
    loop {
        if let Some(err) = acks.failure() {
            return Err(err);
        }

        let pending = acks.pending();
        if pending.is_empty() {
            return Ok(rounds);
        }
        if config.max_rounds.is_some_and(|max| rounds >= max) {
            return Err(DisseminationError::RoundsExhausted { rounds, pending });
        }

        rounds += 1;
        debug!(round = rounds, pending = pending.len(), "gossip round");
        for neighbor in pending {
            let callback_acks = Arc::clone(acks);
            let target = neighbor.clone();
            let msg_id = node
                .rpc(&neighbor, gossip, move |reply| {
                    acknowledge(&callback_acks, &target, &reply)
                })
                .map_err(|err| DisseminationError::SendFailed {
                    neighbor,
                    reason: format!("{err:#}"),
                })?;
            issued.push(msg_id);
        }

        tokio::time::sleep(config.retry_interval).await;
    }
}

fn acknowledge(acks: &AckSet, neighbor: &str, reply: &Message) -> Result<()> {
    let failure = match reply.body.payload() {
        Ok(Payload::BroadcastOk) => {
            acks.mark_acked(neighbor);
            return Ok(());
        }
        Ok(_) => DisseminationError::NeighborRejected {
            neighbor: neighbor.to_string(),
            reply_type: reply.body.kind.clone(),
        },
        Err(err) => DisseminationError::ReplyUndecodable {
            neighbor: neighbor.to_string(),
            reason: format!("{err:#}"),
        },
    };
    acks.fail(failure.clone());
    Err(failure.into())
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;
    use crate::message::Body;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        node: Arc<Node>,
        topology: Arc<TopologyManager>,
        outbound: mpsc::UnboundedReceiver<Message>,
    }

    impl Fixture {
        fn new(neighbors: &[&str]) -> Self {
            let (tx, outbound) = mpsc::unbounded_channel();
            let topology = Arc::new(TopologyManager::new());
            topology.set_neighbors(neighbors.iter().map(|n| n.to_string()).collect());
            Self {
                node: Arc::new(Node::new("n1", vec![], tx)),
                topology,
                outbound,
            }
        }

        fn start(
            &self,
            from: &str,
            value: u64,
            config: GossipConfig,
        ) -> JoinHandle<Result<DisseminationReport>> {
            let node = Arc::clone(&self.node);
            let topology = Arc::clone(&self.topology);
            let request = broadcast_request(from, value);
            tokio::spawn(async move {
                disseminate(&node, &topology, &config, &request, Value::from(value)).await
            })
        }

        async fn next(&mut self) -> Message {
            timeout(WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for outbound message")
                .expect("outbound channel closed")
        }

        fn answer(&self, gossip: &Message, kind: &str) -> Option<Result<()>> {
            let mut body = Body::from_payload(&Payload::BroadcastOk).expect("encode body");
            body.kind = kind.to_string();
            body.in_reply_to = gossip.body.msg_id;
            self.node
                .handle_reply(Message::new(gossip.dest.clone(), gossip.src.clone(), body))
        }
    }

    fn broadcast_request(from: &str, value: u64) -> Message {
        let mut body = Body::from_payload(&Payload::Broadcast {
            message: Value::from(value),
        })
        .expect("encode body");
        body.msg_id = Some(1);
        Message::new(from, "n1", body)
    }

    fn fast() -> GossipConfig {
        GossipConfig {
            retry_interval: Duration::from_millis(10),
            max_rounds: None,
        }
    }

    #[tokio::test]
    async fn no_neighbors_replies_twice_and_completes() {
        let mut fixture = Fixture::new(&[]);
        let handle = fixture.start("c1", 42, fast());

        let first = fixture.next().await;
        let second = fixture.next().await;
        assert_eq!((first.dest.as_str(), first.body.kind.as_str()), ("c1", "broadcast_ok"));
        assert_eq!((second.dest.as_str(), second.body.kind.as_str()), ("c1", "broadcast_ok"));
        assert_eq!(first.body.in_reply_to, Some(1));
        assert_eq!(second.body.in_reply_to, Some(1));

        let report = handle.await.expect("task").expect("dissemination");
        assert_eq!(report, DisseminationReport { rounds: 0, neighbors: 0 });
    }

    #[tokio::test]
    async fn completes_once_every_neighbor_acks() {
        let mut fixture = Fixture::new(&["n2", "n3"]);
        let handle = fixture.start("c1", 42, fast());

        assert_eq!(fixture.next().await.body.kind, "broadcast_ok");
        let to_n2 = fixture.next().await;
        let to_n3 = fixture.next().await;
        assert_eq!(to_n2.dest, "n2");
        assert_eq!(to_n3.dest, "n3");
        assert_eq!(
            to_n2.body.payload().expect("gossip payload"),
            Payload::Broadcast {
                message: Value::from(42u64)
            }
        );

        assert!(matches!(fixture.answer(&to_n2, "broadcast_ok"), Some(Ok(()))));
        assert!(matches!(fixture.answer(&to_n3, "broadcast_ok"), Some(Ok(()))));

        let report = timeout(WAIT, handle)
            .await
            .expect("dissemination should finish")
            .expect("task")
            .expect("dissemination");
        assert_eq!(report.neighbors, 2);

        // Drain any retries sent before the acks landed; the last message is the final ok.
        let mut last = fixture.next().await;
        while let Ok(message) = fixture.outbound.try_recv() {
            last = message;
        }
        assert_eq!((last.dest.as_str(), last.body.kind.as_str()), ("c1", "broadcast_ok"));
    }

    #[tokio::test]
    async fn acked_neighbors_are_not_resent() {
        let mut fixture = Fixture::new(&["n2", "n3"]);
        let config = GossipConfig {
            retry_interval: Duration::from_millis(200),
            max_rounds: None,
        };
        let handle = fixture.start("c1", 7, config);

        assert_eq!(fixture.next().await.body.kind, "broadcast_ok");
        let to_n2 = fixture.next().await;
        let first_to_n3 = fixture.next().await;
        fixture.answer(&to_n2, "broadcast_ok");

        // Second round only targets n3.
        let retry = fixture.next().await;
        assert_eq!(retry.dest, "n3");
        assert_ne!(retry.body.msg_id, first_to_n3.body.msg_id);

        fixture.answer(&retry, "broadcast_ok");
        let done = fixture.next().await;
        assert_eq!((done.dest.as_str(), done.body.kind.as_str()), ("c1", "broadcast_ok"));

        let report = handle.await.expect("task").expect("dissemination");
        assert_eq!(report.rounds, 2);
    }

    #[tokio::test]
    async fn lost_round_replies_leave_no_callbacks_behind() {
        let mut fixture = Fixture::new(&["n2"]);
        let handle = fixture.start("c1", 21, fast());

        fixture.next().await;
        let _unanswered = fixture.next().await;
        let retry = fixture.next().await;
        assert_eq!(retry.dest, "n2");
        fixture.answer(&retry, "broadcast_ok");

        timeout(WAIT, handle)
            .await
            .expect("dissemination should finish")
            .expect("task")
            .expect("dissemination");
        assert_eq!(fixture.node.pending_rpcs(), 0);
    }

    #[tokio::test]
    async fn sender_is_not_gossiped_back_to() {
        let mut fixture = Fixture::new(&["n2", "n3"]);
        let handle = fixture.start("n2", 5, fast());

        let ok = fixture.next().await;
        assert_eq!((ok.dest.as_str(), ok.body.kind.as_str()), ("n2", "broadcast_ok"));

        let gossip = fixture.next().await;
        assert_eq!(gossip.dest, "n3");
        fixture.answer(&gossip, "broadcast_ok");

        let report = timeout(WAIT, handle)
            .await
            .expect("dissemination should finish")
            .expect("task")
            .expect("dissemination");
        assert_eq!(report.neighbors, 1);
    }

    #[tokio::test]
    async fn rejection_aborts_the_whole_operation() {
        let mut fixture = Fixture::new(&["n2", "n3"]);
        let handle = fixture.start("c1", 9, fast());

        assert_eq!(fixture.next().await.body.kind, "broadcast_ok");
        let to_n2 = fixture.next().await;
        let _to_n3 = fixture.next().await;

        assert!(matches!(
            fixture.answer(&to_n2, "broadcast_not_okay"),
            Some(Err(_))
        ));

        let err = timeout(WAIT, handle)
            .await
            .expect("dissemination should abort")
            .expect("task")
            .expect_err("rejected dissemination");
        assert_eq!(
            err.downcast_ref::<DisseminationError>(),
            Some(&DisseminationError::NeighborRejected {
                neighbor: "n2".into(),
                reply_type: "broadcast_not_okay".into(),
            })
        );

        let mut last = fixture.next().await;
        while let Ok(message) = fixture.outbound.try_recv() {
            last = message;
        }
        assert_eq!(
            (last.dest.as_str(), last.body.kind.as_str()),
            ("c1", "broadcast_not_okay")
        );
    }

    #[tokio::test]
    async fn error_reply_aborts() {
        let mut fixture = Fixture::new(&["n2"]);
        let handle = fixture.start("c1", 3, fast());

        fixture.next().await;
        let to_n2 = fixture.next().await;

        let mut body = Body::from_payload(&Payload::Error {
            code: 13,
            text: "crashed".into(),
        })
        .expect("encode body");
        body.in_reply_to = to_n2.body.msg_id;
        let outcome = fixture.node.handle_reply(Message::new("n2", "n1", body));
        assert!(matches!(outcome, Some(Err(_))));

        let err = timeout(WAIT, handle)
            .await
            .expect("dissemination should abort")
            .expect("task")
            .expect_err("error reply aborts");
        assert!(matches!(
            err.downcast_ref::<DisseminationError>(),
            Some(DisseminationError::NeighborRejected { reply_type, .. }) if reply_type == "error"
        ));
    }

    #[tokio::test]
    async fn max_rounds_turns_silence_into_failure() {
        let mut fixture = Fixture::new(&["n2"]);
        let config = GossipConfig {
            retry_interval: Duration::from_millis(5),
            max_rounds: Some(3),
        };
        let handle = fixture.start("c1", 11, config);

        let err = timeout(WAIT, handle)
            .await
            .expect("bounded dissemination should finish")
            .expect("task")
            .expect_err("unanswered neighbor");
        assert_eq!(
            err.downcast_ref::<DisseminationError>(),
            Some(&DisseminationError::RoundsExhausted {
                rounds: 3,
                pending: vec!["n2".into()],
            })
        );

        let mut sent = Vec::new();
        while let Ok(message) = fixture.outbound.try_recv() {
            sent.push(message);
        }
        let gossip_count = sent.iter().filter(|m| m.dest == "n2").count();
        assert_eq!(gossip_count, 3);
        let last = sent.last().expect("final reply");
        assert_eq!(last.body.kind, "broadcast_not_okay");
        assert_eq!(fixture.node.pending_rpcs(), 0);
    }

    #[tokio::test]
    async fn silent_neighbor_keeps_retrying() {
        let mut fixture = Fixture::new(&["n2"]);
        let handle = fixture.start("c1", 13, fast());

        fixture.next().await;
        for _ in 0..4 {
            let gossip = fixture.next().await;
            assert_eq!(gossip.dest, "n2");
        }
        assert!(!handle.is_finished());
        handle.abort();
    }
}
