//! Gossip broadcast node.
//!
//! A node joins a cluster through the `init` handshake, then accepts three
//! client requests: `broadcast` adds a value, `read` returns every value seen
//! so far, and `topology` names the node's neighbors. A value seen for the
//! first time is gossiped to each neighbor, retried every interval until the
//! neighbor acknowledges it. Every node stores each value once, so
//! retransmissions are harmless and the cluster converges on the same set.
//!
//! # Architecture
//!
//! - **Reader**: parses stdin line by line and routes each message
//! - **Writer task**: the single owner of stdout, fed by an unbounded channel
//! - **Handler tasks**: one per request; broadcasts of new values stay alive
//!   for as long as their gossip rounds run
//!
//! State shared between handlers sits behind locks that are never held
//! across an `.await`.
//!
//! # Modules
//!
//! - [`message`]: Wire envelope, typed payloads and line framing
//! - [`node`]: Message ids, `send`/`reply`/`rpc` and reply correlation
//! - [`store`]: Deduplicated, insertion-ordered value store
//! - [`topology`]: This node's current neighbor list
//! - [`ack`]: Per-dissemination acknowledgment tracking
//! - [`gossip`]: The retrying dissemination loop
//! - [`server`]: Request handlers
//! - [`runtime`]: Init handshake, read loop and output writer
//! - [`cli`]: Command-line flags

pub mod ack;
pub mod cli;
pub mod gossip;
pub mod message;
pub mod node;
pub mod runtime;
pub mod server;
pub mod store;
pub mod topology;
