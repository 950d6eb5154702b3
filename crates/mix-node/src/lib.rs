//! `mix-node`: a mix node runtime on top of `mix-round`.
//!
//! [`NodeInstance`] turns inbound [`RoundMessage`](mix_types::RoundMessage)s
//! into round and phase operations; [`ProtocolHandler`] sends each phase's
//! output on to the next node through a [`PeerNetwork`]. [`Cluster`] wires N
//! instances together over the in-memory [`LocalNetwork`]. Each node's
//! [`Activity`] is tracked by an [`ActivityMachine`].

pub mod activity;
pub mod cluster;
pub mod handlers;
pub mod instance;
pub mod network;

pub use activity::ActivityMachine;
pub use cluster::Cluster;
pub use handlers::{CompletedBatch, HandlerSet, ProtocolHandler};
pub use instance::NodeInstance;
pub use mix_types::Activity;
pub use network::{LocalNetwork, PeerNetwork};
