//! `mix-round`: per-round protocol state for a mix node.
//!
//! A [`Round`] owns one [`Phase`] per protocol step. Each phase wraps a
//! [`PhaseGraph`] built on the engine, a [`TransmissionHandler`] that drains
//! its egress, and a forward-only [`PhaseState`](mix_types::PhaseState).
//!
//! ```text
//!   RoundMessage ──▶ Round::await_gate(tag) ──▶ Phase (input + send)
//!                                                   │ queue_phase
//!                                                   ▼
//!                                             ResourceQueue ──▶ graph.run
//!                                                   │           transmit
//!                                                   ▼
//!                                               QueueEvent
//! ```
//!
//! The [`ResourceQueue`] bounds concurrent phases node-wide; the
//! [`RoundManager`] tracks live rounds and refuses reused ids.

pub mod buffer;
pub mod error;
pub mod failure;
pub mod manager;
pub mod measure;
pub mod phase;
pub mod protocol;
pub mod resource_queue;
pub mod response;
pub mod round;
pub mod streams;
pub mod transmit;
pub mod transport;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use buffer::RoundBuffer;
pub use error::{Result, RoundError};
pub use failure::RoundFailure;
pub use manager::RoundManager;
pub use measure::{Metric, Metrics};
pub use phase::Phase;
pub use protocol::Position;
pub use resource_queue::{QueueEvent, ResourceQueue};
pub use response::{Response, ResponseMap};
pub use round::{Round, RoundParams};
pub use streams::{LinkSource, PhaseGraph};
pub use transmit::{DiscardHandler, HandlerFactory, TransmissionHandler};
pub use transport::{decode_message, encode_message};
