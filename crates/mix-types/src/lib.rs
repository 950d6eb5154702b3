pub mod activity;
pub mod config;
pub mod error;
pub mod message;
pub mod node;
pub mod phase;

pub use activity::Activity;
pub use error::{MixError, Result};
pub use message::{RoundErrorReport, RoundMessage, Slot};
pub use node::{NodeId, RoundId, Topology};
pub use phase::{PhaseState, PhaseTag, PhaseType};
