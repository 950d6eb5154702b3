//! `mix-cryptops`: the arithmetic a mix phase performs on each slot.
//!
//! Primitives are pure functions over a [`CyclicGroup`]: they take inputs,
//! return the output or a [`CryptoError`], and hold no state. Phase buffers
//! are [`IntBuffer`]s so disjoint index ranges can be written from many
//! workers at once without locking.

pub mod buffer;
pub mod error;
pub mod group;
pub mod ops;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use buffer::IntBuffer;
pub use error::{CryptoError, Result};
pub use group::CyclicGroup;
