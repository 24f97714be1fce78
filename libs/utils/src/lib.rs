//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

/// `Timestamp` is the logical time at which writes commit and reads are pinned
pub mod timestamp;

// 128-bit identifiers with hex serialization
pub mod id;

// helper functions for creating and fsyncing
pub mod crashsafe;

// common log initialisation routine
pub mod logging;

pub mod serde_system_time;
