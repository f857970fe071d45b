//! Wire protocol building blocks.

pub mod commands;
pub mod crc;
pub mod frame;

// Re-export common types
pub use frame::{Decoder, encode};
