//! Protocolo binario entre dispatcher y workers.

pub mod auth;
pub mod codec;
pub mod control;
pub mod link;
pub mod manifest;
mod message;

pub use message::*;

/// `length: u32` + `command: u16`
pub const HEADER_LEN: usize = 6;
pub const MAX_MESSAGE_LEN: u32 = 256 * 1024;
pub const CHALLENGE_LEN: usize = 16;
pub const RESPONSE_LEN: usize = 32;
