//! Protocol layer for the chat relay
//!
//! This module provides:
//! - Newline-delimited line framing
//! - The fixed prompts and notice formats sent to clients

pub mod codec;
pub mod messages;

pub use codec::{LineCodec, DEFAULT_MAX_LINE_LENGTH};
pub use messages::ClientLine;
