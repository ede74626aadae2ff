//! Wire format between the bridge, the broker and the protocol engine.
//!
//! # Architecture
//!
//! - **protocol**: Topic layout, envelopes, outbound classification
//! - **codec**: CRLF line codec for the engine-side byte stream

pub mod codec;
pub mod protocol;

pub use codec::FrameCodec;
pub use protocol::{InboundRoute, Outbound, Topics, WireError};
