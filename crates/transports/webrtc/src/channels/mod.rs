//! Data channel message framing, type registry and multiplexing
//!
//! Every non-image bus message crosses the data channel as a 32-byte
//! NUL-padded type tag followed by the serialized body:
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────┐
//! │ type name, NUL padded (32 B) │ bincode body (variable)   │
//! └──────────────────────────────┴───────────────────────────┘
//! ```

pub mod messages;
pub mod multiplexer;
pub mod registry;

pub use messages::{MAX_MESSAGE_SIZE, REGISTERED_TYPES, TYPE_TAG_LEN};
pub use multiplexer::{
    run_dispatcher, Decoded, FrameSink, MessageMultiplexer, Outbound, Resolution,
};
pub use registry::{MessageCodec, TypeRegistry};
