// Copyright 2020 Joyent, Inc.

//! Error type shared by every layer of the crate. A `Remote` error fails
//! only the call that produced it; every other kind is fatal to the
//! pipeline that raised it, because the byte stream can no longer be
//! trusted. The type is `Clone` so one carrier failure can settle every
//! pending waiter.

use std::io;

/// Errors surfaced by the RPC engine and its codecs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The remote procedure failed. `stack` is the remote stack, carried
    /// verbatim from the peer.
    #[error("remote call failed: {message}")]
    Remote { message: String, stack: String },

    /// A frame header carried the wrong magic number.
    #[error("invalid frame magic 0x{found:08x}")]
    BadMagic { found: u32 },

    /// A frame header announced a payload beyond the configured ceiling.
    #[error("frame payload too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Record encryption or authentication failed.
    #[error("cipher failure: {0}")]
    Crypto(String),

    /// A record could not be serialized or deserialized.
    #[error("wire codec error: {0}")]
    Codec(String),

    /// The underlying carrier reported an I/O failure.
    #[error("carrier I/O error: {0}")]
    Io(String),

    /// The pipeline was torn down while work was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The engine's outbound channel is gone; the pipeline no longer
    /// accepts messages.
    #[error("pipeline outbound channel closed")]
    ChannelClosed,
}

impl From<io::Error> for RpcError {
    fn from(error: io::Error) -> Self {
        RpcError::Io(error.to_string())
    }
}
