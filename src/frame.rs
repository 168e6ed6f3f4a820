// Copyright 2020 Joyent, Inc.

//! This module implements the functions necessary for duplex RPC framing.
//! Each record travels as `length (u32 LE) | magic (u32 LE) | payload`,
//! where the payload is the record itself or its sealed form when the
//! pipeline carries a cipher. The decoder tolerates arbitrary
//! re-fragmentation of the byte stream; it never retries and never
//! reorders. A wrong magic number, an oversized length, or a failed open
//! poisons the pipeline.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::cipher::Cipher;
use crate::errors::RpcError;
use crate::protocol::Message;

/// The frame marker every record header carries.
pub const MAGIC: u32 = 0xB1F7_705F;

/// The size of a frame header: length plus magic.
pub const FRAME_HEADER_SZ: usize = 8;

/// Ceiling on a single frame payload. A header announcing more than this
/// is treated as a framing error rather than a buffering request.
pub const MAX_PAYLOAD_SZ: usize = 64 * 1024 * 1024;

/// Byte-level frame codec: discrete payload records in, framed (and
/// optionally sealed) bytes out, and the reverse.
pub struct FrameCodec {
    cipher: Option<Cipher>,
}

impl FrameCodec {
    pub fn new(cipher: Option<Cipher>) -> FrameCodec {
        FrameCodec { cipher }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), RpcError> {
        let record = match &self.cipher {
            Some(cipher) => Bytes::from(cipher.seal(&item)?),
            None => item,
        };
        if record.len() > MAX_PAYLOAD_SZ {
            return Err(RpcError::FrameTooLarge {
                size: record.len(),
                max: MAX_PAYLOAD_SZ,
            });
        }
        dst.reserve(FRAME_HEADER_SZ + record.len());
        dst.put_u32_le(record.len() as u32);
        dst.put_u32_le(MAGIC);
        dst.put_slice(&record);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, RpcError> {
        if src.len() < FRAME_HEADER_SZ {
            return Ok(None);
        }
        let len = LittleEndian::read_u32(&src[0..4]) as usize;
        let magic = LittleEndian::read_u32(&src[4..8]);
        if magic != MAGIC {
            return Err(RpcError::BadMagic { found: magic });
        }
        if len > MAX_PAYLOAD_SZ {
            return Err(RpcError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD_SZ,
            });
        }
        if src.len() < FRAME_HEADER_SZ + len {
            src.reserve(FRAME_HEADER_SZ + len - src.len());
            return Ok(None);
        }
        src.advance(FRAME_HEADER_SZ);
        let record = src.split_to(len);
        match &self.cipher {
            Some(cipher) => Ok(Some(BytesMut::from(&cipher.open(&record)?[..]))),
            None => Ok(Some(record)),
        }
    }
}

/// Message-level codec: `FrameCodec` with the message codec stacked on
/// top, suitable for driving a carrier through `Framed`.
pub struct RpcCodec {
    frames: FrameCodec,
}

impl RpcCodec {
    pub fn new(cipher: Option<Cipher>) -> RpcCodec {
        RpcCodec {
            frames: FrameCodec::new(cipher),
        }
    }
}

impl Encoder<Message> for RpcCodec {
    type Error = RpcError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), RpcError> {
        let record = item.encode()?;
        self.frames.encode(Bytes::from(record), dst)
    }
}

impl Decoder for RpcCodec {
    type Item = Message;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, RpcError> {
        match self.frames.decode(src)? {
            Some(record) => Message::decode(&record).map(Some),
            None => Ok(None),
        }
    }
}
