// Copyright 2020 Joyent, Inc.

//! This module contains the types and functions used to encode and decode
//! duplex RPC messages. The contents of this module are not needed for
//! normal client or server consumers of this crate, but they are exposed
//! for the special case of someone needing to implement custom client or
//! server code.

use std::sync::atomic::{AtomicU32, Ordering};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use rmpv::{Integer, Utf8String};

use crate::errors::RpcError;
use crate::value::{self, Value};

/// A data type representing a message id allocator that can safely be
/// shared between threads. The `next_id` associated function retrieves the
/// next id value and manages the circular message id space internally.
/// Call ids and callback handles draw from the same space.
#[derive(Default)]
pub struct MessageId(AtomicU32);

impl MessageId {
    /// Creates a new MessageId
    pub fn new() -> Self {
        MessageId(AtomicU32::new(0))
    }

    /// Returns the next message id, wrapping around the u32 space.
    pub fn next_id(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Represents the Type field of a duplex RPC message.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
pub enum MessageType {
    /// A procedure invocation. The first argument item is the procedure
    /// name; the rest are positional arguments.
    Call = 0xDF68_F4CB,
    /// The single result of a completed call.
    Return = 0x68B1_7581,
    /// An invocation of a callback handle the caller passed with a call.
    Callback = 0x8D65_E5CC,
    /// The failure of a call, with the remote message and stack.
    Error = 0xA07C_0F84,
}

/// Represents the tag of one argument item in a CALL or CALLBACK message.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
pub enum ArgKind {
    /// Any serializable value, carried directly.
    Others = 0x00A7_F68C,
    /// A callback handle: a 32-bit integer the recipient treats as an
    /// opaque token and may invoke by emitting CALLBACK messages bearing
    /// it.
    Function = 0x007F_F45F,
}

/// One argument item of a CALL or CALLBACK message.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Value(Value),
    /// A callback handle allocated from the sender's id space.
    Callback(u32),
}

/// The ERROR message payload: the remote failure's message and stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorData {
    pub message: String,
    pub stack: String,
}

/// The data payload of a message; its shape is determined by the message
/// type.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    /// CALL and CALLBACK carry an ordered argument list.
    Args(Vec<CallArg>),
    /// RETURN carries the procedure's result.
    Value(Value),
    /// ERROR carries the remote failure.
    Error(ErrorData),
}

/// Represents a duplex RPC message: a type tag, a 32-bit id, and a payload
/// whose shape follows the type.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    pub id: u32,
    pub data: MessageData,
}

impl Message {
    /// Returns a CALL message for the named procedure. The name travels as
    /// the first argument item, tagged as a plain value.
    pub fn call(id: u32, name: &str, args: Vec<CallArg>) -> Message {
        let mut items = Vec::with_capacity(args.len() + 1);
        items.push(CallArg::Value(Value::String(String::from(name))));
        items.extend(args);
        Message {
            msg_type: MessageType::Call,
            id,
            data: MessageData::Args(items),
        }
    }

    /// Returns a CALLBACK message invoking the callback handle `id` with
    /// the provided positional arguments.
    pub fn callback(id: u32, args: Vec<Value>) -> Message {
        Message {
            msg_type: MessageType::Callback,
            id,
            data: MessageData::Args(args.into_iter().map(CallArg::Value).collect()),
        }
    }

    /// Returns a RETURN message completing call `id` with `value`.
    pub fn ret(id: u32, value: Value) -> Message {
        Message {
            msg_type: MessageType::Return,
            id,
            data: MessageData::Value(value),
        }
    }

    /// Returns an ERROR message failing call `id`.
    pub fn error(id: u32, message: String, stack: String) -> Message {
        Message {
            msg_type: MessageType::Error,
            id,
            data: MessageData::Error(ErrorData { message, stack }),
        }
    }

    /// Serialize this message to one wire record: the MessagePack 3-array
    /// `[id, type, data]`. Returns an error if the data shape does not
    /// match the message type.
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        let data = match (self.msg_type, &self.data) {
            (MessageType::Call, MessageData::Args(args))
            | (MessageType::Callback, MessageData::Args(args)) => encode_args(args)?,
            (MessageType::Return, MessageData::Value(v)) => value::to_mp(v)?,
            (MessageType::Error, MessageData::Error(e)) => rmpv::Value::Array(vec![
                rmpv::Value::String(Utf8String::from(e.message.as_str())),
                rmpv::Value::String(Utf8String::from(e.stack.as_str())),
            ]),
            _ => {
                return Err(RpcError::Codec(String::from(
                    "message data shape does not match message type",
                )))
            }
        };
        let msg_type = self
            .msg_type
            .to_u32()
            .ok_or_else(|| RpcError::Codec(String::from("invalid message type")))?;
        let tree = rmpv::Value::Array(vec![
            rmpv::Value::Integer(Integer::from(self.id)),
            rmpv::Value::Integer(Integer::from(msg_type)),
            data,
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &tree)
            .map_err(|e| RpcError::Codec(e.to_string()))?;
        Ok(buf)
    }

    /// Parse one wire record into a `Message`.
    pub fn decode(buf: &[u8]) -> Result<Message, RpcError> {
        let mut cursor = buf;
        let tree = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| RpcError::Codec(e.to_string()))?;
        let mut parts = match tree {
            rmpv::Value::Array(parts) if parts.len() == 3 => parts,
            _ => {
                return Err(RpcError::Codec(String::from(
                    "message record must be a 3-array",
                )))
            }
        };
        let data = parts.pop().unwrap_or(rmpv::Value::Nil);
        let msg_type = decode_u32(parts.pop(), "message type")?;
        let id = decode_u32(parts.pop(), "message id")?;
        let msg_type = MessageType::from_u32(msg_type).ok_or_else(|| {
            RpcError::Codec(format!("unknown message type 0x{:08x}", msg_type))
        })?;
        let data = match msg_type {
            MessageType::Call | MessageType::Callback => decode_args(data)?,
            MessageType::Return => MessageData::Value(value::from_mp(data)?),
            MessageType::Error => decode_error(data)?,
        };
        Ok(Message { msg_type, id, data })
    }
}

fn encode_args(args: &[CallArg]) -> Result<rmpv::Value, RpcError> {
    let mut items = Vec::with_capacity(args.len());
    for arg in args {
        let (kind, payload) = match arg {
            CallArg::Value(v) => (ArgKind::Others, value::to_mp(v)?),
            CallArg::Callback(handle) => (
                ArgKind::Function,
                rmpv::Value::Integer(Integer::from(*handle)),
            ),
        };
        let kind = kind
            .to_u32()
            .ok_or_else(|| RpcError::Codec(String::from("invalid argument tag")))?;
        items.push(rmpv::Value::Array(vec![
            rmpv::Value::Integer(Integer::from(kind)),
            payload,
        ]));
    }
    Ok(rmpv::Value::Array(items))
}

fn decode_args(data: rmpv::Value) -> Result<MessageData, RpcError> {
    let items = match data {
        rmpv::Value::Array(items) => items,
        _ => {
            return Err(RpcError::Codec(String::from(
                "argument list must be an array",
            )))
        }
    };
    let mut args = Vec::with_capacity(items.len());
    for item in items {
        let mut pair = match item {
            rmpv::Value::Array(pair) if pair.len() == 2 => pair,
            _ => {
                return Err(RpcError::Codec(String::from(
                    "argument item must be a 2-array",
                )))
            }
        };
        let payload = pair.pop().unwrap_or(rmpv::Value::Nil);
        let kind = decode_u32(pair.pop(), "argument tag")?;
        match ArgKind::from_u32(kind) {
            Some(ArgKind::Others) => args.push(CallArg::Value(value::from_mp(payload)?)),
            Some(ArgKind::Function) => args.push(CallArg::Callback(decode_u32(
                Some(payload),
                "callback handle",
            )?)),
            None => {
                return Err(RpcError::Codec(format!(
                    "unknown argument tag 0x{:08x}",
                    kind
                )))
            }
        }
    }
    Ok(MessageData::Args(args))
}

fn decode_error(data: rmpv::Value) -> Result<MessageData, RpcError> {
    match data {
        rmpv::Value::Array(mut pair) if pair.len() == 2 => {
            let stack = decode_string(pair.pop(), "error stack")?;
            let message = decode_string(pair.pop(), "error message")?;
            Ok(MessageData::Error(ErrorData { message, stack }))
        }
        _ => Err(RpcError::Codec(String::from(
            "error payload must be a 2-array",
        ))),
    }
}

fn decode_u32(value: Option<rmpv::Value>, what: &str) -> Result<u32, RpcError> {
    match value {
        Some(rmpv::Value::Integer(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| RpcError::Codec(format!("{} out of range", what))),
        _ => Err(RpcError::Codec(format!("{} must be an integer", what))),
    }
}

fn decode_string(value: Option<rmpv::Value>, what: &str) -> Result<String, RpcError> {
    match value {
        Some(rmpv::Value::String(s)) => s
            .into_str()
            .ok_or_else(|| RpcError::Codec(format!("{} is not valid UTF-8", what))),
        _ => Err(RpcError::Codec(format!("{} must be a string", what))),
    }
}
