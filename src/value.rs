// Copyright 2020 Joyent, Inc.

//! This module contains the self-describing value model used for every RPC
//! payload. A `Value` round-trips through MessagePack without ambiguity:
//! byte arrays stay distinct from arrays, big integers from machine
//! integers, `Undefined` from `Null`, and maps keep their key order and
//! admit non-string keys. Types MessagePack has no native marker for ride
//! ext records with crate-assigned tags; both ends of a connection are this
//! crate, so the tag assignment is part of the wire contract.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use num_bigint::BigInt;
use rmpv::{Integer, Utf8String};

use crate::errors::RpcError;

const EXT_UNDEFINED: i8 = 0x01;
const EXT_DATE: i8 = 0x02;
const EXT_BIGINT: i8 = 0x03;
const EXT_SET: i8 = 0x04;
const EXT_ERROR: i8 = 0x05;

/// A single RPC payload value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    /// Distinct from `Null`: the absence of a value, e.g. a procedure that
    /// returns nothing.
    Undefined,
    Bool(bool),
    Int(i64),
    /// Arbitrary-precision integer, kept apart from `Int` on the wire.
    BigInt(BigInt),
    Float(f64),
    String(String),
    /// A byte payload, distinct from `Array`.
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Insertion-ordered pairs; keys need not be strings.
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    /// Millisecond precision; sub-millisecond detail does not survive the
    /// wire.
    Date(SystemTime),
    Error { message: String, stack: String },
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            // NaN compares equal to itself so round-trip assertions hold.
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (
                Value::Error { message: a_msg, stack: a_stack },
                Value::Error { message: b_msg, stack: b_stack },
            ) => a_msg == b_msg && a_stack == b_stack,
            _ => false,
        }
    }
}

impl Value {
    /// Returns the contained string, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the contained bytes, if this is a `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the contained integer, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the contained float, if this is a `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the contained boolean, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the contained elements, if this is an `Array`.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(String::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Value {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Value {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Value {
        Value::Array(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Value {
        Value::BigInt(v)
    }
}

impl From<SystemTime> for Value {
    fn from(v: SystemTime) -> Value {
        Value::Date(v)
    }
}

/// Convert a `Value` into the MessagePack value tree it is serialized as.
pub(crate) fn to_mp(value: &Value) -> Result<rmpv::Value, RpcError> {
    let encoded = match value {
        Value::Null => rmpv::Value::Nil,
        Value::Undefined => rmpv::Value::Ext(EXT_UNDEFINED, Vec::new()),
        Value::Bool(b) => rmpv::Value::Boolean(*b),
        Value::Int(n) => rmpv::Value::Integer(Integer::from(*n)),
        Value::BigInt(n) => rmpv::Value::Ext(EXT_BIGINT, n.to_signed_bytes_be()),
        Value::Float(f) => rmpv::Value::F64(*f),
        Value::String(s) => rmpv::Value::String(Utf8String::from(s.as_str())),
        Value::Bytes(b) => rmpv::Value::Binary(b.clone()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_mp(item)?);
            }
            rmpv::Value::Array(out)
        }
        Value::Map(pairs) => {
            let mut out = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                out.push((to_mp(k)?, to_mp(v)?));
            }
            rmpv::Value::Map(out)
        }
        Value::Set(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(to_mp(item)?);
            }
            rmpv::Value::Ext(EXT_SET, write_nested(&rmpv::Value::Array(out))?)
        }
        Value::Date(when) => {
            rmpv::Value::Ext(EXT_DATE, system_time_to_millis(*when).to_be_bytes().to_vec())
        }
        Value::Error { message, stack } => {
            let pair = rmpv::Value::Array(vec![
                rmpv::Value::String(Utf8String::from(message.as_str())),
                rmpv::Value::String(Utf8String::from(stack.as_str())),
            ]);
            rmpv::Value::Ext(EXT_ERROR, write_nested(&pair)?)
        }
    };
    Ok(encoded)
}

/// Rebuild a `Value` from its MessagePack value tree.
pub(crate) fn from_mp(encoded: rmpv::Value) -> Result<Value, RpcError> {
    let value = match encoded {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(n) => match n.as_i64() {
            Some(v) => Value::Int(v),
            // Wider than i64: only a foreign encoder produces this.
            None => match n.as_u64() {
                Some(v) => Value::BigInt(BigInt::from(v)),
                None => {
                    return Err(RpcError::Codec(String::from(
                        "unrepresentable integer payload",
                    )))
                }
            },
        },
        rmpv::Value::F32(f) => Value::Float(f64::from(f)),
        rmpv::Value::F64(f) => Value::Float(f),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Value::String(s),
            None => {
                return Err(RpcError::Codec(String::from(
                    "string payload is not valid UTF-8",
                )))
            }
        },
        rmpv::Value::Binary(b) => Value::Bytes(b),
        rmpv::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_mp(item)?);
            }
            Value::Array(out)
        }
        rmpv::Value::Map(pairs) => {
            let mut out = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                out.push((from_mp(k)?, from_mp(v)?));
            }
            Value::Map(out)
        }
        rmpv::Value::Ext(EXT_UNDEFINED, _) => Value::Undefined,
        rmpv::Value::Ext(EXT_DATE, payload) => {
            let millis: [u8; 8] = payload.as_slice().try_into().map_err(|_| {
                RpcError::Codec(String::from("date payload must be 8 bytes"))
            })?;
            Value::Date(millis_to_system_time(i64::from_be_bytes(millis)))
        }
        rmpv::Value::Ext(EXT_BIGINT, payload) => {
            Value::BigInt(BigInt::from_signed_bytes_be(&payload))
        }
        rmpv::Value::Ext(EXT_SET, payload) => match read_nested(&payload)? {
            rmpv::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(from_mp(item)?);
                }
                Value::Set(out)
            }
            _ => {
                return Err(RpcError::Codec(String::from(
                    "set payload must be an array",
                )))
            }
        },
        rmpv::Value::Ext(EXT_ERROR, payload) => match read_nested(&payload)? {
            rmpv::Value::Array(mut pair) if pair.len() == 2 => {
                let stack = expect_string(pair.pop(), "error stack")?;
                let message = expect_string(pair.pop(), "error message")?;
                Value::Error { message, stack }
            }
            _ => {
                return Err(RpcError::Codec(String::from(
                    "error payload must be a 2-array",
                )))
            }
        },
        rmpv::Value::Ext(tag, _) => {
            return Err(RpcError::Codec(format!("unknown ext tag {}", tag)))
        }
    };
    Ok(value)
}

fn expect_string(value: Option<rmpv::Value>, what: &str) -> Result<String, RpcError> {
    match value {
        Some(rmpv::Value::String(s)) => s
            .into_str()
            .ok_or_else(|| RpcError::Codec(format!("{} is not valid UTF-8", what))),
        _ => Err(RpcError::Codec(format!("{} must be a string", what))),
    }
}

fn write_nested(value: &rmpv::Value) -> Result<Vec<u8>, RpcError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| RpcError::Codec(e.to_string()))?;
    Ok(buf)
}

fn read_nested(buf: &[u8]) -> Result<rmpv::Value, RpcError> {
    let mut cursor = buf;
    rmpv::decode::read_value(&mut cursor).map_err(|e| RpcError::Codec(e.to_string()))
}

pub(crate) fn system_time_to_millis(when: SystemTime) -> i64 {
    match when.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

pub(crate) fn millis_to_system_time(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(value: Value) -> Value {
        let buf = write_nested(&to_mp(&value).expect("encode")).expect("write");
        from_mp(read_nested(&buf).expect("read")).expect("decode")
    }

    fn assert_round_trip(value: Value) {
        let decoded = round_trip(value.clone());
        assert_eq!(decoded, value);
    }

    #[test]
    fn scalars_round_trip() {
        assert_round_trip(Value::Null);
        assert_round_trip(Value::Undefined);
        assert_round_trip(Value::Bool(true));
        assert_round_trip(Value::Bool(false));
        assert_round_trip(Value::Int(0));
        assert_round_trip(Value::Int(-42));
        assert_round_trip(Value::Int(i64::MAX));
        assert_round_trip(Value::Int(i64::MIN));
        assert_round_trip(Value::Float(1.5));
        assert_round_trip(Value::Float(f64::NAN));
        assert_round_trip(Value::Float(f64::INFINITY));
        assert_round_trip(Value::Float(f64::NEG_INFINITY));
        assert_round_trip(Value::String(String::from("héllo wörld ✓")));
        assert_round_trip(Value::String(String::new()));
    }

    #[test]
    fn big_integers_round_trip() {
        assert_round_trip(Value::BigInt(BigInt::from(7)));
        assert_round_trip(Value::BigInt(BigInt::from(-7)));
        assert_round_trip(Value::BigInt(
            BigInt::from(u64::MAX) * BigInt::from(u64::MAX),
        ));
    }

    #[test]
    fn bytes_round_trip() {
        assert_round_trip(Value::Bytes(Vec::new()));
        assert_round_trip(Value::Bytes(b"qwertyuiop".to_vec()));
        assert_round_trip(Value::Bytes(vec![0u8; 300_000]));
    }

    #[test]
    fn dates_round_trip() {
        assert_round_trip(Value::Date(UNIX_EPOCH));
        assert_round_trip(Value::Date(UNIX_EPOCH + Duration::from_millis(1_234_567_890)));
        assert_round_trip(Value::Date(UNIX_EPOCH - Duration::from_millis(86_400_000)));
    }

    #[test]
    fn collections_round_trip() {
        assert_round_trip(Value::Array(vec![
            Value::Int(1),
            Value::String(String::from("two")),
            Value::Null,
        ]));
        assert_round_trip(Value::Set(vec![Value::Int(1), Value::Int(2)]));
        assert_round_trip(Value::Map(vec![
            (Value::String(String::from("name")), Value::Int(1)),
            (Value::Int(7), Value::Bool(true)),
            (
                Value::Array(vec![Value::Int(1)]),
                Value::Bytes(vec![1, 2, 3]),
            ),
        ]));
    }

    #[test]
    fn nested_records_round_trip() {
        assert_round_trip(Value::Map(vec![(
            Value::String(String::from("outer")),
            Value::Map(vec![(
                Value::String(String::from("inner")),
                Value::Array(vec![
                    Value::Set(vec![Value::Bytes(vec![9])]),
                    Value::Date(UNIX_EPOCH + Duration::from_millis(5)),
                    Value::Undefined,
                ]),
            )]),
        )]));
    }

    #[test]
    fn error_values_round_trip() {
        assert_round_trip(Value::Error {
            message: String::from("kaboom"),
            stack: String::from("kaboom\n    at explode (demo)"),
        });
    }

    #[test]
    fn wide_unsigned_integers_promote_to_bigint() {
        let buf =
            write_nested(&rmpv::Value::Integer(Integer::from(u64::MAX))).expect("write");
        let decoded = from_mp(read_nested(&buf).expect("read")).expect("decode");
        assert_eq!(decoded, Value::BigInt(BigInt::from(u64::MAX)));
    }

    #[test]
    fn unknown_ext_tag_is_rejected() {
        let buf = write_nested(&rmpv::Value::Ext(0x55, vec![1, 2, 3])).expect("write");
        let result = from_mp(read_nested(&buf).expect("read"));
        assert!(matches!(result, Err(RpcError::Codec(_))));
    }

    #[test]
    fn undefined_and_null_stay_distinct() {
        assert_ne!(round_trip(Value::Undefined), Value::Null);
        assert_ne!(round_trip(Value::Null), Value::Undefined);
    }

    #[test]
    fn bytes_and_arrays_stay_distinct() {
        let bytes = round_trip(Value::Bytes(vec![1, 2, 3]));
        assert!(matches!(bytes, Value::Bytes(_)));
        let array =
            round_trip(Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        assert!(matches!(array, Value::Array(_)));
    }

    #[test]
    fn millis_conversion_is_symmetric() {
        for millis in [-86_400_000i64, -1, 0, 1, 1_234_567_890_123] {
            assert_eq!(system_time_to_millis(millis_to_system_time(millis)), millis);
        }
    }
}
