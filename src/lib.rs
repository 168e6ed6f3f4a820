// Copyright 2019 Joyent, Inc.

//! duplex-rpc: a transport-agnostic bidirectional RPC protocol
//!
//! A server side exposes a set of named asynchronous procedures (an
//! *extension*); a client side invokes them by name with arbitrary
//! serializable arguments and awaits a single result. While a procedure
//! runs it may invoke *callback* arguments the caller passed, any number
//! of times, streaming data back to the caller before the call returns.
//! The same wire protocol runs over any ordered, reliable bidirectional
//! carrier: a TCP stream, HTTP request/response bodies, WebSocket frames,
//! or an in-process duplex pipe. This crate is the protocol engine; a
//! carrier adapter only has to feed the engine's inbound byte stream and
//! forward its outbound byte stream.
//!
//! Protocol overview
//!
//! Communication consists of discrete *records*, each framed as:
//!
//! * LEN0...LEN3       4-byte little-endian unsigned integer: the number of
//!                     payload bytes that follow the header.
//!
//! * MAGIC0...MAGIC3   4-byte little-endian unsigned integer, always
//!                     0xB1F7705F. A record with any other value here
//!                     poisons the pipeline.
//!
//! * DATA0...DATAN     Payload. A MessagePack-encoded message, or its
//!                     AES-256-GCM sealed form when the pipeline was given
//!                     a pre-shared `rpc_key`.
//!
//! Each message is the MessagePack 3-array `[id, type, data]`. The id is a
//! 32-bit integer scoped to the pipeline; the client allocates ids
//! sequentially for calls and callback handles alike. The type is one of:
//!
//! |Type value    | Type name  | Description |
//! |------------- | ---------- | ----------- |
//! | `0xDF68F4CB` | `CALL`     | A procedure invocation. Only clients send it. |
//! | `0x68B17581` | `RETURN`   | The single result of a completed call. Only servers send it. |
//! | `0x8D65E5CC` | `CALLBACK` | An invocation of a callback handle carried by an earlier CALL. Only servers send it. |
//! | `0xA07C0F84` | `ERROR`    | The failed completion of a call, with the remote message and stack. Only servers send it. |
//!
//! ### Argument items
//!
//! CALL and CALLBACK data is an ordered list of argument items, each the
//! pair `[tag, payload]`. The first item of a CALL is by convention the
//! procedure name. Two tags exist:
//!
//! | Tag value  | Tag name   | Payload |
//! | ---------- | ---------- | ------- |
//! | `0xA7F68C` | `OTHERS`   | Any serializable value, carried directly. |
//! | `0x7FF45F` | `FUNCTION` | A 32-bit callback handle. The recipient may invoke it by emitting CALLBACK messages whose id equals the handle. |
//!
//! ### Messaging scenarios
//!
//! **Client invokes a procedure.** The client allocates a call id,
//! registers a waiter under it, allocates and registers a handle for every
//! callback argument, and sends one CALL. Clients may issue concurrent
//! calls over a single pipeline.
//!
//! **Server streams data through a callback.** While the procedure runs it
//! may invoke any callback argument it received; each invocation travels
//! as one CALLBACK message bearing that argument's handle. All CALLBACKs
//! for a call precede its RETURN on the wire.
//!
//! **Server completes a call.** Exactly one RETURN (carrying the
//! procedure's result, possibly the undefined value) or one ERROR
//! (carrying the failure's message and stack) finishes each call. The
//! client then drops every callback registration belonging to that call.
//!
//! A remote ERROR fails only its own call. A framing error, a failed
//! decrypt, or a malformed payload poisons the whole pipeline: inbound
//! processing stops and every pending call fails. The engine never
//! retries; reconnection is a carrier concern.

#![allow(missing_docs)]

pub mod cipher;
pub mod client;
pub mod context;
pub mod errors;
pub mod frame;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod value;
