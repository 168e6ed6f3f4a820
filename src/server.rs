// Copyright 2019 Joyent, Inc.

//! This module provides the interface for creating duplex RPC servers.
//!
//! An `Extension` maps procedure names to async procedures. The server
//! engine dispatches each inbound CALL to its procedure, materializing
//! FUNCTION-tagged arguments as `CallbackProxy` handles that route
//! invocations back to the caller, and emits the procedure's RETURN or
//! ERROR when it completes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use slog::{debug, error, info, Logger};
use tokio::sync::mpsc;

use crate::context::{self, CallContext};
use crate::errors::RpcError;
use crate::protocol::{CallArg, Message, MessageData, MessageType};
use crate::value::Value;

/// A procedure failure: the message travels to the caller along with a
/// stack. When a procedure supplies no stack the engine composes one
/// naming the procedure and its extension.
#[derive(Debug)]
pub struct Fault {
    pub message: String,
    pub stack: Option<String>,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Fault {
        Fault {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(message: impl Into<String>, stack: impl Into<String>) -> Fault {
        Fault {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}

impl From<RpcError> for Fault {
    fn from(error: RpcError) -> Fault {
        Fault::new(error.to_string())
    }
}

/// The outcome of one procedure invocation.
pub type ProcedureResult = Result<Value, Fault>;

type Procedure =
    Arc<dyn Fn(Vec<ProcArg>) -> BoxFuture<'static, ProcedureResult> + Send + Sync>;

/// One materialized positional argument of a dispatched call.
pub enum ProcArg {
    Value(Value),
    /// A caller-supplied callback; invoke it any number of times before
    /// returning.
    Callback(CallbackProxy),
}

impl ProcArg {
    /// Take this argument as a value, failing the call otherwise.
    pub fn into_value(self) -> Result<Value, Fault> {
        match self {
            ProcArg::Value(v) => Ok(v),
            ProcArg::Callback(_) => Err(Fault::new("expected a value argument")),
        }
    }

    /// Take this argument as a callback, failing the call otherwise.
    pub fn into_callback(self) -> Result<CallbackProxy, Fault> {
        match self {
            ProcArg::Callback(cb) => Ok(cb),
            ProcArg::Value(_) => Err(Fault::new("expected a callback argument")),
        }
    }
}

/// The local face of a caller-supplied callback handle. Invoking it emits
/// a CALLBACK message bearing the handle through the pipeline's outbound
/// channel; the await propagates the channel's flow control into the
/// procedure.
#[derive(Clone)]
pub struct CallbackProxy {
    handle: u32,
    outbound: mpsc::Sender<Message>,
}

impl CallbackProxy {
    /// Invoke the remote callback with positional arguments.
    pub async fn call(&self, args: Vec<Value>) -> Result<(), RpcError> {
        self.outbound
            .send(Message::callback(self.handle, args))
            .await
            .map_err(|_| RpcError::ChannelClosed)
    }

    /// The wire handle this proxy routes to.
    pub fn handle(&self) -> u32 {
        self.handle
    }
}

/// A named collection of procedures a server exposes. The extension
/// outlives any pipeline dispatching into it.
pub struct Extension {
    name: String,
    procedures: HashMap<String, Procedure>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Extension {
        Extension {
            name: name.into(),
            procedures: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an async procedure under `name`. A procedure registered
    /// twice replaces its predecessor.
    pub fn register<F, Fut>(&mut self, name: &str, procedure: F) -> &mut Self
    where
        F: Fn(Vec<ProcArg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcedureResult> + Send + 'static,
    {
        let boxed: Procedure = Arc::new(move |args| -> BoxFuture<'static, ProcedureResult> {
            Box::pin(procedure(args))
        });
        self.procedures.insert(String::from(name), boxed);
        self
    }

    fn procedure(&self, name: &str) -> Option<Procedure> {
        self.procedures.get(name).cloned()
    }
}

/// How a pipeline runs inbound calls. Selected by the enclosing pipeline,
/// never negotiated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// A new call is not started until the previous one returned. Required
    /// when the carrier ties a response stream to a single call.
    Sequential,
    /// Every call runs in its own task; returns and callbacks interleave
    /// on the outbound stream.
    Concurrent,
}

/// The server half of one pipeline: consumes decoded messages, produces
/// encoded ones.
#[derive(Clone)]
pub(crate) struct ServerEngine {
    extension: Arc<Extension>,
    outbound: mpsc::Sender<Message>,
    ctx: Option<CallContext>,
    log: Logger,
}

impl ServerEngine {
    pub(crate) fn new(
        extension: Arc<Extension>,
        outbound: mpsc::Sender<Message>,
        ctx: Option<CallContext>,
        log: Logger,
    ) -> ServerEngine {
        ServerEngine {
            extension,
            outbound,
            ctx,
            log,
        }
    }

    /// Handle one inbound message. Only CALL is dispatched; anything else
    /// is dropped.
    pub(crate) async fn handle_message(&self, msg: Message) {
        match (msg.msg_type, msg.data) {
            (MessageType::Call, MessageData::Args(args)) => self.dispatch(msg.id, args).await,
            (msg_type, _) => {
                debug!(self.log, "dropping non-call message";
                    "msg_type" => ?msg_type, "id" => msg.id);
            }
        }
    }

    async fn dispatch(&self, id: u32, mut args: Vec<CallArg>) {
        let started = Instant::now();
        let name = match take_name(&mut args) {
            Ok(name) => name,
            Err(fault) => {
                error!(self.log, "rejecting malformed call"; "id" => id, "err" => fault.message.as_str());
                self.emit_fault(id, "<none>", fault).await;
                return;
            }
        };
        let summary = summarize_args(&args);

        let materialized = args
            .into_iter()
            .map(|arg| match arg {
                CallArg::Value(v) => ProcArg::Value(v),
                CallArg::Callback(handle) => ProcArg::Callback(CallbackProxy {
                    handle,
                    outbound: self.outbound.clone(),
                }),
            })
            .collect();

        let result = match self.extension.procedure(&name) {
            Some(procedure) => {
                context::scope(self.ctx.clone(), procedure(materialized)).await
            }
            None => Err(Fault::new(format!(
                "no procedure {:?} in extension {:?}",
                name,
                self.extension.name()
            ))),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(value) => {
                info!(self.log, "rpc call completed";
                    "method" => name.as_str(), "elapsed_ms" => elapsed_ms, "args" => summary.as_str());
                // The pipeline is gone if this send fails; the result is
                // dropped with it.
                let _ = self.outbound.send(Message::ret(id, value)).await;
            }
            Err(fault) => {
                error!(self.log, "rpc call failed";
                    "method" => name.as_str(), "elapsed_ms" => elapsed_ms,
                    "args" => summary.as_str(), "err" => fault.message.as_str());
                self.emit_fault(id, &name, fault).await;
            }
        }
    }

    async fn emit_fault(&self, id: u32, name: &str, fault: Fault) {
        let stack = match fault.stack {
            Some(stack) => stack,
            None => format!(
                "{}\n    at {} ({})",
                fault.message,
                name,
                self.extension.name()
            ),
        };
        let _ = self
            .outbound
            .send(Message::error(id, fault.message, stack))
            .await;
    }
}

fn take_name(args: &mut Vec<CallArg>) -> Result<String, Fault> {
    if args.is_empty() {
        return Err(Fault::new("call names no procedure"));
    }
    match args.remove(0) {
        CallArg::Value(Value::String(name)) => Ok(name),
        _ => Err(Fault::new("procedure name must be a string")),
    }
}

/// One-line rendering of an argument list for the completion log.
fn summarize_args(args: &[CallArg]) -> String {
    let mut out = String::from("(");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match arg {
            CallArg::Callback(handle) => out.push_str(&format!("callback#{}", handle)),
            CallArg::Value(v) => out.push_str(&summarize_value(v)),
        }
    }
    out.push(')');
    out
}

fn summarize_value(value: &Value) -> String {
    match value {
        Value::Null => String::from("null"),
        Value::Undefined => String::from("undefined"),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::BigInt(n) => format!("{}n", n),
        Value::Float(f) => f.to_string(),
        Value::String(s) if s.len() <= 32 => format!("{:?}", s),
        Value::String(s) => format!("string[{}]", s.len()),
        Value::Bytes(b) => format!("bytes[{}]", b.len()),
        Value::Array(items) => format!("array[{}]", items.len()),
        Value::Map(pairs) => format!("map[{}]", pairs.len()),
        Value::Set(items) => format!("set[{}]", items.len()),
        Value::Date(_) => String::from("date"),
        Value::Error { message, .. } => format!("error({:?})", message),
    }
}
