// Copyright 2019 Joyent, Inc.

//! This module provides the interface for creating duplex RPC clients.
//!
//! A `Client` is a cheap clone handle over one pipeline's client engine:
//! the id allocator, the pending-call table, and the outbound writer. Any
//! number of tasks may invoke procedures through the same handle; results,
//! remote errors, and callback invocations are routed back by the
//! pipeline's reader task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::future::BoxFuture;
use slog::{debug, Logger};
use tokio::sync::{mpsc, oneshot, watch};

use crate::errors::RpcError;
use crate::protocol::{CallArg, Message, MessageData, MessageId, MessageType};
use crate::value::Value;

/// A local callback passed as a call argument. The closure is invoked once
/// per inbound CALLBACK message bearing its handle; the future it returns
/// runs on its own task.
pub type CallbackFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// One positional argument of an outbound call: a serializable value or a
/// local callback the remote procedure may invoke.
pub enum Arg {
    Value(Value),
    Callback(CallbackFn),
}

impl Arg {
    /// Wrap an async closure as a callback argument.
    pub fn callback<F, Fut>(f: F) -> Arg
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Arg::Callback(Arc::new(move |args| -> BoxFuture<'static, ()> {
            Box::pin(f(args))
        }))
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Arg {
        Arg::Value(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Arg {
        Arg::Value(Value::from(v))
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Arg {
        Arg::Value(Value::from(v))
    }
}

impl From<i64> for Arg {
    fn from(v: i64) -> Arg {
        Arg::Value(Value::from(v))
    }
}

impl From<i32> for Arg {
    fn from(v: i32) -> Arg {
        Arg::Value(Value::from(v))
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Arg {
        Arg::Value(Value::from(v))
    }
}

impl From<bool> for Arg {
    fn from(v: bool) -> Arg {
        Arg::Value(Value::from(v))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(v: Vec<u8>) -> Arg {
        Arg::Value(Value::from(v))
    }
}

enum Pending {
    /// A call awaiting its RETURN or ERROR.
    Waiter(oneshot::Sender<Result<Value, RpcError>>),
    /// A callback handle; persists until the owning call settles.
    Slot(CallbackFn),
}

struct Shared {
    pending: Mutex<HashMap<u32, Pending>>,
    ids: MessageId,
    outbound: mpsc::Sender<Message>,
    shutdown: watch::Sender<bool>,
    log: Logger,
}

/// Handle to one pipeline's client engine.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub(crate) fn attach(
        outbound: mpsc::Sender<Message>,
        log: Logger,
    ) -> (Client, watch::Receiver<bool>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let client = Client {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                ids: MessageId::new(),
                outbound,
                shutdown,
                log,
            }),
        };
        (client, shutdown_rx)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u32, Pending>> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invoke the named remote procedure and await its single result.
    ///
    /// Callback arguments may be invoked by the remote procedure any
    /// number of times before it returns; their registrations are removed
    /// when this call settles, however it settles.
    pub async fn invoke(&self, name: &str, args: Vec<Arg>) -> Result<Value, RpcError> {
        let started = Instant::now();
        let call_id = self.shared.ids.next_id();
        let (tx, rx) = oneshot::channel();
        let mut wire_args = Vec::with_capacity(args.len());
        let mut callback_ids = Vec::new();
        {
            let mut pending = self.pending();
            pending.insert(call_id, Pending::Waiter(tx));
            for arg in args {
                match arg {
                    Arg::Value(v) => wire_args.push(CallArg::Value(v)),
                    Arg::Callback(f) => {
                        let handle = self.shared.ids.next_id();
                        pending.insert(handle, Pending::Slot(f));
                        callback_ids.push(handle);
                        wire_args.push(CallArg::Callback(handle));
                    }
                }
            }
        }

        let call = Message::call(call_id, name, wire_args);
        if self.shared.outbound.send(call).await.is_err() {
            self.unregister(call_id, &callback_ids);
            return Err(RpcError::ChannelClosed);
        }

        let result = match rx.await {
            Ok(settled) => settled,
            Err(_) => Err(RpcError::ConnectionClosed),
        };
        self.unregister(call_id, &callback_ids);

        debug!(self.shared.log, "call settled";
            "method" => name,
            "ok" => result.is_ok(),
            "elapsed_ms" => started.elapsed().as_millis() as u64);
        result
    }

    /// The number of entries in the pending-call table: in-flight calls
    /// plus live callback registrations.
    pub fn outstanding(&self) -> usize {
        self.pending().len()
    }

    /// Tear down the pipeline. Every pending call fails with
    /// `ConnectionClosed`; later invocations fail as the writer is gone.
    pub fn close(&self) {
        self.shared.shutdown.send_replace(true);
        self.fail(RpcError::ConnectionClosed);
    }

    fn unregister(&self, call_id: u32, callback_ids: &[u32]) {
        let mut pending = self.pending();
        pending.remove(&call_id);
        for handle in callback_ids {
            pending.remove(handle);
        }
    }

    /// Route one inbound message. Unknown ids and unexpected types are
    /// dropped; shape errors cannot occur past the message codec.
    pub(crate) fn handle_message(&self, msg: Message) {
        match (msg.msg_type, msg.data) {
            (MessageType::Return, MessageData::Value(v)) => self.settle(msg.id, Ok(v)),
            (MessageType::Error, MessageData::Error(e)) => self.settle(
                msg.id,
                Err(RpcError::Remote {
                    message: e.message,
                    stack: e.stack,
                }),
            ),
            (MessageType::Callback, MessageData::Args(args)) => {
                self.run_callback(msg.id, args)
            }
            (msg_type, _) => {
                debug!(self.shared.log, "dropping unexpected message";
                    "msg_type" => ?msg_type, "id" => msg.id);
            }
        }
    }

    fn settle(&self, id: u32, result: Result<Value, RpcError>) {
        let waiter = {
            let mut pending = self.pending();
            match pending.remove(&id) {
                Some(Pending::Waiter(tx)) => Some(tx),
                Some(slot @ Pending::Slot(_)) => {
                    // A response id that names a callback slot is a peer
                    // bug; leave the slot alone.
                    pending.insert(id, slot);
                    None
                }
                None => None,
            }
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(self.shared.log, "dropping response for unknown call"; "id" => id),
        }
    }

    fn run_callback(&self, id: u32, args: Vec<CallArg>) {
        let slot = {
            let pending = self.pending();
            match pending.get(&id) {
                Some(Pending::Slot(f)) => Some(f.clone()),
                _ => None,
            }
        };
        let f = match slot {
            Some(f) => f,
            None => {
                debug!(self.shared.log, "dropping callback for unknown handle"; "id" => id);
                return;
            }
        };
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                CallArg::Value(v) => values.push(v),
                CallArg::Callback(_) => {
                    debug!(self.shared.log, "dropping callback with function-tagged argument";
                        "id" => id);
                    return;
                }
            }
        }
        // The closure itself runs here, so invocations of one slot follow
        // wire order; only the future it returns leaves this task.
        tokio::spawn(f(values));
    }

    /// Fail every pending entry with `error` and clear the table. Each
    /// waiter is completed exactly once.
    pub(crate) fn fail(&self, error: RpcError) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            if let Pending::Waiter(tx) = entry {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}
