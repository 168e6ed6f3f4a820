// Copyright 2020 Joyent, Inc.

//! This module provides the scoped per-call storage extension procedures
//! use to discover their carrier context (for example the request that
//! opened the connection) without an explicit parameter. The value set
//! around a dispatched procedure remains visible throughout that
//! procedure's asynchronous descendants and is invisible to every other
//! concurrent call.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: Option<CallContext>;
}

/// A cheaply cloneable, type-erased per-call context value.
#[derive(Clone)]
pub struct CallContext(Arc<dyn Any + Send + Sync>);

impl CallContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> CallContext {
        CallContext(Arc::new(value))
    }

    /// Borrow the context as its concrete type, if it is one.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallContext")
    }
}

/// The context of the call currently being dispatched, if any. Returns
/// `None` outside a dispatch or when the carrier supplied no context.
pub fn current() -> Option<CallContext> {
    CURRENT.try_with(|ctx| ctx.clone()).unwrap_or(None)
}

/// Run one dispatched procedure with its carrier context in scope.
pub(crate) async fn scope<F>(ctx: Option<CallContext>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}
