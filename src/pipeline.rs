// Copyright 2020 Joyent, Inc.

//! This module couples a byte carrier to an engine: the duplex pipeline.
//! Inbound bytes flow through the frame and message codecs into the
//! engine; outbound messages flow through a bounded channel, the codecs,
//! and the carrier's write half. One pipeline owns one carrier connection;
//! its cipher, pending-call table, and framing carry die with it.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use slog::{debug, error, o, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::cipher::Cipher;
use crate::client::Client;
use crate::context::CallContext;
use crate::errors::RpcError;
use crate::frame::RpcCodec;
use crate::server::{DispatchMode, Extension, ServerEngine};

/// Default bound of the outbound message channel; the high-water mark the
/// emit path blocks on.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 32;

/// Configuration of a client pipeline.
#[derive(Clone)]
pub struct ClientConfig {
    /// Pre-shared cipher key; empty means the pipeline runs in the clear.
    pub rpc_key: String,
    pub log: Option<Logger>,
    pub outbound_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            rpc_key: String::new(),
            log: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Configuration of a server pipeline.
#[derive(Clone)]
pub struct ServerConfig {
    /// Pre-shared cipher key; empty means the pipeline runs in the clear.
    pub rpc_key: String,
    pub mode: DispatchMode,
    pub log: Option<Logger>,
    /// Per-carrier context made visible to dispatched procedures through
    /// `context::current`.
    pub context: Option<CallContext>,
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            rpc_key: String::new(),
            mode: DispatchMode::Concurrent,
            log: None,
            context: None,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

fn fallback_logger() -> Logger {
    Logger::root(slog_stdlog::StdLog.fuse(), o!())
}

/// Attach a client engine to a carrier. Returns immediately; the reader
/// and writer tasks run until the carrier closes, a framing error poisons
/// the pipeline, or the client is closed. Any of those fails every pending
/// call exactly once.
pub fn connect<S>(io: S, config: ClientConfig) -> Client
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let log = config.log.unwrap_or_else(fallback_logger);
    let cipher = Cipher::derive(&config.rpc_key);
    let framed = Framed::new(io, RpcCodec::new(cipher));
    let (mut sink, mut stream) = framed.split();
    let (outbound, mut outbound_rx) =
        mpsc::channel(config.outbound_capacity.max(1));
    let (client, shutdown_rx) = Client::attach(outbound, log.clone());

    let writer_log = log.clone();
    let mut writer_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = outbound_rx.recv() => match maybe {
                    Some(msg) => {
                        if let Err(e) = sink.send(msg).await {
                            debug!(writer_log, "outbound write failed"; "err" => %e);
                            break;
                        }
                    }
                    None => break,
                },
                changed = writer_shutdown.changed() => {
                    if changed.is_err() || *writer_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let reader = client.clone();
    let reader_log = log;
    let mut reader_shutdown = shutdown_rx;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(msg)) => reader.handle_message(msg),
                    Some(Err(e)) => {
                        error!(reader_log, "inbound decode failed; closing pipeline"; "err" => %e);
                        reader.fail(e);
                        reader.close();
                        break;
                    }
                    None => {
                        reader.fail(RpcError::ConnectionClosed);
                        reader.close();
                        break;
                    }
                },
                changed = reader_shutdown.changed() => {
                    if changed.is_err() || *reader_shutdown.borrow() {
                        reader.fail(RpcError::ConnectionClosed);
                        break;
                    }
                }
            }
        }
    });

    client
}

/// Run a server pipeline over one carrier connection to completion.
///
/// Inbound calls dispatch into `extension` per the configured mode. The
/// function returns when the carrier closes or a framing error poisons the
/// pipeline; queued outbound messages are drained best-effort first. In
/// concurrent mode, calls still running when the carrier dies have their
/// output silently dropped.
pub async fn serve<S>(
    io: S,
    extension: Arc<Extension>,
    config: ServerConfig,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let log = config
        .log
        .unwrap_or_else(fallback_logger)
        .new(o!("extension" => String::from(extension.name())));
    let cipher = Cipher::derive(&config.rpc_key);
    let framed = Framed::new(io, RpcCodec::new(cipher));
    let (mut sink, mut stream) = framed.split();
    let (outbound, mut outbound_rx) =
        mpsc::channel(config.outbound_capacity.max(1));
    let engine = ServerEngine::new(extension, outbound, config.context, log.clone());

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            sink.send(msg).await?;
        }
        let _ = sink.close().await;
        Ok::<(), RpcError>(())
    });

    let mut result = Ok(());
    while let Some(item) = stream.next().await {
        match item {
            Ok(msg) => match config.mode {
                DispatchMode::Sequential => engine.handle_message(msg).await,
                DispatchMode::Concurrent => {
                    let call_engine = engine.clone();
                    tokio::spawn(async move { call_engine.handle_message(msg).await });
                }
            },
            Err(e) => {
                error!(log, "inbound decode failed; closing pipeline"; "err" => %e);
                result = Err(e);
                break;
            }
        }
    }

    // Dropping our engine releases the outbound sender; the writer drains
    // whatever in-flight dispatches still emit, then finishes.
    drop(engine);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if result.is_ok() {
                result = Err(e);
            }
        }
        Err(join_error) => {
            debug!(log, "writer task aborted"; "err" => %join_error);
        }
    }
    result
}
