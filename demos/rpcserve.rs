// Copyright 2020 Joyent, Inc.

use std::env;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use slog::{error, info, o, Drain, Logger};
use tokio::net::TcpListener;

use duplex_rpc::pipeline::{self, ServerConfig};
use duplex_rpc::server::{Extension, Fault, ProcArg};
use duplex_rpc::value::Value;

fn int_arg(arg: Option<ProcArg>) -> Result<i64, Fault> {
    arg.ok_or_else(|| Fault::new("missing argument"))?
        .into_value()?
        .as_i64()
        .ok_or_else(|| Fault::new("expected an integer argument"))
}

fn demo_extension() -> Arc<Extension> {
    let mut ext = Extension::new("demo");
    ext.register("hello", |args| async move {
        let name = match args.into_iter().next() {
            Some(arg) => match arg.into_value()? {
                Value::String(s) => s,
                _ => return Err(Fault::new("expected a string argument")),
            },
            None => String::from("world"),
        };
        Ok(Value::from(format!("hello {}", name)))
    });
    ext.register("date", |_args| async move {
        Ok(Value::Date(SystemTime::now()))
    });
    ext.register("echo", |args| async move {
        let values = args
            .into_iter()
            .map(|arg| arg.into_value())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Array(values))
    });
    ext.register("yes", |args| async move {
        let mut args = args.into_iter();
        let value = args
            .next()
            .ok_or_else(|| Fault::new("missing value argument"))?
            .into_value()?;
        let count = int_arg(args.next())?;
        if !(1..=10_000).contains(&count) {
            return Err(Fault::new("count must be between 1 and 10000"));
        }
        match args.next() {
            // With a callback, stream the value instead of returning it.
            Some(arg) => {
                let emit = arg.into_callback()?;
                for _ in 0..count {
                    emit.call(vec![value.clone()]).await?;
                }
                Ok(Value::Undefined)
            }
            None => Ok(Value::Array(vec![value; count as usize])),
        }
    });
    Arc::new(ext)
}

#[tokio::main]
async fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let root_log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("127.0.0.1:2030"));
    let rpc_key = env::args().nth(2).unwrap_or_default();

    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(root_log, "listening for rpc requests"; "address" => addr.as_str());

    let extension = demo_extension();
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let config = ServerConfig {
                    rpc_key: rpc_key.clone(),
                    log: Some(root_log.clone()),
                    ..Default::default()
                };
                let extension = extension.clone();
                let conn_log = root_log.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline::serve(socket, extension, config).await {
                        error!(conn_log, "connection failed"; "peer" => %peer, "err" => %e);
                    }
                });
            }
            Err(e) => error!(root_log, "failed to accept socket"; "err" => %e),
        }
    }
}
