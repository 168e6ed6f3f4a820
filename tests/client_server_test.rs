// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

use num_bigint::BigInt;
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::io::duplex;

use duplex_rpc::client::{Arg, Client};
use duplex_rpc::context::{self, CallContext};
use duplex_rpc::errors::RpcError;
use duplex_rpc::pipeline::{self, ClientConfig, ServerConfig};
use duplex_rpc::server::{DispatchMode, Extension, Fault, ProcArg};
use duplex_rpc::value::Value;

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn string_arg(arg: Option<ProcArg>) -> Result<String, Fault> {
    match arg
        .ok_or_else(|| Fault::new("missing argument"))?
        .into_value()?
    {
        Value::String(s) => Ok(s),
        _ => Err(Fault::new("expected a string argument")),
    }
}

fn bytes_arg(arg: Option<ProcArg>) -> Result<Vec<u8>, Fault> {
    match arg
        .ok_or_else(|| Fault::new("missing argument"))?
        .into_value()?
    {
        Value::Bytes(b) => Ok(b),
        _ => Err(Fault::new("expected a byte argument")),
    }
}

fn test_extension() -> Arc<Extension> {
    let mut ext = Extension::new("test-suite");
    ext.register("hello", |args| async move {
        let name = string_arg(args.into_iter().next())?;
        Ok(Value::from(format!("hello {}", name)))
    });
    ext.register("callback", |args| async move {
        let mut args = args.into_iter();
        let text = string_arg(args.next())?;
        let progress = args
            .next()
            .ok_or_else(|| Fault::new("missing callback"))?
            .into_callback()?;
        for i in 0..3 {
            progress
                .call(vec![Value::from(format!("progress {}", i))])
                .await?;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Ok(Value::from(format!("hello callback {}", text)))
    });
    ext.register("buffer", |args| async move {
        let bytes = bytes_arg(args.into_iter().next())?;
        if bytes.len() < 8 {
            return Err(Fault::new("buffer argument too short"));
        }
        Ok(Value::Bytes(bytes[3..8].to_vec()))
    });
    ext.register("array", |args| async move {
        let mut args = args.into_iter();
        let text = string_arg(args.next())?;
        let bytes = bytes_arg(args.next())?;
        if bytes.len() < 8 {
            return Err(Fault::new("buffer argument too short"));
        }
        Ok(Value::Array(vec![
            Value::Int(123),
            Value::from("abc"),
            Value::from(format!("hi {}", text)),
            Value::Bytes(bytes[3..8].to_vec()),
        ]))
    });
    ext.register("void", |_args| async move { Ok(Value::Undefined) });
    ext.register("echo", |args| async move {
        args.into_iter()
            .next()
            .ok_or_else(|| Fault::new("missing argument"))?
            .into_value()
    });
    ext.register("fail", |_args| async move {
        Err(Fault::new("deliberate failure"))
    });
    ext.register("sleep", |args| async move {
        let ms = args
            .into_iter()
            .next()
            .ok_or_else(|| Fault::new("missing argument"))?
            .into_value()?
            .as_i64()
            .ok_or_else(|| Fault::new("expected an integer"))?;
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        Ok(Value::from("slept"))
    });
    ext.register("whoami", |_args| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        match context::current().and_then(|c| c.get::<String>().cloned()) {
            Some(who) => Ok(Value::String(who)),
            None => Ok(Value::Undefined),
        }
    });
    Arc::new(ext)
}

fn start_pair(mode: DispatchMode, key: &str, context: Option<CallContext>) -> Client {
    let (client_io, server_io) = duplex(8 * 1024);
    let server_config = ServerConfig {
        rpc_key: String::from(key),
        mode,
        log: Some(test_logger()),
        context,
        ..Default::default()
    };
    tokio::spawn(pipeline::serve(server_io, test_extension(), server_config));
    pipeline::connect(
        client_io,
        ClientConfig {
            rpc_key: String::from(key),
            log: Some(test_logger()),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn hello_round_trip() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let result = client
        .invoke("hello", vec![Arg::from("asdfghjkl")])
        .await
        .expect("result");
    assert_eq!(result, Value::from("hello asdfghjkl"));
}

#[tokio::test]
async fn callbacks_arrive_in_order_before_the_return() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let progress = Arg::callback(move |args| {
        let text = match args.into_iter().next() {
            Some(Value::String(s)) => s,
            other => panic!("unexpected callback argument: {:?}", other),
        };
        sink.lock().unwrap().push(text);
        async {}
    });

    let result = client
        .invoke("callback", vec![Arg::from("asdfghjkl"), progress])
        .await
        .expect("result");

    assert_eq!(result, Value::from("hello callback asdfghjkl"));
    let seen = observed.lock().unwrap().clone();
    assert_eq!(seen, vec!["progress 0", "progress 1", "progress 2"]);
}

#[tokio::test]
async fn buffer_slices_round_trip() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let result = client
        .invoke("buffer", vec![Arg::from(b"qwertyuiop".to_vec())])
        .await
        .expect("result");
    assert_eq!(result, Value::Bytes(b"rtyui".to_vec()));
}

#[tokio::test]
async fn large_buffers_round_trip() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let result = client
        .invoke("buffer", vec![Arg::from(vec![0u8; 300_000])])
        .await
        .expect("result");
    assert_eq!(result, Value::Bytes(vec![0u8; 5]));
}

#[tokio::test]
async fn mixed_arrays_round_trip() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let result = client
        .invoke(
            "array",
            vec![Arg::from("asdfghjkl"), Arg::from(b"qwertyuiop".to_vec())],
        )
        .await
        .expect("result");
    assert_eq!(
        result,
        Value::Array(vec![
            Value::Int(123),
            Value::from("abc"),
            Value::from("hi asdfghjkl"),
            Value::Bytes(b"rtyui".to_vec()),
        ])
    );
}

#[tokio::test]
async fn void_returns_undefined() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let result = client
        .invoke(
            "void",
            vec![Arg::from("asdfghjkl"), Arg::from(b"qwertyuiop".to_vec())],
        )
        .await
        .expect("result");
    assert!(result.is_undefined());
}

#[tokio::test]
async fn remote_failures_carry_the_remote_stack() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    match client.invoke("fail", vec![]).await {
        Err(RpcError::Remote { message, stack }) => {
            assert_eq!(message, "deliberate failure");
            assert!(stack.contains("fail"), "stack was {:?}", stack);
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_procedures_fail_only_their_call() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    match client.invoke("nonesuch", vec![]).await {
        Err(RpcError::Remote { message, .. }) => {
            assert!(message.contains("nonesuch"));
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
    // The pipeline is still healthy.
    let result = client
        .invoke("hello", vec![Arg::from("again")])
        .await
        .expect("result");
    assert_eq!(result, Value::from("hello again"));
}

#[tokio::test]
async fn a_slow_call_does_not_block_a_fast_one() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let slow_client = client.clone();
    let slow_started = Instant::now();
    let slow = tokio::spawn(async move {
        slow_client.invoke("sleep", vec![Arg::from(1000i64)]).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast_started = Instant::now();
    let fast = client
        .invoke("hello", vec![Arg::from("quick")])
        .await
        .expect("fast result");
    let fast_elapsed = fast_started.elapsed();

    assert_eq!(fast, Value::from("hello quick"));
    assert!(
        fast_elapsed < Duration::from_millis(500),
        "fast call took {:?}",
        fast_elapsed
    );

    let slow_result = slow.await.expect("join").expect("slow result");
    assert_eq!(slow_result, Value::from("slept"));
    assert!(slow_started.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test]
async fn sequential_mode_runs_one_call_at_a_time() {
    let client = start_pair(DispatchMode::Sequential, "", None);
    let slow_client = client.clone();
    let slow = tokio::spawn(async move {
        slow_client.invoke("sleep", vec![Arg::from(300i64)]).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast_started = Instant::now();
    let fast = client
        .invoke("hello", vec![Arg::from("quick")])
        .await
        .expect("fast result");
    assert_eq!(fast, Value::from("hello quick"));
    assert!(
        fast_started.elapsed() >= Duration::from_millis(200),
        "sequential dispatch should have delayed the second call"
    );
    slow.await.expect("join").expect("slow result");
}

#[tokio::test]
async fn carrier_context_is_isolated_per_pipeline() {
    let a = start_pair(
        DispatchMode::Concurrent,
        "",
        Some(CallContext::new(String::from("carrier-a"))),
    );
    let b = start_pair(
        DispatchMode::Concurrent,
        "",
        Some(CallContext::new(String::from("carrier-b"))),
    );

    let (ra, rb) = tokio::join!(a.invoke("whoami", vec![]), b.invoke("whoami", vec![]));
    assert_eq!(ra.expect("a"), Value::from("carrier-a"));
    assert_eq!(rb.expect("b"), Value::from("carrier-b"));
}

#[tokio::test]
async fn settled_calls_leave_no_registrations_behind() {
    let client = start_pair(DispatchMode::Concurrent, "", None);

    client
        .invoke(
            "callback",
            vec![Arg::from("x"), Arg::callback(|_args| async {})],
        )
        .await
        .expect("result");
    assert_eq!(client.outstanding(), 0);

    let failed = client
        .invoke(
            "fail",
            vec![Arg::from("y"), Arg::callback(|_args| async {})],
        )
        .await;
    assert!(failed.is_err());
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn encrypted_pipelines_round_trip() {
    let client = start_pair(DispatchMode::Concurrent, "sup3r-s3cret", None);
    let result = client
        .invoke("hello", vec![Arg::from("over aes")])
        .await
        .expect("result");
    assert_eq!(result, Value::from("hello over aes"));

    let echoed = client
        .invoke(
            "echo",
            vec![Arg::Value(Value::Bytes(vec![0xAB; 100_000]))],
        )
        .await
        .expect("echo");
    assert_eq!(echoed, Value::Bytes(vec![0xAB; 100_000]));
}

#[tokio::test]
async fn mismatched_keys_fail_the_pipeline() {
    let (client_io, server_io) = duplex(8 * 1024);
    tokio::spawn(pipeline::serve(
        server_io,
        test_extension(),
        ServerConfig {
            rpc_key: String::from("one key"),
            log: Some(test_logger()),
            ..Default::default()
        },
    ));
    let client = pipeline::connect(
        client_io,
        ClientConfig {
            rpc_key: String::from("another key"),
            log: Some(test_logger()),
            ..Default::default()
        },
    );

    assert!(client.invoke("hello", vec![Arg::from("x")]).await.is_err());
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn closing_the_client_fails_outstanding_calls() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let invoker = client.clone();
    let pending = tokio::spawn(async move {
        invoker.invoke("sleep", vec![Arg::from(5000i64)]).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closed_at = Instant::now();
    client.close();
    let result = pending.await.expect("join");
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    assert!(closed_at.elapsed() < Duration::from_millis(500));
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn echo_preserves_every_admissible_value() {
    let client = start_pair(DispatchMode::Concurrent, "", None);
    let values = vec![
        Value::Null,
        Value::Undefined,
        Value::Bool(true),
        Value::Int(-7),
        Value::Int(i64::MAX),
        Value::BigInt(BigInt::from(u64::MAX) * BigInt::from(3)),
        Value::Float(3.25),
        Value::Float(f64::INFINITY),
        Value::Float(f64::NEG_INFINITY),
        Value::from("héllo wörld ✓"),
        Value::Bytes(vec![7u8; 300_000]),
        Value::Date(UNIX_EPOCH + Duration::from_millis(1_600_000_000_123)),
        Value::Array(vec![Value::Int(1), Value::from("two"), Value::Null]),
        Value::Map(vec![
            (Value::from("name"), Value::from("one")),
            (Value::Int(2), Value::Bool(true)),
        ]),
        Value::Set(vec![Value::Int(1), Value::Int(2)]),
        Value::Error {
            message: String::from("carried"),
            stack: String::from("carried\n    at someplace"),
        },
    ];
    for value in values {
        let echoed = client
            .invoke("echo", vec![Arg::Value(value.clone())])
            .await
            .expect("echo");
        assert_eq!(echoed, value);
    }

    let nan = client
        .invoke("echo", vec![Arg::Value(Value::Float(f64::NAN))])
        .await
        .expect("echo");
    assert_eq!(nan, Value::Float(f64::NAN));
}
