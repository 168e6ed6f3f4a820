// Copyright 2020 Joyent, Inc.

use std::process;

use clap::{Arg as CliArg, ArgAction, Command};
use tokio::net::TcpStream;

use duplex_rpc::client::Arg;
use duplex_rpc::pipeline::{self, ClientConfig};
use duplex_rpc::value::Value;

fn parse_opts() -> clap::ArgMatches {
    Command::new("rpccall")
        .about("Command-line tool for making a duplex RPC method call")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            CliArg::new("host")
                .help("DNS name or IP address for remote server")
                .long("host")
                .default_value("127.0.0.1"),
        )
        .arg(
            CliArg::new("port")
                .help("TCP port for remote server (Default: 2030)")
                .long("port")
                .default_value("2030"),
        )
        .arg(
            CliArg::new("key")
                .help("Pre-shared cipher key (empty: no encryption)")
                .long("key")
                .default_value(""),
        )
        .arg(
            CliArg::new("progress")
                .help("Attach a printing callback as the final argument")
                .long("progress")
                .action(ArgAction::SetTrue),
        )
        .arg(
            CliArg::new("method")
                .help("Name of remote RPC method call")
                .required(true),
        )
        .arg(
            CliArg::new("args")
                .help("String arguments for the RPC method call")
                .num_args(0..),
        )
        .get_matches()
}

#[tokio::main]
async fn main() {
    let matches = parse_opts();
    let host = matches.get_one::<String>("host").expect("host");
    let port = matches.get_one::<String>("port").expect("port");
    let rpc_key = matches.get_one::<String>("key").expect("key").clone();
    let method = matches.get_one::<String>("method").expect("method");
    let mut args: Vec<Arg> = matches
        .get_many::<String>("args")
        .map(|values| values.map(|s| Arg::from(s.as_str())).collect())
        .unwrap_or_default();
    if matches.get_flag("progress") {
        args.push(Arg::callback(|values: Vec<Value>| {
            for value in values {
                println!("callback: {:?}", value);
            }
            async {}
        }));
    }

    let addr = format!("{}:{}", host, port);
    let stream = TcpStream::connect(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to connect to server: {}", e);
        process::exit(1)
    });

    let client = pipeline::connect(stream, ClientConfig { rpc_key, ..Default::default() });
    match client.invoke(method, args).await {
        Ok(result) => println!("{:?}", result),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
    client.close();
}
