//! Room chat relay
//!
//! Usage:
//!   cargo run -- server                         # Run the relay on 127.0.0.1:12345
//!   cargo run -- server --port 5000             # Run on a specific port
//!   cargo run -- client --addr 127.0.0.1:5000   # Interactive client

use std::env;
use std::io::BufRead;
use std::net::SocketAddr;

use anyhow::Context;
use roomrelay::{ChatClient, ChatClientConfig, ChatConfig, ChatServer, ClientEvent};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => {
            let config = server_config(&args[2..])?;
            run_server(config).await?;
        }
        "client" => {
            let config = client_config(&args[2..])?;
            run_client(config).await?;
        }
        "help" | "--help" | "-h" => {
            print_usage();
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("roomrelay - line-oriented chat relay with named rooms");
    println!();
    println!("USAGE:");
    println!("    cargo run -- server [OPTIONS]");
    println!("    cargo run -- client [--addr HOST:PORT]");
    println!();
    println!("SERVER OPTIONS:");
    println!("    --config <FILE>          JSON config file (flags below override it)");
    println!("    --host <HOST>            Address to bind (default: 127.0.0.1)");
    println!("    --port <PORT>            Port to listen on (default: 12345)");
    println!("    --max-conn <NUM>         Maximum connections (default: 1000)");
    println!("    --max-line <BYTES>       Maximum line length (default: 4096)");
    println!("    --idle-timeout <SECS>    Close silent sessions after SECS");
    println!();
    println!("PROTOCOL:");
    println!("    Send your name, then a room name. Every further line goes to the");
    println!("    rest of the room. Send 'exit' to leave.");
    println!();
    println!("EXAMPLES:");
    println!("    cargo run -- server --port 5000");
    println!("    RUST_LOG=debug cargo run -- server");
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn parse_flag<T>(args: &[String], flag: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    flag_value(args, flag)
        .map(|v| v.parse::<T>().with_context(|| format!("Invalid value for {}: {}", flag, v)))
        .transpose()
}

fn server_config(args: &[String]) -> anyhow::Result<ChatConfig> {
    let mut config = match flag_value(args, "--config") {
        Some(path) => ChatConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => ChatConfig::default(),
    };

    if let Some(host) = parse_flag::<std::net::IpAddr>(args, "--host")? {
        config.bind_addr.set_ip(host);
    }
    if let Some(port) = parse_flag::<u16>(args, "--port")? {
        config.bind_addr.set_port(port);
    }
    if let Some(max) = parse_flag(args, "--max-conn")? {
        config.max_connections = max;
    }
    if let Some(max) = parse_flag(args, "--max-line")? {
        config.max_line_length = max;
    }
    if let Some(secs) = parse_flag(args, "--idle-timeout")? {
        config.idle_timeout_secs = Some(secs);
    }

    config.validate()?;
    Ok(config)
}

fn client_config(args: &[String]) -> anyhow::Result<ChatClientConfig> {
    let mut config = ChatClientConfig::default();
    if let Some(addr) = parse_flag::<SocketAddr>(args, "--addr")? {
        config.server_addr = addr;
    }
    Ok(config)
}

async fn run_server(config: ChatConfig) -> anyhow::Result<()> {
    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Max line length: {}", config.max_line_length);
    match config.idle_timeout_secs {
        Some(secs) => info!("  - Idle timeout: {}s", secs),
        None => info!("  - Idle timeout: disabled"),
    }

    let server = ChatServer::new(config);

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            let stats = signal_server.get_stats().await;
            match serde_json::to_string(&stats) {
                Ok(json) => info!("Final stats: {}", json),
                Err(e) => error!("Failed to serialize stats: {}", e),
            }
            signal_server.shutdown();
        }
    });

    if let Err(e) = server.start().await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

async fn run_client(config: ChatClientConfig) -> anyhow::Result<()> {
    let mut client = ChatClient::new(config);
    let events = client.connect().await?;
    drive_client(&mut client, events, spawn_stdin_reader()).await
}

/// Print server lines and forward input lines until either side ends
async fn drive_client(
    client: &mut ChatClient,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    mut input: mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Line(line)) => println!("{}", line),
                Some(ClientEvent::Disconnected(reason)) => {
                    println!("Disconnected: {}", reason);
                    break;
                }
                None => break,
            },
            line = input.recv() => {
                let Some(line) = line else { break };
                let line = line.trim_end();
                if line.eq_ignore_ascii_case("exit") {
                    client.exit().await?;
                    return Ok(());
                }
                client.send_line(line).await?;
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

/// Forward stdin lines from a dedicated thread so runtime shutdown never waits on a read
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
