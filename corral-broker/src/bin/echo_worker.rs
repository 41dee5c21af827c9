//! corral echo worker
//!
//! Minimal plugin speaking the corral protocol over stdio: length-prefixed
//! JSON envelopes on stdin/stdout, logs on stderr.
//!
//! Methods:
//!   ping          -> "pong"
//!   echo          -> the params, unchanged
//!   sleep {ms}    -> "slept" after `ms` milliseconds
//!   crash         -> reports an unhandled error to the host
//!   exit          -> exits without answering
//!
//! Usage:
//!   corral-echo-worker [--delay-ms 50] [--no-handshake] [--verbose]

use anyhow::{Context, Result};
use clap::Parser;
use corral_broker::{ChannelTransport, HandshakeStream, TransportKind};
use corral_proto::{
    HOST_STREAM, PLUGIN_STREAM, RpcError, RpcKind, RpcMessage, UNHANDLED_ERROR_METHOD,
    read_message, write_message,
};
use serde_json::{Value, json};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug, Clone)]
#[command(name = "corral-echo-worker")]
#[command(about = "Reference corral plugin answering ping/echo over stdio")]
struct Args {
    /// Delay before answering every request
    #[arg(long, default_value = "0")]
    delay_ms: u64,

    /// Never start the handshake
    #[arg(long)]
    no_handshake: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();

    let (transport, mut outbound) = ChannelTransport::pair(TransportKind::Process);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbound.recv().await {
            write_message(&mut stdout, &message).await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut stdin = tokio::io::stdin();
    if args.no_handshake {
        info!("handshake disabled, draining stdin");
        while read_message(&mut stdin).await.is_ok() {}
        return Ok(());
    }

    let transport = Arc::new(transport);
    let stream = Arc::new(
        HandshakeStream::new(PLUGIN_STREAM, HOST_STREAM, transport.clone())
            .context("failed to open stream")?,
    );
    info!("worker started");

    loop {
        let raw = match read_message(&mut stdin).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("skipping bad frame: {}", e);
                continue;
            }
            Err(e) => return Err(e).context("failed to read from stdin"),
        };
        let Some(payload) = stream.receive(raw) else {
            continue;
        };
        let Ok(request) = RpcMessage::from_value(payload) else {
            continue;
        };
        if request.kind() != RpcKind::Request {
            continue;
        }
        if request.method.as_deref() == Some("exit") {
            info!("exit requested");
            std::process::exit(0);
        }

        let stream = stream.clone();
        let args = args.clone();
        tokio::spawn(async move {
            if let Err(e) = answer(&stream, &args, request).await {
                warn!("failed to answer: {:#}", e);
            }
        });
    }

    info!("stdin closed, shutting down");
    drop(stream);
    transport.shutdown();
    writer.await??;
    Ok(())
}

async fn answer(stream: &HandshakeStream, args: &Args, request: RpcMessage) -> Result<()> {
    let (Some(id), Some(method)) = (request.id, request.method) else {
        return Ok(());
    };
    let params = request.params.unwrap_or(Value::Null);
    debug!("request {} {}", id, method);

    if args.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
    }

    let outcome = match method.as_str() {
        "ping" => Ok(json!("pong")),
        "echo" => Ok(params),
        "sleep" => match params.get("ms").and_then(Value::as_u64) {
            Some(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!("slept"))
            }
            None => Err(RpcError::invalid_params("sleep expects {\"ms\": <u64>}")),
        },
        "crash" => {
            let report = RpcMessage::notification(
                UNHANDLED_ERROR_METHOD,
                json!({ "message": "crash requested" }),
            );
            stream.write(serde_json::to_value(&report)?)?;
            return Ok(());
        }
        other => Err(RpcError::method_not_found(other)),
    };

    let response = match outcome {
        Ok(result) => RpcMessage::success(id, result),
        Err(error) => RpcMessage::failure(id, error),
    };
    stream.write(serde_json::to_value(&response)?)?;
    Ok(())
}
