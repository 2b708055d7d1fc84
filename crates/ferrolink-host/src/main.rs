//! Ferrolink host daemon.
//!
//! # Usage
//!
//! ```bash
//! # Talk to an MCU on the default port with an authenticated link
//! ferrolink-hostd --device /dev/ttyATH0 --secret-file /etc/ferrolink/secret
//!
//! # Unauthenticated bench setup with custom timing
//! ferrolink-hostd --device /dev/ttyUSB0 --baud 57600 --ack-timeout-ms 250
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use clap::Parser;
use ferrolink_core::{HandlerReply, LinkConfig, Role};
use ferrolink_crypto::SharedSecret;
use ferrolink_host::HostDriver;
use ferrolink_proto::{CommandId, wire::ByteReader};
use tokio_serial::SerialPortBuilderExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Ferrolink host daemon
#[derive(Parser, Debug)]
#[command(name = "ferrolink-hostd")]
#[command(about = "Host end of the Ferrolink MCU RPC link")]
#[command(version)]
struct Args {
    /// Serial device connected to the MCU
    #[arg(short, long, default_value = "/dev/ttyATH0")]
    device: String,

    /// UART line rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// File holding the shared handshake secret
    #[arg(short, long)]
    secret_file: Option<String>,

    /// Derive the MAC key with HKDF instead of keying with the raw
    /// secret
    #[arg(long)]
    hardened: bool,

    /// Per-frame ACK deadline in milliseconds
    #[arg(long)]
    ack_timeout_ms: Option<u16>,

    /// Retransmit attempts before a timeout surfaces
    #[arg(long)]
    retry_limit: Option<u8>,

    /// Write-all and handshake-response deadline in milliseconds
    #[arg(long)]
    response_timeout_ms: Option<u32>,

    /// Advertise the RLE payload helper
    #[arg(long)]
    enable_rle: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(device = %args.device, baud = args.baud, "ferrolink host starting");

    let mut config = LinkConfig::new(Role::Host);
    config.baudrate = args.baud;
    config.hardened = args.hardened;
    config.enable_rle = args.enable_rle;
    if let Some(ms) = args.ack_timeout_ms {
        config.timing.ack_timeout_ms = ms;
    }
    if let Some(limit) = args.retry_limit {
        config.timing.retry_limit = limit;
    }
    if let Some(ms) = args.response_timeout_ms {
        config.timing.response_timeout_ms = ms;
    }

    match &args.secret_file {
        Some(path) => {
            let raw = tokio::fs::read(path).await?;
            // Trailing newline from `echo` style provisioning is not
            // part of the secret.
            let trimmed = raw.strip_suffix(b"\n").unwrap_or(&raw).to_vec();
            config.shared_secret = Some(SharedSecret::new(trimmed)?);
        },
        None => {
            tracing::warn!("no shared secret configured; the link is unauthenticated");
        },
    }

    let port = tokio_serial::new(&args.device, args.baud).open_native_async()?;
    let (reader, writer) = tokio::io::split(port);

    let (mut driver, handle) = HostDriver::new(reader, writer, config)?;
    install_default_handlers(&mut driver);

    let link = tokio::spawn(driver.run());

    handle.handshake().await?;
    tracing::info!("handshake initiated");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    link.await??;

    Ok(())
}

/// Console sink and an in-memory datastore; the service layer replaces
/// these with its real backends.
fn install_default_handlers<R, W>(driver: &mut HostDriver<R, W>)
where
    R: tokio::io::AsyncRead + Unpin + Send,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    driver.register_handler(CommandId::ConsoleWrite, |frame, _| {
        tracing::info!(target: "ferrolink::console", "{}", String::from_utf8_lossy(&frame.payload));
        Ok(HandlerReply::None)
    });

    let store: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));

    let put_store = Arc::clone(&store);
    driver.register_handler(CommandId::DatastorePut, move |frame, _| {
        let mut reader = ByteReader::new(&frame.payload);
        let key_len = reader.read_u8().unwrap_or_default() as usize;
        let key = reader.take(key_len).unwrap_or_default().to_vec();
        let value_len = reader.read_u8().unwrap_or_default() as usize;
        let value = reader.take(value_len).unwrap_or_default().to_vec();
        if let Ok(mut map) = put_store.lock() {
            map.insert(key, value);
        }
        Ok(HandlerReply::None)
    });

    let get_store = Arc::clone(&store);
    driver.register_handler(CommandId::DatastoreGet, move |frame, _| {
        let mut reader = ByteReader::new(&frame.payload);
        let key_len = reader.read_u8().unwrap_or_default() as usize;
        let key = reader.take(key_len).unwrap_or_default();
        let value = get_store
            .lock()
            .ok()
            .and_then(|map| map.get(key).cloned())
            .unwrap_or_default();
        let mut payload = Vec::with_capacity(1 + value.len());
        payload.push(value.len().min(255) as u8);
        payload.extend_from_slice(&value[..value.len().min(255)]);
        Ok(HandlerReply::Response(payload))
    });
}
