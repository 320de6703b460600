//! Byte transport behind the link: a real UART or a TCP socket.
//!
//! The TCP form exists for development against `boardlink-simulator`; both
//! forms present the same async stream to the rest of the link layer.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// Anything the link layer can read and write bytes through.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// Open a transport from a spec string:
/// - `serial:/dev/serial0` — UART at the configured baud rate
/// - `tcp:127.0.0.1:3334` — simulator link
pub async fn open(spec: &str, baud: u32) -> Result<Box<dyn LinkStream>> {
    if let Some(path) = spec.strip_prefix("serial:") {
        let stream = tokio_serial::new(path, baud)
            .open_native_async()
            .with_context(|| format!("opening serial port {path}"))?;
        info!("Link: serial port {path} open at {baud} baud");
        return Ok(Box::new(stream));
    }
    if let Some(addr) = spec.strip_prefix("tcp:") {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting simulator link {addr}"))?;
        stream.set_nodelay(true).ok();
        info!("Link: connected to simulator at {addr}");
        return Ok(Box::new(stream));
    }
    bail!("unrecognized link spec '{spec}' (expected serial:<dev> or tcp:<addr>)");
}
