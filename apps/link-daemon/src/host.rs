//! Host-side byte streams for the link: a TCP listener or a serial port.

use crate::config::{HostTransport, LinkConfig};
use anyhow::{Context, Result};
use frame_protocol::Link;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Run the link over the configured host transport until it fails.
pub async fn serve(link: Link, cfg: &LinkConfig) -> Result<()> {
    match cfg.transport {
        HostTransport::Tcp => serve_tcp(link, &cfg.tcp_listen).await,
        HostTransport::Serial => {
            let path = cfg
                .serial_path
                .as_deref()
                .context("link.serial_path is not set")?;
            serve_serial(link, path, cfg.baud).await
        }
    }
}

/// Accept one host at a time; the router persists across connections, per-peer state does not.
pub async fn serve_tcp(mut link: Link, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr, "waiting for host connections");
    loop {
        let (stream, peer) = listener.accept().await.context("accepting host connection")?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not disable nagle");
        }
        info!(%peer, "host connected");
        let (r, w) = stream.into_split();
        match link.serve(r, w).await {
            Ok(stats) => info!(%peer, ?stats, "host disconnected"),
            Err(e) => warn!(%peer, error = %e, "host link failed"),
        }
        link.reset();
    }
}

/// Serve the link over a serial port, bridged into an in-memory duplex stream.
pub async fn serve_serial(mut link: Link, path: &str, baud: u32) -> Result<()> {
    let port = serialport::new(path, baud)
        .timeout(Duration::from_millis(20))
        .open()
        .with_context(|| format!("opening serial port {path}"))?;
    info!(path, baud, "serial host link open");
    let near = bridge(port).context("starting serial bridge threads")?;
    let (r, w) = tokio::io::split(near);
    let stats = link.serve(r, w).await?;
    info!(?stats, "serial link closed");
    Ok(())
}

/// Pump bytes between a blocking serial port and the far end of a duplex pipe.
fn bridge(port: Box<dyn serialport::SerialPort>) -> Result<DuplexStream> {
    let (near, far) = tokio::io::duplex(4096);
    let (mut far_rx, mut far_tx) = tokio::io::split(far);
    let runtime = Handle::current();

    let mut rx_port = port.try_clone().context("cloning serial handle")?;
    let rt = runtime.clone();
    std::thread::Builder::new()
        .name("serial-rx".into())
        .spawn(move || {
            let mut buf = [0u8; 512];
            loop {
                match rx_port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        if rt.block_on(far_tx.write_all(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) => {
                        warn!(error = %e, "serial read failed");
                        break;
                    }
                }
            }
            let _ = rt.block_on(far_tx.shutdown());
        })?;

    let mut tx_port = port;
    std::thread::Builder::new()
        .name("serial-tx".into())
        .spawn(move || {
            let mut buf = [0u8; 512];
            loop {
                match runtime.block_on(far_rx.read(&mut buf)) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Err(e) = tx_port.write_all(&buf[..n]).and_then(|()| tx_port.flush()) {
                            warn!(error = %e, "serial write failed");
                            break;
                        }
                    }
                }
            }
        })?;
    Ok(near)
}
