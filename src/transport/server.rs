//! Bridge listener: accept loop and per-connection handler.
//!
//! The engine connects to the loopback bridge port, writes one
//! newline-terminated command and reads one line back (`ok` when the
//! command was handled, an empty line otherwise).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::gateway::{BridgeOutcome, TransportGateway};

/// Longest bridge command accepted, in bytes.
const MAX_COMMAND_BYTES: u64 = 64 * 1024;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bridge server wrapping the gateway.
#[derive(Debug)]
pub struct BridgeServer {
    gateway: TransportGateway,
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl BridgeServer {
    pub fn new(gateway: TransportGateway, addr: SocketAddr) -> Self {
        Self {
            gateway,
            addr,
            cancel: CancellationToken::new(),
        }
    }

    /// Run the server until cancelled or a fatal error occurs.
    pub async fn serve(&self) -> io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let max_connections = self.gateway.config().bridge_max_connections;
        let slots = Arc::new(Semaphore::new(max_connections));
        tracing::info!(addr = %self.addr, max_connections, "bridge listening");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("bridge listener stopped");
                    break;
                }
                accept = listener.accept() => self.admit(accept, &slots).await,
            }
        }
        Ok(())
    }

    /// Hand an accepted connection to its own task. Accept failures (fd
    /// exhaustion, aborted handshakes) are logged and the loop goes on.
    async fn admit(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        slots: &Arc<Semaphore>,
    ) {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "bridge accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                return;
            }
        };

        if !peer.ip().is_loopback() {
            tracing::warn!(%peer, "bridge connection from non-loopback peer refused");
            return;
        }
        let Ok(permit) = slots.clone().try_acquire_owned() else {
            tracing::warn!(
                %peer,
                max_connections = self.gateway.config().bridge_max_connections,
                "bridge connection rejected: too many open"
            );
            return;
        };

        let gateway = self.gateway.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, gateway, cancel, permit).await {
                tracing::debug!(%peer, error = %e, "bridge connection failed");
            }
        });
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Read one command line, hand it to the gateway and answer with one line.
async fn handle_connection(
    stream: TcpStream,
    gateway: TransportGateway,
    cancel: CancellationToken,
    _slot: OwnedSemaphorePermit,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader).take(MAX_COMMAND_BYTES);
    let read_timeout = gateway.config().bridge_read_timeout;
    let mut line = String::new();

    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        read = tokio::time::timeout(read_timeout, reader.read_line(&mut line)) => {
            match read {
                Err(_elapsed) => {
                    tracing::debug!(
                        timeout_ms = read_timeout.as_millis() as u64,
                        "bridge read timed out"
                    );
                    return Ok(());
                }
                Ok(result) => {
                    if result? == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    let reply: &[u8] = match gateway.handle_bridge(&line) {
        BridgeOutcome::Handled => b"ok\n",
        BridgeOutcome::Ignored | BridgeOutcome::Dropped => b"\n",
    };
    writer.write_all(reply).await?;
    writer.flush().await?;
    Ok(())
}
