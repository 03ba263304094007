// This module contains the server loop.
//
// Everything happens on the one well-known socket. The loop works in the following stages:
//
// 1. Wait for a datagram. While a transfer is active the wait is bounded by the receive timeout,
//    otherwise it waits forever.
// 2. Hand the datagram to the Processor, which decides what to do with it and what, if anything,
//    goes back.
// 3. Send the reply, bounded by the transmit timeout.
//
// Failures in any stage are reported back to the Processor, which decides whether the transfer
// survives. Nothing in here ends the loop: errors after bind are logged and the server keeps
// listening.

use crate::config::{ConfigError, ServerConfig};
use crate::filestore::FileStore;
use crate::processor::{Processor, ResultAction, State};
use crate::tftp::{self, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Lets other tasks switch the server on and off while it runs.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    enabled: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub fn enable(&self) {
        self.enabled.send_replace(true);
    }

    /// Kills the active transfer, if any, and refuses requests until [`ServerHandle::enable`].
    pub fn disable(&self) {
        self.enabled.send_replace(false);
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }
}

/// A bound TFTP server.
pub struct Server<S: FileStore> {
    sock: TftpSocket,
    processor: Processor<S>,
    tx_timeout: Duration,
    enabled: Arc<watch::Sender<bool>>,
    enabled_rx: watch::Receiver<bool>,
}

impl<S: FileStore> Server<S> {
    /// Validates `config` and binds the listening socket.
    pub fn bind(config: &ServerConfig, store: S) -> Result<Server<S>, ServerError> {
        config.validate()?;
        let addr = config.bind_addr()?;
        let sock = TftpSocket::bind(addr).map_err(|e| ServerError::CantBind(addr, e))?;
        log::info!("Listening on {}", sock.local_addr().map_err(ServerError::NoSocket)?);

        let (tx, rx) = watch::channel(true);
        Ok(Server {
            sock,
            processor: Processor::new(store, config),
            tx_timeout: config.tx_timeout,
            enabled: Arc::new(tx),
            enabled_rx: rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.sock.local_addr().map_err(ServerError::NoSocket)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle { enabled: self.enabled.clone() }
    }

    /// Serves requests forever.
    pub async fn run(self) {
        let Server { sock, mut processor, tx_timeout, enabled, mut enabled_rx } = self;
        // Our own sender keeps the channel open however many handles get dropped.
        let _enabled = enabled;
        // One spare byte so an oversized datagram arrives oversized instead of silently clipped.
        let mut buf = [0_u8; tftp::MAX_PACKET_SIZE + 1];

        loop {
            let ttl = processor.receive_timeout();
            let received = tokio::select! {
                received = sock.recv_from(&mut buf, ttl) => received,
                Ok(()) = enabled_rx.changed() => {
                    let want = *enabled_rx.borrow_and_update();
                    match (want, processor.is_enabled()) {
                        (true, false) => processor.enable(),
                        (false, true) => processor.disable(),
                        _ => {}
                    }
                    continue;
                }
            };

            let (len, src) = match received {
                Ok(received) => received,
                Err(SocketError::Timeout(_)) => {
                    processor.timed_out();
                    dump_diagnostics(&processor);
                    continue;
                }
                Err(e) => {
                    processor.receive_failed(&e);
                    continue;
                }
            };

            let was_active = processor.state() != State::Idle;
            match processor.handle(&buf[..len], src).await {
                ResultAction::Reply(out) => {
                    if let Err(e) = sock.send_to(&out.datagram, out.to, tx_timeout).await {
                        log::warn!("Unable to send packet to {}: {}", out.to, e);
                        processor.transmit_failed(out.to);
                    }
                }
                ResultAction::Silent => {}
            }

            if was_active && processor.state() == State::Idle {
                dump_diagnostics(&processor);
            }
        }
    }
}

fn dump_diagnostics<S: FileStore>(processor: &Processor<S>) {
    log::debug!("{}", processor.status());
    log::debug!("{}", processor.trace());
}

#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    CantBind(SocketAddr, SocketError),
    NoSocket(SocketError),
}

impl error::Error for ServerError {}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Invalid configuration: {}", e),
            Self::CantBind(addr, e) => write!(f, "Couldn't bind {}: {}", addr, e),
            Self::NoSocket(e) => write!(f, "Socket unavailable: {}", e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> ServerError {
        ServerError::Config(e)
    }
}
