// The protocol state machine.
//
// The server holds at most one transfer. Every datagram that reaches the processor is classified
// in this order:
//
// 1. Server disabled: refused outright.
// 2. A transfer is active and the datagram is not from its peer: refused as busy, the transfer is
//    left alone.
// 3. Otherwise decoded and dispatched on (state, opcode).
//
// The processor never touches a socket. It returns at most one datagram for the caller to send,
// and the caller reports back when a receive times out or a send fails. Anything that goes wrong
// inside a transfer drops the machine back to Idle with the file closed.

use crate::config::ServerConfig;
use crate::filestore::{FileStore, OpenMode, StoredFile};
use crate::tftp::{Datagram, ErrorCode, OpCode, Packet, PacketError, BLOCK_SIZE};
use crate::trace::{Status, Trace, HEAD_LEN};
use crate::transaction::{Direction, Transaction};
use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for a RRQ or WRQ.
    Idle,
    /// Sending a file to the peer.
    TransferRead,
    /// Receiving a file from the peer.
    TransferWrite,
}

impl State {
    /// Short form used in the trace table.
    pub fn label(&self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::TransferRead => "RD",
            State::TransferWrite => "WR",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Idle => write!(f, "IDLE"),
            State::TransferRead => write!(f, "DATA READ"),
            State::TransferWrite => write!(f, "DATA WRITE"),
        }
    }
}

impl From<Direction> for State {
    fn from(direction: Direction) -> State {
        match direction {
            Direction::None => State::Idle,
            Direction::Reading => State::TransferRead,
            Direction::Writing => State::TransferWrite,
        }
    }
}

/// A datagram the caller should transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: SocketAddr,
    pub datagram: Datagram,
}

/// Represents an action that the caller of Processor should take in response to a datagram.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the datagram.
    Reply(Outbound),

    /// Nothing goes back on the wire.
    Silent,
}

fn reply(to: SocketAddr, datagram: Datagram) -> ResultAction {
    ResultAction::Reply(Outbound { to, datagram })
}

/// Reasons a transfer gets torn down.
#[derive(Debug)]
enum TransferError {
    Open(io::Error),
    Read(io::Error),
    Write(io::Error),
    Malformed(PacketError),
    Encode(PacketError),
    Unexpected(OpCode),
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Open(e) => write!(f, "Could not open file: {}", e),
            Self::Read(e) => write!(f, "File read failed: {}", e),
            Self::Write(e) => write!(f, "File write failed: {}", e),
            Self::Malformed(e) => write!(f, "{}", e),
            Self::Encode(e) => write!(f, "Could not encode reply: {}", e),
            Self::Unexpected(op) => write!(f, "{} received, not supposed to!", op.label()),
        }
    }
}

impl TransferError {
    /// The ERROR packet owed to the peer, if any.
    fn courtesy(&self) -> Option<Datagram> {
        match self {
            Self::Open(e) if e.kind() == io::ErrorKind::NotFound => {
                Some(Datagram::error(ErrorCode::FileNotFound, "file not found"))
            }
            Self::Open(e) => Some(Datagram::error(e.kind().into(), &e.to_string())),
            Self::Read(_) => Some(Datagram::error(ErrorCode::Undefined, "file read error")),
            Self::Write(e) => {
                let code = match ErrorCode::from(e.kind()) {
                    ErrorCode::Undefined => ErrorCode::DiskFull,
                    code => code,
                };
                Some(Datagram::error(code, "file write error"))
            }
            Self::Malformed(e) => Some(Datagram::error(ErrorCode::Illegal, &e.to_string())),
            Self::Encode(_) | Self::Unexpected(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    last_opcode: Option<OpCode>,
    rx_count: u32,
    rx_len: usize,
    rx_head: Vec<u8>,
    tx_count: u32,
    tx_len: usize,
    tx_head: Vec<u8>,
}

/// Drives the single transfer the server allows.
pub struct Processor<S: FileStore> {
    store: S,
    txn: Transaction<S::File>,
    rx_timeout: Duration,
    enabled: bool,
    trace: Trace,
    counters: Counters,
}

impl<S: FileStore> Processor<S> {
    pub fn new(store: S, config: &ServerConfig) -> Processor<S> {
        Processor {
            store,
            txn: Transaction::new(),
            rx_timeout: config.rx_timeout,
            enabled: true,
            trace: Trace::new(config.trace_history),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> State {
        self.txn.direction().into()
    }

    pub fn transaction(&self) -> &Transaction<S::File> {
        &self.txn
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// How long the caller should wait for the next datagram. `None` means forever.
    pub fn receive_timeout(&self) -> Option<Duration> {
        match self.state() {
            State::Idle => None,
            _ => Some(self.rx_timeout),
        }
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state(),
            enabled: self.enabled,
            last_opcode: self.counters.last_opcode,
            peer: self.txn.peer(),
            rx_count: self.counters.rx_count,
            rx_block: self.txn.rx_block,
            rx_len: self.counters.rx_len,
            rx_head: self.counters.rx_head.clone(),
            tx_count: self.counters.tx_count,
            tx_block: self.txn.tx_block,
            tx_len: self.counters.tx_len,
            tx_head: self.counters.tx_head.clone(),
        }
    }

    /// Given an incoming datagram, advances the machine and describes what to send back.
    pub async fn handle(&mut self, buf: &[u8], peer: SocketAddr) -> ResultAction {
        self.counters.rx_count = self.counters.rx_count.wrapping_add(1);
        self.counters.rx_len = buf.len();
        self.counters.rx_head = buf.iter().take(HEAD_LEN).copied().collect();

        let action = self.dispatch(buf, peer).await;

        if let ResultAction::Reply(out) = &action {
            let bytes = out.datagram.as_bytes();
            self.counters.tx_count = self.counters.tx_count.wrapping_add(1);
            self.counters.tx_len = bytes.len();
            self.counters.tx_head = bytes.iter().take(HEAD_LEN).copied().collect();
        }
        action
    }

    async fn dispatch(&mut self, buf: &[u8], peer: SocketAddr) -> ResultAction {
        if !self.enabled {
            log::warn!("Server disabled, refusing datagram from {}", peer);
            return reply(
                peer,
                Datagram::error(ErrorCode::Undefined, "Transaction denied, server disabled"),
            );
        }

        if self.txn.is_active() && !self.txn.is_same_peer(&peer) {
            log::warn!(
                "Rejecting {} while a transfer with {:?} is in progress",
                peer,
                self.txn.peer()
            );
            self.record("Busy, foreign TID refused");
            return reply(peer, Datagram::error(ErrorCode::Undefined, "server busy"));
        }

        let packet = match Packet::decode(buf) {
            Ok(packet) => packet,
            Err(e) if self.txn.is_active() => return self.fail(TransferError::Malformed(e), peer),
            Err(e) => {
                log::debug!("Dropping undecodable datagram from {}: {}", peer, e);
                return ResultAction::Silent;
            }
        };
        log::debug!("Got packet from {}: {:?}", peer, packet);
        self.counters.last_opcode = Some(packet.opcode());

        let result = match self.state() {
            State::Idle => self.on_idle(packet, peer).await,
            State::TransferRead => self.on_read(packet, peer).await,
            State::TransferWrite => self.on_write(packet, peer).await,
        };
        match result {
            Ok(action) => action,
            Err(e) => self.fail(e, peer),
        }
    }

    async fn on_idle(&mut self, packet: Packet<'_>, peer: SocketAddr) -> Result<ResultAction, TransferError> {
        self.record("Idle state");
        match packet {
            Packet::ReadReq { path, options, .. } => {
                if !options.is_empty() {
                    log::debug!("Ignoring request options {:?}", options);
                }
                self.start_read(&path, peer).await
            }
            Packet::WriteReq { path, options, .. } => {
                if !options.is_empty() {
                    log::debug!("Ignoring request options {:?}", options);
                }
                self.start_write(&path, peer).await
            }
            other => Err(TransferError::Unexpected(other.opcode())),
        }
    }

    async fn on_read(&mut self, packet: Packet<'_>, peer: SocketAddr) -> Result<ResultAction, TransferError> {
        match packet {
            Packet::Ack { block } => {
                self.txn.rx_block = block;
                if block == self.txn.tx_block {
                    self.record("Data rd, ACK rx'd");
                    return self.send_next_block(peer).await;
                }

                // The peer missed our last block or is echoing an old ACK. Either way, the same
                // bytes go out again and the file stays where it is.
                log::debug!(
                    "ACK for block {} while block {} is outstanding, retransmitting",
                    block,
                    self.txn.tx_block
                );
                self.record("Data rd, stale ACK, re-tx");
                match self.txn.last_data() {
                    Some(datagram) => Ok(reply(peer, datagram.clone())),
                    None => Ok(ResultAction::Silent),
                }
            }
            Packet::ReadReq { path, .. } => {
                self.record("Data rd, rx'd RRQ, restarting");
                self.start_read(&path, peer).await
            }
            other => Ok(self.refuse_in_transfer(other, peer)),
        }
    }

    async fn on_write(&mut self, packet: Packet<'_>, peer: SocketAddr) -> Result<ResultAction, TransferError> {
        match packet {
            Packet::Data { block, data } => {
                self.txn.rx_block = block;
                let ack = Datagram::encode(&Packet::Ack { block }).map_err(TransferError::Encode)?;

                if block <= self.txn.tx_block {
                    // Already written. Acknowledge again so the peer stops resending.
                    self.record("Data wr, duplicate block, re-ACK");
                    return Ok(reply(peer, ack));
                }

                if !data.is_empty() {
                    let Some(file) = self.txn.file_mut() else {
                        return Err(TransferError::Write(no_open_file()));
                    };
                    file.write_block(data).await.map_err(TransferError::Write)?;
                }
                self.txn.tx_block = block;

                if data.len() < BLOCK_SIZE {
                    log::info!("Received final block {} from {}", block, peer);
                    self.record("Data wr, final block, closing");
                    self.txn.end();
                } else {
                    self.record("Data wr, DATA ok");
                }
                Ok(reply(peer, ack))
            }
            Packet::WriteReq { path, .. } => {
                self.record("Data wr, rx'd WRQ, restarting");
                self.start_write(&path, peer).await
            }
            other => Ok(self.refuse_in_transfer(other, peer)),
        }
    }

    /// Answers a packet that has no business arriving mid-transfer. The transfer carries on.
    fn refuse_in_transfer(&mut self, packet: Packet<'_>, peer: SocketAddr) -> ResultAction {
        let op = packet.opcode();
        if let Packet::Error { code, message } = &packet {
            log::warn!("Client sent error packet: code: {:?}, message: '{}'", code, message);
        }
        let note = match self.state() {
            State::TransferWrite => format!("Data wr, server busy, {} opcode?", op.label()),
            _ => format!("Data rd, server busy, {} opcode?", op.label()),
        };
        self.record(&note);
        reply(
            peer,
            Datagram::error(ErrorCode::Illegal, &format!("server busy, unexpected {}", op.label())),
        )
    }

    async fn start_read(&mut self, path: &str, peer: SocketAddr) -> Result<ResultAction, TransferError> {
        self.txn.begin(peer, Direction::Reading);
        let file = self
            .store
            .open(path, OpenMode::Read)
            .await
            .map_err(TransferError::Open)?;
        self.txn.attach_file(file);
        log::info!("Sending '{}' to {}", path, peer);
        self.record("Rd request, file opened");
        self.send_next_block(peer).await
    }

    async fn start_write(&mut self, path: &str, peer: SocketAddr) -> Result<ResultAction, TransferError> {
        self.txn.begin(peer, Direction::Writing);
        let file = self
            .store
            .open(path, OpenMode::Create)
            .await
            .map_err(TransferError::Open)?;
        self.txn.attach_file(file);
        log::info!("Receiving '{}' from {}", path, peer);
        self.record("Wr request, file opened");
        let ack = Datagram::encode(&Packet::Ack { block: 0 }).map_err(TransferError::Encode)?;
        Ok(reply(peer, ack))
    }

    /// Reads the next chunk and sends it as the next block. A short chunk ends the transfer.
    async fn send_next_block(&mut self, peer: SocketAddr) -> Result<ResultAction, TransferError> {
        let mut payload = [0_u8; BLOCK_SIZE];
        let Some(file) = self.txn.file_mut() else {
            return Err(TransferError::Read(no_open_file()));
        };
        let len = file.read_block(&mut payload).await.map_err(TransferError::Read)?;

        let block = self.txn.tx_block.wrapping_add(1);
        let datagram = Datagram::encode(&Packet::Data { block, data: &payload[..len] })
            .map_err(TransferError::Encode)?;
        self.txn.tx_block = block;

        if len < BLOCK_SIZE {
            log::info!("Sent final block {} to {}", block, peer);
            self.record("Data rd, final block, closing");
            self.txn.end();
        } else {
            self.txn.remember_data(datagram.clone());
        }
        Ok(reply(peer, datagram))
    }

    fn fail(&mut self, err: TransferError, peer: SocketAddr) -> ResultAction {
        match err {
            TransferError::Unexpected(_) => log::debug!("Ignoring datagram from {}: {}", peer, err),
            _ => log::warn!("Transfer with {} terminated: {}", peer, err),
        }
        self.record(&format!("Error, session terminated: {}", err));
        self.terminate();
        match err.courtesy() {
            Some(datagram) => reply(peer, datagram),
            None => ResultAction::Silent,
        }
    }

    /// Abandons the active transfer, if any.
    pub fn terminate(&mut self) {
        if self.txn.is_active() {
            log::debug!("Trace at termination:\n{}", self.trace);
        }
        self.txn.end();
    }

    /// The caller waited [`Processor::receive_timeout`] without hearing anything.
    ///
    /// The transfer is dropped rather than retried.
    pub fn timed_out(&mut self) {
        if let Some(peer) = self.txn.peer() {
            log::warn!("No word from {} in {:?}, abandoning transfer", peer, self.rx_timeout);
            self.record("Rx timeout, session terminated");
            self.terminate();
        }
    }

    /// The socket failed while receiving.
    pub fn receive_failed(&mut self, err: &dyn error::Error) {
        log::warn!("Receive failed: {}", err);
        if self.txn.is_active() {
            self.record("Rx error, session terminated");
            self.terminate();
        }
    }

    /// A datagram the processor asked for could not be sent to `to`.
    ///
    /// Only a failure towards the active peer ends the transfer.
    pub fn transmit_failed(&mut self, to: SocketAddr) {
        if self.txn.is_active() && self.txn.is_same_peer(&to) {
            log::warn!("Could not reach {}, abandoning transfer", to);
            self.record("Tx error, session terminated");
            self.terminate();
        }
    }

    pub fn enable(&mut self) {
        log::info!("Server enabled");
        self.enabled = true;
        self.txn.end();
    }

    /// Kills the active transfer and refuses everything until [`Processor::enable`].
    pub fn disable(&mut self) {
        log::info!("Server disabled");
        self.enabled = false;
        self.record("Server disabled");
        self.terminate();
    }

    fn record(&mut self, note: &str) {
        let state = self.state();
        self.trace.record(state, self.txn.rx_block, self.txn.tx_block, note);
    }
}

fn no_open_file() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "no file is open")
}
