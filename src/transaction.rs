//! The one transfer the server is allowed to have in flight.

use crate::tftp::Datagram;
use std::net::SocketAddr;

/// Which way file contents are flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    /// Server to client (RRQ).
    Reading,
    /// Client to server (WRQ).
    Writing,
}

/// Session state for the active transfer.
///
/// Owns the open file for as long as the transfer lasts. `F` is whatever the file store hands
/// out.
#[derive(Debug)]
pub struct Transaction<F> {
    peer: Option<SocketAddr>,
    direction: Direction,

    /// Last block sent (reading) or last block accepted (writing).
    pub tx_block: u16,

    /// Block number carried by the most recent ACK or DATA from the peer.
    pub rx_block: u16,

    file: Option<F>,

    /// Kept so a duplicate ACK can be answered with the exact same bytes.
    last_data: Option<Datagram>,
}

impl<F> Default for Transaction<F> {
    fn default() -> Self {
        Transaction::new()
    }
}

impl<F> Transaction<F> {
    pub fn new() -> Transaction<F> {
        Transaction {
            peer: None,
            direction: Direction::None,
            tx_block: 0,
            rx_block: 0,
            file: None,
            last_data: None,
        }
    }

    /// Starts a transfer with `peer`, discarding anything left from a previous one.
    pub fn begin(&mut self, peer: SocketAddr, direction: Direction) {
        self.end();
        self.peer = Some(peer);
        self.direction = direction;
    }

    /// Closes the file and forgets the peer. Safe to call when nothing is active.
    pub fn end(&mut self) {
        self.file = None;
        self.last_data = None;
        self.peer = None;
        self.direction = Direction::None;
        self.tx_block = 0;
        self.rx_block = 0;
    }

    pub fn is_active(&self) -> bool {
        self.direction != Direction::None
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Transfer ID check.
    ///
    /// IPv4 peers must match on address and port. IPv6 peers are matched on the address octets
    /// alone.
    pub fn is_same_peer(&self, addr: &SocketAddr) -> bool {
        match (self.peer, addr) {
            (Some(SocketAddr::V4(ours)), SocketAddr::V4(theirs)) => {
                ours.ip() == theirs.ip() && ours.port() == theirs.port()
            }
            (Some(SocketAddr::V6(ours)), SocketAddr::V6(theirs)) => {
                ours.ip().octets() == theirs.ip().octets()
            }
            _ => false,
        }
    }

    pub fn attach_file(&mut self, file: F) {
        self.file = Some(file);
    }

    pub fn file_mut(&mut self) -> Option<&mut F> {
        self.file.as_mut()
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    pub fn remember_data(&mut self, datagram: Datagram) {
        self.last_data = Some(datagram);
    }

    pub fn last_data(&self) -> Option<&Datagram> {
        self.last_data.as_ref()
    }
}
