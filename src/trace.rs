//! Observational history of what the state machine did.
//!
//! Nothing here affects protocol behavior. The processor appends an entry on every transition
//! worth knowing about and the server logs the rendered table when a transfer dies.

use crate::processor::State;
use crate::tftp::OpCode;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Longest note kept per entry, in characters.
pub const NOTE_LEN: usize = 80;

/// Smallest history the server may be configured with.
pub const MIN_HISTORY: usize = 16;

/// Bytes of each datagram shown in a [`Status`].
pub const HEAD_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub id: u32,
    /// Time since the trace was created.
    pub timestamp: Duration,
    pub state: State,
    pub rx_block: u16,
    pub tx_block: u16,
    pub note: String,
}

/// Fixed-capacity ring of [`TraceEntry`]. The oldest entry is overwritten once full.
#[derive(Debug)]
pub struct Trace {
    entries: VecDeque<TraceEntry>,
    capacity: usize,
    next_id: u32,
    started: Instant,
}

impl Trace {
    pub fn new(capacity: usize) -> Trace {
        let capacity = capacity.max(1);
        Trace {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, state: State, rx_block: u16, tx_block: u16, note: &str) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry {
            id: self.next_id,
            timestamp: self.started.elapsed(),
            state,
            rx_block,
            tx_block,
            note: note.chars().take(NOTE_LEN).collect(),
        });
        self.next_id = self.next_id.wrapping_add(1);
    }

    /// Oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{:-^79}", " TFTP TRACE ")?;
        writeln!(f, " {:>8}  {:>5}  {:<5}  {:>5}  {:>5}  Note", "TS(ms)", "ID", "State", "Rx#", "Tx#")?;
        for entry in &self.entries {
            writeln!(
                f,
                " {:>8}  {:>5}  {:<5}  {:>5}  {:>5}  {}",
                entry.timestamp.as_millis(),
                entry.id,
                entry.state.label(),
                entry.rx_block,
                entry.tx_block,
                entry.note
            )?;
        }
        Ok(())
    }
}

/// Snapshot of the server's session and counters.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub state: State,
    pub enabled: bool,
    pub last_opcode: Option<OpCode>,
    pub peer: Option<SocketAddr>,

    pub rx_count: u32,
    pub rx_block: u16,
    pub rx_len: usize,
    pub rx_head: Vec<u8>,

    pub tx_count: u32,
    pub tx_block: u16,
    pub tx_len: usize,
    pub tx_head: Vec<u8>,
}

fn hex_head(f: &mut fmt::Formatter, bytes: &[u8]) -> fmt::Result {
    let head: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    writeln!(f, "{}", head.join(" "))
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{:-^79}", " TFTP ")?;
        writeln!(f, "State      : {}{}", self.state, if self.enabled { "" } else { " (disabled)" })?;
        writeln!(f, "OpCode     : {}", self.last_opcode.map_or("-NONE-", |op| op.label()))?;
        writeln!(f)?;
        writeln!(f, "Rx Msg Ctr : {:>5}", self.rx_count)?;
        writeln!(f, "Rx Block # : {:>5}", self.rx_block)?;
        writeln!(f, "Rx Msg Len : {:>5}", self.rx_len)?;
        write!(f, "Rx Msg     : ")?;
        hex_head(f, &self.rx_head)?;
        writeln!(f)?;
        writeln!(f, "Tx Msg Ctr : {:>5}", self.tx_count)?;
        writeln!(f, "Tx Block # : {:>5}", self.tx_block)?;
        writeln!(f, "Tx Msg Len : {:>5}", self.tx_len)?;
        write!(f, "Tx Msg     : ")?;
        hex_head(f, &self.tx_head)?;
        writeln!(f)?;
        match self.peer {
            Some(peer) => writeln!(f, "Peer       : {}", peer),
            None => writeln!(f, "Peer       :"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_overwrites_oldest() {
        let mut trace = Trace::new(MIN_HISTORY);
        for i in 0..(MIN_HISTORY as u16 + 4) {
            trace.record(State::TransferRead, i, i + 1, "ack");
        }
        assert_eq!(trace.len(), MIN_HISTORY);
        let ids: Vec<u32> = trace.entries().map(|e| e.id).collect();
        assert_eq!(ids.first(), Some(&4));
        assert_eq!(ids.last(), Some(&(MIN_HISTORY as u32 + 3)));
    }

    #[test]
    fn test_note_is_truncated() {
        let mut trace = Trace::new(MIN_HISTORY);
        trace.record(State::Idle, 0, 0, &"n".repeat(200));
        assert_eq!(trace.entries().next().unwrap().note.len(), NOTE_LEN);
    }

    #[test]
    fn test_render_trace_table() {
        let mut trace = Trace::new(MIN_HISTORY);
        trace.record(State::Idle, 0, 0, "Rd request, file opened");
        trace.record(State::TransferWrite, 3, 3, "Data wr, data ok");

        let rendered = trace.to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].len(), 79);
        assert!(lines[2].contains("IDLE"));
        assert!(lines[2].ends_with("Rd request, file opened"));
        assert!(lines[3].contains("WR"));
    }

    #[test]
    fn test_render_status() {
        let status = Status {
            state: State::TransferRead,
            enabled: true,
            last_opcode: Some(OpCode::Ack),
            peer: Some("10.0.0.7:3456".parse().unwrap()),
            rx_count: 3,
            rx_block: 2,
            rx_len: 4,
            rx_head: vec![0x00, 0x04, 0x00, 0x02],
            tx_count: 3,
            tx_block: 3,
            tx_len: 516,
            tx_head: vec![0x00, 0x03, 0x00, 0x03, 0x78, 0x78, 0x78, 0x78, 0x78, 0x78],
        };
        let rendered = status.to_string();
        assert!(rendered.contains("State      : DATA READ\n"));
        assert!(rendered.contains("OpCode     : ACK\n"));
        assert!(rendered.contains("Rx Msg     : 00 04 00 02\n"));
        assert!(rendered.contains("Tx Msg Len :   516\n"));
        assert!(rendered.contains("Peer       : 10.0.0.7:3456\n"));
    }
}
