// Wire format for RFC 1350 packets, plus the UDP socket the server talks through.
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
//
// RRQ/WRQ:  opcode | filename | 0x00 | mode | 0x00 [| opt name | 0x00 | opt value | 0x00 ]*
// DATA:     opcode | block # (2 bytes) | data (0-512 bytes)
// ACK:      opcode | block # (2 bytes)
// ERROR:    opcode | error code (2 bytes) | message | 0x00
//
// All integers are big-endian. Option pairs (RFC 2347) are collected but never honored.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest payload a single DATA packet may carry. Not negotiable.
pub const BLOCK_SIZE: usize = 512;

const HEADER_SIZE: usize = 4;

/// Largest datagram the server ever sends or expects to receive.
pub const MAX_PACKET_SIZE: usize = BLOCK_SIZE + HEADER_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::Timeout(_) => write!(f, "Socket IO timeout"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents a failure to translate between bytes and a [`Packet`].
#[derive(Debug, PartialEq)]
pub enum PacketError {
    /// The buffer is too short for its opcode, or a field is badly formed.
    Malformed(String),

    /// The first two bytes do not name a TFTP operation.
    UnknownOpcode(u16),

    /// The output buffer cannot hold the encoded packet.
    BufferTooSmall { needed: usize, available: usize },
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::Malformed(msg) => write!(f, "Malformed packet: {}", msg),
            PacketError::UnknownOpcode(code) => write!(f, "Unknown opcode retrieved: {}", code),
            PacketError::BufferTooSmall { needed, available } => write!(
                f,
                "Packet needs {} bytes but the buffer only holds {}",
                needed, available
            ),
        }
    }
}

/// Represents the mode for a file the client wishes to read or write.
///
/// The server moves bytes verbatim whatever the mode says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

impl FromStr for FileMode {
    type Err = PacketError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "netascii" => Ok(FileMode::NetAscii),
            "octet" => Ok(FileMode::Octet),
            "mail" => Ok(FileMode::Mail),
            _ => Err(PacketError::Malformed(format!("Unknown file mode: '{raw}'"))),
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// The TFTP OpCode, always the first two bytes of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    /// Short upper-case label used in logs and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            OpCode::Rrq => "RRQ",
            OpCode::Wrq => "WRQ",
            OpCode::Data => "DATA",
            OpCode::Ack => "ACK",
            OpCode::Error => "ERROR",
        }
    }
}

impl TryFrom<u16> for OpCode {
    type Error = PacketError;

    fn try_from(rawcode: u16) -> Result<Self, PacketError> {
        match rawcode {
            1 => Ok(OpCode::Rrq),
            2 => Ok(OpCode::Wrq),
            3 => Ok(OpCode::Data),
            4 => Ok(OpCode::Ack),
            5 => Ok(OpCode::Error),
            _ => Err(PacketError::UnknownOpcode(rawcode)),
        }
    }
}

impl From<OpCode> for u16 {
    fn from(op: OpCode) -> u16 {
        match op {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

/// A name/value pair trailing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOption {
    pub name: String,
    pub value: String,
}

/// An enum representing a TFTP packet and its associated data.
///
/// `Data` borrows its payload from whatever buffer it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet<'a> {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        /// Options the client appended to the request. Ignored by the server.
        options: Vec<RequestOption>,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
        options: Vec<RequestOption>,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: &'a [u8],
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Assumes a string begins at the start of the buffer and runs until a 0 byte.
///
/// Returns the string and the position of its terminator, or `None` for the position if the
/// buffer ran out first.
fn string_from_buffer(buf: &[u8]) -> (String, Option<usize>) {
    let end = buf.iter().position(|&c| c == 0x00);
    let raw = &buf[..end.unwrap_or(buf.len())];
    (String::from_utf8_lossy(raw).into_owned(), end)
}

fn parse_request(buf: &[u8]) -> Result<(String, FileMode, Vec<RequestOption>), PacketError> {
    let (path, path_end) = string_from_buffer(buf);
    let path_end = path_end.ok_or_else(|| {
        PacketError::Malformed("Filename must be terminated with a null byte!".to_string())
    })?;

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest);
    let mode_end = mode_end.ok_or_else(|| {
        PacketError::Malformed("Mode must be terminated with a null byte!".to_string())
    })?;
    let mode = raw_mode.parse::<FileMode>()?;

    // Whatever follows the mode is a list of option pairs. A dangling name or an unterminated
    // tail is dropped rather than rejected.
    let mut options = Vec::new();
    let mut rest = &rest[mode_end + 1..];
    loop {
        let (name, name_end) = string_from_buffer(rest);
        let Some(name_end) = name_end else { break };
        let after_name = &rest[name_end + 1..];
        let (value, value_end) = string_from_buffer(after_name);
        let Some(value_end) = value_end else { break };
        if !name.is_empty() {
            options.push(RequestOption { name, value });
        }
        rest = &after_name[value_end + 1..];
    }

    Ok((path, mode, options))
}

fn parse_data(buf: &[u8]) -> Result<Packet<'_>, PacketError> {
    let data = &buf[HEADER_SIZE..];
    if data.len() > BLOCK_SIZE {
        return Err(PacketError::Malformed(format!(
            "Data payload of {} bytes exceeds the {BLOCK_SIZE} byte block size",
            data.len()
        )));
    }
    Ok(Packet::Data { block: u16_from_buffer(&buf[2..4]), data })
}

fn parse_error(buf: &[u8]) -> Packet<'_> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[HEADER_SIZE..]);
    Packet::Error { code, message }
}

fn put_string(buf: &mut [u8], cursor: usize, s: &str) -> usize {
    let bytes = s.as_bytes();
    buf[cursor..cursor + bytes.len()].copy_from_slice(bytes);
    buf[cursor + bytes.len()] = 0x00;
    cursor + bytes.len() + 1
}

impl<'a> Packet<'a> {
    /// Parses a received datagram. Never looks beyond `buf.len()`.
    pub fn decode(buf: &'a [u8]) -> Result<Packet<'a>, PacketError> {
        if buf.len() < HEADER_SIZE {
            return Err(PacketError::Malformed(format!(
                "Packet too short! {} bytes received",
                buf.len()
            )));
        }

        match OpCode::try_from(u16_from_buffer(&buf[..2]))? {
            OpCode::Rrq => {
                let (path, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode, options })
            }
            OpCode::Wrq => {
                let (path, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode, options })
            }
            OpCode::Data => parse_data(buf),
            OpCode::Ack => Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) }),
            OpCode::Error => Ok(parse_error(buf)),
        }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Number of bytes [`Packet::encode`] will write.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                2 + path.len()
                    + 1
                    + mode.as_str().len()
                    + 1
                    + options
                        .iter()
                        .map(|o| o.name.len() + o.value.len() + 2)
                        .sum::<usize>()
            }
            Packet::Data { data, .. } => HEADER_SIZE + data.len(),
            Packet::Ack { .. } => HEADER_SIZE,
            Packet::Error { message, .. } => HEADER_SIZE + message.len() + 1,
        }
    }

    /// Writes the packet into `buf`, returning the number of bytes used.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, PacketError> {
        if let Packet::Data { data, .. } = self {
            if data.len() > BLOCK_SIZE {
                return Err(PacketError::Malformed(format!(
                    "Cannot send {} bytes in one block",
                    data.len()
                )));
            }
        }

        let needed = self.encoded_len();
        if buf.len() < needed {
            return Err(PacketError::BufferTooSmall { needed, available: buf.len() });
        }

        buf[..2].copy_from_slice(&u16::from(self.opcode()).to_be_bytes());
        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                let mut cursor = put_string(buf, 2, path);
                cursor = put_string(buf, cursor, mode.as_str());
                for option in options {
                    cursor = put_string(buf, cursor, &option.name);
                    cursor = put_string(buf, cursor, &option.value);
                }
            }
            Packet::Data { block, data } => {
                buf[2..4].copy_from_slice(&block.to_be_bytes());
                buf[HEADER_SIZE..needed].copy_from_slice(data);
            }
            Packet::Ack { block } => {
                buf[2..4].copy_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf[2..4].copy_from_slice(&u16::from(*code).to_be_bytes());
                put_string(buf, HEADER_SIZE, message);
            }
        }

        Ok(needed)
    }
}

/// An encoded packet in a fixed, stack-sized buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Datagram {
    buf: [u8; MAX_PACKET_SIZE],
    len: usize,
}

impl Datagram {
    pub fn encode(packet: &Packet) -> Result<Datagram, PacketError> {
        let mut buf = [0_u8; MAX_PACKET_SIZE];
        let len = packet.encode(&mut buf)?;
        Ok(Datagram { buf, len })
    }

    /// Builds an ERROR packet, cutting the message down until it fits in one datagram.
    pub fn error(code: ErrorCode, message: &str) -> Datagram {
        let mut end = message.len().min(MAX_PACKET_SIZE - HEADER_SIZE - 1);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let packet = Packet::Error { code, message: message[..end].to_string() };
        let mut buf = [0_u8; MAX_PACKET_SIZE];
        // Cannot fail: the message was truncated to fit above.
        let len = packet.encode(&mut buf).unwrap_or(0);
        Datagram { buf, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn decode(&self) -> Result<Packet<'_>, PacketError> {
        Packet::decode(self.as_bytes())
    }
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.decode() {
            Ok(packet) => write!(f, "Datagram({:?})", packet),
            Err(_) => write!(f, "Datagram({:02x?})", self.as_bytes()),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that bounds every receive and send with a timeout.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    /// Waits for the next datagram. `None` waits forever.
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
        ttl: Option<Duration>,
    ) -> TftpResult<(usize, SocketAddr)> {
        let received = match ttl {
            Some(ttl) => timeout(ttl, self.sock.recv_from(buf)).await??,
            None => self.sock.recv_from(buf).await?,
        };
        Ok(received)
    }

    pub async fn send_to(
        &self,
        datagram: &Datagram,
        dst: SocketAddr,
        ttl: Duration,
    ) -> TftpResult<usize> {
        Ok(timeout(ttl, self.sock.send_to(datagram.as_bytes(), dst)).await??)
    }
}
