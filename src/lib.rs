//! A single-session TFTP server (RFC 1350).
//!
//! One transfer at a time runs over the well-known port, in octet, netascii or mail mode, with
//! the file bytes moved unchanged. Everything else that arrives while a transfer is active is
//! answered with a busy error.
//!
//! [`srv_conn::Server`] owns the socket and the loop. [`processor::Processor`] is the state
//! machine and can be driven directly without a network.

pub mod config;
pub mod filestore;
pub mod processor;
pub mod srv_conn;
pub mod tftp;
pub mod trace;
pub mod transaction;

pub use config::ServerConfig;
pub use filestore::{FileStore, StoredFile, TokioFileStore};
pub use processor::{Processor, ResultAction, State};
pub use srv_conn::{Server, ServerError, ServerHandle};
