//! Server configuration, validated once at startup.

use crate::trace::MIN_HISTORY;
use std::error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 69;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// IP family of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AddressFamily {
    /// IPv4 only
    #[value(alias("4"))]
    Ipv4,
    /// IPv6 only
    #[value(alias("6"))]
    Ipv6,
    /// Both families on one socket. Not supported.
    Any,
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    UnsupportedFamily(AddressFamily),
    ZeroTimeout(&'static str),
    TraceHistoryTooSmall(usize),
    BadRoot(PathBuf),
}

impl error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnsupportedFamily(family) => {
                write!(f, "Address family {:?} is not supported, pick one of ipv4 or ipv6", family)
            }
            Self::ZeroTimeout(which) => write!(f, "The {} timeout must be greater than zero", which),
            Self::TraceHistoryTooSmall(size) => write!(
                f,
                "Trace history must hold at least {} entries, got {}",
                MIN_HISTORY, size
            ),
            Self::BadRoot(path) => write!(f, "{} is not a directory", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// UDP port to listen on.
    pub port: u16,

    pub family: AddressFamily,

    /// How long an active transfer may go without hearing from its peer.
    pub rx_timeout: Duration,

    /// How long a single send may block.
    pub tx_timeout: Duration,

    /// Directory files are served from and written to.
    pub root: PathBuf,

    /// Number of entries kept in the diagnostic trace.
    pub trace_history: usize,

    /// Refuse write requests.
    pub read_only: bool,

    /// Let write requests replace existing files.
    pub overwrite: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            family: AddressFamily::Ipv4,
            rx_timeout: DEFAULT_TIMEOUT,
            tx_timeout: DEFAULT_TIMEOUT,
            root: PathBuf::from("."),
            trace_history: MIN_HISTORY,
            read_only: false,
            overwrite: true,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.family == AddressFamily::Any {
            return Err(ConfigError::UnsupportedFamily(self.family));
        }
        if self.rx_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("receive"));
        }
        if self.tx_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("transmit"));
        }
        if self.trace_history < MIN_HISTORY {
            return Err(ConfigError::TraceHistoryTooSmall(self.trace_history));
        }
        if !self.root.is_dir() {
            return Err(ConfigError::BadRoot(self.root.clone()));
        }
        Ok(())
    }

    /// Wildcard address for the configured family and port.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = match self.family {
            AddressFamily::Ipv4 => Ipv4Addr::UNSPECIFIED.into(),
            AddressFamily::Ipv6 => Ipv6Addr::UNSPECIFIED.into(),
            AddressFamily::Any => return Err(ConfigError::UnsupportedFamily(self.family)),
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn valid() -> (TempDir, ServerConfig) {
        let tmpdir = TempDir::new("root").unwrap();
        let config = ServerConfig { root: tmpdir.path().to_path_buf(), ..Default::default() };
        (tmpdir, config)
    }

    #[test]
    fn test_default_config_is_valid() {
        let (_tmpdir, config) = valid();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.bind_addr(), Ok("0.0.0.0:69".parse().unwrap()));
    }

    #[test]
    fn test_dual_stack_is_rejected() {
        let (_tmpdir, mut config) = valid();
        config.family = AddressFamily::Any;
        assert_eq!(config.validate(), Err(ConfigError::UnsupportedFamily(AddressFamily::Any)));
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_ipv6_binds_unspecified() {
        let (_tmpdir, mut config) = valid();
        config.family = AddressFamily::Ipv6;
        config.port = 6969;
        assert_eq!(config.bind_addr(), Ok("[::]:6969".parse().unwrap()));
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let (_tmpdir, mut config) = valid();
        config.rx_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout("receive")));

        config.rx_timeout = DEFAULT_TIMEOUT;
        config.tx_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout("transmit")));
    }

    #[test]
    fn test_small_trace_history_is_rejected() {
        let (_tmpdir, mut config) = valid();
        config.trace_history = 8;
        assert_eq!(config.validate(), Err(ConfigError::TraceHistoryTooSmall(8)));
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let (tmpdir, mut config) = valid();
        config.root = tmpdir.path().join("missing");
        assert!(matches!(config.validate(), Err(ConfigError::BadRoot(_))));
    }
}
