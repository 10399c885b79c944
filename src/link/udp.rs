//! UDP link
//!
//! The remote address is resolved once, when the link is built. Datagrams
//! from any other source are dropped without being treated as an error.

use super::{DeviceLink, LinkParams, LinkStats, ParamReader};
use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpConfig {
    pub host: String,
    pub port: u16,
}

impl UdpConfig {
    pub fn from_params(params: &LinkParams) -> Result<Self> {
        let mut reader = ParamReader::new(params);
        let host = reader.required_str("host");
        let port = reader.integer("port", 1..=65_535, true);
        let config = match (host, port) {
            (Some(host), Some(port)) => Some(UdpConfig {
                host,
                port: port as u16,
            }),
            _ => None,
        };
        reader.finish("udp", config)
    }
}

pub struct UdpLink {
    config: UdpConfig,
    remote: SocketAddr,
    socket: Option<UdpSocket>,
    /// Receive buffer, reused across reads
    buffer: Box<[u8]>,
    stats: LinkStats,
    discarded: u64,
}

impl std::fmt::Debug for UdpLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpLink")
            .field("config", &self.config)
            .field("remote", &self.remote)
            .field("socket", &self.socket)
            .field("stats", &self.stats)
            .field("discarded", &self.discarded)
            .finish()
    }
}

impl UdpLink {
    /// Build the link and resolve the remote host
    pub fn new(config: UdpConfig) -> Result<Self> {
        let remote = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| WatchError::LinkIo(format!("cannot resolve {}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| WatchError::LinkIo(format!("{} resolved to no address", config.host)))?;
        tracing::debug!("UDP link target {} resolved to {}", config.host, remote);
        Ok(Self {
            config,
            remote,
            socket: None,
            buffer: vec![0u8; MAX_DATAGRAM].into_boxed_slice(),
            stats: LinkStats::default(),
            discarded: 0,
        })
    }

    pub fn validate_config(params: &LinkParams) -> Result<()> {
        UdpConfig::from_params(params).map(|_| ())
    }

    pub fn config(&self) -> &UdpConfig {
        &self.config
    }

    /// Resolved remote address
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Local address of the bound socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Datagrams dropped because they came from another peer
    pub fn discarded_datagrams(&self) -> u64 {
        self.discarded
    }

    fn degrade(&mut self, what: &str, err: std::io::Error) {
        tracing::error!("UDP {} with {} failed: {}", what, self.remote, err);
        self.stats.io_errors += 1;
        self.socket = None;
    }
}

impl DeviceLink for UdpLink {
    fn kind(&self) -> &'static str {
        "udp"
    }

    fn initialize(&mut self) -> Result<()> {
        self.destroy();
        let unspecified = match self.remote.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
        socket.set_nonblocking(true)?;
        tracing::info!(
            "UDP link bound on {:?}, talking to {}",
            socket.local_addr().ok(),
            self.remote
        );
        self.socket = Some(socket);
        Ok(())
    }

    fn destroy(&mut self) {
        if self.socket.take().is_some() {
            tracing::info!("Closed UDP link to {}", self.remote);
        }
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        loop {
            let socket = self.socket.as_ref()?;
            match socket.recv_from(&mut self.buffer) {
                Ok((n, source)) if source == self.remote => {
                    self.stats.bytes_read += n as u64;
                    return Some(self.buffer[..n].to_vec());
                }
                Ok((_, source)) => {
                    tracing::trace!("Dropping datagram from unexpected peer {}", source);
                    self.discarded += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) => {
                    self.degrade("receive", e);
                    return None;
                }
            }
        }
    }

    fn write(&mut self, data: &[u8]) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        match socket.send_to(data, self.remote) {
            Ok(n) => self.stats.bytes_written += n as u64,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                tracing::warn!("UDP send buffer full, dropped {} bytes", data.len());
            }
            Err(e) => self.degrade("send", e),
        }
    }

    fn operational(&self) -> bool {
        self.socket.is_some()
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}
