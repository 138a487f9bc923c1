use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tokio::net::TcpStream;

/// Port assumed for a CONNECT authority without one.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Destination requested by a proxy client.
///
/// Domain names are kept unresolved; resolution happens in [`ProxyTarget::connect`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProxyTarget {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl ProxyTarget {
    /// Literal addresses become [`ProxyTarget::Ip`], everything else a domain.
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => ProxyTarget::Ip(SocketAddr::new(ip, port)),
            Err(_) => ProxyTarget::Domain(host.to_string(), port),
        }
    }

    /// Parses `host[:port]`, `[v6]` or `[v6]:port`.
    ///
    /// A missing port defaults to 443 and so does one that does not parse; the latter is logged.
    /// Returns `None` only when no host is present.
    pub fn parse_authority(authority: &str) -> Option<Self> {
        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            (host, tail.strip_prefix(':'))
        } else if authority.parse::<std::net::Ipv6Addr>().is_ok() {
            (authority, None)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return None;
        }
        let port = match port {
            None => DEFAULT_CONNECT_PORT,
            Some(port) => port.parse::<u16>().unwrap_or_else(|_| {
                log::warn!("invalid port `{port}` in `{authority}`, using {DEFAULT_CONNECT_PORT}");
                DEFAULT_CONNECT_PORT
            }),
        };
        Some(Self::from_host(host, port))
    }

    pub fn port(&self) -> u16 {
        match self {
            ProxyTarget::Ip(addr) => addr.port(),
            ProxyTarget::Domain(_, port) => *port,
        }
    }

    /// Opens a TCP connection to the target, resolving domains first.
    pub async fn connect(&self, timeout: Duration) -> std::io::Result<TcpStream> {
        let connect = async {
            match self {
                ProxyTarget::Ip(addr) => TcpStream::connect(addr).await,
                ProxyTarget::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
            }
        };
        match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {self} timed out after {timeout:?}"),
            )),
        }
    }
}

impl From<SocketAddr> for ProxyTarget {
    fn from(addr: SocketAddr) -> Self {
        ProxyTarget::Ip(addr)
    }
}

impl std::fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProxyTarget::Ip(addr) => write!(f, "{addr}"),
            ProxyTarget::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}
