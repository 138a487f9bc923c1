use crate::{
    Error, Result,
    server::{DEFAULT_HTTP_LISTEN, DEFAULT_SOCKS5_LISTEN, ServerConfig},
    tun2socks::EngineConfig,
};
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone, clap::Parser)]
#[command(author, version, about = "Relay traffic through SOCKS5/HTTP CONNECT proxies and a tun-to-socks engine.", long_about = None)]
pub struct Args {
    /// Run a SOCKS5 server on this address.
    /// Given without a value, listens on 0.0.0.0:1080.
    #[arg(long, value_name = "IP:PORT", num_args = 0..=1, default_missing_value = DEFAULT_SOCKS5_LISTEN)]
    pub socks5_listen: Option<SocketAddr>,

    /// Run an HTTP CONNECT server on this address.
    /// Given without a value, listens on 0.0.0.0:8080.
    #[arg(long, value_name = "IP:PORT", num_args = 0..=1, default_missing_value = DEFAULT_HTTP_LISTEN)]
    pub http_listen: Option<SocketAddr>,

    /// Upstream proxy used by the tun engine, in the form proto://host:port,
    /// where proto is one of socks5, http.
    #[arg(short, long, value_parser = |s: &str| ArgProxy::try_from(s), value_name = "URL", default_value = DEFAULT_PROXY_URL)]
    pub proxy: ArgProxy,

    /// Name of the tun interface, such as tun0. Starts the tun engine.
    #[arg(short, long, value_name = "name")]
    #[cfg_attr(unix, arg(conflicts_with = "tun_fd"))]
    pub tun: Option<String>,

    /// File descriptor of an already configured tun interface. Starts the tun engine.
    #[cfg(unix)]
    #[arg(long, value_name = "fd", conflicts_with = "tun")]
    pub tun_fd: Option<i32>,

    /// MTU of the tun interface
    #[arg(long, value_name = "bytes", default_value = "1500")]
    pub mtu: u16,

    /// Timeout in seconds for the servers' outbound connects and request handshakes
    #[arg(long, value_name = "seconds", default_value = "10")]
    pub connect_timeout: u64,

    /// Timeout in seconds for the tun engine's connects through the upstream proxy
    #[arg(long, value_name = "seconds", default_value = "5")]
    pub proxy_timeout: u64,

    /// TCP idle timeout in seconds for tun flows
    #[arg(long, value_name = "seconds", default_value = "600")]
    pub tcp_timeout: u64,

    /// Maximum number of sessions to be handled concurrently, per server and for the tun engine
    #[arg(long, value_name = "number", default_value = "200")]
    pub max_sessions: usize,

    /// Verbosity level
    #[arg(short, long, value_name = "level", value_enum, default_value = "info")]
    pub verbosity: ArgVerbosity,
}

/// Group owner address of a Wi-Fi Direct group.
pub const DEFAULT_PROXY_URL: &str = "socks5://192.168.49.1:1080";

impl Default for Args {
    fn default() -> Self {
        Args {
            socks5_listen: None,
            http_listen: None,
            proxy: ArgProxy::default(),
            tun: None,
            #[cfg(unix)]
            tun_fd: None,
            mtu: 1500,
            connect_timeout: 10,
            proxy_timeout: 5,
            tcp_timeout: 600,
            max_sessions: 200,
            verbosity: ArgVerbosity::Info,
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        use clap::Parser;
        let args = Self::parse();
        if !args.has_work() {
            eprintln!("Nothing to run, use '--socks5-listen', '--http-listen' or '--tun'.");
            std::process::exit(-1);
        }
        args
    }

    /// True when at least one server or the tun engine is configured.
    pub fn has_work(&self) -> bool {
        self.socks5_listen.is_some() || self.http_listen.is_some() || self.engine_enabled()
    }

    pub fn engine_enabled(&self) -> bool {
        #[cfg(unix)]
        if self.tun_fd.is_some() {
            return true;
        }
        self.tun.is_some()
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            handshake_timeout: Duration::from_secs(self.connect_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            max_sessions: self.max_sessions,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            mtu: self.mtu,
            connect_timeout: Duration::from_secs(self.proxy_timeout),
            tcp_timeout: Duration::from_secs(self.tcp_timeout),
            max_sessions: self.max_sessions,
        }
    }

    pub fn socks5_listen(&mut self, addr: SocketAddr) -> &mut Self {
        self.socks5_listen = Some(addr);
        self
    }

    pub fn http_listen(&mut self, addr: SocketAddr) -> &mut Self {
        self.http_listen = Some(addr);
        self
    }

    pub fn proxy(&mut self, proxy: ArgProxy) -> &mut Self {
        self.proxy = proxy;
        self
    }

    pub fn tun(&mut self, tun: String) -> &mut Self {
        self.tun = Some(tun);
        self
    }

    #[cfg(unix)]
    pub fn tun_fd(&mut self, tun_fd: Option<i32>) -> &mut Self {
        self.tun_fd = tun_fd;
        self
    }

    pub fn mtu(&mut self, mtu: u16) -> &mut Self {
        self.mtu = mtu;
        self
    }

    pub fn max_sessions(&mut self, max_sessions: usize) -> &mut Self {
        self.max_sessions = max_sessions;
        self
    }

    pub fn verbosity(&mut self, verbosity: ArgVerbosity) -> &mut Self {
        self.verbosity = verbosity;
        self
    }
}

#[repr(C)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum ArgVerbosity {
    Off = 0,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<ArgVerbosity> for log::LevelFilter {
    fn from(verbosity: ArgVerbosity) -> Self {
        match verbosity {
            ArgVerbosity::Off => log::LevelFilter::Off,
            ArgVerbosity::Error => log::LevelFilter::Error,
            ArgVerbosity::Warn => log::LevelFilter::Warn,
            ArgVerbosity::Info => log::LevelFilter::Info,
            ArgVerbosity::Debug => log::LevelFilter::Debug,
            ArgVerbosity::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::fmt::Display for ArgVerbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ArgVerbosity::Off => write!(f, "off"),
            ArgVerbosity::Error => write!(f, "error"),
            ArgVerbosity::Warn => write!(f, "warn"),
            ArgVerbosity::Info => write!(f, "info"),
            ArgVerbosity::Debug => write!(f, "debug"),
            ArgVerbosity::Trace => write!(f, "trace"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgProxy {
    pub proxy_type: ProxyType,
    pub addr: SocketAddr,
}

impl Default for ArgProxy {
    fn default() -> Self {
        ArgProxy {
            proxy_type: ProxyType::Socks5,
            addr: SocketAddr::from(([192, 168, 49, 1], 1080)),
        }
    }
}

impl std::fmt::Display for ArgProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", &self.proxy_type, &self.addr)
    }
}

impl TryFrom<&str> for ArgProxy {
    type Error = Error;
    fn try_from(s: &str) -> Result<Self> {
        let e = format!("`{s}` is not a valid proxy URL");
        let url = url::Url::parse(s).map_err(|_| Error::from(&e))?;
        let e = format!("`{s}` does not contain a host");
        let host = url.host_str().ok_or(Error::from(e))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let e = format!("`{s}` does not contain a port");
        let port = url.port_or_known_default().ok_or(Error::from(&e))?;

        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::from(format!("`{s}`: proxy credentials are not supported")));
        }

        let e = format!("`{host}` could not be resolved");
        let mut addr_iter = (host, port).to_socket_addrs().map_err(|_| Error::from(&e))?;

        let e = format!("`{host}` does not resolve to a usable IP address");
        let addr = addr_iter.next().ok_or(Error::from(&e))?;

        let proxy_type = url.scheme().to_ascii_lowercase().as_str().try_into()?;

        Ok(ArgProxy { proxy_type, addr })
    }
}

#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum ProxyType {
    Http = 0,
    #[default]
    Socks5,
}

impl TryFrom<&str> for ProxyType {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self> {
        match value {
            "http" => Ok(ProxyType::Http),
            "socks5" => Ok(ProxyType::Socks5),
            scheme => Err(Error::from(&format!("`{scheme}` is an invalid proxy type"))),
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyType::Socks5 => write!(f, "socks5"),
            ProxyType::Http => write!(f, "http"),
        }
    }
}
