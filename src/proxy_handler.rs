use crate::{
    args::{ArgProxy, ProxyType},
    http::HttpConnector,
    socks::SocksConnector,
    target::ProxyTarget,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpStream;

/// Opens tunnels to targets through an upstream proxy.
///
/// The returned stream has completed the proxy handshake and carries only tunnel payload.
#[async_trait::async_trait]
pub trait ProxyConnector: Send + Sync {
    fn server_addr(&self) -> SocketAddr;
    async fn connect(&self, target: &ProxyTarget) -> std::io::Result<TcpStream>;
}

pub fn create_connector(proxy: &ArgProxy, timeout: Duration) -> Arc<dyn ProxyConnector> {
    match proxy.proxy_type {
        ProxyType::Socks5 => Arc::new(SocksConnector::new(proxy.addr, timeout)),
        ProxyType::Http => Arc::new(HttpConnector::new(proxy.addr, timeout)),
    }
}
