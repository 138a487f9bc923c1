use crate::{
    error::Result,
    proxy_handler::ProxyConnector,
    socks5::{self, Command, METHOD_NO_AUTH},
    target::ProxyTarget,
};
use std::{net::SocketAddr, time::Duration};
use tokio::{io::AsyncWriteExt, net::TcpStream};

/// SOCKS5 client: no authentication, CONNECT only.
#[derive(Clone, Debug)]
pub struct SocksConnector {
    server: SocketAddr,
    timeout: Duration,
}

impl SocksConnector {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    async fn handshake(&self, request: &[u8]) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server).await?;
        stream.write_all(&socks5::encode_greeting(&[METHOD_NO_AUTH])).await?;
        socks5::read_frame(&mut stream, socks5::decode_method_selection).await?;
        stream.write_all(request).await?;
        let bound = socks5::read_frame(&mut stream, socks5::decode_reply).await?;
        log::trace!("socks5 server {} bound {bound}", self.server);
        Ok(stream)
    }
}

#[async_trait::async_trait]
impl ProxyConnector for SocksConnector {
    fn server_addr(&self) -> SocketAddr {
        self.server
    }

    async fn connect(&self, target: &ProxyTarget) -> std::io::Result<TcpStream> {
        // encoded up front: a target SOCKS5 cannot express never reaches the server
        let request = socks5::encode_request(Command::Connect, target).map_err(std::io::Error::other)?;
        match tokio::time::timeout(self.timeout, self.handshake(&request)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("socks5 server {} timed out for {target}", self.server),
            )),
        }
    }
}
