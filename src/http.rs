use crate::{error::Result, proxy_handler::ProxyConnector, target::ProxyTarget};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

const MAX_RESPONSE_HEADERS: usize = 64;
const MAX_RESPONSE_HEAD_LEN: usize = 8192;

/// HTTP CONNECT client.
#[derive(Clone, Debug)]
pub struct HttpConnector {
    server: SocketAddr,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    async fn handshake(&self, target: &ProxyTarget) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.server).await?;
        let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;

        let head = read_response_head(&mut stream).await?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        if res.parse(&head)?.is_partial() {
            return Err(format!("incomplete response from {}", self.server).into());
        }
        match res.code {
            Some(200) => Ok(stream),
            code => Err(format!("http proxy {} answered CONNECT {target} with {code:?}", self.server).into()),
        }
    }
}

/// Reads up to and including the blank line, leaving tunnel bytes in the socket.
async fn read_response_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD_LEN {
            return Err("response head too large".into());
        }
        head.push(stream.read_u8().await?);
    }
    Ok(head)
}

#[async_trait::async_trait]
impl ProxyConnector for HttpConnector {
    fn server_addr(&self) -> SocketAddr {
        self.server
    }

    async fn connect(&self, target: &ProxyTarget) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(self.timeout, self.handshake(target)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("http proxy {} timed out for {target}", self.server),
            )),
        }
    }
}
