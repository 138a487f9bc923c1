use crate::{
    error::Result,
    relay::relay_pair,
    server::{ServerConfig, accept_loop, linger_close},
    target::ProxyTarget,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

pub const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const RESPONSE_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const RESPONSE_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

const MAX_LINE_LEN: usize = 8192;
const MAX_HEADER_LINES: usize = 64;

/// Runs an HTTP CONNECT proxy on `listener` until `shutdown_token` is cancelled.
pub async fn run(listener: TcpListener, config: ServerConfig, shutdown_token: CancellationToken) -> std::io::Result<()> {
    let config = Arc::new(config);
    let max_sessions = config.max_sessions;
    accept_loop("http", listener, max_sessions, shutdown_token, move |stream, peer, token| {
        let config = config.clone();
        async move { handle_client(stream, peer, &config, token).await }
    })
    .await
}

#[derive(Debug, PartialEq, Eq)]
pub enum RequestLineError {
    NotConnect(String),
    Malformed,
}

/// Parses `CONNECT host[:port] HTTP/1.x`.
pub fn parse_request_line(line: &str) -> std::result::Result<ProxyTarget, RequestLineError> {
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or(RequestLineError::Malformed)?;
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(RequestLineError::NotConnect(method.to_string()));
    }
    let authority = parts.next().ok_or(RequestLineError::Malformed)?;
    match parts.next() {
        Some(version) if version.starts_with("HTTP/1.") && parts.next().is_none() => {}
        _ => return Err(RequestLineError::Malformed),
    }
    ProxyTarget::parse_authority(authority).ok_or(RequestLineError::Malformed)
}

enum Head {
    Connect(ProxyTarget),
    BadRequest(String),
    Closed,
}

async fn handle_client(stream: TcpStream, peer: SocketAddr, config: &ServerConfig, token: CancellationToken) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let head = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        res = tokio::time::timeout(config.handshake_timeout, read_head(&mut reader)) => match res {
            Ok(res) => res?,
            Err(_) => return Err(format!("request from {peer} timed out").into()),
        },
    };
    let target = match head {
        Head::Connect(target) => target,
        Head::BadRequest(reason) => {
            log::debug!("http {peer}: {reason}");
            reader.write_all(RESPONSE_BAD_REQUEST).await?;
            linger_close(reader).await;
            return Ok(());
        }
        Head::Closed => return Ok(()),
    };

    let connected = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        res = target.connect(config.connect_timeout) => res,
    };
    let mut outbound = match connected {
        Ok(outbound) => outbound,
        Err(err) => {
            log::debug!("http {peer} connect to {target} failed: {err}");
            reader.write_all(RESPONSE_BAD_GATEWAY).await?;
            linger_close(reader).await;
            return Ok(());
        }
    };
    reader.write_all(RESPONSE_ESTABLISHED).await?;
    log::debug!("http {peer} -> {target} established");

    // bytes the client pipelined after the blank line belong to the tunnel
    let early = reader.buffer().to_vec();
    if !early.is_empty() {
        outbound.write_all(&early).await?;
    }
    let client = reader.into_inner();

    let stats = relay_pair(client, outbound, token).await;
    log::debug!(
        "http {peer} -> {target} done, {} bytes up, {} bytes down",
        stats.a_to_b + early.len() as u64,
        stats.b_to_a
    );
    Ok(())
}

async fn read_head(reader: &mut BufReader<TcpStream>) -> Result<Head> {
    let line = match read_line(reader).await? {
        Line::Text(line) => line,
        Line::Invalid(reason) => return Ok(Head::BadRequest(format!("request line {reason}"))),
        Line::Eof => return Ok(Head::Closed),
    };
    let target = match parse_request_line(&line) {
        Ok(target) => target,
        Err(RequestLineError::NotConnect(method)) => return Ok(Head::BadRequest(format!("unsupported method {method}"))),
        Err(RequestLineError::Malformed) => return Ok(Head::BadRequest(format!("malformed request line {line:?}"))),
    };

    for _ in 0..MAX_HEADER_LINES {
        match read_line(reader).await? {
            Line::Text(header) if header.is_empty() => return Ok(Head::Connect(target)),
            Line::Text(_) => {}
            Line::Invalid(reason) => return Ok(Head::BadRequest(format!("header line {reason}"))),
            Line::Eof => return Ok(Head::Closed),
        }
    }
    Ok(Head::BadRequest(format!("more than {MAX_HEADER_LINES} header lines")))
}

enum Line {
    Text(String),
    Invalid(&'static str),
    Eof,
}

/// Reads one line without its terminator.
async fn read_line(reader: &mut BufReader<TcpStream>) -> Result<Line> {
    let mut line = Vec::new();
    let n = reader.take(MAX_LINE_LEN as u64).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if line.last() != Some(&b'\n') {
        let reason = if n == MAX_LINE_LEN { "exceeds 8 KiB" } else { "is truncated" };
        return Ok(Line::Invalid(reason));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(line) => Ok(Line::Text(line)),
        Err(_) => Ok(Line::Invalid("is not UTF-8")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_lines() {
        assert_eq!(
            parse_request_line("CONNECT example.com:443 HTTP/1.1"),
            Ok(ProxyTarget::Domain("example.com".into(), 443))
        );
        assert_eq!(
            parse_request_line("CONNECT 10.0.0.9:22 HTTP/1.0"),
            Ok(ProxyTarget::Ip("10.0.0.9:22".parse().unwrap()))
        );
        assert_eq!(
            parse_request_line("CONNECT example.com HTTP/1.1"),
            Ok(ProxyTarget::Domain("example.com".into(), 443))
        );
        assert_eq!(
            parse_request_line("CONNECT example.com:abc HTTP/1.1"),
            Ok(ProxyTarget::Domain("example.com".into(), 443))
        );
    }

    #[test]
    fn rejected_lines() {
        assert_eq!(
            parse_request_line("GET http://example.com/ HTTP/1.1"),
            Err(RequestLineError::NotConnect("GET".into()))
        );
        assert_eq!(parse_request_line(""), Err(RequestLineError::Malformed));
        assert_eq!(parse_request_line("CONNECT"), Err(RequestLineError::Malformed));
        assert_eq!(parse_request_line("CONNECT example.com:443"), Err(RequestLineError::Malformed));
        assert_eq!(parse_request_line("CONNECT example.com:443 SPDY/3"), Err(RequestLineError::Malformed));
        assert_eq!(parse_request_line("CONNECT :443 HTTP/1.1"), Err(RequestLineError::Malformed));
    }
}
