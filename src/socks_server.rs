use crate::{
    error::{Error, Result},
    relay::relay_pair,
    server::{ServerConfig, accept_loop, linger_close},
    socks5::{self, METHOD_NO_ACCEPTABLE, Reply, Socks5Error},
    target::ProxyTarget,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

/// Runs a SOCKS5 server on `listener` until `shutdown_token` is cancelled.
pub async fn run(listener: TcpListener, config: ServerConfig, shutdown_token: CancellationToken) -> std::io::Result<()> {
    let config = Arc::new(config);
    let max_sessions = config.max_sessions;
    accept_loop("socks5", listener, max_sessions, shutdown_token, move |stream, peer, token| {
        let config = config.clone();
        async move { handle_client(stream, peer, &config, token).await }
    })
    .await
}

enum Negotiated {
    Connect(ProxyTarget),
    Refused(Socks5Error),
}

async fn handle_client(mut client: TcpStream, peer: SocketAddr, config: &ServerConfig, token: CancellationToken) -> Result<()> {
    let negotiated = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        res = tokio::time::timeout(config.handshake_timeout, negotiate(&mut client)) => match res {
            Ok(res) => res?,
            Err(_) => return Err(format!("handshake with {peer} timed out").into()),
        },
    };
    let target = match negotiated {
        Negotiated::Connect(target) => target,
        Negotiated::Refused(err) => {
            linger_close(client).await;
            return Err(err.into());
        }
    };

    let connected = tokio::select! {
        _ = token.cancelled() => return Ok(()),
        res = target.connect(config.connect_timeout) => res,
    };
    let outbound = match connected {
        Ok(outbound) => outbound,
        Err(err) => {
            log::debug!("socks5 {peer} connect to {target} failed: {err}");
            client.write_all(&socks5::encode_reply(Reply::ConnectionRefused)).await?;
            linger_close(client).await;
            return Ok(());
        }
    };
    client.write_all(&socks5::encode_reply(Reply::Succeeded)).await?;
    log::debug!("socks5 {peer} -> {target} established");

    let stats = relay_pair(client, outbound, token).await;
    log::debug!("socks5 {peer} -> {target} done, {} bytes up, {} bytes down", stats.a_to_b, stats.b_to_a);
    Ok(())
}

/// Server side of the handshake. Errors without a SOCKS5 reply close the connection silently.
async fn negotiate(client: &mut TcpStream) -> Result<Negotiated> {
    let greeting = socks5::read_frame(client, socks5::decode_greeting).await?;
    let method = greeting.select_method();
    client.write_all(&socks5::encode_method_selection(method)).await?;
    if method == METHOD_NO_ACCEPTABLE {
        return Ok(Negotiated::Refused(Socks5Error::NoAcceptableMethod));
    }

    match socks5::read_frame(client, socks5::decode_request).await {
        Ok(request) => Ok(Negotiated::Connect(request.target)),
        Err(Error::Socks5(err)) => match err.reply() {
            Some(reply) => {
                client.write_all(&socks5::encode_reply(reply)).await?;
                Ok(Negotiated::Refused(err))
            }
            None => Err(err.into()),
        },
        Err(err) => Err(err),
    }
}
