use std::{future::Future, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SOCKS5_LISTEN: &str = "0.0.0.0:1080";
pub const DEFAULT_HTTP_LISTEN: &str = "0.0.0.0:8080";

const LINGER_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings shared by the SOCKS5 and HTTP CONNECT servers.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bound on reading the client's request, before any outbound connect.
    pub handshake_timeout: Duration,
    /// Bound on the outbound connect to the requested target.
    pub connect_timeout: Duration,
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_sessions: 200,
        }
    }
}

/// Accepts connections until `shutdown_token` fires, running `handler` for each one in its own task.
///
/// Every handler gets a child token of `shutdown_token`. On shutdown the listener is closed first,
/// then all sessions are cancelled and awaited.
pub(crate) async fn accept_loop<H, F>(
    name: &'static str,
    listener: TcpListener,
    max_sessions: usize,
    shutdown_token: CancellationToken,
    handler: H,
) -> std::io::Result<()>
where
    H: Fn(TcpStream, SocketAddr, CancellationToken) -> F,
    F: Future<Output = crate::Result<()>> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    log::info!("{name} server listening on {local_addr}");

    let mut sessions = JoinSet::new();
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown_token.cancelled() => break,
            Some(res) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(err) = res {
                    log::error!("{name} session task failed: {err}");
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("{name} accept error: {err}");
                    continue;
                }
            },
        };

        if sessions.len() >= max_sessions {
            log::warn!("{name} server: too many sessions ({}), dropping {peer}", sessions.len());
            continue;
        }

        log::debug!("{name} session {peer} accepted");
        let session = handler(stream, peer, shutdown_token.child_token());
        sessions.spawn(async move {
            match session.await {
                Ok(()) => log::debug!("{name} session {peer} closed"),
                Err(err) => log::debug!("{name} session {peer} closed with error: {err}"),
            }
        });
    }

    drop(listener);
    let active = sessions.len();
    while sessions.join_next().await.is_some() {}
    log::info!("{name} server on {local_addr} stopped, {active} sessions closed");
    Ok(())
}

/// Closes after a final error reply: sends FIN, then discards unread client bytes for a moment
/// so the kernel does not answer them with a reset.
pub(crate) async fn linger_close<S>(mut stream: S)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    if stream.shutdown().await.is_err() {
        return;
    }
    let mut buf = [0u8; 512];
    let discard = async {
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(LINGER_TIMEOUT, discard).await;
}
