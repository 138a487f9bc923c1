use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Size of the single chunk in flight per direction.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// How long the remaining direction may run after its peer reached end of stream.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Copies `source` into `sink` until end of stream, then shuts the sink down.
///
/// Each chunk is written and flushed completely before the next read.
pub async fn copy_one_way<R, W>(source: &mut R, sink: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).await?;
        sink.flush().await?;
        total += n as u64;
    }
    sink.shutdown().await?;
    Ok(total)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Relays `a` and `b` in both directions until both directions are done.
///
/// An error in one direction ends the other immediately; end of stream gives it
/// [`DRAIN_TIMEOUT`] to finish. Cancelling `cancel` drops both streams.
pub async fn relay_pair<A, B>(a: A, b: B, cancel: CancellationToken) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_reader, mut a_writer) = tokio::io::split(a);
    let (mut b_reader, mut b_writer) = tokio::io::split(b);
    let a_to_b = copy_one_way(&mut a_reader, &mut b_writer);
    let b_to_a = copy_one_way(&mut b_reader, &mut a_writer);
    tokio::pin!(a_to_b, b_to_a);

    let mut stats = RelayStats::default();
    tokio::select! {
        _ = cancel.cancelled() => {
            log::trace!("relay cancelled");
        }
        res = &mut a_to_b => {
            let clean = record("a -> b", res, &mut stats.a_to_b);
            if let Some(res) = drain(&mut b_to_a, clean, &cancel).await {
                record("b -> a", res, &mut stats.b_to_a);
            }
        }
        res = &mut b_to_a => {
            let clean = record("b -> a", res, &mut stats.b_to_a);
            if let Some(res) = drain(&mut a_to_b, clean, &cancel).await {
                record("a -> b", res, &mut stats.a_to_b);
            }
        }
    }
    stats
}

fn record(direction: &str, res: std::io::Result<u64>, counter: &mut u64) -> bool {
    match res {
        Ok(n) => {
            *counter = n;
            true
        }
        Err(err) => {
            log::debug!("relay {direction} ended with error: {err}");
            false
        }
    }
}

async fn drain<F>(leg: F, clean: bool, cancel: &CancellationToken) -> Option<std::io::Result<u64>>
where
    F: std::future::Future<Output = std::io::Result<u64>>,
{
    if !clean {
        return None;
    }
    tokio::select! {
        _ = cancel.cancelled() => None,
        res = tokio::time::timeout(DRAIN_TIMEOUT, leg) => match res {
            Ok(res) => Some(res),
            Err(_) => {
                log::trace!("relay drain timed out");
                None
            }
        },
    }
}
