use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::sync::PollSender;

/// In-memory stand-in for a tun interface.
///
/// Every read yields exactly one injected packet and every write is one outgoing
/// packet, the way a tun file descriptor behaves. Reads reach end of stream once
/// the [`VirtualTunHandle`] is dropped.
pub struct VirtualTunDevice {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: PollSender<Vec<u8>>,
}

/// The host side of a [`VirtualTunDevice`].
pub struct VirtualTunHandle {
    inject: mpsc::Sender<Vec<u8>>,
    exfiltrate: mpsc::Receiver<Vec<u8>>,
}

impl VirtualTunDevice {
    pub fn new(capacity: usize) -> (VirtualTunDevice, VirtualTunHandle) {
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, exfiltrate) = mpsc::channel(capacity);
        let device = VirtualTunDevice {
            inbound,
            outbound: PollSender::new(outbound),
        };
        (device, VirtualTunHandle { inject, exfiltrate })
    }
}

impl VirtualTunHandle {
    pub async fn inject_packet(&self, packet: &[u8]) -> std::io::Result<()> {
        self.inject
            .send(packet.to_vec())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "virtual device closed"))
    }

    /// Next packet written by the device owner, `None` once it has closed the device.
    pub async fn exfiltrate_packet(&mut self) -> Option<Vec<u8>> {
        self.exfiltrate.recv().await
    }

    pub fn try_exfiltrate_packet(&mut self) -> Option<Vec<u8>> {
        self.exfiltrate.try_recv().ok()
    }
}

impl AsyncRead for VirtualTunDevice {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if let Some(packet) = ready!(self.inbound.poll_recv(cx)) {
            // a short buffer truncates, as with a real tun read
            let n = packet.len().min(buf.remaining());
            buf.put_slice(&packet[..n]);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for VirtualTunDevice {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let closed = || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "virtual device handle dropped");
        if ready!(self.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(closed()));
        }
        if self.outbound.send_item(buf.to_vec()).is_err() {
            return Poll::Ready(Err(closed()));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.outbound.close();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn packets_keep_their_boundaries() {
        let (mut device, mut handle) = VirtualTunDevice::new(8);
        handle.inject_packet(&[1, 2, 3]).await.unwrap();
        handle.inject_packet(&[4, 5]).await.unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(device.read(&mut buf).await.unwrap(), 3);
        assert_eq!(device.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);

        device.write_all(&[9, 9, 9, 9]).await.unwrap();
        device.write_all(&[7]).await.unwrap();
        assert_eq!(handle.exfiltrate_packet().await.unwrap(), vec![9, 9, 9, 9]);
        assert_eq!(handle.exfiltrate_packet().await.unwrap(), vec![7]);
        assert!(handle.try_exfiltrate_packet().is_none());
    }

    #[tokio::test]
    async fn dropping_the_handle_ends_reads() {
        let (mut device, handle) = VirtualTunDevice::new(1);
        drop(handle);
        let mut buf = [0u8; 16];
        assert_eq!(device.read(&mut buf).await.unwrap(), 0);
        assert!(device.write_all(&[1]).await.is_err());
    }
}
