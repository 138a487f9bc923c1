//! Turns the TCP flows read from a tun device into proxy tunnels and writes the
//! tunnels' return bytes back to the device as IPv4/TCP segments.
//!
//! Only what the local stack needs to see a well-behaved peer is implemented:
//! in-order delivery with cumulative ACKs, sequence tracking for the return
//! direction, and respect for the client's receive window. Segments beyond a
//! gap are dropped and left to the client's retransmission.

use crate::{
    error::Result,
    flow_table::{Flow, FlowKey, FlowState, FlowTable, FlowTableError, InboundSegment},
    packet::{self, TCP_IPV4_OVERHEAD, TcpFlags, TcpHeader, TcpSegment, Transport},
    proxy_handler::ProxyConnector,
    relay::{self, DRAIN_TIMEOUT},
    target::ProxyTarget,
};
use std::{
    hash::{BuildHasher, RandomState},
    net::{SocketAddr, SocketAddrV4},
    pin::{Pin, pin},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker, ready},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::{CancellationToken, PollSender};

const PACKET_QUEUE: usize = 256;
const FLOW_QUEUE: usize = 64;
/// Assumed when the client's SYN carries no MSS option (RFC 9293).
const DEFAULT_CLIENT_MSS: u16 = 536;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub mtu: u16,
    /// Bound on opening a tunnel through the upstream proxy.
    pub connect_timeout: Duration,
    /// A flow without client segments for this long is reset.
    pub tcp_timeout: Duration,
    pub max_sessions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            connect_timeout: Duration::from_secs(5),
            tcp_timeout: Duration::from_secs(600),
            max_sessions: 200,
        }
    }
}

impl EngineConfig {
    fn mss(&self) -> u16 {
        self.mtu.saturating_sub(TCP_IPV4_OVERHEAD as u16)
    }
}

pub struct Engine {
    connector: Arc<dyn ProxyConnector>,
    config: EngineConfig,
    table: Arc<FlowTable>,
}

impl Engine {
    pub fn new(connector: Arc<dyn ProxyConnector>, config: EngineConfig) -> Self {
        let table = Arc::new(FlowTable::new(config.max_sessions));
        Self { connector, config, table }
    }

    pub fn flow_table(&self) -> Arc<FlowTable> {
        self.table.clone()
    }

    /// Processes packets from `device` until it reaches end of stream or `shutdown_token` fires.
    ///
    /// All flows are torn down before this returns.
    pub async fn run<D>(self, device: D, shutdown_token: CancellationToken) -> Result<()>
    where
        D: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mtu = self.config.mtu as usize;
        if mtu <= TCP_IPV4_OVERHEAD {
            return Err(format!("mtu {mtu} is too small").into());
        }

        let (mut device_reader, device_writer) = tokio::io::split(device);
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE);
        let writer = tokio::spawn(write_packets(device_writer, packet_rx));
        let mut flows = JoinSet::new();
        let mut buf = vec![0u8; mtu];
        log::info!("tun engine started, mtu {mtu}, upstream proxy {}", self.connector.server_addr());

        let result = loop {
            let n = tokio::select! {
                _ = shutdown_token.cancelled() => break Ok(()),
                Some(res) = flows.join_next(), if !flows.is_empty() => {
                    if let Err(err) = res {
                        log::error!("flow task failed: {err}");
                    }
                    continue;
                }
                res = device_reader.read(&mut buf) => match res {
                    Ok(0) => {
                        log::info!("tun device closed");
                        break Ok(());
                    }
                    Ok(n) => n,
                    Err(err) => break Err(err),
                },
            };
            self.dispatch(&buf[..n], &packet_tx, &mut flows, &shutdown_token);
        };

        let active = self.table.len();
        self.table.clear();
        while flows.join_next().await.is_some() {}
        drop(packet_tx);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("tun writer failed: {err}"),
            Err(err) => log::error!("tun writer task failed: {err}"),
        }
        log::info!("tun engine stopped, {active} flows closed");
        Ok(result?)
    }

    fn dispatch(
        &self,
        buf: &[u8],
        packets: &mpsc::Sender<Vec<u8>>,
        flows: &mut JoinSet<()>,
        shutdown_token: &CancellationToken,
    ) {
        let parsed = match packet::parse_packet(buf) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::trace!("dropping packet: {err}");
                return;
            }
        };
        let (tcp, payload) = match parsed.transport {
            Transport::Tcp { header, payload } => (header, payload),
            Transport::Udp => {
                log::trace!("dropping UDP packet {} -> {}", parsed.ip.src, parsed.ip.dst);
                return;
            }
            Transport::Other(protocol) => {
                log::trace!("dropping {protocol} packet {} -> {}", parsed.ip.src, parsed.ip.dst);
                return;
            }
        };
        let key = FlowKey::new(
            SocketAddrV4::new(parsed.ip.src, tcp.src_port),
            SocketAddrV4::new(parsed.ip.dst, tcp.dst_port),
        );

        if tcp.flags.contains(TcpFlags::RST) {
            if self.table.remove(&key).is_some() {
                log::debug!("{key} reset by client");
            }
            return;
        }

        match self.table.lookup(&key) {
            None if tcp.flags.is_syn() => self.open_flow(key, &tcp, packets, flows, shutdown_token),
            None => log::trace!("{key} no flow, dropping {:?}", tcp.flags),
            Some(flow) if flow.state() == FlowState::Opening => {
                log::trace!("{key} still connecting, dropping {:?}", tcp.flags);
            }
            Some(flow) => {
                let segment = InboundSegment {
                    seq: tcp.seq,
                    ack: tcp.ack,
                    flags: tcp.flags,
                    window: tcp.window,
                    payload: payload.to_vec(),
                };
                if let Err(err) = flow.sender().try_send(segment) {
                    log::trace!("{key} dropping segment: {err}");
                }
            }
        }
    }

    fn open_flow(
        &self,
        key: FlowKey,
        syn: &TcpHeader,
        packets: &mpsc::Sender<Vec<u8>>,
        flows: &mut JoinSet<()>,
        shutdown_token: &CancellationToken,
    ) {
        let (sender, receiver) = mpsc::channel(FLOW_QUEUE);
        let cancel = shutdown_token.child_token();
        let flow = Flow::new(sender, cancel.clone());
        let id = flow.id();
        match self.table.insert(key, flow) {
            Ok(()) => {}
            Err(err @ FlowTableError::Full(_)) => {
                log::warn!("{key} refused: {err}");
                let refusal = TcpSegment::new(key.dst(), key.src(), 0, syn.seq.wrapping_add(1), TcpFlags::RST | TcpFlags::ACK);
                if let Ok(packet) = refusal.build() {
                    let _ = packets.try_send(packet);
                }
                return;
            }
            Err(err) => {
                log::trace!("{key} {err}");
                return;
            }
        }
        log::debug!("{key} opening through {}", self.connector.server_addr());

        let opener = FlowOpener {
            key,
            id,
            client_isn: syn.seq,
            client_window: syn.window,
            client_mss: syn.mss.unwrap_or(DEFAULT_CLIENT_MSS),
            table: self.table.clone(),
            connector: self.connector.clone(),
            packets: packets.clone(),
            config: self.config.clone(),
        };
        flows.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => log::debug!("{} closed", opener.key),
                _ = opener.run(receiver) => {}
            }
            opener.table.remove_generation(&opener.key, opener.id);
        });
    }
}

async fn write_packets<W>(mut writer: W, mut packets: mpsc::Receiver<Vec<u8>>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = packets.recv().await {
        writer.write_all(&packet).await?;
        writer.flush().await?;
    }
    Ok(())
}

fn initial_sequence(key: &FlowKey) -> u32 {
    RandomState::new().hash_one(key) as u32
}

/// True if `a` comes after `b` in sequence space.
fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Everything a flow task needs, owned so the task is `'static`.
struct FlowOpener {
    key: FlowKey,
    id: u64,
    client_isn: u32,
    client_window: u16,
    client_mss: u16,
    table: Arc<FlowTable>,
    connector: Arc<dyn ProxyConnector>,
    packets: mpsc::Sender<Vec<u8>>,
    config: EngineConfig,
}

enum Finish {
    Upstream(std::io::Result<u64>),
    Client(std::io::Result<()>),
}

impl FlowOpener {
    async fn run(&self, mut inbound: mpsc::Receiver<InboundSegment>) {
        let key = self.key;
        let target = ProxyTarget::Ip(SocketAddr::V4(key.dst()));
        let upstream = match tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&target)).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => {
                log::debug!("{key} connect failed: {err}");
                self.refuse().await;
                return;
            }
            Err(_) => {
                log::debug!("{key} connect timed out");
                self.refuse().await;
                return;
            }
        };

        let mss = Mss {
            local: self.config.mss(),
            client: self.client_mss,
        };
        let link = FlowLink::new(key, self.client_isn, initial_sequence(&key), self.client_window, self.packets.clone(), mss);
        if !self.table.set_state(&key, self.id, FlowState::Established) {
            return;
        }
        link.send_syn_ack().await;
        log::debug!("{key} established");

        let (mut upstream_reader, mut upstream_writer) = upstream.into_split();
        let mut tun_writer = TunSegmentWriter::new(link.clone());
        let mut return_leg = pin!(relay::copy_one_way(&mut upstream_reader, &mut tun_writer));
        let mut inbound_leg = pin!(link.forward_inbound(&mut upstream_writer, &mut inbound, self.config.tcp_timeout));

        let finish = tokio::select! {
            res = &mut return_leg => Finish::Upstream(res),
            res = &mut inbound_leg => Finish::Client(res),
        };
        match finish {
            Finish::Upstream(Ok(n)) => {
                log::debug!("{key} upstream closed after {n} bytes");
                // half-close: the client may keep sending until its own FIN, bounded by the idle timeout
                if let Err(err) = inbound_leg.await {
                    log::debug!("{key} resetting: {err}");
                    link.reset().await;
                }
            }
            Finish::Client(Ok(())) => match tokio::time::timeout(DRAIN_TIMEOUT, return_leg).await {
                Ok(Ok(n)) => log::debug!("{key} closed, {n} bytes returned"),
                Ok(Err(err)) => {
                    log::debug!("{key} resetting: {err}");
                    link.reset().await;
                }
                Err(_) => link.send_fin().await,
            },
            Finish::Upstream(Err(err)) | Finish::Client(Err(err)) => {
                log::debug!("{key} resetting: {err}");
                link.reset().await;
            }
        }
    }

    async fn refuse(&self) {
        let refusal = TcpSegment::new(
            self.key.dst(),
            self.key.src(),
            0,
            self.client_isn.wrapping_add(1),
            TcpFlags::RST | TcpFlags::ACK,
        );
        if let Ok(packet) = refusal.build() {
            let _ = self.packets.send(packet).await;
        }
    }
}

#[derive(Debug)]
struct SeqState {
    /// Next sequence number expected from the client, sent as our ACK.
    client_next: u32,
    /// Sequence number of our next byte.
    server_next: u32,
    client_acked: u32,
    client_window: u32,
    fin_sent: bool,
    write_waker: Option<Waker>,
}

#[derive(Clone, Copy, Debug)]
struct Mss {
    /// Advertised in our SYN-ACK.
    local: u16,
    /// From the client's SYN.
    client: u16,
}

impl Mss {
    /// Largest payload of a segment towards the client.
    fn send(self) -> u16 {
        self.local.min(self.client)
    }
}

/// Sequence state of one flow plus the queue towards the device writer.
#[derive(Clone)]
struct FlowLink {
    key: FlowKey,
    state: Arc<Mutex<SeqState>>,
    packets: mpsc::Sender<Vec<u8>>,
    mss: Mss,
}

impl FlowLink {
    fn new(key: FlowKey, client_isn: u32, server_isn: u32, client_window: u16, packets: mpsc::Sender<Vec<u8>>, mss: Mss) -> Self {
        let state = SeqState {
            client_next: client_isn.wrapping_add(1),
            server_next: server_isn.wrapping_add(1),
            client_acked: server_isn.wrapping_add(1),
            client_window: client_window as u32,
            fin_sent: false,
            write_waker: None,
        };
        Self {
            key,
            state: Arc::new(Mutex::new(state)),
            packets,
            mss,
        }
    }

    fn state(&self) -> MutexGuard<'_, SeqState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A segment towards the client carrying the current sequence and acknowledgment numbers.
    fn segment<'a>(&self, state: &SeqState, flags: TcpFlags) -> TcpSegment<'a> {
        TcpSegment::new(self.key.dst(), self.key.src(), state.server_next, state.client_next, flags)
    }

    async fn emit(&self, segment: TcpSegment<'_>) {
        match segment.build() {
            Ok(packet) => {
                if self.packets.send(packet).await.is_err() {
                    log::trace!("{} device writer gone", self.key);
                }
            }
            Err(err) => log::warn!("{} cannot build segment: {err}", self.key),
        }
    }

    async fn send_syn_ack(&self) {
        let segment = {
            let state = self.state();
            let mut segment = self.segment(&state, TcpFlags::SYN | TcpFlags::ACK);
            segment.seq = state.server_next.wrapping_sub(1);
            segment.mss(self.mss.local)
        };
        self.emit(segment).await;
    }

    async fn send_ack(&self) {
        let segment = self.segment(&self.state(), TcpFlags::ACK);
        self.emit(segment).await;
    }

    async fn send_fin(&self) {
        let segment = {
            let mut state = self.state();
            if state.fin_sent {
                return;
            }
            let segment = self.segment(&state, TcpFlags::FIN | TcpFlags::ACK);
            state.server_next = state.server_next.wrapping_add(1);
            state.fin_sent = true;
            segment
        };
        self.emit(segment).await;
    }

    async fn reset(&self) {
        let segment = self.segment(&self.state(), TcpFlags::RST | TcpFlags::ACK);
        self.emit(segment).await;
    }

    fn on_ack(&self, ack: u32, window: u16) {
        let mut state = self.state();
        if seq_after(ack, state.client_acked) && !seq_after(ack, state.server_next) {
            state.client_acked = ack;
        }
        state.client_window = window as u32;
        if let Some(waker) = state.write_waker.take() {
            waker.wake();
        }
    }

    /// Writes in-order client payload to `upstream` until the client's FIN, which is acknowledged
    /// after the upstream write side is shut down.
    async fn forward_inbound<W>(
        &self,
        upstream: &mut W,
        inbound: &mut mpsc::Receiver<InboundSegment>,
        idle_timeout: Duration,
    ) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let segment = match tokio::time::timeout(idle_timeout, inbound.recv()).await {
                Ok(Some(segment)) => segment,
                Ok(None) => return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "flow removed")),
                Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout")),
            };
            if segment.flags.contains(TcpFlags::SYN) {
                // the SYN-ACK was lost
                self.send_syn_ack().await;
                continue;
            }
            if segment.flags.contains(TcpFlags::ACK) {
                self.on_ack(segment.ack, segment.window);
            }

            let fin = segment.flags.contains(TcpFlags::FIN);
            let expected = self.state().client_next;
            let offset = expected.wrapping_sub(segment.seq) as i32;
            if offset < 0 {
                log::trace!("{} out of order segment, {} bytes ahead", self.key, -offset);
                if !segment.payload.is_empty() || fin {
                    self.send_ack().await;
                }
                continue;
            }

            let offset = offset as usize;
            let fresh = segment.payload.get(offset..).unwrap_or_default();
            if !fresh.is_empty() {
                upstream.write_all(fresh).await?;
                upstream.flush().await?;
                let mut state = self.state();
                state.client_next = expected.wrapping_add(fresh.len() as u32);
            }
            if fin && offset <= segment.payload.len() {
                {
                    let mut state = self.state();
                    state.client_next = state.client_next.wrapping_add(1);
                }
                upstream.shutdown().await?;
                self.send_ack().await;
                return Ok(());
            }
            if !segment.payload.is_empty() || fin {
                self.send_ack().await;
            }
        }
    }
}

/// Turns bytes written to it into data segments towards the client.
///
/// Writes block while the client's receive window is full. Shutting it down sends our FIN.
struct TunSegmentWriter {
    link: FlowLink,
    sender: PollSender<Vec<u8>>,
}

impl TunSegmentWriter {
    fn new(link: FlowLink) -> Self {
        let sender = PollSender::new(link.packets.clone());
        Self { link, sender }
    }
}

fn writer_closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tun device writer closed")
}

impl AsyncWrite for TunSegmentWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(writer_closed()));
        }
        let (packet, len) = {
            let mut state = this.link.state();
            let in_flight = state.server_next.wrapping_sub(state.client_acked);
            let window = state.client_window.saturating_sub(in_flight) as usize;
            if window == 0 {
                state.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            let len = buf.len().min(this.link.mss.send() as usize).min(window);
            let segment = this.link.segment(&state, TcpFlags::PSH | TcpFlags::ACK).payload(&buf[..len]);
            let packet = segment.build().map_err(std::io::Error::other)?;
            state.server_next = state.server_next.wrapping_add(len as u32);
            (packet, len)
        };
        if this.sender.send_item(packet).is_err() {
            return Poll::Ready(Err(writer_closed()));
        }
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if ready!(this.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(writer_closed()));
        }
        let packet = {
            let mut state = this.link.state();
            if state.fin_sent {
                return Poll::Ready(Ok(()));
            }
            let packet = this.link.segment(&state, TcpFlags::FIN | TcpFlags::ACK).build();
            state.server_next = state.server_next.wrapping_add(1);
            state.fin_sent = true;
            packet.map_err(std::io::Error::other)?
        };
        if this.sender.send_item(packet).is_err() {
            return Poll::Ready(Err(writer_closed()));
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: Mss = Mss {
        local: 1460,
        client: 1460,
    };

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_after(1, 0));
        assert!(seq_after(5, u32::MAX - 5));
        assert!(!seq_after(u32::MAX - 5, 5));
        assert!(!seq_after(7, 7));
    }

    #[test]
    fn mss_follows_mtu() {
        assert_eq!(EngineConfig::default().mss(), 1460);
        let config = EngineConfig {
            mtu: 576,
            ..Default::default()
        };
        assert_eq!(config.mss(), 536);
    }

    #[test]
    fn segments_use_the_smaller_mss() {
        let mss = Mss { local: 1460, client: 536 };
        assert_eq!(mss.send(), 536);
        let mss = Mss { local: 1360, client: 1460 };
        assert_eq!(mss.send(), 1360);
    }

    #[tokio::test]
    async fn inbound_trims_retransmits_and_drops_gaps() {
        let key = FlowKey::new("10.0.0.2:40000".parse().unwrap(), "1.1.1.1:80".parse().unwrap());
        let (packets, mut emitted) = mpsc::channel(16);
        let link = FlowLink::new(key, 99, 5000, 65535, packets, MSS);
        let (segments, mut inbound) = mpsc::channel(16);
        let (mut upstream, mut far) = tokio::io::duplex(64);

        let segment = |seq: u32, flags: TcpFlags, payload: &[u8]| InboundSegment {
            seq,
            ack: 5001,
            flags,
            window: 65535,
            payload: payload.to_vec(),
        };
        let data = TcpFlags::PSH | TcpFlags::ACK;
        segments.send(segment(100, data, b"abc")).await.unwrap();
        segments.send(segment(101, data, b"bcde")).await.unwrap();
        segments.send(segment(110, data, b"zz")).await.unwrap();
        segments.send(segment(105, TcpFlags::FIN | TcpFlags::ACK, b"")).await.unwrap();

        link.forward_inbound(&mut upstream, &mut inbound, Duration::from_secs(5))
            .await
            .unwrap();
        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"abcde");

        let mut acks = Vec::new();
        while let Ok(packet) = emitted.try_recv() {
            let parsed = packet::parse_packet(&packet).unwrap();
            let Transport::Tcp { header, .. } = parsed.transport else {
                panic!("not a TCP packet");
            };
            assert_eq!(header.seq, 5001);
            acks.push(header.ack);
        }
        assert_eq!(acks, vec![103, 105, 105, 106]);
    }

    #[tokio::test]
    async fn idle_flow_times_out() {
        let key = FlowKey::new("10.0.0.2:40001".parse().unwrap(), "1.1.1.1:80".parse().unwrap());
        let (packets, _emitted) = mpsc::channel(4);
        let link = FlowLink::new(key, 1, 1, 65535, packets, MSS);
        let (_segments, mut inbound) = mpsc::channel::<InboundSegment>(4);
        let (mut upstream, _far) = tokio::io::duplex(64);
        let err = link
            .forward_inbound(&mut upstream, &mut inbound, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
