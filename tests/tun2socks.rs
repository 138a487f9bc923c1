use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tunrelay::{
    ProxyConnector, SocksConnector,
    flow_table::{FlowKey, FlowTable},
    packet::{self, Ipv4Header, TcpFlags, TcpHeader, TcpSegment, Transport},
    server::ServerConfig,
    socks_server,
    tun2socks::{Engine, EngineConfig},
    virtdevice::{VirtualTunDevice, VirtualTunHandle},
};

const CLIENT_ISN: u32 = 1000;

fn client_addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), port)
}

async fn echo_server() -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
        unreachable!()
    };
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let mut buf = [0u8; 1024];
                loop {
                    let n = reader.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    writer.write_all(&buf[..n]).await.unwrap();
                }
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

async fn socks_proxy(shutdown_token: CancellationToken) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(socks_server::run(listener, ServerConfig::default(), shutdown_token));
    addr
}

struct Harness {
    handle: VirtualTunHandle,
    table: Arc<FlowTable>,
    token: CancellationToken,
    engine: JoinHandle<tunrelay::Result<()>>,
    /// Receive window advertised on every client segment.
    window: u16,
}

impl Harness {
    async fn start(config: EngineConfig) -> Self {
        let token = CancellationToken::new();
        let proxy = socks_proxy(token.clone()).await;
        Self::with_proxy(proxy, config, token)
    }

    fn with_proxy(proxy: SocketAddr, config: EngineConfig, token: CancellationToken) -> Self {
        let connector: Arc<dyn ProxyConnector> = Arc::new(SocksConnector::new(proxy, Duration::from_secs(5)));
        let engine = Engine::new(connector, config);
        let table = engine.flow_table();
        let (device, handle) = VirtualTunDevice::new(64);
        let engine = tokio::spawn(engine.run(device, token.clone()));
        Self {
            handle,
            table,
            token,
            engine,
            window: u16::MAX,
        }
    }

    async fn send(&self, src: SocketAddrV4, dst: SocketAddrV4, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) {
        let packet = TcpSegment::new(src, dst, seq, ack, flags)
            .payload(payload)
            .window(self.window)
            .build()
            .unwrap();
        self.handle.inject_packet(&packet).await.unwrap();
    }

    async fn send_syn(&self, src: SocketAddrV4, dst: SocketAddrV4, isn: u32, window: u16) {
        self.send_syn_with_mss(src, dst, isn, window, 1460).await;
    }

    async fn send_syn_with_mss(&self, src: SocketAddrV4, dst: SocketAddrV4, isn: u32, window: u16, mss: u16) {
        let packet = TcpSegment::new(src, dst, isn, 0, TcpFlags::SYN).mss(mss).window(window).build().unwrap();
        self.handle.inject_packet(&packet).await.unwrap();
    }

    /// Next packet from the engine, with both checksums verified.
    async fn receive(&mut self) -> (Ipv4Header, TcpHeader, Vec<u8>) {
        let packet = tokio::time::timeout(Duration::from_secs(5), self.handle.exfiltrate_packet())
            .await
            .expect("no packet from the engine")
            .expect("engine closed the device");
        assert_eq!(packet::verify_checksums(&packet), Ok(true), "bad checksum");
        let parsed = packet::parse_packet(&packet).unwrap();
        let ip = parsed.ip;
        let Transport::Tcp { header, payload } = parsed.transport else {
            panic!("engine wrote a non-TCP packet");
        };
        (ip, header, payload.to_vec())
    }

    async fn receive_until<F>(&mut self, mut done: F) -> (Ipv4Header, TcpHeader, Vec<u8>)
    where
        F: FnMut(&TcpHeader, &[u8]) -> bool,
    {
        loop {
            let (ip, header, payload) = self.receive().await;
            if done(&header, &payload) {
                return (ip, header, payload);
            }
        }
    }

    async fn wait_for_empty_table(&self) {
        for _ in 0..100 {
            if self.table.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("flows left: {:?}", self.table.keys());
    }

    async fn stop(self) {
        self.token.cancel();
        self.engine.await.unwrap().unwrap();
    }
}

/// Completes the handshake and returns the engine's initial sequence number.
async fn establish(harness: &mut Harness, client: SocketAddrV4, server: SocketAddrV4, window: u16) -> u32 {
    harness.window = window;
    harness.send_syn(client, server, CLIENT_ISN, window).await;
    let (ip, syn_ack, payload) = harness.receive().await;
    assert_eq!(ip.src, *server.ip());
    assert_eq!(ip.dst, *client.ip());
    assert_eq!(syn_ack.src_port, server.port());
    assert_eq!(syn_ack.dst_port, client.port());
    assert!(syn_ack.flags.contains(TcpFlags::SYN | TcpFlags::ACK), "{:?}", syn_ack.flags);
    assert_eq!(syn_ack.ack, CLIENT_ISN + 1);
    assert!(payload.is_empty());
    let server_isn = syn_ack.seq;
    harness
        .send(client, server, CLIENT_ISN + 1, server_isn.wrapping_add(1), TcpFlags::ACK, &[])
        .await;
    server_isn
}

#[test_log::test(tokio::test)]
async fn echo_through_the_proxy_and_close() {
    let server = echo_server().await;
    let client = client_addr(40000);
    let mut harness = Harness::start(EngineConfig::default()).await;

    let server_isn = establish(&mut harness, client, server, 65535).await;
    assert_eq!(harness.table.len(), 1);

    let ack = server_isn.wrapping_add(1);
    harness
        .send(client, server, CLIENT_ISN + 1, ack, TcpFlags::PSH | TcpFlags::ACK, b"hello")
        .await;

    let mut acked_request = false;
    let mut echoed = Vec::new();
    while echoed.len() < 5 || !acked_request {
        let (_, header, payload) = harness.receive().await;
        assert!(!header.flags.contains(TcpFlags::RST));
        if header.ack == CLIENT_ISN + 6 {
            acked_request = true;
        }
        if !payload.is_empty() {
            assert_eq!(header.seq, ack.wrapping_add(echoed.len() as u32));
            echoed.extend_from_slice(&payload);
        }
    }
    assert_eq!(echoed, b"hello");

    let server_next = ack.wrapping_add(5);
    harness
        .send(client, server, CLIENT_ISN + 6, server_next, TcpFlags::FIN | TcpFlags::ACK, &[])
        .await;
    let (_, fin, _) = harness.receive_until(|header, _| header.flags.contains(TcpFlags::FIN)).await;
    assert_eq!(fin.seq, server_next);
    assert_eq!(fin.ack, CLIENT_ISN + 7);
    harness
        .send(client, server, CLIENT_ISN + 7, server_next.wrapping_add(1), TcpFlags::ACK, &[])
        .await;

    harness.wait_for_empty_table().await;
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn syn_opens_exactly_one_socks_tunnel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = listener.local_addr().unwrap();
    let (connected_tx, mut connected) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let connected_tx = connected_tx.clone();
            tokio::spawn(async move {
                let mut greeting = [0u8; 3];
                stream.read_exact(&mut greeting).await.unwrap();
                stream.write_all(&[5, 0]).await.unwrap();
                let mut request = [0u8; 10];
                stream.read_exact(&mut request).await.unwrap();
                stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
                connected_tx.send((greeting, request)).unwrap();
                // hold the tunnel open
                let mut rest = Vec::new();
                let _ = stream.read_to_end(&mut rest).await;
            });
        }
    });

    let mut harness = Harness::with_proxy(proxy, EngineConfig::default(), CancellationToken::new());
    let client = client_addr(40010);
    let target = SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 80);
    harness.send_syn(client, target, CLIENT_ISN, 65535).await;
    let (_, syn_ack, _) = harness.receive().await;
    assert!(syn_ack.flags.contains(TcpFlags::SYN | TcpFlags::ACK));
    harness.send_syn(client, target, CLIENT_ISN, 65535).await;
    harness.receive().await;

    let (greeting, request) = connected.recv().await.unwrap();
    assert_eq!(greeting, [5, 1, 0]);
    assert_eq!(request, [5, 1, 0, 1, 93, 184, 216, 34, 0, 80]);
    assert_eq!(harness.table.keys(), vec![FlowKey::new(client, target)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connected.try_recv().is_err(), "a second tunnel was opened");
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn repeated_syn_keeps_a_single_flow() {
    let server = echo_server().await;
    let client = client_addr(40001);
    let mut harness = Harness::start(EngineConfig::default()).await;

    harness.send_syn(client, server, CLIENT_ISN, 65535).await;
    let (_, first, _) = harness.receive().await;
    harness.send_syn(client, server, CLIENT_ISN, 65535).await;
    let (_, second, _) = harness.receive().await;

    assert!(second.flags.contains(TcpFlags::SYN | TcpFlags::ACK));
    assert_eq!(first.seq, second.seq);
    assert_eq!(second.ack, CLIENT_ISN + 1);
    assert_eq!(harness.table.len(), 1);
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn unreachable_target_is_reset() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(server) = closed.local_addr().unwrap() else {
        unreachable!()
    };
    drop(closed);
    let client = client_addr(40002);
    let mut harness = Harness::start(EngineConfig::default()).await;

    harness.send_syn(client, server, CLIENT_ISN, 65535).await;
    let (_, reset, _) = harness.receive().await;
    assert!(reset.flags.contains(TcpFlags::RST | TcpFlags::ACK));
    assert_eq!(reset.ack, CLIENT_ISN + 1);
    assert_eq!(reset.dst_port, client.port());

    harness.wait_for_empty_table().await;
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn full_table_resets_new_flows() {
    let server = echo_server().await;
    let config = EngineConfig {
        max_sessions: 1,
        ..Default::default()
    };
    let mut harness = Harness::start(config).await;

    establish(&mut harness, client_addr(40003), server, 65535).await;
    harness.send_syn(client_addr(40004), server, CLIENT_ISN, 65535).await;
    let (_, reset, _) = harness.receive_until(|header, _| header.dst_port == 40004).await;
    assert!(reset.flags.contains(TcpFlags::RST));
    assert_eq!(reset.ack, CLIENT_ISN + 1);
    assert_eq!(harness.table.len(), 1);
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn client_reset_removes_the_flow() {
    let server = echo_server().await;
    let client = client_addr(40005);
    let mut harness = Harness::start(EngineConfig::default()).await;

    let server_isn = establish(&mut harness, client, server, 65535).await;
    assert_eq!(harness.table.len(), 1);
    harness
        .send(client, server, CLIENT_ISN + 1, server_isn.wrapping_add(1), TcpFlags::RST, &[])
        .await;
    harness.wait_for_empty_table().await;
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn same_four_tuple_opens_a_fresh_flow() {
    let server = echo_server().await;
    let client = client_addr(40009);
    let mut harness = Harness::start(EngineConfig::default()).await;

    let first_isn = establish(&mut harness, client, server, 65535).await;
    harness
        .send(client, server, CLIENT_ISN + 1, first_isn.wrapping_add(1), TcpFlags::RST, &[])
        .await;
    harness.wait_for_empty_table().await;

    let second_isn = establish(&mut harness, client, server, 65535).await;
    assert_eq!(harness.table.len(), 1);
    let ack = second_isn.wrapping_add(1);
    harness
        .send(client, server, CLIENT_ISN + 1, ack, TcpFlags::PSH | TcpFlags::ACK, b"again")
        .await;
    let (_, echo, payload) = harness.receive_until(|_, payload| !payload.is_empty()).await;
    assert_eq!(payload, b"again");
    assert_eq!(echo.seq, ack);
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn same_four_tuple_reopens_after_fin_close() {
    let server = echo_server().await;
    let client = client_addr(40011);
    let mut harness = Harness::start(EngineConfig::default()).await;

    let first_isn = establish(&mut harness, client, server, 65535).await;
    assert_eq!(harness.table.len(), 1);
    let server_next = first_isn.wrapping_add(1);
    harness
        .send(client, server, CLIENT_ISN + 1, server_next, TcpFlags::FIN | TcpFlags::ACK, &[])
        .await;
    let (_, fin, _) = harness.receive_until(|header, _| header.flags.contains(TcpFlags::FIN)).await;
    assert_eq!(fin.seq, server_next);
    assert_eq!(fin.ack, CLIENT_ISN + 2);
    harness
        .send(client, server, CLIENT_ISN + 2, server_next.wrapping_add(1), TcpFlags::ACK, &[])
        .await;
    assert!(harness.table.len() <= 1);
    harness.wait_for_empty_table().await;
    while harness.handle.try_exfiltrate_packet().is_some() {}

    let second_isn = establish(&mut harness, client, server, 65535).await;
    assert_eq!(harness.table.len(), 1);
    let ack = second_isn.wrapping_add(1);
    harness
        .send(client, server, CLIENT_ISN + 1, ack, TcpFlags::PSH | TcpFlags::ACK, &[120, 50])
        .await;
    let (_, echo, payload) = harness.receive_until(|_, payload| !payload.is_empty()).await;
    assert_eq!(payload, [120, 50]);
    assert_eq!(echo.seq, ack);
    assert_eq!(harness.table.len(), 1);
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn return_segments_respect_the_client_mss() {
    let server = echo_server().await;
    let client = client_addr(40012);
    let mut harness = Harness::start(EngineConfig::default()).await;

    harness.send_syn_with_mss(client, server, CLIENT_ISN, 65535, 536).await;
    let (_, syn_ack, _) = harness.receive().await;
    assert_eq!(syn_ack.mss, Some(1460));
    let first = syn_ack.seq.wrapping_add(1);
    harness
        .send(client, server, CLIENT_ISN + 1, first, TcpFlags::ACK, &[])
        .await;

    let request = vec![7u8; 1200];
    harness
        .send(client, server, CLIENT_ISN + 1, first, TcpFlags::PSH | TcpFlags::ACK, &request)
        .await;
    let mut echoed = Vec::new();
    while echoed.len() < request.len() {
        let (_, header, payload) = harness.receive().await;
        assert!(payload.len() <= 536, "segment of {} bytes", payload.len());
        if !payload.is_empty() {
            assert_eq!(header.seq, first.wrapping_add(echoed.len() as u32));
            echoed.extend_from_slice(&payload);
        }
    }
    assert_eq!(echoed, request);
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn return_data_waits_for_the_client_window() {
    let server = echo_server().await;
    let client = client_addr(40006);
    let mut harness = Harness::start(EngineConfig::default()).await;

    let server_isn = establish(&mut harness, client, server, 4).await;
    let first = server_isn.wrapping_add(1);
    harness
        .send(client, server, CLIENT_ISN + 1, first, TcpFlags::PSH | TcpFlags::ACK, b"abcdefgh")
        .await;

    let mut echoed = Vec::new();
    while echoed.len() < 4 {
        let (_, _, payload) = harness.receive().await;
        echoed.extend_from_slice(&payload);
    }
    assert_eq!(echoed, b"abcd");
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Some(packet) = harness.handle.try_exfiltrate_packet() {
        let parsed = packet::parse_packet(&packet).unwrap();
        let Transport::Tcp { payload, .. } = parsed.transport else {
            panic!("engine wrote a non-TCP packet");
        };
        assert!(payload.is_empty(), "data sent beyond the client window");
    }

    harness
        .send(client, server, CLIENT_ISN + 9, first.wrapping_add(4), TcpFlags::ACK, &[])
        .await;
    while echoed.len() < 8 {
        let (_, header, payload) = harness.receive().await;
        if !payload.is_empty() {
            assert_eq!(header.seq, first.wrapping_add(echoed.len() as u32));
            echoed.extend_from_slice(&payload);
        }
    }
    assert_eq!(echoed, b"abcdefgh");
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn non_tcp_and_malformed_packets_are_dropped() {
    let mut harness = Harness::start(EngineConfig::default()).await;

    let mut udp = TcpSegment::new(client_addr(40007), client_addr(53), 1, 0, TcpFlags::SYN).build().unwrap();
    udp[9] = 17;
    harness.handle.inject_packet(&udp).await.unwrap();
    harness.handle.inject_packet(&[0x60, 0, 0, 0]).await.unwrap();
    harness
        .send(client_addr(40008), client_addr(80), 5, 0, TcpFlags::ACK, b"stray")
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.handle.try_exfiltrate_packet().is_none());
    assert!(harness.table.is_empty());
    harness.stop().await;
}

#[test_log::test(tokio::test)]
async fn device_close_stops_the_engine() {
    let harness = Harness::start(EngineConfig::default()).await;
    let Harness { handle, engine, .. } = harness;
    drop(handle);
    tokio::time::timeout(Duration::from_secs(5), engine).await.unwrap().unwrap().unwrap();
}
