//! IPv4/TCP header parsing and construction of the TCP segments written back to the tun device.

use smoltcp::{
    phy::ChecksumCapabilities,
    wire::{IpAddress, Ipv4Packet, Ipv4Repr, TcpOption, TcpPacket, TcpSeqNumber},
};
use std::net::{Ipv4Addr, SocketAddrV4};

pub use smoltcp::wire::IpProtocol;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
/// IPv4 and TCP headers without options.
pub const TCP_IPV4_OVERHEAD: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;

const DEFAULT_TTL: u8 = 64;
const DEFAULT_WINDOW: u16 = 65535;
const MSS_OPTION_LEN: usize = 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("truncated or malformed {0} header")]
    Malformed(&'static str),
    #[error("not IPv4 (version {0})")]
    NotIpv4(u8),
    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),
    #[error("fragmented packet")]
    Fragmented,
    #[error("segment of {0} bytes exceeds the IPv4 limit")]
    TooLarge(usize),
}

#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// A connection request: SYN without ACK.
    pub fn is_syn(self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }

    fn of<T: AsRef<[u8]>>(tcp: &TcpPacket<T>) -> Self {
        [
            (tcp.fin(), Self::FIN),
            (tcp.syn(), Self::SYN),
            (tcp.rst(), Self::RST),
            (tcp.psh(), Self::PSH),
            (tcp.ack(), Self::ACK),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(TcpFlags::default(), |flags, (_, flag)| flags | flag)
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        const NAMES: [(TcpFlags, &str); 5] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
        ];
        let names: Vec<&str> = NAMES.iter().filter(|(flag, _)| self.contains(*flag)).map(|(_, n)| *n).collect();
        write!(f, "[{}]", names.join("|"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    /// Maximum segment size option, if the peer sent one.
    pub mss: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Transport<'a> {
    Tcp { header: TcpHeader, payload: &'a [u8] },
    Udp,
    Other(IpProtocol),
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub ip: Ipv4Header,
    pub transport: Transport<'a>,
}

/// Validates the IPv4 header at the start of `buf`; fragments are rejected.
fn parse_ipv4(buf: &[u8]) -> Result<Ipv4Packet<&[u8]>, PacketError> {
    let ip = Ipv4Packet::new_checked(buf).map_err(|_| PacketError::Malformed("IPv4"))?;
    if ip.version() != 4 {
        return Err(PacketError::NotIpv4(ip.version()));
    }
    let header_len = ip.header_len() as usize;
    if header_len < IPV4_HEADER_LEN {
        return Err(PacketError::BadHeaderLength(header_len));
    }
    if ip.more_frags() || ip.frag_offset() != 0 {
        return Err(PacketError::Fragmented);
    }
    Ok(ip)
}

fn mss_option(options: &[u8]) -> Option<u16> {
    let mut options = options;
    while !options.is_empty() {
        let (rest, option) = TcpOption::parse(options).ok()?;
        match option {
            TcpOption::EndOfList => break,
            TcpOption::MaxSegmentSize(mss) => return Some(mss),
            _ => {}
        }
        options = rest;
    }
    None
}

fn parse_tcp(segment: &[u8]) -> Result<(TcpHeader, &[u8]), PacketError> {
    let tcp = TcpPacket::new_checked(segment).map_err(|_| PacketError::Malformed("TCP"))?;
    let header = TcpHeader {
        src_port: tcp.src_port(),
        dst_port: tcp.dst_port(),
        seq: tcp.seq_number().0 as u32,
        ack: tcp.ack_number().0 as u32,
        header_len: tcp.header_len() as usize,
        flags: TcpFlags::of(&tcp),
        window: tcp.window_len(),
        mss: mss_option(tcp.options()),
    };
    Ok((header, tcp.payload()))
}

/// Classifies a raw packet read from the tun device.
///
/// Bytes past the IPv4 total length (link padding) are ignored.
pub fn parse_packet(buf: &[u8]) -> Result<ParsedPacket<'_>, PacketError> {
    let packet = parse_ipv4(buf)?;
    let ip = Ipv4Header {
        header_len: packet.header_len() as usize,
        total_len: packet.total_len() as usize,
        ttl: packet.hop_limit(),
        protocol: packet.next_header(),
        src: Ipv4Addr::from(packet.src_addr()),
        dst: Ipv4Addr::from(packet.dst_addr()),
    };
    let transport = match ip.protocol {
        IpProtocol::Tcp => {
            let (header, payload) = parse_tcp(packet.payload())?;
            Transport::Tcp { header, payload }
        }
        IpProtocol::Udp => Transport::Udp,
        other => Transport::Other(other),
    };
    Ok(ParsedPacket { ip, transport })
}

/// Checks the IPv4 header checksum and, for TCP, the segment checksum over the pseudo header.
pub fn verify_checksums(buf: &[u8]) -> Result<bool, PacketError> {
    let ip = Ipv4Packet::new_checked(buf).map_err(|_| PacketError::Malformed("IPv4"))?;
    if !ip.verify_checksum() {
        return Ok(false);
    }
    if ip.next_header() != IpProtocol::Tcp {
        return Ok(true);
    }
    let tcp = TcpPacket::new_checked(ip.payload()).map_err(|_| PacketError::Malformed("TCP"))?;
    Ok(tcp.verify_checksum(&IpAddress::Ipv4(ip.src_addr()), &IpAddress::Ipv4(ip.dst_addr())))
}

/// An outgoing TCP segment. [`TcpSegment::build`] produces the full IPv4 packet with valid checksums.
#[derive(Clone, Debug)]
pub struct TcpSegment<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// Maximum segment size option, only meaningful on SYN segments.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, seq: u32, ack: u32, flags: TcpFlags) -> Self {
        Self {
            src,
            dst,
            seq,
            ack,
            flags,
            window: DEFAULT_WINDOW,
            mss: None,
            payload: &[],
        }
    }

    pub fn payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.mss = Some(mss);
        self
    }

    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn build(&self) -> Result<Vec<u8>, PacketError> {
        let options_len = if self.mss.is_some() { MSS_OPTION_LEN } else { 0 };
        let tcp_len = TCP_HEADER_LEN + options_len + self.payload.len();
        let total_len = IPV4_HEADER_LEN + tcp_len;
        if total_len > u16::MAX as usize {
            return Err(PacketError::TooLarge(total_len));
        }

        let src = *self.src.ip();
        let dst = *self.dst.ip();
        let ip_repr = Ipv4Repr {
            src_addr: src.into(),
            dst_addr: dst.into(),
            next_header: IpProtocol::Tcp,
            payload_len: tcp_len,
            hop_limit: DEFAULT_TTL,
        };
        let mut packet = vec![0u8; total_len];
        ip_repr.emit(&mut Ipv4Packet::new_unchecked(&mut packet[..]), &ChecksumCapabilities::default());

        let mut tcp = TcpPacket::new_unchecked(&mut packet[IPV4_HEADER_LEN..]);
        tcp.set_src_port(self.src.port());
        tcp.set_dst_port(self.dst.port());
        tcp.set_seq_number(TcpSeqNumber(self.seq as i32));
        tcp.set_ack_number(TcpSeqNumber(self.ack as i32));
        tcp.set_header_len((TCP_HEADER_LEN + options_len) as u8);
        tcp.clear_flags();
        tcp.set_fin(self.flags.contains(TcpFlags::FIN));
        tcp.set_syn(self.flags.contains(TcpFlags::SYN));
        tcp.set_rst(self.flags.contains(TcpFlags::RST));
        tcp.set_psh(self.flags.contains(TcpFlags::PSH));
        tcp.set_ack(self.flags.contains(TcpFlags::ACK));
        tcp.set_window_len(self.window);
        tcp.set_urgent_at(0);
        if let Some(mss) = self.mss {
            TcpOption::MaxSegmentSize(mss).emit(tcp.options_mut());
        }
        tcp.payload_mut().copy_from_slice(self.payload);
        tcp.fill_checksum(&IpAddress::Ipv4(src.into()), &IpAddress::Ipv4(dst.into()));
        Ok(packet)
    }
}
