//! SOCKS5 wire format (RFC 1928 subset: no authentication, CONNECT only).
//!
//! Decoders work on a byte slice and return the frame with the number of bytes it used.
//! [`Socks5Error::Incomplete`] tells the caller how many bytes the frame needs in total.

use crate::target::ProxyTarget;
use socks5_impl::protocol::{self, Address, AddressType, Response, StreamOperation};
use tokio::io::{AsyncRead, AsyncReadExt};

pub use socks5_impl::protocol::{Command, Reply};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

pub const MAX_DOMAIN_LEN: usize = 255;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("incomplete frame, {needed} bytes needed")]
    Incomplete { needed: usize },
    #[error("unsupported version {0:#04x}")]
    BadVersion(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("invalid domain name")]
    InvalidDomain,
    #[error("domain name of {0} bytes cannot be encoded")]
    DomainTooLong(usize),
    #[error("server refused the request with reply {0:#04x}")]
    Rejected(u8),
}

impl Socks5Error {
    /// The reply a server sends before closing, if the protocol has one for this error.
    pub fn reply(&self) -> Option<Reply> {
        match self {
            Socks5Error::UnsupportedCommand(_) => Some(Reply::CommandNotSupported),
            Socks5Error::UnsupportedAddressType(_) => Some(Reply::AddressTypeNotSupported),
            Socks5Error::InvalidDomain | Socks5Error::DomainTooLong(_) => Some(Reply::GeneralFailure),
            _ => None,
        }
    }
}

type Decoded<T> = Result<(T, usize), Socks5Error>;

fn need(buf: &[u8], needed: usize) -> Result<(), Socks5Error> {
    if buf.len() < needed {
        Err(Socks5Error::Incomplete { needed })
    } else {
        Ok(())
    }
}

fn check_version(buf: &[u8]) -> Result<(), Socks5Error> {
    match buf.first() {
        Some(&SOCKS5_VERSION) | None => Ok(()),
        Some(&v) => Err(Socks5Error::BadVersion(v)),
    }
}

impl From<Address> for ProxyTarget {
    fn from(address: Address) -> Self {
        match address {
            Address::SocketAddress(addr) => ProxyTarget::Ip(addr),
            Address::DomainAddress(host, port) => ProxyTarget::Domain(host.into(), port),
        }
    }
}

fn address_of(target: &ProxyTarget) -> Result<Address, Socks5Error> {
    match target {
        ProxyTarget::Ip(addr) => Ok(Address::from(*addr)),
        ProxyTarget::Domain(host, _) if host.is_empty() => Err(Socks5Error::InvalidDomain),
        ProxyTarget::Domain(host, _) if host.len() > MAX_DOMAIN_LEN => Err(Socks5Error::DomainTooLong(host.len())),
        ProxyTarget::Domain(host, port) => Ok(Address::from((host.clone(), *port))),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    /// No authentication if offered, otherwise "no acceptable methods".
    pub fn select_method(&self) -> u8 {
        if self.methods.contains(&METHOD_NO_AUTH) {
            METHOD_NO_AUTH
        } else {
            METHOD_NO_ACCEPTABLE
        }
    }
}

pub fn decode_greeting(buf: &[u8]) -> Decoded<Greeting> {
    check_version(buf)?;
    need(buf, 2)?;
    let len = 2 + buf[1] as usize;
    need(buf, len)?;
    let methods = buf[2..len].to_vec();
    Ok((Greeting { methods }, len))
}

pub fn encode_method_selection(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: ProxyTarget,
}

/// Decodes the type byte at `buf[at]` with the address and port after it; returns the address and the end offset.
fn decode_address(buf: &[u8], at: usize) -> Result<(ProxyTarget, usize), Socks5Error> {
    need(buf, at + 1)?;
    let atyp = buf[at];
    let address_type = AddressType::try_from(atyp).map_err(|_| Socks5Error::UnsupportedAddressType(atyp))?;
    let end = match address_type {
        AddressType::IPv4 => at + 1 + 4 + 2,
        AddressType::IPv6 => at + 1 + 16 + 2,
        AddressType::Domain => {
            need(buf, at + 2)?;
            at + 2 + buf[at + 1] as usize + 2
        }
    };
    need(buf, end)?;
    if matches!(address_type, AddressType::Domain) && buf[at + 1] == 0 {
        return Err(Socks5Error::InvalidDomain);
    }
    let address = Address::retrieve_from_stream(&mut &buf[at..end]).map_err(|_| Socks5Error::InvalidDomain)?;
    Ok((address.into(), end))
}

/// Decodes a client request. Only CONNECT is accepted; the reserved byte is ignored.
///
/// The whole frame is consumed before the command is checked, so a rejected request
/// leaves no unread bytes behind.
pub fn decode_request(buf: &[u8]) -> Decoded<Request> {
    check_version(buf)?;
    need(buf, 4)?;
    let (target, len) = decode_address(buf, 3)?;
    match Command::try_from(buf[1]) {
        Ok(Command::Connect) => Ok((
            Request {
                command: Command::Connect,
                target,
            },
            len,
        )),
        _ => Err(Socks5Error::UnsupportedCommand(buf[1])),
    }
}

/// A reply with the placeholder bound address `0.0.0.0:0`.
pub fn encode_reply(reply: Reply) -> Vec<u8> {
    let response = Response::new(reply, Address::unspecified());
    let mut buf = Vec::with_capacity(response.len());
    response.write_to_buf(&mut buf);
    buf
}

pub fn encode_greeting(methods: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(SOCKS5_VERSION);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);
    buf
}

/// Decodes the server's method selection, which must be "no authentication".
pub fn decode_method_selection(buf: &[u8]) -> Decoded<u8> {
    check_version(buf)?;
    need(buf, 2)?;
    match buf[1] {
        METHOD_NO_AUTH => Ok((METHOD_NO_AUTH, 2)),
        _ => Err(Socks5Error::NoAcceptableMethod),
    }
}

pub fn encode_request(command: Command, target: &ProxyTarget) -> Result<Vec<u8>, Socks5Error> {
    let request = protocol::Request::new(command, address_of(target)?);
    let mut buf = Vec::with_capacity(request.len());
    request.write_to_buf(&mut buf);
    Ok(buf)
}

/// Decodes a server reply, consuming its variable-length bound address.
pub fn decode_reply(buf: &[u8]) -> Decoded<ProxyTarget> {
    check_version(buf)?;
    need(buf, 4)?;
    if buf[1] != u8::from(Reply::Succeeded) {
        return Err(Socks5Error::Rejected(buf[1]));
    }
    decode_address(buf, 3)
}

/// Reads exactly one frame from `stream`, never consuming bytes past it.
pub async fn read_frame<S, T, F>(stream: &mut S, decode: F) -> crate::Result<T>
where
    S: AsyncRead + Unpin + ?Sized,
    F: Fn(&[u8]) -> Decoded<T>,
{
    let mut buf = Vec::with_capacity(32);
    loop {
        match decode(&buf) {
            Ok((frame, _)) => return Ok(frame),
            Err(Socks5Error::Incomplete { needed }) => {
                let start = buf.len();
                buf.resize(needed, 0);
                stream.read_exact(&mut buf[start..]).await?;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
