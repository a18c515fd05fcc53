//! IPv4, TCP and UDP wire formats, plus the builders for packets the gateway synthesizes.

use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

pub mod fragment;
mod ipv4;
mod tcp;
mod udp;

pub use fragment::{FragmentKey, FragmentTable};
pub use ipv4::{Ipv4Header, FLAG_DONT_FRAGMENT, FLAG_MORE_FRAGMENTS};
pub use tcp::{TcpFlags, TcpHeader};
pub use udp::UdpHeader;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;

const MSS_OPTION_LEN: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Invalid {0} header")]
    Malformed(&'static str),
    #[error("Unsupported IP version {0}")]
    Version(u8),
    #[error("Invalid header length {0}")]
    HeaderLength(usize),
    #[error("Fragment extends past the maximum datagram size")]
    Oversized,
}

/// A TCP segment the gateway sends to the client.
#[derive(Debug, Clone, Copy)]
pub struct OutboundTcp<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// Advertised only on SYN segments.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// Appends a complete IPv4+TCP packet to `out`.
pub fn build_tcp_packet(segment: &OutboundTcp<'_>, identification: u16, out: &mut Vec<u8>) {
    let mss = segment.mss.filter(|_| segment.flags.syn);
    let options = mss.map(|mss| {
        let [high, low] = mss.to_be_bytes();
        [2, MSS_OPTION_LEN as u8, high, low]
    });
    let options: &[u8] = match &options {
        Some(options) => options,
        None => &[],
    };

    let tcp = TcpHeader {
        src_port: segment.src.port(),
        dst_port: segment.dst.port(),
        seq: segment.seq,
        ack: segment.ack,
        header_len: TCP_HEADER_LEN + options.len(),
        flags: segment.flags,
        window: segment.window,
        checksum: 0,
        urgent_ptr: 0,
        options,
        payload: segment.payload,
    };

    let ip = Ipv4Header::outbound(
        *segment.src.ip(),
        *segment.dst.ip(),
        PROTOCOL_TCP,
        identification,
        tcp.header_len + tcp.payload.len(),
    );
    out.reserve(usize::from(ip.total_len));
    ip.write_header(out);
    tcp.write_to(*segment.src.ip(), *segment.dst.ip(), out);
}

/// Appends a complete IPv4+UDP packet to `out`. The result may exceed the MTU; see
/// [`Ipv4Header::fragments`].
pub fn build_udp_packet(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    identification: u16,
    payload: &[u8],
    out: &mut Vec<u8>,
) {
    let udp = UdpHeader::new(src.port(), dst.port(), payload);
    let mut ip = Ipv4Header::outbound(
        *src.ip(),
        *dst.ip(),
        PROTOCOL_UDP,
        identification,
        usize::from(udp.length),
    );
    // large responses must stay fragmentable
    ip.flags = 0;
    out.reserve(usize::from(ip.total_len));
    ip.write_header(out);
    udp.write_to(*src.ip(), *dst.ip(), out);
}

/// Destinations eligible when the engine runs in public-only mode: global unicast
/// addresses outside 10/8, 172.16/12 and 192.168.0/24.
pub fn is_public_destination(ip: Ipv4Addr) -> bool {
    let global_unicast = !(ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_loopback()
        || ip.is_multicast()
        || ip.is_link_local());

    let [a, b, c, _] = ip.octets();
    let private = a == 10 || (a == 172 && b & 0xF0 == 16) || (a == 192 && b == 168 && c == 0);

    global_unicast && !private
}
