use std::{borrow::Cow, net::Ipv4Addr};

use smoltcp::wire::{IpProtocol, Ipv4Packet};

use super::{PacketError, IPV4_HEADER_LEN};

pub const FLAG_DONT_FRAGMENT: u8 = 0b010;
pub const FLAG_MORE_FRAGMENTS: u8 = 0b001;

const DEFAULT_TTL: u8 = 64;

const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;
/// Options with this bit set are repeated in every fragment.
const OPTION_COPIED: u8 = 0x80;

/// A parsed IPv4 datagram. `options` and `payload` borrow from the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header<'a> {
    /// Header length in bytes, options included.
    pub header_len: usize,
    pub tos: u8,
    pub total_len: u16,
    pub identification: u16,
    /// Don't-fragment and more-fragments bits.
    pub flags: u8,
    /// Offset in 8-byte units.
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub options: Cow<'a, [u8]>,
    pub payload: &'a [u8],
}

impl<'a> Ipv4Header<'a> {
    /// Parses a datagram. Bytes past `total_len` (link-layer padding) are ignored.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        let packet = Ipv4Packet::new_checked(bytes).map_err(|_| PacketError::Malformed("IPv4"))?;

        if packet.version() != 4 {
            return Err(PacketError::Version(packet.version()));
        }

        let header_len = usize::from(packet.header_len());
        if header_len < IPV4_HEADER_LEN {
            return Err(PacketError::HeaderLength(header_len));
        }

        let mut flags = 0;
        if packet.dont_frag() {
            flags |= FLAG_DONT_FRAGMENT;
        }
        if packet.more_frags() {
            flags |= FLAG_MORE_FRAGMENTS;
        }

        Ok(Ipv4Header {
            header_len,
            tos: (packet.dscp() << 2) | packet.ecn(),
            total_len: packet.total_len(),
            identification: packet.ident(),
            flags,
            fragment_offset: packet.frag_offset() / 8,
            ttl: packet.hop_limit(),
            protocol: packet.next_header().into(),
            checksum: packet.checksum(),
            src: packet.src_addr(),
            dst: packet.dst_addr(),
            options: Cow::Borrowed(&bytes[IPV4_HEADER_LEN..header_len]),
            payload: packet.payload(),
        })
    }

    /// A fresh, unfragmented header for an outbound datagram carrying `payload_len` bytes.
    pub fn outbound(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        identification: u16,
        payload_len: usize,
    ) -> Ipv4Header<'static> {
        Ipv4Header {
            header_len: IPV4_HEADER_LEN,
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            identification,
            flags: FLAG_DONT_FRAGMENT,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol,
            checksum: 0,
            src,
            dst,
            options: Cow::Borrowed(&[]),
            payload: &[],
        }
    }

    pub fn more_fragments(&self) -> bool {
        self.flags & FLAG_MORE_FRAGMENTS != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset != 0
    }

    /// Offset of this fragment's payload in bytes.
    pub fn fragment_byte_offset(&self) -> usize {
        usize::from(self.fragment_offset) * 8
    }

    pub fn checksum_valid(&self) -> bool {
        let mut header = Vec::with_capacity(self.header_len);
        self.encode_header(&mut header);
        let mut packet = Ipv4Packet::new_unchecked(&mut header[..]);
        packet.set_checksum(self.checksum);
        packet.verify_checksum()
    }

    /// Appends the header, with a freshly computed checksum, to `out`.
    pub fn write_header(&self, out: &mut Vec<u8>) {
        let start = out.len();
        self.encode_header(out);
        Ipv4Packet::new_unchecked(&mut out[start..]).fill_checksum();
    }

    /// Appends header and payload to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        self.write_header(out);
        out.extend_from_slice(self.payload);
    }

    /// Splits this datagram into fragments no larger than `mtu`. A datagram that already
    /// fits comes back unchanged. Only copied options are repeated past the first fragment.
    pub fn fragments(&self, mtu: usize) -> Vec<Ipv4Header<'a>> {
        if usize::from(self.total_len) <= mtu {
            return vec![self.clone()];
        }

        let later_options = copied_options(&self.options);
        let later_header_len = padded_header_len(later_options.len());

        // every fragment but the last carries a multiple of 8 bytes
        let first_len = ((mtu - self.header_len) / 8).max(1) * 8;
        let later_len = ((mtu - later_header_len) / 8).max(1) * 8;

        let mut fragments = Vec::new();
        let mut offset = 0;
        while offset < self.payload.len() {
            let first = offset == 0;
            let (header_len, chunk_len) = if first {
                (self.header_len, first_len)
            } else {
                (later_header_len, later_len)
            };
            let end = (offset + chunk_len).min(self.payload.len());
            let more = if end == self.payload.len() {
                self.flags & FLAG_MORE_FRAGMENTS
            } else {
                FLAG_MORE_FRAGMENTS
            };

            fragments.push(Ipv4Header {
                header_len,
                total_len: (header_len + end - offset) as u16,
                flags: more,
                fragment_offset: self.fragment_offset + (offset / 8) as u16,
                options: if first {
                    self.options.clone()
                } else {
                    Cow::Owned(later_options.clone())
                },
                payload: &self.payload[offset..end],
                ..self.clone()
            });
            offset = end;
        }
        fragments
    }

    /// Header bytes with a zero checksum. Options are zero-padded to `header_len`.
    fn encode_header(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.header_len, 0);

        let mut packet = Ipv4Packet::new_unchecked(&mut out[start..]);
        packet.set_version(4);
        packet.set_header_len(self.header_len as u8);
        packet.set_dscp(self.tos >> 2);
        packet.set_ecn(self.tos & 0x03);
        packet.set_total_len(self.total_len);
        packet.set_ident(self.identification);
        packet.clear_flags();
        packet.set_dont_frag(self.flags & FLAG_DONT_FRAGMENT != 0);
        packet.set_more_frags(self.more_fragments());
        packet.set_frag_offset(self.fragment_offset * 8);
        packet.set_hop_limit(self.ttl);
        packet.set_next_header(IpProtocol::from(self.protocol));
        packet.set_checksum(0);
        packet.set_src_addr(self.src);
        packet.set_dst_addr(self.dst);

        let options_len = self.options.len().min(self.header_len - IPV4_HEADER_LEN);
        let options_start = start + IPV4_HEADER_LEN;
        out[options_start..options_start + options_len]
            .copy_from_slice(&self.options[..options_len]);
    }
}

/// The options that must be repeated in non-first fragments. Parsing stops at end-of-list
/// or at a malformed length.
fn copied_options(options: &[u8]) -> Vec<u8> {
    let mut copied = Vec::new();
    let mut rest = options;
    while let Some((&kind, tail)) = rest.split_first() {
        let len = match kind {
            OPTION_END => break,
            OPTION_NOP => 1,
            _ => match tail.first() {
                Some(&len) if len >= 2 && usize::from(len) <= rest.len() => usize::from(len),
                _ => break,
            },
        };
        if kind & OPTION_COPIED != 0 {
            copied.extend_from_slice(&rest[..len]);
        }
        rest = &rest[len..];
    }
    copied
}

fn padded_header_len(options_len: usize) -> usize {
    IPV4_HEADER_LEN + options_len.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PROTOCOL_UDP;

    fn datagram(payload_len: usize) -> Vec<u8> {
        let payload = vec![0xAB; payload_len];
        let mut header = Ipv4Header::outbound(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            PROTOCOL_UDP,
            7,
            payload.len(),
        );
        header.payload = &payload;
        let mut out = Vec::new();
        header.write_to(&mut out);
        out
    }

    #[test]
    fn parse_reads_fields_and_checksum() {
        let bytes = datagram(12);
        let header = Ipv4Header::parse(&bytes).unwrap();
        assert_eq!(header.header_len, 20);
        assert_eq!(header.total_len, 32);
        assert_eq!(header.identification, 7);
        assert_eq!(header.flags, FLAG_DONT_FRAGMENT);
        assert_eq!(header.protocol, PROTOCOL_UDP);
        assert_eq!(header.payload.len(), 12);
        assert!(header.checksum_valid());
        assert!(!header.is_fragment());
        assert!(Ipv4Packet::new_checked(&bytes[..]).unwrap().verify_checksum());

        let mut rewritten = Vec::new();
        header.write_to(&mut rewritten);
        assert_eq!(rewritten, bytes);
    }

    #[test]
    fn corrupt_checksum_is_detected() {
        let mut bytes = datagram(4);
        bytes[10] ^= 0xFF;
        assert!(!Ipv4Header::parse(&bytes).unwrap().checksum_valid());
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            Ipv4Header::parse(&[0x45; 10]),
            Err(PacketError::Malformed("IPv4"))
        );

        let mut v6 = datagram(0);
        v6[0] = 0x65;
        assert_eq!(Ipv4Header::parse(&v6), Err(PacketError::Version(6)));

        let mut short_ihl = datagram(0);
        short_ihl[0] = 0x44;
        assert_eq!(
            Ipv4Header::parse(&short_ihl),
            Err(PacketError::HeaderLength(16))
        );

        let mut long = datagram(8);
        long[3] = 200;
        assert_eq!(
            Ipv4Header::parse(&long),
            Err(PacketError::Malformed("IPv4"))
        );
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let mut bytes = datagram(6);
        bytes.extend_from_slice(&[0; 10]);
        assert_eq!(Ipv4Header::parse(&bytes).unwrap().payload.len(), 6);
    }

    #[test]
    fn fragments_respect_mtu_and_alignment() {
        let bytes = datagram(3000);
        let header = Ipv4Header::parse(&bytes).unwrap();
        let fragments = header.fragments(1500);

        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| usize::from(f.total_len) <= 1500));
        assert_eq!(fragments[0].payload.len() % 8, 0);
        assert!(fragments[0].more_fragments() && fragments[1].more_fragments());
        assert!(!fragments[2].more_fragments());
        assert_eq!(fragments[1].fragment_byte_offset(), 1480);
        assert!(fragments.iter().all(|f| f.flags & FLAG_DONT_FRAGMENT == 0));

        let total: usize = fragments.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, 3000);
    }

    #[test]
    fn later_fragments_keep_only_copied_options() {
        // security (copied, len 4), record route (not copied, len 3), NOP
        let options = [0x82, 4, 0xAA, 0xBB, 0x07, 3, 4, OPTION_NOP];
        let payload = vec![0x11; 3000];
        let mut header = Ipv4Header::outbound(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            PROTOCOL_UDP,
            9,
            payload.len(),
        );
        header.header_len = IPV4_HEADER_LEN + options.len();
        header.total_len = (header.header_len + payload.len()) as u16;
        header.options = Cow::Borrowed(&options[..]);
        header.payload = &payload;

        let fragments = header.fragments(1500);
        assert_eq!(&fragments[0].options[..], &options);
        assert_eq!(fragments[0].header_len, 28);
        for fragment in &fragments[1..] {
            assert_eq!(&fragment.options[..], &options[..4]);
            assert_eq!(fragment.header_len, 24);
            assert!(usize::from(fragment.total_len) <= 1500);
        }

        let mut wire = Vec::new();
        fragments[1].write_to(&mut wire);
        let parsed = Ipv4Header::parse(&wire).unwrap();
        assert!(parsed.checksum_valid());
        assert_eq!(&parsed.options[..], &options[..4]);
        assert_eq!(parsed.fragment_byte_offset(), 1472);

        let total: usize = fragments.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, 3000);
    }

    #[test]
    fn copied_options_skip_local_ones() {
        assert_eq!(copied_options(&[0x07, 3, 4, 0x82, 4, 0, 0]), vec![0x82, 4, 0, 0]);
        assert_eq!(
            copied_options(&[OPTION_NOP, 0x83, 3, 1, OPTION_END, 0x82]),
            vec![0x83, 3, 1]
        );
        assert!(copied_options(&[0x82, 9, 0]).is_empty());
    }
}
