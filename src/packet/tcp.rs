use std::{fmt, net::Ipv4Addr};

use smoltcp::wire::{IpAddress, TcpPacket};

use super::PacketError;

const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;
const OPTION_MSS: u8 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn ack_only() -> Self {
        Self {
            ack: true,
            ..Default::default()
        }
    }

    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn rst_only() -> Self {
        Self {
            rst: true,
            ..Default::default()
        }
    }

    pub fn rst_ack() -> Self {
        Self {
            rst: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn psh_ack() -> Self {
        Self {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            psh: byte & 0x08 != 0,
            ack: byte & 0x10 != 0,
            urg: byte & 0x20 != 0,
            ece: byte & 0x40 != 0,
            cwr: byte & 0x80 != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        [
            self.fin, self.syn, self.rst, self.psh, self.ack, self.urg, self.ece, self.cwr,
        ]
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .fold(0, |byte, (bit, _)| byte | (1 << bit))
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.syn, "SYN"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.ack, "ACK"),
            (self.urg, "URG"),
        ];
        let mut first = true;
        for (_, name) in names.iter().filter(|(set, _)| *set) {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}

/// A parsed TCP segment borrowing its options and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Data offset in bytes.
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> TcpHeader<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        let packet = TcpPacket::new_checked(bytes).map_err(|_| PacketError::Malformed("TCP"))?;

        Ok(TcpHeader {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq: packet.seq_number().0 as u32,
            ack: packet.ack_number().0 as u32,
            header_len: usize::from(packet.header_len()),
            flags: TcpFlags {
                fin: packet.fin(),
                syn: packet.syn(),
                rst: packet.rst(),
                psh: packet.psh(),
                ack: packet.ack(),
                urg: packet.urg(),
                ece: packet.ece(),
                cwr: packet.cwr(),
            },
            window: packet.window_len(),
            checksum: packet.checksum(),
            urgent_ptr: packet.urgent_at(),
            options: packet.options(),
            payload: packet.payload(),
        })
    }

    /// The maximum segment size option, if the segment carries one.
    pub fn mss(&self) -> Option<u16> {
        let mut options = self.options;
        while let Some((&kind, rest)) = options.split_first() {
            match kind {
                OPTION_END => return None,
                OPTION_NOP => options = rest,
                _ => {
                    let len = usize::from(*rest.first()?);
                    if len < 2 || len > options.len() {
                        return None;
                    }
                    if kind == OPTION_MSS && len == 4 {
                        return Some(u16::from_be_bytes([options[2], options[3]]));
                    }
                    options = &options[len..];
                }
            }
        }
        None
    }

    /// Sequence space consumed by this segment: payload plus one for each of SYN and FIN.
    pub fn sequence_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.flags.syn) + u32::from(self.flags.fin)
    }

    pub fn checksum_valid(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        let mut segment = Vec::with_capacity(self.header_len + self.payload.len());
        self.encode(&mut segment, self.checksum);
        TcpPacket::new_unchecked(&segment[..])
            .verify_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst))
    }

    /// Appends the segment to `out`, computing the checksum over the pseudo-header.
    pub fn write_to(&self, src: Ipv4Addr, dst: Ipv4Addr, out: &mut Vec<u8>) {
        let start = out.len();
        self.encode(out, 0);
        TcpPacket::new_unchecked(&mut out[start..])
            .fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst));
    }

    fn encode(&self, out: &mut Vec<u8>, checksum: u16) {
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.push(((self.header_len / 4) as u8) << 4);
        out.push(self.flags.to_byte());
        out.extend_from_slice(&self.window.to_be_bytes());
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&self.urgent_ptr.to_be_bytes());
        out.extend_from_slice(self.options);
        out.extend_from_slice(self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TCP_HEADER_LEN;

    #[test]
    fn flags_round_trip_every_bit() {
        for byte in 0..=u8::MAX {
            assert_eq!(TcpFlags::from_byte(byte).to_byte(), byte);
        }
        assert_eq!(TcpFlags::syn_ack().to_byte(), 0x12);
        assert_eq!(TcpFlags::syn_ack().to_string(), "SYN|ACK");
    }

    #[test]
    fn mss_option_is_found_after_padding() {
        let options = [OPTION_NOP, OPTION_NOP, 4, 2, OPTION_MSS, 4, 0x05, 0xB4];
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 0,
            header_len: TCP_HEADER_LEN + options.len(),
            flags: TcpFlags::default(),
            window: 0,
            checksum: 0,
            urgent_ptr: 0,
            options: &options,
            payload: &[],
        };
        assert_eq!(header.mss(), Some(1460));
    }

    #[test]
    fn malformed_options_yield_no_mss() {
        let options = [OPTION_MSS, 0, 0, 0];
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 0,
            header_len: 24,
            flags: TcpFlags::default(),
            window: 0,
            checksum: 0,
            urgent_ptr: 0,
            options: &options,
            payload: &[],
        };
        assert_eq!(header.mss(), None);
    }

    #[test]
    fn data_offset_outside_the_segment_is_rejected() {
        let mut bytes = [0u8; 20];
        bytes[12] = 0xF0;
        assert_eq!(TcpHeader::parse(&bytes), Err(PacketError::Malformed("TCP")));
        bytes[12] = 0x40;
        assert_eq!(TcpHeader::parse(&bytes), Err(PacketError::Malformed("TCP")));
        assert_eq!(
            TcpHeader::parse(&bytes[..12]),
            Err(PacketError::Malformed("TCP"))
        );
    }

    #[test]
    fn parse_reads_header_fields() {
        let options = [OPTION_MSS, 4, 0x05, 0xB4];
        let header = TcpHeader {
            src_port: 40000,
            dst_port: 443,
            seq: u32::MAX,
            ack: 0x8000_0001,
            header_len: TCP_HEADER_LEN + options.len(),
            flags: TcpFlags::syn_ack(),
            window: 1024,
            checksum: 0,
            urgent_ptr: 0,
            options: &options,
            payload: b"data",
        };
        let (src, dst) = (Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(1, 1, 1, 1));
        let mut bytes = Vec::new();
        header.write_to(src, dst, &mut bytes);

        let parsed = TcpHeader::parse(&bytes).unwrap();
        assert_eq!((parsed.src_port, parsed.dst_port), (40000, 443));
        assert_eq!((parsed.seq, parsed.ack), (u32::MAX, 0x8000_0001));
        assert_eq!(parsed.flags, TcpFlags::syn_ack());
        assert_eq!(parsed.mss(), Some(1460));
        assert_eq!(parsed.payload, b"data");
        assert!(parsed.checksum_valid(src, dst));
        assert!(!parsed.checksum_valid(src, Ipv4Addr::new(1, 1, 1, 2)));
    }
}
