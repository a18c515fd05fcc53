use std::net::Ipv4Addr;

use smoltcp::wire::{IpAddress, UdpPacket};

use super::{PacketError, UDP_HEADER_LEN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload, as declared on the wire.
    pub length: u16,
    pub checksum: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        let packet = UdpPacket::new_checked(bytes).map_err(|_| PacketError::Malformed("UDP"))?;

        Ok(UdpHeader {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            length: packet.len(),
            checksum: packet.checksum(),
            payload: packet.payload(),
        })
    }

    pub fn new(src_port: u16, dst_port: u16, payload: &'a [u8]) -> Self {
        UdpHeader {
            src_port,
            dst_port,
            length: (UDP_HEADER_LEN + payload.len()) as u16,
            checksum: 0,
            payload,
        }
    }

    /// A zero checksum means the sender did not compute one.
    pub fn checksum_valid(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        let mut datagram = Vec::with_capacity(usize::from(self.length));
        self.encode(&mut datagram, self.checksum);
        UdpPacket::new_unchecked(&datagram[..])
            .verify_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst))
    }

    /// Appends the datagram to `out`. A computed checksum of zero is sent as `0xFFFF`.
    pub fn write_to(&self, src: Ipv4Addr, dst: Ipv4Addr, out: &mut Vec<u8>) {
        let start = out.len();
        self.encode(out, 0);
        UdpPacket::new_unchecked(&mut out[start..])
            .fill_checksum(&IpAddress::Ipv4(src), &IpAddress::Ipv4(dst));
    }

    fn encode(&self, out: &mut Vec<u8>, checksum: u16) {
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_datagram_verifies() {
        let src = Ipv4Addr::new(8, 8, 8, 8);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let mut bytes = Vec::new();
        UdpHeader::new(53, 40000, b"answer").write_to(src, dst, &mut bytes);

        let parsed = UdpHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.payload, b"answer");
        assert_ne!(parsed.checksum, 0);
        assert!(parsed.checksum_valid(src, dst));
        assert!(!parsed.checksum_valid(src, Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn length_field_bounds_payload() {
        let bytes = [0, 1, 0, 2, 0, 10, 0, 0, 1, 2, 3, 4];
        assert_eq!(UdpHeader::parse(&bytes).unwrap().payload, &[1, 2]);

        let short = [0, 1, 0, 2, 0, 4, 0, 0];
        assert_eq!(UdpHeader::parse(&short), Err(PacketError::Malformed("UDP")));

        let long = [0, 1, 0, 2, 0, 20, 0, 0, 1, 2];
        assert_eq!(UdpHeader::parse(&long), Err(PacketError::Malformed("UDP")));
    }
}
