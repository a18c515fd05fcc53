use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tokio::io::{AsyncRead, AsyncReadExt};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

impl AddressType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::Ipv6),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

/// Destination or bound address as it travels inside SOCKS5 messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksSocketAddr {
    pub port: u16,
    pub addr: Addr,
}

impl SocksSocketAddr {
    /// `0.0.0.0:0`, sent as DST in a UDP ASSOCIATE request when the client address is unknown.
    pub fn unspecified() -> Self {
        SocksSocketAddr {
            port: 0,
            addr: Addr::Ipv4(Ipv4Addr::UNSPECIFIED),
        }
    }

    /// Turns `Self` into: AddrType+ADDR+PORT
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(18);

        bytes.push(self.addr.addr_type().to_u8());

        match &self.addr {
            Addr::Ipv4(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Ipv6(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Domain(domain) => {
                let len = u8::try_from(domain.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "Domain name longer than 255 bytes")
                })?;
                bytes.push(len);
                bytes.extend_from_slice(domain.as_bytes())
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        Ok(bytes)
    }

    /// Reads AddrType+ADDR+PORT from `reader`.
    pub async fn read<R>(reader: &mut R) -> io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let addr_type = reader.read_u8().await?;
        let addr = match AddressType::from_u8(addr_type) {
            Some(AddressType::Ipv4) => {
                let mut octets = [0; 4];
                reader.read_exact(&mut octets).await?;
                Addr::Ipv4(Ipv4Addr::from(octets))
            }
            Some(AddressType::Ipv6) => {
                let mut octets = [0; 16];
                reader.read_exact(&mut octets).await?;
                Addr::Ipv6(Ipv6Addr::from(octets))
            }
            Some(AddressType::DomainName) => {
                let len = reader.read_u8().await?;
                let mut domain = vec![0; len as usize];
                reader.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "Domain was invalid utf8")
                })?;
                Addr::Domain(domain)
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Invalid address type {addr_type:#04x}"),
                ))
            }
        };
        let port = reader.read_u16().await?;

        Ok(SocksSocketAddr { port, addr })
    }

    /// Resolves the address, looking domain names up through the system resolver.
    pub async fn to_socket_addr(&self) -> io::Result<Vec<SocketAddr>> {
        match &self.addr {
            Addr::Ipv4(ip) => Ok(vec![SocketAddr::new(IpAddr::V4(*ip), self.port)]),
            Addr::Ipv6(ip) => Ok(vec![SocketAddr::new(IpAddr::V6(*ip), self.port)]),
            Addr::Domain(domain) => Ok(tokio::net::lookup_host((domain.as_str(), self.port))
                .await?
                .collect()),
        }
    }
}

impl From<SocketAddr> for SocksSocketAddr {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(ipv4) => SocksSocketAddr {
                port: ipv4.port(),
                addr: Addr::Ipv4(*ipv4.ip()),
            },
            SocketAddr::V6(ipv6) => SocksSocketAddr {
                port: ipv6.port(),
                addr: Addr::Ipv6(*ipv6.ip()),
            },
        }
    }
}

impl fmt::Display for SocksSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Addr::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Addr::Domain(domain) => write!(f, "{}:{}", domain, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Addr {
    pub fn addr_type(&self) -> AddressType {
        match self {
            Addr::Ipv4(_) => AddressType::Ipv4,
            Addr::Ipv6(_) => AddressType::Ipv6,
            Addr::Domain(_) => AddressType::DomainName,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        match self {
            Addr::Ipv4(ip) => ip.is_unspecified(),
            Addr::Ipv6(ip) => ip.is_unspecified(),
            Addr::Domain(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn reads_back_what_it_writes() {
        let addr = SocksSocketAddr {
            port: 443,
            addr: Addr::Domain("example.com".into()),
        };
        let bytes = addr.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes[1] as usize, "example.com".len());

        let parsed = SocksSocketAddr::read(&mut Cursor::new(bytes)).await.unwrap();
        assert_eq!(parsed, addr);
    }

    #[tokio::test]
    async fn rejects_unknown_address_type() {
        let err = SocksSocketAddr::read(&mut Cursor::new(vec![0x02, 1, 2, 3, 4, 0, 80]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn long_domain_cannot_be_encoded() {
        let addr = SocksSocketAddr {
            port: 80,
            addr: Addr::Domain("a".repeat(256)),
        };
        assert!(addr.to_bytes().is_err());
    }
}
