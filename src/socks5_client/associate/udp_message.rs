use std::io::{self, Cursor};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::{SocksSocketAddr, RESERVED_16};

/// A SOCKS5 UDP request header plus its payload.
///
/// Over a UDP relay the RSV field is zero. Over the UDP-over-TCP tunnel, datagrams share
/// one byte stream, so RSV carries the payload length instead.
#[derive(Debug)]
pub struct UdpMessage<'a> {
    pub fragment_number: u8,
    pub dst: SocksSocketAddr,
    pub data: &'a [u8],
}

impl<'a> UdpMessage<'a> {
    pub fn as_bytes(&self) -> io::Result<Vec<u8>> {
        self.encode(RESERVED_16)
    }

    pub fn as_tunnel_frame(&self) -> io::Result<Vec<u8>> {
        let len = u16::try_from(self.data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "Datagram too large to tunnel")
        })?;
        self.encode(len)
    }

    fn encode(&self, reserved: u16) -> io::Result<Vec<u8>> {
        let mut res: Vec<u8> = Vec::with_capacity(self.data.len() + 32);
        res.extend_from_slice(&reserved.to_be_bytes());
        res.push(self.fragment_number);
        res.extend(self.dst.to_bytes()?);
        res.extend_from_slice(self.data);
        Ok(res)
    }

    pub async fn parse(buf: &'a [u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(buf);

        let reserved = cursor.read_u16().await?;
        if reserved != RESERVED_16 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Reserved bytes need to be zero but weren't",
            ));
        }

        let fragment_number = cursor.read_u8().await?;
        let dst = SocksSocketAddr::read(&mut cursor).await?;

        let data = &buf[cursor.position() as usize..];
        Ok(UdpMessage {
            fragment_number,
            dst,
            data,
        })
    }
}

/// Reads one tunnel frame, returning `None` on a clean end of stream.
pub async fn read_tunnel_frame<R>(reader: &mut R) -> io::Result<Option<(SocksSocketAddr, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u16().await {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    let _fragment_number = reader.read_u8().await?;
    let source = SocksSocketAddr::read(reader).await?;

    let mut data = vec![0; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(Some((source, data)))
}
