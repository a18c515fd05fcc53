use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream, UdpSocket,
    },
    select,
};
use tracing::trace;

use self::udp_message::{read_tunnel_frame, UdpMessage};

pub mod udp_message;

const MAX_DATAGRAM: usize = 65_535;

/// An established UDP path to one destination through the proxy.
#[derive(Debug)]
pub enum UdpUpstream {
    /// RFC 1928 UDP ASSOCIATE: datagrams go to a relay socket, the control connection
    /// keeps the association alive.
    Associate {
        control: TcpStream,
        socket: UdpSocket,
        destination: SocketAddr,
    },
    /// UDP-over-TCP: datagrams are framed on the request stream itself.
    Tunnel {
        stream: TcpStream,
        destination: SocketAddr,
    },
}

impl UdpUpstream {
    pub fn into_split(self) -> (UdpSender, UdpReceiver) {
        match self {
            UdpUpstream::Associate {
                control,
                socket,
                destination,
            } => {
                let socket = Arc::new(socket);
                (
                    UdpSender::Associate {
                        socket: socket.clone(),
                        destination,
                    },
                    UdpReceiver::Associate { socket, control },
                )
            }
            UdpUpstream::Tunnel {
                stream,
                destination,
            } => {
                let (reader, writer) = stream.into_split();
                (
                    UdpSender::Tunnel {
                        writer,
                        destination,
                    },
                    UdpReceiver::Tunnel { reader },
                )
            }
        }
    }
}

#[derive(Debug)]
pub enum UdpSender {
    Associate {
        socket: Arc<UdpSocket>,
        destination: SocketAddr,
    },
    Tunnel {
        writer: OwnedWriteHalf,
        destination: SocketAddr,
    },
}

impl UdpSender {
    pub async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            UdpSender::Associate {
                socket,
                destination,
            } => {
                let message = UdpMessage {
                    fragment_number: 0,
                    dst: (*destination).into(),
                    data: payload,
                };
                socket.send(&message.as_bytes()?).await?;
            }
            UdpSender::Tunnel {
                writer,
                destination,
            } => {
                let frame = UdpMessage {
                    fragment_number: 0,
                    dst: (*destination).into(),
                    data: payload,
                }
                .as_tunnel_frame()?;
                writer.write_all(&frame).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum UdpReceiver {
    Associate {
        socket: Arc<UdpSocket>,
        control: TcpStream,
    },
    Tunnel {
        reader: OwnedReadHalf,
    },
}

impl UdpReceiver {
    /// Next response payload, or `None` once the proxy has torn the association down.
    pub async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            UdpReceiver::Associate { socket, control } => {
                let mut buf = vec![0; MAX_DATAGRAM];
                let mut probe = [0; 1];
                loop {
                    let n = select! {
                        received = socket.recv(&mut buf) => received?,
                        closed = control.read(&mut probe) => {
                            return match closed {
                                Ok(0) => Ok(None),
                                Ok(_) => Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "Received unexpected data from tcpstream",
                                )),
                                Err(err) => Err(err),
                            };
                        }
                    };

                    let message = match UdpMessage::parse(&buf[..n]).await {
                        Ok(message) => message,
                        Err(err) => {
                            trace!(%err, "Dropping malformed relay datagram");
                            continue;
                        }
                    };
                    if message.fragment_number != 0 {
                        trace!(
                            fragment = message.fragment_number,
                            "Dropping fragmented relay datagram"
                        );
                        continue;
                    }
                    return Ok(Some(message.data.to_vec()));
                }
            }
            UdpReceiver::Tunnel { reader } => {
                Ok(read_tunnel_frame(reader).await?.map(|(_, data)| data))
            }
        }
    }
}
