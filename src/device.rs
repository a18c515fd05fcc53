//! The virtual interface the engine reads packets from and writes packets to.

use std::{future::Future, io};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One IPv4 datagram per call in each direction.
pub trait TunDevice: Send + Sync + 'static {
    /// Reads the next datagram into `buf`, returning its length.
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Writes one complete datagram.
    fn send(&self, packet: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Closes the interface handle. Pending and later `recv`/`send` calls fail.
    fn close(&self);
}

/// An interface backed by channels, for embedders that exchange packets in memory.
#[derive(Debug)]
pub struct ChannelDevice {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

/// The far side of a [`ChannelDevice`]: injects client packets and collects the
/// packets the engine writes.
#[derive(Debug)]
pub struct DevicePeer {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelDevice {
    pub fn pair(capacity: usize) -> (ChannelDevice, DevicePeer) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        (
            ChannelDevice {
                inbound: Mutex::new(inbound_rx),
                outbound: outbound_tx,
                closed: CancellationToken::new(),
            },
            DevicePeer {
                tx: inbound_tx,
                rx: outbound_rx,
            },
        )
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "Device closed")
}

impl TunDevice for ChannelDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            packet = inbound.recv() => match packet {
                Some(packet) => {
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    Ok(len)
                }
                None => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Device peer went away",
                )),
            },
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_error()),
            sent = self.outbound.send(packet.to_vec()) => sent.map_err(|_| closed_error()),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

impl DevicePeer {
    /// Hands a packet to the engine as if the client had sent it.
    pub async fn inject(&self, packet: Vec<u8>) -> io::Result<()> {
        self.tx.send(packet).await.map_err(|_| closed_error())
    }

    /// The next packet the engine wrote, or `None` once the device is gone.
    pub async fn next_packet(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn try_next_packet(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}
