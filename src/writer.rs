//! The single writer that owns the interface's transmit side.
//!
//! Flow tasks never touch the device; they enqueue [`OutboundPacket`]s and the
//! [`WriteSerializer`] writes them one at a time in enqueue order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::{device::TunDevice, pool::PacketBuf, Error};

#[derive(Debug)]
pub enum OutboundPacket {
    Tcp(PacketBuf),
    Udp(PacketBuf),
    /// An already complete IPv4 datagram, such as a fragment of a large UDP response.
    Ip(PacketBuf),
}

impl OutboundPacket {
    pub fn bytes(&self) -> &[u8] {
        match self {
            OutboundPacket::Tcp(buf) | OutboundPacket::Udp(buf) | OutboundPacket::Ip(buf) => buf,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundPacket::Tcp(_) => "tcp",
            OutboundPacket::Udp(_) => "udp",
            OutboundPacket::Ip(_) => "ip",
        }
    }

    pub fn release(self) {
        match self {
            OutboundPacket::Tcp(buf) | OutboundPacket::Udp(buf) | OutboundPacket::Ip(buf) => {
                buf.release()
            }
        }
    }
}

/// Producer handle of the outbound queue.
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<OutboundPacket>,
    stop: CancellationToken,
}

impl WriteQueue {
    pub fn new(capacity: usize, stop: CancellationToken) -> (Self, mpsc::Receiver<OutboundPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        (WriteQueue { tx, stop }, rx)
    }

    /// Waits for room in the queue. Fails once the writer has been told to stop; the
    /// packet's buffer is released either way.
    pub async fn enqueue(&self, packet: OutboundPacket) -> crate::Result<()> {
        if self.stop.is_cancelled() {
            packet.release();
            return Err(Error::Shutdown);
        }
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => Err(Error::Shutdown),
            sent = self.tx.send(packet) => sent.map_err(|_| Error::Shutdown),
        }
    }
}

pub struct WriteSerializer<D> {
    device: Arc<D>,
    rx: mpsc::Receiver<OutboundPacket>,
    stop: CancellationToken,
}

impl<D: TunDevice> WriteSerializer<D> {
    pub fn new(device: Arc<D>, rx: mpsc::Receiver<OutboundPacket>, stop: CancellationToken) -> Self {
        Self { device, rx, stop }
    }

    pub async fn run(mut self) {
        loop {
            let packet = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                packet = self.rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            if let Err(err) = self.device.send(packet.bytes()).await {
                let err = Error::InterfaceWrite(err);
                warn!(kind = packet.kind(), ?err, "Dropping outbound packet");
            }
            packet.release();
        }

        self.rx.close();
        while let Ok(packet) = self.rx.try_recv() {
            packet.release();
        }
        trace!("Write serializer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{device::ChannelDevice, pool::BufferPool};

    fn packet(pool: &Arc<BufferPool>, byte: u8) -> OutboundPacket {
        let mut buf = pool.checkout();
        buf.as_mut_vec().push(byte);
        OutboundPacket::Udp(buf)
    }

    #[tokio::test]
    async fn writes_in_enqueue_order_and_releases() {
        let pool = BufferPool::new(16, 64);
        let (device, mut peer) = ChannelDevice::pair(16);
        let stop = CancellationToken::new();
        let (queue, rx) = WriteQueue::new(16, stop.clone());
        let writer = tokio::spawn(WriteSerializer::new(Arc::new(device), rx, stop.clone()).run());

        for byte in 0..10 {
            queue.enqueue(packet(&pool, byte)).await.unwrap();
        }
        for byte in 0..10 {
            assert_eq!(peer.next_packet().await.unwrap(), vec![byte]);
        }

        stop.cancel();
        writer.await.unwrap();
        assert_eq!(pool.available() as u64, pool.allocations());
    }

    #[tokio::test]
    async fn enqueue_fails_fast_after_stop() {
        let pool = BufferPool::new(4, 64);
        let stop = CancellationToken::new();
        let (queue, _rx) = WriteQueue::new(1, stop.clone());

        queue.enqueue(packet(&pool, 1)).await.unwrap();
        stop.cancel();

        let blocked = tokio::time::timeout(Duration::from_secs(1), queue.enqueue(packet(&pool, 2)));
        assert!(matches!(blocked.await, Ok(Err(Error::Shutdown))));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn failed_write_still_releases() {
        let pool = BufferPool::new(4, 64);
        let (device, _peer) = ChannelDevice::pair(4);
        device.close();
        let stop = CancellationToken::new();
        let (queue, rx) = WriteQueue::new(4, stop.clone());
        let writer = tokio::spawn(WriteSerializer::new(Arc::new(device), rx, stop.clone()).run());

        queue.enqueue(packet(&pool, 1)).await.unwrap();
        drop(queue);
        writer.await.unwrap();
        assert_eq!(pool.available(), 1);
    }
}
