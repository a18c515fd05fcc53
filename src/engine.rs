//! The engine: owns the interface, the read loop and everything the flows share.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, trace, warn};

use crate::{
    config::{EngineConfig, ProxyConfig},
    connector::Connector,
    device::TunDevice,
    dns_cache::DnsCache,
    flow_table::FlowTable,
    packet::{
        build_udp_packet, is_public_destination, FragmentTable, Ipv4Header, TcpHeader, UdpHeader,
        IPV4_HEADER_LEN, PROTOCOL_TCP, PROTOCOL_UDP, UDP_HEADER_LEN,
    },
    pool::{BufferPool, DEFAULT_POOL_CAPACITY},
    tcp_flow::{self, Segment},
    udp_flow,
    writer::{OutboundPacket, WriteQueue, WriteSerializer},
    Error, Result,
};

/// Largest datagram the read loop accepts.
const MAX_PACKET: usize = 65_535;

/// State every flow task reaches through an `Arc`.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) connector: Connector,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) queue: WriteQueue,
    pub(crate) tcp_flows: FlowTable<Segment>,
    pub(crate) udp_flows: FlowTable<Vec<u8>>,
    pub(crate) dns_cache: Option<DnsCache>,
    pub(crate) tracker: TaskTracker,
    /// Parent of every flow's cancellation token.
    pub(crate) shutdown: CancellationToken,
    ip_id: AtomicU16,
}

impl Shared {
    pub(crate) fn next_ip_id(&self) -> u16 {
        self.ip_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Wraps `payload` in UDP and IPv4 and queues it, fragmenting past the MTU.
    pub(crate) async fn send_udp(
        &self,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > MAX_PACKET - IPV4_HEADER_LEN - UDP_HEADER_LEN {
            debug!(len = payload.len(), "Datagram too large for IPv4");
            return Ok(());
        }

        let mut packet = self.pool.checkout();
        build_udp_packet(src, dst, self.next_ip_id(), payload, packet.as_mut_vec());
        if packet.len() <= self.config.mtu {
            return self.queue.enqueue(OutboundPacket::Udp(packet)).await;
        }

        let header = Ipv4Header::parse(&packet)?;
        let fragments = header.fragments(self.config.mtu);
        trace!(len = packet.len(), count = fragments.len(), "Fragmenting datagram");
        for fragment in fragments {
            let mut buf = self.pool.checkout();
            fragment.write_to(buf.as_mut_vec());
            self.queue.enqueue(OutboundPacket::Ip(buf)).await?;
        }
        Ok(())
    }
}

/// Relays the traffic of one virtual interface through a SOCKS5 proxy.
pub struct Engine<D> {
    device: Arc<D>,
    shared: Arc<Shared>,
    /// Stops the read loop and the write serializer.
    stopping: CancellationToken,
    writer_rx: Mutex<Option<mpsc::Receiver<OutboundPacket>>>,
    stopped: AtomicBool,
}

impl<D: TunDevice> Engine<D> {
    /// Builds an engine from the classic gateway parameters. `proxy_address` is either
    /// `host:port` or a `socks5://[user:pass@]host[:port]` URL.
    pub fn create(
        device: D,
        proxy_address: &str,
        dns_servers: Vec<Ipv4Addr>,
        public_only: bool,
        enable_dns_cache: bool,
    ) -> Result<Self> {
        let proxy: ProxyConfig = proxy_address.parse()?;
        let config = EngineConfig::new(proxy)
            .with_dns_servers(dns_servers)
            .with_public_only(public_only)
            .with_dns_cache(enable_dns_cache);
        Self::new(device, config)
    }

    pub fn new(device: D, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let stopping = CancellationToken::new();
        let (queue, writer_rx) = WriteQueue::new(config.write_queue_capacity, stopping.clone());
        let dns_cache = config.dns_cache.then(DnsCache::default);

        let shared = Shared {
            connector: Connector::new(config.proxy.clone()),
            pool: BufferPool::new(DEFAULT_POOL_CAPACITY, config.mtu),
            queue,
            tcp_flows: FlowTable::new(),
            udp_flows: FlowTable::new(),
            dns_cache,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            ip_id: AtomicU16::new(rand::random()),
            config,
        };

        Ok(Self {
            device: Arc::new(device),
            shared: Arc::new(shared),
            stopping,
            writer_rx: Mutex::new(Some(writer_rx)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn tcp_flow_count(&self) -> usize {
        self.shared.tcp_flows.len()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.shared.udp_flows.len()
    }

    /// Reads the interface until [`Engine::stop`] is called or a read fails. A read failure
    /// stops the engine and is returned.
    pub async fn run(&self) -> Result<()> {
        let writer_rx = self.writer_rx.lock().take().ok_or(Error::AlreadyRunning)?;
        if self.stopping.is_cancelled() {
            return Err(Error::Shutdown);
        }

        self.shared.tracker.spawn(
            WriteSerializer::new(self.device.clone(), writer_rx, self.stopping.clone()).run(),
        );

        info!(proxy = %self.shared.config.proxy.address, "Engine running");
        let mut fragments = FragmentTable::new(self.shared.config.reassembly_timeout);
        let mut buf = vec![0; MAX_PACKET];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.stopping.cancelled() => break,
                read = self.device.recv(&mut buf) => read,
            };

            match read {
                Ok(len) => match self.process(&buf[..len], &mut fragments).await {
                    Ok(()) => {}
                    Err(Error::Shutdown) => break,
                    Err(err) => debug!(?err, "Dropping packet"),
                },
                Err(_) if self.stopping.is_cancelled() => break,
                Err(err) => {
                    warn!(?err, "Reading from the interface failed");
                    self.stop().await;
                    return Err(Error::InterfaceRead(err));
                }
            }
        }

        trace!("Read loop finished");
        Ok(())
    }

    /// Stops the writer, closes the interface, cancels every flow and waits for all tasks.
    /// Calling it again only waits.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            self.shared.tracker.wait().await;
            return;
        }

        info!("Stopping engine");
        self.stopping.cancel();
        self.device.close();
        self.shared.tcp_flows.cancel_all();
        self.shared.udp_flows.cancel_all();
        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        debug!("Engine stopped");
    }

    async fn process(&self, packet: &[u8], fragments: &mut FragmentTable) -> Result<()> {
        let ip = Ipv4Header::parse(packet)?;
        if self.shared.config.public_only && !is_public_destination(ip.dst) {
            trace!(dst = %ip.dst, "Dropping packet to non-public destination");
            return Ok(());
        }

        if ip.is_fragment() {
            let Some(datagram) = fragments.insert(&ip)? else {
                return Ok(());
            };
            let ip = Ipv4Header::parse(&datagram)?;
            return self.dispatch(&ip).await;
        }

        self.dispatch(&ip).await
    }

    async fn dispatch(&self, ip: &Ipv4Header<'_>) -> Result<()> {
        match ip.protocol {
            PROTOCOL_TCP => {
                let tcp = TcpHeader::parse(ip.payload)?;
                tcp_flow::handle_segment(&self.shared, ip, &tcp).await
            }
            PROTOCOL_UDP => {
                let udp = UdpHeader::parse(ip.payload)?;
                udp_flow::handle_datagram(&self.shared, ip, &udp).await
            }
            protocol => {
                trace!(protocol, "Ignoring unsupported protocol");
                Ok(())
            }
        }
    }
}
