//! UDP flows: one proxied datagram path per (source, destination) pair, kept alive by traffic
//! and dropped after the idle TTL.

use std::{
    net::{SocketAddr, SocketAddrV4},
    sync::Arc,
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{sleep_until, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, span, trace, Instrument, Level};

use crate::{
    engine::Shared,
    flow_table::{FlowHandle, FlowId, FlowKey},
    packet::{Ipv4Header, UdpHeader},
    socks5_client::UdpReceiver,
    Socks5Error,
};

pub const DNS_PORT: u16 = 53;

const DATAGRAM_QUEUE: usize = 128;

/// Routes one client datagram: answered from the DNS cache, handed to its flow, or used
/// to open a new flow.
pub(crate) async fn handle_datagram(
    shared: &Arc<Shared>,
    ip: &Ipv4Header<'_>,
    udp: &UdpHeader<'_>,
) -> crate::Result<()> {
    let key = FlowKey::new(
        SocketAddrV4::new(ip.src, udp.src_port),
        SocketAddrV4::new(ip.dst, udp.dst_port),
    );

    if is_cached_dns(shared, &key) {
        if let Some(answer) = shared
            .dns_cache
            .as_ref()
            .and_then(|cache| cache.answer(udp.payload))
        {
            trace!(%key, "Answering DNS query from cache");
            return shared.send_udp(key.dst, key.src, &answer).await;
        }
    }

    if let Some(flow) = shared.udp_flows.lookup(&key) {
        if flow.tx.try_send(udp.payload.to_vec()).is_err() {
            trace!(%key, "Flow busy, dropping datagram");
        }
        return Ok(());
    }

    spawn(shared, key, udp.payload.to_vec());
    Ok(())
}

fn is_cached_dns(shared: &Shared, key: &FlowKey) -> bool {
    key.dst.port() == DNS_PORT
        && shared.dns_cache.is_some()
        && shared.config.intercepts_dns(*key.dst.ip())
}

fn spawn(shared: &Arc<Shared>, key: FlowKey, first: Vec<u8>) {
    let (tx, rx) = mpsc::channel(DATAGRAM_QUEUE);
    // fresh channel, cannot be full
    let _ = tx.try_send(first);
    let cancel = shared.shutdown.child_token();
    let Some(id) = shared.udp_flows.insert(
        key,
        FlowHandle {
            tx,
            cancel: cancel.clone(),
        },
    ) else {
        return;
    };

    debug!(%key, "New UDP flow");
    let flow = UdpFlow {
        shared: Arc::clone(shared),
        key,
        id,
        rx,
        cancel,
        cache_responses: is_cached_dns(shared, &key),
    };
    let span = span!(Level::DEBUG, "udp", src = %key.src, dst = %key.dst);
    shared.tracker.spawn(flow.run().instrument(span));
}

struct UdpFlow {
    shared: Arc<Shared>,
    key: FlowKey,
    id: FlowId,
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    cache_responses: bool,
}

impl UdpFlow {
    async fn run(mut self) {
        if let Err(err) = self.relay().await {
            debug!(?err, "UDP flow failed");
        }
        self.cancel.cancel();
        self.shared.udp_flows.remove(&self.key, self.id);
        debug!("UDP flow finished");
    }

    async fn relay(&mut self) -> crate::Result<()> {
        let connector = self.shared.connector.clone();
        let upstream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            upstream = connector.open_udp(SocketAddr::V4(self.key.dst)) => upstream?,
        };

        let (mut sender, receiver) = upstream.into_split();
        let (responses_tx, mut responses) = mpsc::channel(DATAGRAM_QUEUE);
        self.shared.tracker.spawn(
            read_upstream(receiver, responses_tx, self.cancel.clone()).in_current_span(),
        );

        let ttl = self.shared.config.udp_ttl;
        let write_timeout = self.shared.config.proxy.write_timeout;
        let mut deadline = Instant::now() + ttl;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep_until(deadline) => {
                    debug!(?ttl, "UDP flow expired");
                    return Ok(());
                }
                datagram = self.rx.recv() => {
                    let Some(datagram) = datagram else {
                        return Ok(());
                    };
                    deadline = Instant::now() + ttl;
                    match timeout(write_timeout, sender.send(&datagram)).await {
                        Ok(sent) => sent.map_err(Socks5Error::IoError)?,
                        Err(_) => return Err(Socks5Error::Timeout.into()),
                    }
                }
                response = responses.recv() => {
                    let Some(response) = response else {
                        debug!("Upstream closed");
                        return Ok(());
                    };
                    deadline = Instant::now() + ttl;
                    if self.cache_responses {
                        if let Some(cache) = &self.shared.dns_cache {
                            cache.store(&response);
                        }
                    }
                    self.shared
                        .send_udp(self.key.dst, self.key.src, &response)
                        .await?;
                }
            }
        }
    }
}

/// Companion task: moves upstream datagrams into the flow. Datagrams are dropped when the
/// flow falls behind.
async fn read_upstream(
    mut receiver: UdpReceiver,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = receiver.recv() => received,
        };
        match received {
            Ok(Some(datagram)) => match tx.try_send(datagram) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!("Flow busy, dropping response"),
                Err(TrySendError::Closed(_)) => return,
            },
            Ok(None) => return,
            Err(err) => {
                debug!(?err, "Upstream receive failed");
                return;
            }
        }
    }
}
