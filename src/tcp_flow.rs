//! Terminates client TCP connections locally and relays their bytes through the proxy.
//!
//! Each flow is owned by one task. The engine's read loop only looks the flow up and
//! hands it [`Segment`]s; sequence bookkeeping lives in [`Tcb`], which does no I/O.

use std::{
    net::{SocketAddr, SocketAddrV4},
    ops::Range,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::OwnedWriteHalf,
    sync::mpsc,
    time::{sleep_until, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, span, trace, Instrument, Level};

use crate::{
    engine::Shared,
    flow_table::{FlowHandle, FlowId, FlowKey},
    packet::{build_tcp_packet, Ipv4Header, OutboundTcp, TcpFlags, TcpHeader},
    writer::OutboundPacket,
};

/// MSS assumed when the client's SYN carries none.
const DEFAULT_MSS: u16 = 536;

/// Client data beyond one pending chunk is left unacknowledged, so the advertised window
/// is fixed.
const RECEIVE_WINDOW: u16 = 65_535;

const SEGMENT_QUEUE: usize = 256;
const UPSTREAM_QUEUE: usize = 64;

/// Client data accepted while the proxy dial is still in flight.
const MAX_EARLY_DATA: usize = 256 * 1024;

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynReceived,
    Established,
    Closing,
    Closed,
    Reset,
}

/// A client segment, detached from the packet it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn from_header(tcp: &TcpHeader<'_>) -> Self {
        Self {
            seq: tcp.seq,
            ack: tcp.ack,
            flags: tcp.flags,
            window: tcp.window,
            mss: tcp.mss(),
            payload: tcp.payload.to_vec(),
        }
    }

    /// Drops the payload and any FIN behind it, keeping acknowledgement and control bits.
    fn without_data(mut self) -> Self {
        if !self.payload.is_empty() {
            self.payload.clear();
            self.flags.fin = false;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Ack,
    SynAck,
}

/// What a client segment asks of the flow.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// New bytes in the segment's payload, to be forwarded upstream.
    pub deliver: Option<Range<usize>>,
    pub respond: Option<Response>,
    /// The client's FIN was accepted by this segment.
    pub fin: bool,
    pub reset: bool,
}

/// Sequence state of one virtual connection.
#[derive(Debug, Clone)]
pub struct Tcb {
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub client_window: u32,
    pub mss: u16,
    pub fin_received: bool,
    pub fin_sent: bool,
}

impl Tcb {
    pub fn new(syn: &Segment, iss: u32, mtu: usize) -> Self {
        let link_mss = u16::try_from(mtu.saturating_sub(40)).unwrap_or(u16::MAX);
        Self {
            iss,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1),
            rcv_nxt: syn.seq.wrapping_add(1),
            client_window: u32::from(syn.window),
            mss: syn.mss.unwrap_or(DEFAULT_MSS).min(link_mss).max(1),
            fin_received: false,
            fin_sent: false,
        }
    }

    pub fn on_segment(&mut self, segment: &Segment) -> Outcome {
        let mut outcome = Outcome::default();

        if segment.flags.rst {
            outcome.reset = true;
            return outcome;
        }

        if segment.flags.syn {
            outcome.respond = if segment.seq.wrapping_add(1) == self.rcv_nxt {
                Some(Response::SynAck)
            } else {
                Some(Response::Ack)
            };
            return outcome;
        }

        if segment.flags.ack
            && seq_le(self.snd_una, segment.ack)
            && seq_le(segment.ack, self.snd_nxt)
        {
            self.snd_una = segment.ack;
            self.client_window = u32::from(segment.window);
        }

        let len = segment.payload.len();
        if len == 0 && !segment.flags.fin {
            return outcome;
        }

        outcome.respond = Some(Response::Ack);
        if self.fin_received || seq_lt(self.rcv_nxt, segment.seq) {
            // duplicate after close, or a gap we cannot reorder
            return outcome;
        }

        let skip = self.rcv_nxt.wrapping_sub(segment.seq) as usize;
        if skip > len {
            return outcome;
        }
        if skip < len {
            outcome.deliver = Some(skip..len);
            self.rcv_nxt = self.rcv_nxt.wrapping_add((len - skip) as u32);
        }
        if segment.flags.fin {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.fin_received = true;
            outcome.fin = true;
        }
        outcome
    }

    /// Bytes that may be sent before the client's window is full.
    pub fn send_window(&self) -> usize {
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        self.client_window.saturating_sub(in_flight) as usize
    }

    pub fn on_send(&mut self, len: usize) {
        self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
    }

    pub fn on_fin_sent(&mut self) {
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.fin_sent = true;
    }

    pub fn fin_acked(&self) -> bool {
        self.fin_sent && self.snd_una == self.snd_nxt
    }

    pub fn is_finished(&self) -> bool {
        self.fin_received && self.fin_acked()
    }
}

/// Routes one client segment: to its flow, into a new flow, or back as a reset.
pub(crate) async fn handle_segment(
    shared: &Arc<Shared>,
    ip: &Ipv4Header<'_>,
    tcp: &TcpHeader<'_>,
) -> crate::Result<()> {
    let key = FlowKey::new(
        SocketAddrV4::new(ip.src, tcp.src_port),
        SocketAddrV4::new(ip.dst, tcp.dst_port),
    );
    let segment = Segment::from_header(tcp);

    if let Some(flow) = shared.tcp_flows.lookup(&key) {
        let reset = segment.flags.rst;
        if flow.tx.try_send(segment).is_err() {
            if reset {
                // a reset is never retransmitted
                trace!(%key, "Flow busy, cancelling on reset");
                flow.cancel.cancel();
            } else {
                trace!(%key, "Flow busy, dropping segment");
            }
        }
        return Ok(());
    }

    if segment.flags.syn && !segment.flags.ack {
        spawn(shared, key, segment);
        Ok(())
    } else if !segment.flags.rst {
        reject(shared, key, &segment).await
    } else {
        Ok(())
    }
}

fn spawn(shared: &Arc<Shared>, key: FlowKey, syn: Segment) {
    let (tx, rx) = mpsc::channel(SEGMENT_QUEUE);
    let cancel = shared.shutdown.child_token();
    let Some(id) = shared.tcp_flows.insert(
        key,
        FlowHandle {
            tx,
            cancel: cancel.clone(),
        },
    ) else {
        return;
    };

    let tcb = Tcb::new(&syn, rand::random(), shared.config.mtu);
    debug!(%key, mss = tcb.mss, "New TCP flow");
    let flow = TcpFlow {
        shared: Arc::clone(shared),
        key,
        id,
        rx,
        cancel,
        tcb,
        state: TcpState::SynReceived,
    };
    let span = span!(Level::DEBUG, "tcp", src = %key.src, dst = %key.dst);
    shared.tracker.spawn(flow.run().instrument(span));
}

/// Answers a segment that belongs to no flow, as a closed port would.
async fn reject(shared: &Shared, key: FlowKey, segment: &Segment) -> crate::Result<()> {
    let (seq, ack, flags) = if segment.flags.ack {
        (segment.ack, 0, TcpFlags::rst_only())
    } else {
        let len = segment.payload.len() as u32 + u32::from(segment.flags.fin);
        (0, segment.seq.wrapping_add(len), TcpFlags::rst_ack())
    };

    let mut buf = shared.pool.checkout();
    build_tcp_packet(
        &OutboundTcp {
            src: key.dst,
            dst: key.src,
            seq,
            ack,
            flags,
            window: 0,
            mss: None,
            payload: &[],
        },
        shared.next_ip_id(),
        buf.as_mut_vec(),
    );
    trace!(%key, "Resetting segment for unknown flow");
    shared.queue.enqueue(OutboundPacket::Tcp(buf)).await
}

struct TcpFlow {
    shared: Arc<Shared>,
    key: FlowKey,
    id: FlowId,
    rx: mpsc::Receiver<Segment>,
    cancel: CancellationToken,
    tcb: Tcb,
    state: TcpState,
}

impl TcpFlow {
    async fn run(mut self) {
        if let Err(err) = self.drive().await {
            trace!(?err, "Flow stopped");
            self.state = TcpState::Reset;
        }
        if self.state == TcpState::Reset {
            self.cancel.cancel();
        }
        self.shared.tcp_flows.remove(&self.key, self.id);
        debug!(state = ?self.state, "TCP flow finished");
    }

    async fn drive(&mut self) -> crate::Result<()> {
        self.transmit(TcpFlags::syn_ack(), &[]).await?;

        let connector = self.shared.connector.clone();
        let destination = SocketAddr::V4(self.key.dst);
        let connect = async move { connector.connect(destination).await };
        tokio::pin!(connect);

        let mut early = Vec::new();
        let stream = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return self.abort().await,
                connected = &mut connect => match connected {
                    Ok(stream) => break stream,
                    Err(err) => {
                        debug!(?err, "Upstream dial failed");
                        return self.abort().await;
                    }
                },
                segment = self.rx.recv() => {
                    let Some(segment) = segment else {
                        return self.abort().await;
                    };
                    let outcome = self.tcb.on_segment(&segment);
                    if outcome.reset {
                        self.state = TcpState::Reset;
                        return Ok(());
                    }
                    if let Some(range) = outcome.deliver {
                        if early.len() + range.len() > MAX_EARLY_DATA {
                            debug!("Too much data before the proxy connected");
                            return self.abort().await;
                        }
                        early.extend_from_slice(&segment.payload[range]);
                    }
                    self.respond(outcome.respond).await?;
                }
            }
        };

        self.state = TcpState::Established;
        trace!("Upstream connected");

        let (mut reader, writer) = stream.into_split();
        let (upstream_tx, upstream_rx) = mpsc::channel(UPSTREAM_QUEUE);
        self.shared.tracker.spawn(
            write_upstream(
                writer,
                upstream_rx,
                self.shared.config.proxy.write_timeout,
                self.cancel.clone(),
            )
            .in_current_span(),
        );

        let mut upstream_tx = Some(upstream_tx);
        // client bytes waiting for room in the upstream queue; nothing more is accepted
        // until they are handed off, so the client's own window holds the rest
        let mut pending = (!early.is_empty()).then_some(early);

        let idle = self.shared.config.tcp_idle_timeout;
        let close_timeout = self.shared.config.tcp_close_timeout;
        let mut last_activity = Instant::now();
        let mut closing_since: Option<Instant> = None;
        let mut upstream_open = true;
        let mut buf = vec![0; usize::from(self.tcb.mss)];

        loop {
            if self.tcb.fin_received && pending.is_none() && upstream_tx.is_some() {
                // half-close once the last client bytes are queued
                self.state = TcpState::Closing;
                upstream_tx = None;
            }
            if self.tcb.is_finished() && pending.is_none() {
                self.state = TcpState::Closed;
                return Ok(());
            }
            if self.tcb.fin_received && self.tcb.fin_sent && closing_since.is_none() {
                closing_since = Some(Instant::now());
            }
            let deadline = match closing_since {
                Some(since) => since + close_timeout,
                None => last_activity + idle,
            };
            let window = self.tcb.send_window().min(buf.len());

            tokio::select! {
                _ = self.cancel.cancelled() => return self.abort().await,
                _ = sleep_until(deadline) => {
                    if closing_since.is_some() {
                        debug!("Close timed out");
                        self.state = TcpState::Closed;
                        return Ok(());
                    }
                    debug!(?idle, "Idle timeout");
                    return self.abort().await;
                }
                permit = reserve(&upstream_tx), if pending.is_some() => match permit {
                    Some(permit) => {
                        if let Some(data) = pending.take() {
                            permit.send(data);
                        }
                    }
                    // the writer failed and cancelled the flow
                    None => return self.abort().await,
                },
                segment = self.rx.recv() => {
                    let Some(segment) = segment else {
                        return self.abort().await;
                    };
                    last_activity = Instant::now();
                    let segment = if pending.is_some() {
                        segment.without_data()
                    } else {
                        segment
                    };
                    let outcome = self.tcb.on_segment(&segment);
                    if outcome.reset {
                        trace!("Client reset");
                        self.state = TcpState::Reset;
                        return Ok(());
                    }
                    if let Some(range) = outcome.deliver {
                        if upstream_tx.is_some() {
                            pending = Some(segment.payload[range].to_vec());
                        }
                    }
                    if outcome.fin {
                        trace!("Client finished sending");
                    }
                    self.respond(outcome.respond).await?;
                }
                read = reader.read(&mut buf[..window]), if upstream_open && window > 0 => match read {
                    Ok(0) => {
                        trace!("Upstream finished sending");
                        upstream_open = false;
                        self.transmit(TcpFlags::fin_ack(), &[]).await?;
                        self.tcb.on_fin_sent();
                        self.state = TcpState::Closing;
                    }
                    Ok(n) => {
                        last_activity = Instant::now();
                        self.transmit(TcpFlags::psh_ack(), &buf[..n]).await?;
                        self.tcb.on_send(n);
                    }
                    Err(err) => {
                        debug!(?err, "Upstream read failed");
                        return self.abort().await;
                    }
                },
            }
        }
    }

    /// Resets the client side unless the whole engine is going away.
    async fn abort(&mut self) -> crate::Result<()> {
        self.state = TcpState::Reset;
        if self.shared.shutdown.is_cancelled() {
            return Ok(());
        }
        self.transmit(TcpFlags::rst_ack(), &[]).await
    }

    async fn respond(&mut self, response: Option<Response>) -> crate::Result<()> {
        match response {
            Some(Response::Ack) => self.transmit(TcpFlags::ack_only(), &[]).await,
            Some(Response::SynAck) => self.transmit(TcpFlags::syn_ack(), &[]).await,
            None => Ok(()),
        }
    }

    async fn transmit(&mut self, flags: TcpFlags, payload: &[u8]) -> crate::Result<()> {
        let seq = if flags.syn {
            self.tcb.iss
        } else {
            self.tcb.snd_nxt
        };
        let mut buf = self.shared.pool.checkout();
        build_tcp_packet(
            &OutboundTcp {
                src: self.key.dst,
                dst: self.key.src,
                seq,
                ack: self.tcb.rcv_nxt,
                flags,
                window: RECEIVE_WINDOW,
                mss: Some(self.tcb.mss),
                payload,
            },
            self.shared.next_ip_id(),
            buf.as_mut_vec(),
        );
        trace!(%flags, seq, ack = self.tcb.rcv_nxt, len = payload.len(), "Sending segment");
        self.shared.queue.enqueue(OutboundPacket::Tcp(buf)).await
    }
}

/// Room for one chunk in the upstream queue, or `None` once the writer is gone.
async fn reserve(upstream: &Option<mpsc::Sender<Vec<u8>>>) -> Option<mpsc::Permit<'_, Vec<u8>>> {
    upstream.as_ref()?.reserve().await.ok()
}

/// Companion task: writes client bytes upstream in order, then half-closes.
async fn write_upstream(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => return,
            data = rx.recv() => data,
        };
        let Some(data) = data else {
            break;
        };
        match timeout(write_timeout, writer.write_all(&data)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(?err, "Upstream write failed");
                cancel.cancel();
                return;
            }
            Err(_) => {
                debug!("Upstream write timed out");
                cancel.cancel();
                return;
            }
        }
    }

    if let Err(err) = writer.shutdown().await {
        trace!(?err, "Upstream half-close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syn(seq: u32, mss: Option<u16>) -> Segment {
        Segment {
            seq,
            ack: 0,
            flags: TcpFlags {
                syn: true,
                ..Default::default()
            },
            window: 8192,
            mss,
            payload: Vec::new(),
        }
    }

    fn data(seq: u32, ack: u32, payload: &[u8]) -> Segment {
        Segment {
            seq,
            ack,
            flags: TcpFlags::psh_ack(),
            window: 8192,
            mss: None,
            payload: payload.to_vec(),
        }
    }

    fn established() -> Tcb {
        let mut tcb = Tcb::new(&syn(1000, Some(1460)), 5000, 1500);
        let ack = data(1001, 5001, &[]);
        assert_eq!(tcb.on_segment(&ack), Outcome::default());
        tcb
    }

    #[test]
    fn mss_is_bounded_by_the_link() {
        assert_eq!(Tcb::new(&syn(0, Some(1460)), 0, 1500).mss, 1460);
        assert_eq!(Tcb::new(&syn(0, Some(9000)), 0, 1500).mss, 1460);
        assert_eq!(Tcb::new(&syn(0, None), 0, 1500).mss, DEFAULT_MSS);
        assert_eq!(Tcb::new(&syn(0, Some(1460)), 0, 576).mss, 536);
    }

    #[test]
    fn in_order_data_advances_the_ack() {
        let mut tcb = established();
        let outcome = tcb.on_segment(&data(1001, 5001, b"hello"));
        assert_eq!(outcome.deliver, Some(0..5));
        assert_eq!(outcome.respond, Some(Response::Ack));
        assert_eq!(tcb.rcv_nxt, 1006);
    }

    #[test]
    fn retransmission_is_acked_not_delivered() {
        let mut tcb = established();
        tcb.on_segment(&data(1001, 5001, b"hello"));

        let outcome = tcb.on_segment(&data(1001, 5001, b"hello"));
        assert_eq!(outcome.deliver, None);
        assert_eq!(outcome.respond, Some(Response::Ack));
        assert_eq!(tcb.rcv_nxt, 1006);
    }

    #[test]
    fn overlap_delivers_only_the_new_suffix() {
        let mut tcb = established();
        tcb.on_segment(&data(1001, 5001, b"hello"));

        let outcome = tcb.on_segment(&data(1004, 5001, b"lo world"));
        assert_eq!(outcome.deliver, Some(2..8));
        assert_eq!(tcb.rcv_nxt, 1012);
    }

    #[test]
    fn gap_is_dropped_with_a_duplicate_ack() {
        let mut tcb = established();
        let outcome = tcb.on_segment(&data(1100, 5001, b"later"));
        assert_eq!(outcome.deliver, None);
        assert_eq!(outcome.respond, Some(Response::Ack));
        assert_eq!(tcb.rcv_nxt, 1001);
    }

    #[test]
    fn fin_consumes_a_sequence_number() {
        let mut tcb = established();
        let mut fin = data(1001, 5001, b"bye");
        fin.flags = TcpFlags::fin_ack();

        let outcome = tcb.on_segment(&fin);
        assert!(outcome.fin);
        assert_eq!(outcome.deliver, Some(0..3));
        assert_eq!(tcb.rcv_nxt, 1005);
        assert!(tcb.fin_received);

        let again = tcb.on_segment(&fin);
        assert!(!again.fin);
        assert_eq!(again.respond, Some(Response::Ack));
    }

    #[test]
    fn reset_and_syn_retransmission() {
        let mut tcb = Tcb::new(&syn(1000, None), 5000, 1500);
        assert_eq!(
            tcb.on_segment(&syn(1000, None)).respond,
            Some(Response::SynAck)
        );

        let mut rst = data(1001, 0, &[]);
        rst.flags = TcpFlags::rst_only();
        assert!(tcb.on_segment(&rst).reset);
    }

    #[test]
    fn sending_respects_the_client_window() {
        let mut tcb = established();
        assert_eq!(tcb.send_window(), 8192);

        tcb.on_send(6000);
        assert_eq!(tcb.send_window(), 2192);

        tcb.on_segment(&data(1001, 5001 + 6000, &[]));
        assert_eq!(tcb.send_window(), 8192);
    }

    #[test]
    fn close_completes_once_our_fin_is_acked() {
        let mut tcb = established();
        let mut fin = data(1001, 5001, &[]);
        fin.flags = TcpFlags::fin_ack();
        tcb.on_segment(&fin);
        tcb.on_fin_sent();
        assert!(!tcb.is_finished());

        tcb.on_segment(&data(1002, 5002, &[]));
        assert!(tcb.is_finished());
    }

    #[test]
    fn held_back_data_is_neither_acked_nor_delivered() {
        let mut tcb = established();
        tcb.on_send(100);

        let mut fin = data(1001, 5101, b"more");
        fin.flags.fin = true;
        let outcome = tcb.on_segment(&fin.without_data());
        assert_eq!(outcome, Outcome::default());
        assert_eq!(tcb.rcv_nxt, 1001);
        assert_eq!(tcb.snd_una, 5101);
        assert!(!tcb.fin_received);

        let mut bare_fin = data(1001, 5101, &[]);
        bare_fin.flags = TcpFlags::fin_ack();
        let outcome = tcb.on_segment(&bare_fin.without_data());
        assert!(outcome.fin);
        assert_eq!(tcb.rcv_nxt, 1002);
    }

    #[test]
    fn sequence_comparisons_wrap() {
        assert!(seq_lt(u32::MAX - 1, 3));
        assert!(!seq_lt(3, u32::MAX - 1));
        assert!(seq_le(7, 7));
    }
}
