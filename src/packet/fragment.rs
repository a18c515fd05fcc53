//! IPv4 fragment reassembly.
//!
//! Fragments are grouped by (source, destination, identification, protocol). A datagram is
//! complete once the final fragment (more-fragments clear) has fixed its length and every
//! byte up to that length has arrived. Overlapping fragments overwrite earlier bytes.
//! Incomplete sets older than the reassembly timeout are dropped.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use smoltcp::wire::Ipv4Packet;
use tracing::trace;

use super::{Ipv4Header, PacketError};

/// Largest datagram reassembly will produce, header included.
pub const MAX_DATAGRAM_LEN: usize = 65_535;

/// Bound on concurrently incomplete datagrams.
pub const MAX_PENDING_SETS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub identification: u16,
    pub protocol: u8,
}

impl FragmentKey {
    pub fn from_header(header: &Ipv4Header<'_>) -> Self {
        Self {
            src: header.src,
            dst: header.dst,
            identification: header.identification,
            protocol: header.protocol,
        }
    }
}

#[derive(Debug)]
struct FragmentSet {
    /// Header bytes of the offset-zero fragment, once seen.
    first_header: Option<Vec<u8>>,
    payload: Vec<u8>,
    /// Sorted, non-overlapping byte ranges received so far.
    received: Vec<(usize, usize)>,
    total_len: Option<usize>,
    created: Instant,
}

impl FragmentSet {
    fn new(created: Instant) -> Self {
        Self {
            first_header: None,
            payload: Vec::new(),
            received: Vec::new(),
            total_len: None,
            created,
        }
    }

    fn insert(&mut self, header: &Ipv4Header<'_>) -> Result<(), PacketError> {
        let start = header.fragment_byte_offset();
        let end = start + header.payload.len();
        if end + header.header_len > MAX_DATAGRAM_LEN {
            return Err(PacketError::Oversized);
        }

        if start == 0 {
            let mut bytes = Vec::with_capacity(header.header_len);
            header.write_header(&mut bytes);
            self.first_header = Some(bytes);
        }
        if !header.more_fragments() {
            self.total_len = Some(end);
        }

        if self.payload.len() < end {
            self.payload.resize(end, 0);
        }
        self.payload[start..end].copy_from_slice(header.payload);
        self.mark_received(start, end);
        Ok(())
    }

    fn mark_received(&mut self, start: usize, end: usize) {
        if start == end {
            return;
        }
        self.received.push((start, end));
        self.received.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.received.len());
        for &(start, end) in &self.received {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        self.received = merged;
    }

    fn is_complete(&self) -> bool {
        match (self.total_len, &self.first_header, self.received.first()) {
            (Some(total), Some(_), Some(&(0, end))) => end >= total,
            (Some(0), Some(_), None) => true,
            _ => false,
        }
    }

    fn assemble(self) -> Option<Vec<u8>> {
        let total = self.total_len?;
        let mut datagram = self.first_header?;
        let header_len = datagram.len();

        let total_len = (header_len + total) as u16;
        let mut header = Ipv4Packet::new_unchecked(&mut datagram[..]);
        header.set_total_len(total_len);
        header.set_more_frags(false);
        header.set_frag_offset(0);
        header.fill_checksum();

        datagram.extend_from_slice(&self.payload[..total]);
        Some(datagram)
    }
}

/// Holds partially received datagrams. Owned by the read loop, so it needs no locking.
#[derive(Debug)]
pub struct FragmentTable {
    sets: HashMap<FragmentKey, FragmentSet>,
    timeout: Duration,
}

impl FragmentTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sets: HashMap::new(),
            timeout,
        }
    }

    /// Adds a fragment; returns the reassembled datagram when this fragment completes it.
    pub fn insert(&mut self, header: &Ipv4Header<'_>) -> Result<Option<Vec<u8>>, PacketError> {
        self.insert_at(header, Instant::now())
    }

    pub(crate) fn insert_at(
        &mut self,
        header: &Ipv4Header<'_>,
        now: Instant,
    ) -> Result<Option<Vec<u8>>, PacketError> {
        self.expire(now);

        let key = FragmentKey::from_header(header);
        if !self.sets.contains_key(&key) && self.sets.len() >= MAX_PENDING_SETS {
            trace!(?key, "Fragment table full, dropping fragment");
            return Ok(None);
        }

        let set = self
            .sets
            .entry(key)
            .or_insert_with(|| FragmentSet::new(now));
        if let Err(err) = set.insert(header) {
            self.sets.remove(&key);
            return Err(err);
        }

        if !set.is_complete() {
            return Ok(None);
        }

        let datagram = self.sets.remove(&key).and_then(FragmentSet::assemble);
        trace!(?key, len = datagram.as_ref().map(Vec::len), "Datagram reassembled");
        Ok(datagram)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.sets.retain(|key, set| {
            let alive = now.saturating_duration_since(set.created) < timeout;
            if !alive {
                trace!(?key, "Dropping stale fragments");
            }
            alive
        });
    }
}
