use std::{
    collections::HashMap,
    fmt,
    net::SocketAddrV4,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Client-side source and the destination the client addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl FlowKey {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Distinguishes successive flows that reused the same key.
pub type FlowId = u64;

/// What the table hands out: the way into a flow task, never the flow state itself.
#[derive(Debug)]
pub struct FlowHandle<M> {
    pub tx: mpsc::Sender<M>,
    pub cancel: CancellationToken,
}

impl<M> Clone for FlowHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

#[derive(Debug)]
pub struct FlowTable<M> {
    entries: Mutex<HashMap<FlowKey, (FlowId, FlowHandle<M>)>>,
    next_id: AtomicU64,
}

impl<M> Default for FlowTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> FlowTable<M> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<FlowHandle<M>> {
        self.entries.lock().get(key).map(|(_, handle)| handle.clone())
    }

    /// Registers a new flow. Returns `None` when the key is already taken.
    pub fn insert(&self, key: FlowKey, handle: FlowHandle<M>) -> Option<FlowId> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, (id, handle));
        Some(id)
    }

    /// Removes the entry only if it still belongs to flow `id`.
    pub fn remove(&self, key: &FlowKey, id: FlowId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((current, _)) if *current == id => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self) {
        let entries = self.entries.lock();
        for (_, handle) in entries.values() {
            handle.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn key(port: u16) -> FlowKey {
        FlowKey::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), port),
            SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443),
        )
    }

    fn handle() -> (FlowHandle<u8>, mpsc::Receiver<u8>) {
        let (tx, rx) = mpsc::channel(1);
        (
            FlowHandle {
                tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    #[test]
    fn one_flow_per_key() {
        let table = FlowTable::new();
        let (first, _rx1) = handle();
        let (second, _rx2) = handle();

        assert!(table.insert(key(1), first).is_some());
        assert!(table.insert(key(1), second).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn stale_removal_keeps_the_newer_flow() {
        let table = FlowTable::new();
        let (first, _rx1) = handle();
        let old = table.insert(key(1), first).unwrap();
        assert!(table.remove(&key(1), old));

        let (second, _rx2) = handle();
        let new = table.insert(key(1), second).unwrap();
        assert_ne!(old, new);
        assert!(!table.remove(&key(1), old));
        assert!(table.lookup(&key(1)).is_some());
        assert!(table.remove(&key(1), new));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn cancel_all_reaches_every_flow() {
        let table = FlowTable::new();
        let mut tokens = Vec::new();
        let mut receivers = Vec::new();
        for port in 0..3 {
            let (handle, rx) = handle();
            tokens.push(handle.cancel.clone());
            receivers.push(rx);
            table.insert(key(port), handle);
        }

        table.cancel_all();
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
