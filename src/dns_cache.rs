//! Short-circuits repeated DNS queries.
//!
//! Successful responses are cached by (lowercased name, record type) until their smallest
//! answer TTL runs out. A hit is answered locally with the query's id and TTLs reduced by
//! the time already spent in the cache.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use hickory_proto::{
    op::{Message, MessageType, ResponseCode},
    rr::Record,
};
use parking_lot::Mutex;
use tracing::trace;

/// Upper bound on cached names.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    record_type: u16,
}

impl CacheKey {
    pub fn new(name: &str, record_type: u16) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            record_type,
        }
    }

    /// Keyed by the first question; messages without one are not cacheable.
    pub fn from_message(message: &Message) -> Option<Self> {
        let query = message.queries().first()?;
        Some(Self::new(
            &query.name().to_ascii(),
            u16::from(query.query_type()),
        ))
    }
}

#[derive(Debug)]
struct CacheEntry {
    response: Message,
    stored_at: Instant,
    ttl: u32,
}

impl CacheEntry {
    fn remaining_ttl(&self, now: Instant) -> u32 {
        let age = now.saturating_duration_since(self.stored_at).as_secs();
        self.ttl.saturating_sub(u32::try_from(age).unwrap_or(u32::MAX))
    }

    fn expires_at(&self) -> Instant {
        self.stored_at + Duration::from_secs(u64::from(self.ttl))
    }
}

#[derive(Debug)]
pub struct DnsCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    capacity: usize,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// A ready-to-send response to the raw `query`, if one is cached and still fresh.
    pub fn answer(&self, query: &[u8]) -> Option<Vec<u8>> {
        self.answer_at(query, Instant::now())
    }

    /// Remembers the raw `response` if it is a successful answer with a nonzero TTL.
    pub fn store(&self, response: &[u8]) {
        self.store_at(response, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub(crate) fn answer_at(&self, query: &[u8], now: Instant) -> Option<Vec<u8>> {
        let query = Message::from_vec(query).ok()?;
        if query.message_type() != MessageType::Query {
            return None;
        }
        let key = CacheKey::from_message(&query)?;

        let (mut response, remaining) = {
            let mut entries = self.entries.lock();
            let entry = entries.get(&key)?;
            let remaining = entry.remaining_ttl(now);
            if remaining == 0 {
                trace!(name = %key.name, "Cached DNS answer expired");
                entries.remove(&key);
                return None;
            }
            (entry.response.clone(), remaining)
        };

        response.set_id(query.id());
        let answers = clamp_ttls(response.take_answers(), remaining);
        response.insert_answers(answers);
        let name_servers = clamp_ttls(response.take_name_servers(), remaining);
        response.insert_name_servers(name_servers);
        let additionals = clamp_ttls(response.take_additionals(), remaining);
        response.insert_additionals(additionals);

        trace!(name = %key.name, remaining, "DNS cache hit");
        response.to_vec().ok()
    }

    pub(crate) fn store_at(&self, response: &[u8], now: Instant) {
        let Ok(response) = Message::from_vec(response) else {
            return;
        };
        if response.message_type() != MessageType::Response
            || response.response_code() != ResponseCode::NoError
        {
            return;
        }
        let Some(ttl) = response.answers().iter().map(Record::ttl).min() else {
            return;
        };
        if ttl == 0 {
            return;
        }
        let Some(key) = CacheKey::from_message(&response) else {
            return;
        };

        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, entry| entry.expires_at() > now);
            if entries.len() >= self.capacity {
                trace!(name = %key.name, "DNS cache full, not storing");
                return;
            }
        }

        trace!(name = %key.name, ttl, "Caching DNS answer");
        entries.insert(
            key,
            CacheEntry {
                response,
                stored_at: now,
                ttl,
            },
        );
    }
}

fn clamp_ttls(mut records: Vec<Record>, remaining: u32) -> Vec<Record> {
    for record in &mut records {
        let ttl = record.ttl().min(remaining);
        record.set_ttl(ttl);
    }
    records
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, str::FromStr};

    use hickory_proto::{
        op::Query,
        rr::{rdata::A, Name, RData, RecordType},
    };

    use super::*;

    fn query(id: u16, name: &str) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        message.to_vec().unwrap()
    }

    fn response(id: u16, name: &str, ttl: u32, code: ResponseCode) -> Vec<u8> {
        let name = Name::from_str(name).unwrap();
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_response_code(code)
            .add_query(Query::query(name.clone(), RecordType::A));
        if code == ResponseCode::NoError {
            message.add_answer(Record::from_rdata(
                name,
                ttl,
                RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
            ));
        }
        message.to_vec().unwrap()
    }

    #[test]
    fn hit_rewrites_id_and_ttl() {
        let cache = DnsCache::default();
        let start = Instant::now();
        cache.store_at(&response(1, "example.com.", 300, ResponseCode::NoError), start);
        assert_eq!(cache.len(), 1);

        let later = start + Duration::from_secs(100);
        let answer = cache
            .answer_at(&query(0xBEEF, "EXAMPLE.com."), later)
            .expect("cached");
        let answer = Message::from_vec(&answer).unwrap();
        assert_eq!(answer.id(), 0xBEEF);
        assert_eq!(answer.answers().len(), 1);
        assert_eq!(answer.answers()[0].ttl(), 200);
    }

    #[test]
    fn expired_entries_miss_and_are_purged() {
        let cache = DnsCache::default();
        let start = Instant::now();
        cache.store_at(&response(1, "example.com.", 5, ResponseCode::NoError), start);

        let later = start + Duration::from_secs(6);
        assert!(cache.answer_at(&query(2, "example.com."), later).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn failures_and_zero_ttls_are_not_cached() {
        let cache = DnsCache::default();
        cache.store(&response(1, "missing.example.", 300, ResponseCode::NXDomain));
        cache.store(&response(1, "volatile.example.", 0, ResponseCode::NoError));
        cache.store(b"not dns at all");
        assert!(cache.is_empty());
    }

    #[test]
    fn other_record_types_miss() {
        let cache = DnsCache::default();
        cache.store(&response(1, "example.com.", 300, ResponseCode::NoError));

        let mut aaaa = Message::new();
        aaaa.set_id(3)
            .set_message_type(MessageType::Query)
            .add_query(Query::query(
                Name::from_str("example.com.").unwrap(),
                RecordType::AAAA,
            ));
        assert!(cache.answer(&aaaa.to_vec().unwrap()).is_none());
    }

    #[test]
    fn full_cache_keeps_existing_entries() {
        let cache = DnsCache::new(1);
        cache.store(&response(1, "one.example.", 300, ResponseCode::NoError));
        cache.store(&response(1, "two.example.", 300, ResponseCode::NoError));
        assert_eq!(cache.len(), 1);
        assert!(cache.answer(&query(9, "one.example.")).is_some());
    }
}
