//! In-memory cache of search responses, keyed by the canonical encoding of
//! the originating search request. Entries collect responses as they stream
//! back from the upstream and become replayable once the terminal
//! SearchResultDone arrives.

use crate::ldap_protocol::{LdapMessage, ProtocolOp, SearchRequest};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Canonical serialization of a search request payload (see
/// `search_request_fingerprint`).
pub type Fingerprint = Vec<u8>;

/// One cached exchange: the request it answers and every response PDU the
/// upstream produced for it, in arrival order.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The originating search payload, kept for identity and debugging.
    pub request: SearchRequest,
    /// SearchResultEntry / SearchResultReference messages followed by one
    /// terminal SearchResultDone.
    pub responses: Vec<LdapMessage>,
    pub completed: bool,
    inserted_at: Instant,
}

/// Outcome of a cache lookup on the request path.
pub enum CacheLookup {
    /// Completed entry; responses are ready to replay.
    Hit(Vec<LdapMessage>),
    /// An entry exists but has not seen its SearchResultDone yet. The
    /// request is still forwarded upstream.
    InProgress,
    Miss,
}

pub struct ResponseCache {
    entries: HashMap<Fingerprint, CacheEntry>,
    expire: Duration,
}

impl ResponseCache {
    pub fn new(expire: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            expire,
        }
    }

    /// Look up a fingerprint. Expired entries are dropped on sight and
    /// reported as a miss.
    pub fn lookup(&mut self, fingerprint: &Fingerprint) -> CacheLookup {
        match self.entries.get(fingerprint) {
            Some(entry) if entry.inserted_at.elapsed() >= self.expire => {
                self.entries.remove(fingerprint);
                CacheLookup::Miss
            }
            Some(entry) if entry.completed => CacheLookup::Hit(entry.responses.clone()),
            Some(_) => CacheLookup::InProgress,
            None => CacheLookup::Miss,
        }
    }

    /// Insert a fresh, in-progress entry for a request just forwarded
    /// upstream. Overwrites any stale entry under the same key.
    pub fn begin(&mut self, fingerprint: Fingerprint, request: SearchRequest) {
        self.entries.insert(
            fingerprint,
            CacheEntry {
                request,
                responses: Vec::new(),
                completed: false,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Append one response to an in-progress entry. A SearchResultDone
    /// completes the entry; a completed entry is never touched again, and
    /// appends to a missing or completed entry are dropped.
    ///
    /// Returns true when this append completed the entry.
    pub fn append(&mut self, fingerprint: &Fingerprint, response: LdapMessage) -> bool {
        let Some(entry) = self.entries.get_mut(fingerprint) else {
            return false;
        };
        if entry.completed {
            return false;
        }
        let is_done = matches!(response.protocol_op, ProtocolOp::SearchResultDone(_));
        entry.responses.push(response);
        if is_done {
            entry.completed = true;
            debug!(
                "cache entry completed ({} responses)",
                entry.responses.len()
            );
        }
        is_done
    }

    /// Evict entries older than the expiry window. Called opportunistically
    /// when no connection pairs are active.
    pub fn purge(&mut self) {
        let expire = self.expire;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < expire);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("cache purge evicted {} of {} entries", evicted, before);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{
        Attribute, Filter, LdapResult, SearchResultEntry, SearchScope,
        search_request_fingerprint,
    };

    fn sample_request() -> SearchRequest {
        SearchRequest {
            base_object: "dc=x".to_string(),
            scope: SearchScope::SingleLevel,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: Filter::EqualityMatch {
                attribute: "uid".to_string(),
                value: b"bob".to_vec(),
            },
            attributes: vec![],
        }
    }

    fn entry_msg(id: i32) -> LdapMessage {
        LdapMessage {
            message_id: id,
            protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
                object_name: "uid=bob,dc=x".to_string(),
                attributes: vec![Attribute {
                    attr_type: "cn".to_string(),
                    attr_values: vec![b"Bob".to_vec()],
                }],
            }),
            controls: None,
        }
    }

    fn done_msg(id: i32) -> LdapMessage {
        LdapMessage {
            message_id: id,
            protocol_op: ProtocolOp::SearchResultDone(LdapResult {
                result_code: 0,
                matched_dn: String::new(),
                diagnostic_message: String::new(),
                extra: Vec::new(),
            }),
            controls: None,
        }
    }

    #[test]
    fn test_miss_then_begin_then_in_progress() {
        let mut cache = ResponseCache::new(Duration::from_secs(60));
        let req = sample_request();
        let fp = search_request_fingerprint(&req);
        assert!(matches!(cache.lookup(&fp), CacheLookup::Miss));
        cache.begin(fp.clone(), req);
        assert!(matches!(cache.lookup(&fp), CacheLookup::InProgress));
    }

    #[test]
    fn test_completion_and_replay() {
        let mut cache = ResponseCache::new(Duration::from_secs(60));
        let req = sample_request();
        let fp = search_request_fingerprint(&req);
        cache.begin(fp.clone(), req);
        assert!(!cache.append(&fp, entry_msg(10)));
        assert!(!cache.append(&fp, entry_msg(10)));
        assert!(cache.append(&fp, done_msg(10)));

        match cache.lookup(&fp) {
            CacheLookup::Hit(responses) => {
                assert_eq!(responses.len(), 3);
                assert!(matches!(
                    responses[2].protocol_op,
                    ProtocolOp::SearchResultDone(_)
                ));
            }
            _ => panic!("expected completed hit"),
        }
    }

    #[test]
    fn test_append_after_completion_ignored() {
        let mut cache = ResponseCache::new(Duration::from_secs(60));
        let req = sample_request();
        let fp = search_request_fingerprint(&req);
        cache.begin(fp.clone(), req);
        cache.append(&fp, entry_msg(1));
        cache.append(&fp, done_msg(1));
        // Late responses must not mutate a completed entry.
        assert!(!cache.append(&fp, entry_msg(1)));
        assert!(!cache.append(&fp, done_msg(1)));
        match cache.lookup(&fp) {
            CacheLookup::Hit(responses) => assert_eq!(responses.len(), 2),
            _ => panic!("expected hit"),
        }
    }

    #[test]
    fn test_append_to_unknown_key_ignored() {
        let mut cache = ResponseCache::new(Duration::from_secs(60));
        assert!(!cache.append(&vec![1, 2, 3], entry_msg(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let mut cache = ResponseCache::new(Duration::from_millis(0));
        let req = sample_request();
        let fp = search_request_fingerprint(&req);
        cache.begin(fp.clone(), req);
        cache.append(&fp, done_msg(1));
        assert!(matches!(cache.lookup(&fp), CacheLookup::Miss));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_evicts_only_expired() {
        let mut cache = ResponseCache::new(Duration::from_millis(0));
        let req = sample_request();
        let fp = search_request_fingerprint(&req);
        cache.begin(fp, req);
        cache.purge();
        assert!(cache.is_empty());

        let mut fresh = ResponseCache::new(Duration::from_secs(60));
        let req = sample_request();
        let fp = search_request_fingerprint(&req);
        fresh.begin(fp, req);
        fresh.purge();
        assert_eq!(fresh.len(), 1);
    }
}
