use std::{
    collections::{hash_map::Entry, HashMap},
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use crate::id::InfoHash;

/// How long an announced peer stays stored without a re-announce.
pub(crate) const PEER_TTL: Duration = Duration::from_secs(60 * 60);

/// Global cap on stored peer records. When full, the record closest to
/// expiry (the least recently announced one) makes room.
const MAX_PEERS_STORED: usize = 500;

/// Peers announced to us, per info hash, with per-record expiry.
///
/// Entries for an info hash only exist while at least one live record does;
/// looking up an unknown hash allocates nothing.
pub(crate) struct PeerStore {
    records: HashMap<InfoHash, Vec<PeerRecord>>,
    len: usize,
}

struct PeerRecord {
    addr: SocketAddrV4,
    expires_at: Instant,
}

impl PeerStore {
    pub fn new() -> PeerStore {
        PeerStore {
            records: HashMap::new(),
            len: 0,
        }
    }

    /// Store or renew a peer record.
    ///
    /// Returns true if the `(info_hash, addr)` pair is stored for the first
    /// time; a re-announce of a known pair only pushes its expiry out and
    /// returns false.
    pub fn insert(&mut self, info_hash: InfoHash, addr: SocketAddrV4, now: Instant) -> bool {
        let expires_at = now + PEER_TTL;

        if let Some(records) = self.records.get_mut(&info_hash) {
            if let Some(record) = records.iter_mut().find(|r| r.addr == addr) {
                record.expires_at = expires_at;
                return false;
            }
        }

        if self.len >= MAX_PEERS_STORED {
            self.evict_soonest_expiring();
        }

        self.records
            .entry(info_hash)
            .or_default()
            .push(PeerRecord { addr, expires_at });
        self.len += 1;

        true
    }

    /// Addresses currently stored for the info hash.
    pub fn get(&self, info_hash: &InfoHash, now: Instant) -> Vec<SocketAddrV4> {
        self.records
            .get(info_hash)
            .into_iter()
            .flatten()
            .filter(|r| r.expires_at > now)
            .map(|r| r.addr)
            .collect()
    }

    /// Drop every record whose TTL has run out and report the removals.
    pub fn sweep(&mut self, now: Instant) -> Vec<(InfoHash, SocketAddrV4)> {
        let mut removed = Vec::new();

        self.records.retain(|info_hash, records| {
            records.retain(|record| {
                let keep = record.expires_at > now;
                if !keep {
                    removed.push((*info_hash, record.addr));
                }
                keep
            });
            !records.is_empty()
        });

        self.len -= removed.len();
        removed
    }

    /// Earliest deadline at which a record expires, for scheduling the next
    /// sweep. None when the store is empty.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.records
            .values()
            .flatten()
            .map(|record| record.expires_at)
            .min()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.len
    }

    /// Make room by dropping the record that would expire first.
    fn evict_soonest_expiring(&mut self) {
        let victim = self
            .records
            .iter()
            .flat_map(|(info_hash, records)| {
                records.iter().map(move |r| (*info_hash, r.addr, r.expires_at))
            })
            .min_by_key(|(_, _, expires_at)| *expires_at);

        if let Some((info_hash, addr, _)) = victim {
            if let Entry::Occupied(mut entry) = self.records.entry(info_hash) {
                entry.get_mut().retain(|r| r.addr != addr);
                if entry.get().is_empty() {
                    entry.remove();
                }
                self.len -= 1;
            }
        }
    }
}
