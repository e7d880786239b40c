//! Request/response correlation over unreliable UDP.
//!
//! Every outgoing query registers a pending entry under a fresh transaction
//! id and schedules a response timeout. Whatever happens first - the
//! response arriving, the timeout firing or the node shutting down -
//! removes the entry, so the outcome of a query is delivered exactly once
//! and a late response after a timeout is dropped on the floor.
//!
//! Ids are two random bytes, which comfortably covers the number of queries
//! in flight at once. Should the random draw keep colliding with
//! outstanding ids, the registry transparently extends to three bytes; the
//! protocol treats `t` as an opaque byte string of any length.

use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::id::{InfoHash, NodeId};
use crate::worker::{
    timer::{Timeout, Timer},
    ScheduledTask,
};

/// How long we wait for a response before a query counts as failed.
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How many short id draws may collide before we move to long ids.
const SHORT_ID_RETRIES: usize = 8;

const SHORT_ID_LEN: usize = 2;
const LONG_ID_LEN: usize = 3;

/// Opaque transaction id: two bytes, three under collision pressure.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct TransactionId {
    len: u8,
    bytes: [u8; LONG_ID_LEN],
}

impl TransactionId {
    fn random<R: Rng>(rng: &mut R, len: usize) -> Self {
        let mut bytes = [0u8; LONG_ID_LEN];
        rng.fill(&mut bytes[..len]);

        TransactionId {
            len: len as u8,
            bytes,
        }
    }

    /// Parse a transaction id we may have issued. Anything of a length we
    /// never generate cannot match an outstanding query.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SHORT_ID_LEN && bytes.len() != LONG_ID_LEN {
            return None;
        }

        let mut out = [0u8; LONG_ID_LEN];
        out[..bytes.len()].copy_from_slice(bytes);

        Some(TransactionId {
            len: bytes.len() as u8,
            bytes: out,
        })
    }
}

impl AsRef<[u8]> for TransactionId {
    fn as_ref(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }
}

// ----------------------------------------------------------------------------//

/// Identifier of an iterative lookup within the worker.
pub(crate) type SearchId = u64;

/// Where the outcome of a pending query is routed.
#[derive(Copy, Clone, Debug)]
pub(crate) enum QueryLink {
    /// Liveness probe; the outcome only affects the queried contact.
    /// `chain` identifies the contact incarnation whose ping schedule the
    /// outcome continues.
    Ping { chain: Instant },
    /// Round of an iterative lookup.
    Search(SearchId),
    /// Final announce of a lookup that requested it.
    Announce(InfoHash),
}

/// The node a query went to. The id is unknown when querying a bootstrap
/// address that is not in the routing table yet.
#[derive(Copy, Clone, Debug)]
pub(crate) struct QueriedNode {
    pub id: Option<NodeId>,
    pub addr: SocketAddrV4,
}

pub(crate) struct PendingQuery {
    pub link: QueryLink,
    pub node: QueriedNode,
    pub timeout: Timeout,
}

/// Registry of queries awaiting a response.
pub(crate) struct Transactions {
    pending: HashMap<TransactionId, PendingQuery>,
}

impl Transactions {
    pub fn new() -> Transactions {
        Transactions {
            pending: HashMap::new(),
        }
    }

    #[allow(unused)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Allocate a transaction id for a query to `node` and schedule its
    /// response timeout.
    pub fn register(
        &mut self,
        link: QueryLink,
        node: QueriedNode,
        timer: &mut Timer<ScheduledTask>,
    ) -> TransactionId {
        let tid = self.fresh_id();
        let timeout = timer.schedule_in(RESPONSE_TIMEOUT, ScheduledTask::TransactionTimeout(tid));

        self.pending.insert(tid, PendingQuery { link, node, timeout });

        tid
    }

    /// Take the pending query matching a response's transaction id. Returns
    /// None for unknown (late, unsolicited or malformed) ids; the caller
    /// cancels the returned query's timeout.
    pub fn resolve(&mut self, tid_bytes: &[u8]) -> Option<PendingQuery> {
        let tid = TransactionId::from_bytes(tid_bytes)?;
        self.pending.remove(&tid)
    }

    /// Take the pending query whose timeout fired. None if a response beat
    /// the timeout to it.
    pub fn expire(&mut self, tid: TransactionId) -> Option<PendingQuery> {
        self.pending.remove(&tid)
    }

    /// Empty the registry, yielding every outstanding query. Used on
    /// shutdown; the timer is cleared wholesale by the caller.
    pub fn drain(&mut self) -> Vec<PendingQuery> {
        self.pending.drain().map(|(_, query)| query).collect()
    }

    fn fresh_id(&self) -> TransactionId {
        let mut rng = rand::thread_rng();

        for _ in 0..SHORT_ID_RETRIES {
            let tid = TransactionId::random(&mut rng, SHORT_ID_LEN);
            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }

        // The short id space is congested; fall back to long ids.
        loop {
            let tid = TransactionId::random(&mut rng, LONG_ID_LEN);
            if !self.pending.contains_key(&tid) {
                return tid;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;
    use crate::worker::timer::Timer;

    fn dummy_node() -> QueriedNode {
        QueriedNode {
            id: None,
            addr: test::dummy_socket_addr_v4(1),
        }
    }

    #[test]
    fn roundtrip_through_bytes() {
        let mut transactions = Transactions::new();
        let mut timer = Timer::new();

        let tid = transactions.register(QueryLink::Ping { chain: Instant::now() }, dummy_node(), &mut timer);

        assert_eq!(tid.as_ref().len(), SHORT_ID_LEN);
        assert_eq!(TransactionId::from_bytes(tid.as_ref()), Some(tid));
    }

    #[test]
    fn resolve_is_at_most_once() {
        let mut transactions = Transactions::new();
        let mut timer = Timer::new();

        let tid = transactions.register(QueryLink::Ping { chain: Instant::now() }, dummy_node(), &mut timer);

        assert!(transactions.resolve(tid.as_ref()).is_some());
        // A duplicate response and the late timeout both find nothing.
        assert!(transactions.resolve(tid.as_ref()).is_none());
        assert!(transactions.expire(tid).is_none());
    }

    #[test]
    fn timeout_wins_over_late_response() {
        let mut transactions = Transactions::new();
        let mut timer = Timer::new();

        let tid = transactions.register(QueryLink::Ping { chain: Instant::now() }, dummy_node(), &mut timer);

        assert!(transactions.expire(tid).is_some());
        assert!(transactions.resolve(tid.as_ref()).is_none());
    }

    #[test]
    fn unknown_ids_resolve_to_nothing() {
        let mut transactions = Transactions::new();

        assert!(transactions.resolve(b"zz").is_none());
        assert!(transactions.resolve(b"").is_none());
        assert!(transactions.resolve(b"too long to be ours").is_none());
    }

    #[test]
    fn ids_are_unique_among_outstanding() {
        let mut transactions = Transactions::new();
        let mut timer = Timer::new();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..1024 {
            let tid = transactions.register(QueryLink::Ping { chain: Instant::now() }, dummy_node(), &mut timer);
            assert!(seen.insert(tid));
        }
    }

    #[test]
    fn congested_short_space_extends_to_long_ids() {
        let mut transactions = Transactions::new();
        let mut timer = Timer::new();

        // Occupy the entire short id space by hand.
        for a in 0..=u8::MAX {
            for b in 0..=u8::MAX {
                let tid = TransactionId::from_bytes(&[a, b]).unwrap();
                let timeout =
                    timer.schedule_in(RESPONSE_TIMEOUT, ScheduledTask::TransactionTimeout(tid));
                transactions.pending.insert(
                    tid,
                    PendingQuery {
                        link: QueryLink::Ping { chain: Instant::now() },
                        node: dummy_node(),
                        timeout,
                    },
                );
            }
        }

        let tid = transactions.register(QueryLink::Ping { chain: Instant::now() }, dummy_node(), &mut timer);
        assert_eq!(tid.as_ref().len(), LONG_ID_LEN);
    }

    #[test]
    fn drain_empties_the_registry() {
        let mut transactions = Transactions::new();
        let mut timer = Timer::new();

        for _ in 0..4 {
            transactions.register(QueryLink::Ping { chain: Instant::now() }, dummy_node(), &mut timer);
        }

        assert_eq!(transactions.drain().len(), 4);
        assert_eq!(transactions.len(), 0);
    }
}
