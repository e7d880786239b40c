//! Iterative Kademlia lookups.
//!
//! One state machine serves both `find_node` (chasing a node id, used for
//! seeding and bucket refreshes) and `get_peers` (chasing an info hash,
//! optionally announcing afterwards). The machine keeps a shortlist of
//! candidates ordered by XOR distance to the target, queries up to alpha of
//! them at a time from within the best K, and finishes when the best K
//! known candidates have all answered or failed and nothing closer is left
//! to ask.

use log::{debug, error};
use std::collections::HashMap;
use std::mem;
use std::net::SocketAddrV4;
use tokio::sync::oneshot;

use crate::id::{Id, NodeId};
use crate::message::{
    AnnouncePeerRequest, FindNodeRequest, GetPeersRequest, Message, MessageBody, Request,
};
use crate::routing::bucket::MAX_BUCKET_SIZE;
use crate::routing::node::ContactInfo;
use crate::transaction::{QueriedNode, QueryLink, SearchId, Transactions};
use crate::worker::{socket::Socket, timer::Timer, ScheduledTask};

/// Number of queries kept in flight at once.
const ALPHA: usize = 3;

/// Width of the result window: the lookup tries to get answers from the K
/// closest candidates it learns about.
const K: usize = MAX_BUCKET_SIZE;

/// What the lookup is chasing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum SearchKind {
    /// `find_node`: populate the routing table around the target.
    Nodes,
    /// `get_peers`: collect peer addresses for the target info hash.
    Peers,
}

/// Where the finished lookup reports to.
pub(crate) enum SearchReply {
    /// Peer addresses found (get_peers lookups).
    Peers(oneshot::Sender<Vec<SocketAddrV4>>),
    /// Bare completion (connect-style seeding).
    Done(oneshot::Sender<()>),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SearchStatus {
    InProgress,
    Complete,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CandidateState {
    /// Known but not queried yet.
    Fresh,
    /// Query sent, response pending.
    Waiting,
    Responded,
    Failed,
}

struct Candidate {
    /// XOR distance to the target; `Id::MAX` while the id is unknown
    /// (bootstrap addresses we were given without one).
    distance: Id,
    id: Option<NodeId>,
    addr: SocketAddrV4,
    state: CandidateState,
}

/// Borrowed worker state a lookup needs to make progress.
pub(crate) struct SearchContext<'a> {
    pub local_id: NodeId,
    pub socket: &'a Socket,
    pub timer: &'a mut Timer<ScheduledTask>,
    pub transactions: &'a mut Transactions,
}

pub(crate) struct Search {
    id: SearchId,
    target: Id,
    kind: SearchKind,
    /// Port to announce after a peers lookup; None means no announce.
    announce_port: Option<u16>,
    /// Shortlist, ascending by distance, deduplicated by id and address.
    candidates: Vec<Candidate>,
    /// Deduplicated peer addresses collected from `values`.
    peers: Vec<SocketAddrV4>,
    /// Announce token per responder address.
    tokens: HashMap<SocketAddrV4, Vec<u8>>,
    in_flight: usize,
    reply: Option<SearchReply>,
}

impl Search {
    /// Build a lookup seeded with contacts from the routing table and
    /// optionally with bare bootstrap addresses.
    pub fn new(
        id: SearchId,
        target: Id,
        kind: SearchKind,
        announce_port: Option<u16>,
        reply: Option<SearchReply>,
        seed_contacts: Vec<ContactInfo>,
        seed_addrs: Vec<SocketAddrV4>,
    ) -> Search {
        let mut search = Search {
            id,
            target,
            kind,
            announce_port,
            candidates: Vec::new(),
            peers: Vec::new(),
            tokens: HashMap::new(),
            in_flight: 0,
            reply,
        };

        for info in seed_contacts {
            search.add_candidate(Some(info.id), info.addr);
        }
        for addr in seed_addrs {
            search.add_candidate(None, addr);
        }

        search
    }

    /// Send the first round of queries.
    pub async fn start(&mut self, ctx: &mut SearchContext<'_>) -> SearchStatus {
        self.pump(ctx).await
    }

    /// Feed a response from `from`. The caller has already validated the
    /// message, credited the responder in the routing table and extracted
    /// the returned contacts/values.
    pub async fn handle_response(
        &mut self,
        ctx: &mut SearchContext<'_>,
        from: SocketAddrV4,
        responder_id: NodeId,
        nodes: &[ContactInfo],
        values: Vec<SocketAddrV4>,
        token: Option<Vec<u8>>,
    ) -> SearchStatus {
        if let Some(index) = self.candidates.iter().position(|c| c.addr == from) {
            if self.candidates[index].state == CandidateState::Waiting {
                self.in_flight -= 1;
            }

            // A bootstrap address reveals its id with its first response,
            // which moves the candidate to its true distance; remove and
            // reinsert to keep the shortlist ordered.
            let mut candidate = self.candidates.remove(index);
            candidate.state = CandidateState::Responded;
            candidate.id = Some(responder_id);
            candidate.distance = responder_id ^ self.target;

            let at = self
                .candidates
                .partition_point(|c| c.distance <= candidate.distance);
            self.candidates.insert(at, candidate);
        }

        if let Some(token) = token {
            self.tokens.insert(from, token);
        }

        for value in values {
            if !self.peers.contains(&value) {
                self.peers.push(value);
            }
        }

        for node in nodes {
            if node.id != ctx.local_id {
                self.add_candidate(Some(node.id), node.addr);
            }
        }

        self.pump(ctx).await
    }

    /// Feed a failure (timeout, error reply or transport error) of the
    /// query sent to `from`.
    pub async fn handle_failure(
        &mut self,
        ctx: &mut SearchContext<'_>,
        from: SocketAddrV4,
    ) -> SearchStatus {
        if let Some(index) = self.candidates.iter().position(|c| c.addr == from) {
            if self.candidates[index].state == CandidateState::Waiting {
                self.in_flight -= 1;
            }
            self.candidates[index].state = CandidateState::Failed;
        }

        self.pump(ctx).await
    }

    /// Issue queries while there is parallelism to spare and candidates
    /// worth asking; conclude the lookup when neither remains.
    async fn pump(&mut self, ctx: &mut SearchContext<'_>) -> SearchStatus {
        while self.in_flight < ALPHA {
            let Some(index) = self.next_query_index() else {
                break;
            };
            self.send_query(ctx, index).await;
        }

        if self.in_flight > 0 {
            return SearchStatus::InProgress;
        }

        self.finish(ctx).await;
        SearchStatus::Complete
    }

    /// Closest fresh candidate within the best-K window of non-failed
    /// candidates.
    fn next_query_index(&self) -> Option<usize> {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state != CandidateState::Failed)
            .take(K)
            .find(|(_, c)| c.state == CandidateState::Fresh)
            .map(|(index, _)| index)
    }

    async fn send_query(&mut self, ctx: &mut SearchContext<'_>, index: usize) {
        let (addr, node) = {
            let candidate = &self.candidates[index];
            (
                candidate.addr,
                QueriedNode {
                    id: candidate.id,
                    addr: candidate.addr,
                },
            )
        };

        let tid = ctx
            .transactions
            .register(QueryLink::Search(self.id), node, ctx.timer);

        let request = match self.kind {
            SearchKind::Nodes => Request::FindNode(FindNodeRequest {
                id: ctx.local_id,
                target: self.target,
            }),
            SearchKind::Peers => Request::GetPeers(GetPeersRequest {
                id: ctx.local_id,
                info_hash: self.target,
            }),
        };
        let message = Message {
            transaction_id: tid.as_ref().to_vec(),
            body: MessageBody::Request(request),
        }
        .encode();

        match ctx.socket.send(&message, addr).await {
            Ok(()) => {
                self.candidates[index].state = CandidateState::Waiting;
                self.in_flight += 1;
            }
            Err(cause) => {
                // Send failure surfaces as a transport error on this query:
                // retire the transaction and skip the candidate.
                error!("failed to send lookup query to {}: {}", addr, cause);
                if let Some(query) = ctx.transactions.resolve(tid.as_ref()) {
                    ctx.timer.cancel(query.timeout);
                }
                self.candidates[index].state = CandidateState::Failed;
            }
        }
    }

    /// Wrap up: announce to the closest responders if asked to, then hand
    /// the collected peers to the caller.
    async fn finish(&mut self, ctx: &mut SearchContext<'_>) {
        if self.kind == SearchKind::Peers {
            if let Some(port) = self.announce_port {
                self.announce(ctx, port).await;
            }
        }

        debug!(
            "lookup for {:?} finished with {} peers from {} candidates",
            self.target,
            self.peers.len(),
            self.candidates.len()
        );

        let peers = mem::take(&mut self.peers);
        match self.reply.take() {
            Some(SearchReply::Peers(reply)) => {
                reply.send(peers).unwrap_or(());
            }
            Some(SearchReply::Done(reply)) => {
                reply.send(()).unwrap_or(());
            }
            None => (),
        }
    }

    /// Send `announce_peer` to the up-to-K closest responders that gave us
    /// a token.
    async fn announce(&mut self, ctx: &mut SearchContext<'_>, port: u16) {
        let targets: Vec<(SocketAddrV4, Option<NodeId>, Vec<u8>)> = self
            .candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| {
                self.tokens
                    .get(&c.addr)
                    .map(|token| (c.addr, c.id, token.clone()))
            })
            .take(K)
            .collect();

        for (addr, id, token) in targets {
            let tid = ctx.transactions.register(
                QueryLink::Announce(self.target),
                QueriedNode { id, addr },
                ctx.timer,
            );

            let message = Message {
                transaction_id: tid.as_ref().to_vec(),
                body: MessageBody::Request(Request::AnnouncePeer(AnnouncePeerRequest {
                    id: ctx.local_id,
                    implied_port: false,
                    info_hash: self.target,
                    port: Some(port),
                    token,
                })),
            }
            .encode();

            if let Err(cause) = ctx.socket.send(&message, addr).await {
                error!("failed to send announce to {}: {}", addr, cause);
                if let Some(query) = ctx.transactions.resolve(tid.as_ref()) {
                    ctx.timer.cancel(query.timeout);
                }
            }
        }
    }

    /// Insert a candidate in distance order unless its address or id is
    /// already on the shortlist.
    fn add_candidate(&mut self, id: Option<NodeId>, addr: SocketAddrV4) {
        let duplicate = self.candidates.iter().any(|c| {
            c.addr == addr || (id.is_some() && c.id == id)
        });
        if duplicate {
            return;
        }

        let distance = match id {
            Some(id) => id ^ self.target,
            None => Id::MAX,
        };

        let index = self
            .candidates
            .partition_point(|c| c.distance <= distance);
        self.candidates.insert(
            index,
            Candidate {
                distance,
                id,
                addr,
                state: CandidateState::Fresh,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn sample_search(seed_contacts: Vec<ContactInfo>, seed_addrs: Vec<SocketAddrV4>) -> Search {
        Search::new(
            1,
            Id::MIN,
            SearchKind::Nodes,
            None,
            None,
            seed_contacts,
            seed_addrs,
        )
    }

    #[test]
    fn candidates_stay_sorted_and_deduplicated() {
        let mut search = sample_search(Vec::new(), Vec::new());

        for seq in [5u8, 1, 3, 1, 200] {
            search.add_candidate(
                Some(test::dummy_node_id(seq)),
                test::dummy_socket_addr_v4(u16::from(seq)),
            );
        }

        // The duplicate id was dropped.
        assert_eq!(search.candidates.len(), 4);

        for pair in search.candidates.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn unknown_id_candidates_sort_last() {
        let mut search = sample_search(
            vec![ContactInfo::new(
                test::dummy_node_id(1),
                test::dummy_socket_addr_v4(1),
            )],
            vec![test::dummy_socket_addr_v4(99)],
        );

        assert_eq!(search.candidates.len(), 2);
        assert_eq!(search.candidates[1].id, None);

        // Until it responds, the bootstrap address ranks at maximum
        // distance; its first response fixes that up.
        search.add_candidate(Some(test::dummy_node_id(2)), test::dummy_socket_addr_v4(2));
        assert_eq!(search.candidates[2].id, None);
    }

    #[test]
    fn query_window_skips_failed_candidates() {
        let mut search = sample_search(Vec::new(), Vec::new());

        for seq in 1..=4u8 {
            search.add_candidate(
                Some(test::dummy_node_id(seq)),
                test::dummy_socket_addr_v4(u16::from(seq)),
            );
        }

        search.candidates[0].state = CandidateState::Failed;
        search.candidates[1].state = CandidateState::Responded;

        let next = search.next_query_index().unwrap();
        assert_eq!(search.candidates[next].state, CandidateState::Fresh);
        assert_eq!(next, 2);
    }

    #[test]
    fn no_fresh_candidates_means_no_next_query() {
        let mut search = sample_search(Vec::new(), Vec::new());

        search.add_candidate(Some(test::dummy_node_id(1)), test::dummy_socket_addr_v4(1));
        search.candidates[0].state = CandidateState::Responded;

        assert_eq!(search.next_query_index(), None);
    }
}
