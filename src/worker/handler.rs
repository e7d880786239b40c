use futures_util::StreamExt;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tokio::{select, sync::mpsc, sync::oneshot};

use super::{
    lookup::{Search, SearchContext, SearchKind, SearchReply, SearchStatus},
    socket::Socket,
    timer::{Timeout, Timer},
    Command, DhtEvent, DhtFault, QueryFailure, ScheduledTask,
};
use crate::{
    id::{Id, NodeId},
    message::{
        error_code, AckResponse, AnnouncePeerRequest, Envelope, ErrorBody, FindNodeResponse,
        GetPeersRequest, GetPeersResponse, Message, MessageBody, PingRequest, Request, Response,
    },
    routing::{
        bucket::MAX_BUCKET_SIZE,
        node::{Contact, ContactInfo, REPING_INTERVAL},
        table::RoutingTable,
    },
    storage::PeerStore,
    token::{Token, TokenAuthority},
    transaction::{PendingQuery, QueriedNode, QueryLink, SearchId, Transactions},
};

/// How often each bucket originates a refresh lookup.
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// The worker owning all node state: routing table, transactions, peer
/// store and token authority. Everything runs on one task; the public
/// handle reaches in through the command channel.
pub(crate) struct DhtHandler {
    running: bool,
    command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<DhtEvent>,
    socket: Socket,
    timer: Timer<ScheduledTask>,
    routing_table: RoutingTable,
    transactions: Transactions,
    tokens: TokenAuthority,
    peer_store: PeerStore,
    searches: HashMap<SearchId, Search>,
    next_search_id: SearchId,
    /// The single armed peer-store sweep, with its deadline.
    sweep: Option<(Instant, Timeout)>,
}

impl DhtHandler {
    pub fn new(
        routing_table: RoutingTable,
        socket: Socket,
        command_rx: mpsc::UnboundedReceiver<Command>,
        event_tx: mpsc::UnboundedSender<DhtEvent>,
    ) -> Self {
        Self {
            running: true,
            command_rx,
            event_tx,
            socket,
            timer: Timer::new(),
            routing_table,
            transactions: Transactions::new(),
            tokens: TokenAuthority::new(),
            peer_store: PeerStore::new(),
            searches: HashMap::new(),
            next_search_id: 0,
            sweep: None,
        }
    }

    pub async fn run(mut self) {
        // The initial full-range bucket gets the first refresh schedule;
        // buckets born from splits get theirs as the splits happen.
        self.timer.schedule_in(
            BUCKET_REFRESH_INTERVAL,
            ScheduledTask::BucketRefresh(Id::MIN),
        );

        match self.socket.local_addr() {
            Ok(addr) => self.emit(DhtEvent::Listening(addr)),
            Err(cause) => error!("failed to read local address: {}", cause),
        }

        while self.running {
            self.run_once().await
        }
    }

    async fn run_once(&mut self) {
        select! {
            task = self.timer.next(), if !self.timer.is_empty() => {
                if let Some(task) = task {
                    self.handle_task(task).await
                }
            }
            command = self.command_rx.recv() => {
                match command {
                    Some(command) => self.handle_command(command).await,
                    // All handles dropped; shut down.
                    None => self.shutdown(None),
                }
            }
            result = self.socket.recv() => {
                match result {
                    Ok((buffer, from)) => self.handle_datagram(&buffer, from).await,
                    Err(cause) => error!("failed to receive datagram: {}", cause),
                }
            }
        }
    }

    fn emit(&self, event: DhtEvent) {
        self.event_tx.send(event).unwrap_or(())
    }

    // ------------------------------------------------------------------//
    // Commands

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { addr, reply } => {
                self.start_search(
                    SearchKind::Nodes,
                    self.routing_table.local_id(),
                    None,
                    Some(SearchReply::Done(reply)),
                    vec![addr],
                )
                .await;
            }
            Command::Search {
                info_hash,
                announce_port,
                reply,
            } => {
                self.start_search(
                    SearchKind::Peers,
                    info_hash,
                    announce_port,
                    Some(SearchReply::Peers(reply)),
                    Vec::new(),
                )
                .await;
            }
            Command::Shutdown { reply } => self.shutdown(Some(reply)),
        }
    }

    async fn start_search(
        &mut self,
        kind: SearchKind,
        target: Id,
        announce_port: Option<u16>,
        reply: Option<SearchReply>,
        seed_addrs: Vec<SocketAddrV4>,
    ) {
        let id = self.next_search_id;
        self.next_search_id += 1;

        let seeds = self.routing_table.closest(target, MAX_BUCKET_SIZE);
        let mut search = Search::new(id, target, kind, announce_port, reply, seeds, seed_addrs);

        let mut ctx = SearchContext {
            local_id: self.routing_table.local_id(),
            socket: &self.socket,
            timer: &mut self.timer,
            transactions: &mut self.transactions,
        };

        if search.start(&mut ctx).await == SearchStatus::InProgress {
            self.searches.insert(id, search);
        }
    }

    // ------------------------------------------------------------------//
    // Scheduled tasks

    async fn handle_task(&mut self, task: ScheduledTask) {
        match task {
            ScheduledTask::TransactionTimeout(tid) => {
                // A response may have beaten the timeout to the registry.
                if let Some(query) = self.transactions.expire(tid) {
                    self.handle_query_failure(query, QueryFailure::Timeout).await;
                }
            }
            ScheduledTask::ContactPing(info, chain) => {
                self.handle_contact_ping(info, chain).await
            }
            ScheduledTask::BucketRefresh(lo) => self.handle_bucket_refresh(lo).await,
            ScheduledTask::PeerSweep => self.handle_peer_sweep(),
        }
    }

    /// Periodic liveness ping. Each contact incarnation has exactly one
    /// such chain, keyed by its `first_seen` stamp; the chain ends silently
    /// when the contact leaves the table (a later re-add starts a fresh
    /// chain under a fresh stamp).
    async fn handle_contact_ping(&mut self, info: ContactInfo, chain: Instant) {
        let due = match self.routing_table.find_contact_mut(info.id) {
            Some(contact)
                if contact.addr() == info.addr && contact.first_seen() == chain =>
            {
                if contact.needs_ping(Instant::now()) {
                    None
                } else {
                    Some(contact.next_ping_at())
                }
            }
            // Gone, re-homed or re-added: not our contact anymore.
            _ => return,
        };

        match due {
            Some(at) => {
                self.timer
                    .schedule_at(at, ScheduledTask::ContactPing(info, chain));
            }
            None => {
                // The chain resumes when the ping resolves or times out.
                self.send_ping(info, chain).await;
            }
        }
    }

    async fn send_ping(&mut self, info: ContactInfo, chain: Instant) {
        let tid = self.transactions.register(
            QueryLink::Ping { chain },
            QueriedNode {
                id: Some(info.id),
                addr: info.addr,
            },
            &mut self.timer,
        );

        let message = Message {
            transaction_id: tid.as_ref().to_vec(),
            body: MessageBody::Request(Request::Ping(PingRequest {
                id: self.routing_table.local_id(),
            })),
        };

        if let Err(cause) = self.socket.send(&message.encode(), info.addr).await {
            error!("failed to send ping to {}: {}", info.addr, cause);
            if let Some(query) = self.transactions.resolve(tid.as_ref()) {
                self.timer.cancel(query.timeout);
                self.handle_query_failure(query, QueryFailure::Transport).await;
            }
        }
    }

    /// Periodic per-bucket refresh: look up a random id in the bucket's
    /// range. Reschedules itself whether or not the lookup goes anywhere.
    async fn handle_bucket_refresh(&mut self, lo: NodeId) {
        let target = match self.routing_table.bucket_by_lo(lo) {
            Some(bucket) => bucket.random_id(),
            // Bucket bounds never disappear, but end the chain if ours did.
            None => return,
        };

        self.timer.schedule_in(
            BUCKET_REFRESH_INTERVAL,
            ScheduledTask::BucketRefresh(lo),
        );

        debug!("refreshing bucket at {:?} via {:?}", lo, target);
        self.start_search(SearchKind::Nodes, target, None, None, Vec::new())
            .await;
    }

    fn handle_peer_sweep(&mut self) {
        self.sweep = None;

        for (info_hash, addr) in self.peer_store.sweep(Instant::now()) {
            self.emit(DhtEvent::PeerDelete(info_hash, addr));
        }

        self.reschedule_sweep();
    }

    /// Keep exactly one sweep armed, at the earliest stored expiry.
    fn reschedule_sweep(&mut self) {
        let next = match self.peer_store.next_expiry() {
            Some(next) => next,
            None => {
                if let Some((_, timeout)) = self.sweep.take() {
                    self.timer.cancel(timeout);
                }
                return;
            }
        };

        match self.sweep {
            Some((at, _)) if at <= next => (),
            _ => {
                if let Some((_, timeout)) = self.sweep.take() {
                    self.timer.cancel(timeout);
                }
                let timeout = self.timer.schedule_at(next, ScheduledTask::PeerSweep);
                self.sweep = Some((next, timeout));
            }
        }
    }

    // ------------------------------------------------------------------//
    // Inbound datagrams

    async fn handle_datagram(&mut self, buffer: &[u8], from: SocketAddrV4) {
        let message = match Message::decode(buffer) {
            Ok(message) => message,
            Err(_) => {
                self.handle_undecodable(buffer, from).await;
                return;
            }
        };

        match message.body {
            MessageBody::Request(request) => {
                self.handle_request(message.transaction_id, request, from).await
            }
            MessageBody::Response(response) => {
                self.handle_response(message.transaction_id, response, from).await
            }
            MessageBody::Error(body) => {
                self.handle_error_reply(message.transaction_id, body, from).await
            }
        }
    }

    /// A datagram that did not parse as a message. Queries for methods we
    /// do not implement still deserve an error 204; everything else is
    /// dropped with a diagnostic fault.
    async fn handle_undecodable(&mut self, buffer: &[u8], from: SocketAddrV4) {
        match Envelope::decode(buffer) {
            Some(envelope) if envelope.is_unknown_query() => {
                debug!("unknown query method from {}", from);
                self.send_error(
                    envelope.transaction_id,
                    error_code::METHOD_UNKNOWN,
                    "Method Unknown",
                    from,
                )
                .await;
            }
            _ => {
                warn!("dropping malformed datagram from {}", from);
                self.emit(DhtEvent::Error(DhtFault::Malformed(from)));
            }
        }
    }

    async fn handle_request(&mut self, tid: Vec<u8>, request: Request, from: SocketAddrV4) {
        // Every valid query is a liveness signal, handler outcome aside.
        let querier = match &request {
            Request::Ping(r) => r.id,
            Request::FindNode(r) => r.id,
            Request::GetPeers(r) => r.id,
            Request::AnnouncePeer(r) => r.id,
        };
        self.observe_contact(Contact::new(ContactInfo::new(querier, from)));

        let local_id = self.routing_table.local_id();

        match request {
            Request::Ping(_) => {
                let response = Response::Ack(AckResponse { id: local_id });
                self.send_response(tid, response, from).await;
            }
            Request::FindNode(request) => {
                let nodes = self.routing_table.closest(request.target, MAX_BUCKET_SIZE);
                let response = Response::FindNode(FindNodeResponse { id: local_id, nodes });
                self.send_response(tid, response, from).await;
            }
            Request::GetPeers(request) => {
                self.handle_get_peers(tid, request, from).await;
            }
            Request::AnnouncePeer(request) => {
                self.handle_announce_peer(tid, request, from).await;
            }
        }
    }

    async fn handle_get_peers(&mut self, tid: Vec<u8>, request: GetPeersRequest, from: SocketAddrV4) {
        let token = self.tokens.issue(from);
        let peers = self.peer_store.get(&request.info_hash, Instant::now());

        let response = if peers.is_empty() {
            // No peers known: point the querier at closer nodes instead.
            GetPeersResponse {
                id: self.routing_table.local_id(),
                nodes: self.routing_table.closest(request.info_hash, MAX_BUCKET_SIZE),
                token: token.as_ref().to_vec(),
                values: Vec::new(),
            }
        } else {
            GetPeersResponse {
                id: self.routing_table.local_id(),
                nodes: Vec::new(),
                token: token.as_ref().to_vec(),
                values: peers,
            }
        };

        self.send_response(tid, Response::GetPeers(response), from).await;
    }

    async fn handle_announce_peer(
        &mut self,
        tid: Vec<u8>,
        request: AnnouncePeerRequest,
        from: SocketAddrV4,
    ) {
        let valid = match Token::new(&request.token) {
            Ok(token) => self.tokens.verify(from, token),
            Err(_) => false,
        };

        if !valid {
            warn!("rejecting announce from {} with a bad token", from);
            self.send_error(tid, error_code::PROTOCOL_ERROR, "Bad Token", from)
                .await;
            return;
        }

        let peer_addr = SocketAddrV4::new(*from.ip(), request.connect_port(from));
        if self
            .peer_store
            .insert(request.info_hash, peer_addr, Instant::now())
        {
            self.emit(DhtEvent::PeerNew(request.info_hash, peer_addr));
        }
        self.reschedule_sweep();

        let response = Response::Ack(AckResponse {
            id: self.routing_table.local_id(),
        });
        self.send_response(tid, response, from).await;
    }

    async fn handle_response(&mut self, tid: Vec<u8>, response: Response, from: SocketAddrV4) {
        let query = match self.transactions.resolve(&tid) {
            Some(query) => query,
            None => {
                // Late, unsolicited or spoofed; either way not ours to act on.
                debug!("dropping response with unknown transaction id from {}", from);
                return;
            }
        };
        self.timer.cancel(query.timeout);

        // The response must come from the address we queried under an id
        // consistent with what we knew.
        let responder_id = response.id();
        let mismatched = query.node.addr != from
            || query.node.id.map_or(false, |expected| expected != responder_id);
        if mismatched {
            self.emit(DhtEvent::Error(DhtFault::ResponderMismatch {
                from,
                queried: query.node.addr,
            }));
            self.handle_query_failure(query, QueryFailure::Transport).await;
            return;
        }

        // Credit the responder before routing the outcome.
        let responder = ContactInfo::new(responder_id, from);
        if let Some(contact) = self.routing_table.find_contact_mut(responder_id) {
            contact.thank();
        }
        self.observe_contact(Contact::new(responder));

        match query.link {
            QueryLink::Ping { chain } => {
                let alive = self
                    .routing_table
                    .find_contact_mut(responder_id)
                    .map_or(false, |c| c.addr() == from && c.first_seen() == chain);
                if alive {
                    self.timer
                        .schedule_in(REPING_INTERVAL, ScheduledTask::ContactPing(responder, chain));
                }
            }
            QueryLink::Search(search_id) => {
                let (nodes, values, token) = match response {
                    Response::FindNode(r) => (r.nodes, Vec::new(), None),
                    Response::GetPeers(r) => (r.nodes, r.values, Some(r.token)),
                    Response::Ack(_) => (Vec::new(), Vec::new(), None),
                };

                // Contacts learned second-hand enter the table unverified;
                // they earn good standing by responding to us themselves.
                for node in &nodes {
                    if node.id != self.routing_table.local_id() {
                        self.observe_contact(Contact::new_unverified(*node));
                    }
                }

                if let Some(mut search) = self.searches.remove(&search_id) {
                    let mut ctx = SearchContext {
                        local_id: self.routing_table.local_id(),
                        socket: &self.socket,
                        timer: &mut self.timer,
                        transactions: &mut self.transactions,
                    };
                    let status = search
                        .handle_response(&mut ctx, from, responder_id, &nodes, values, token)
                        .await;
                    if status == SearchStatus::InProgress {
                        self.searches.insert(search_id, search);
                    }
                }
            }
            QueryLink::Announce(info_hash) => {
                debug!("announce for {:?} acknowledged by {}", info_hash, from);
            }
        }
    }

    async fn handle_error_reply(&mut self, tid: Vec<u8>, body: ErrorBody, from: SocketAddrV4) {
        let query = match self.transactions.resolve(&tid) {
            Some(query) => query,
            None => {
                debug!("dropping error reply with unknown transaction id from {}", from);
                return;
            }
        };
        self.timer.cancel(query.timeout);

        warn!(
            "received error {} ({}) from {}",
            body.code, body.message, from
        );
        self.handle_query_failure(
            query,
            QueryFailure::Remote {
                code: body.code,
                message: body.message,
            },
        )
        .await;
    }

    /// Common tail of every unsuccessful query: curse the contact and route
    /// the failure to whatever originated the query.
    async fn handle_query_failure(&mut self, query: PendingQuery, failure: QueryFailure) {
        if let Some(id) = query.node.id {
            if let Some(contact) = self.routing_table.find_contact_mut(id) {
                contact.curse();
            }
        }

        match query.link {
            QueryLink::Ping { chain } => {
                // Keep probing; the contact is evicted by bucket policy once
                // it turns bad, which also ends this chain.
                if let Some(id) = query.node.id {
                    let info = ContactInfo::new(id, query.node.addr);
                    let alive = self
                        .routing_table
                        .find_contact_mut(id)
                        .map_or(false, |c| c.addr() == info.addr && c.first_seen() == chain);
                    if alive {
                        self.timer
                            .schedule_in(REPING_INTERVAL, ScheduledTask::ContactPing(info, chain));
                    }
                }
            }
            QueryLink::Search(search_id) => {
                if let Some(mut search) = self.searches.remove(&search_id) {
                    let mut ctx = SearchContext {
                        local_id: self.routing_table.local_id(),
                        socket: &self.socket,
                        timer: &mut self.timer,
                        transactions: &mut self.transactions,
                    };
                    let status = search.handle_failure(&mut ctx, query.node.addr).await;
                    if status == SearchStatus::InProgress {
                        self.searches.insert(search_id, search);
                    }
                }
            }
            QueryLink::Announce(info_hash) => {
                warn!(
                    "announce for {:?} to {} failed: {:?}",
                    info_hash, query.node.addr, failure
                );
            }
        }
    }

    // ------------------------------------------------------------------//
    // Helpers

    /// Record a sighting in the routing table and attach timer chains to
    /// whatever the observation created.
    fn observe_contact(&mut self, contact: Contact) {
        let info = *contact.info();
        let chain = contact.first_seen();
        let observed = self.routing_table.observe(contact);

        if observed.added {
            self.timer
                .schedule_in(REPING_INTERVAL, ScheduledTask::ContactPing(info, chain));
        }

        for lo in observed.new_buckets {
            self.timer
                .schedule_in(BUCKET_REFRESH_INTERVAL, ScheduledTask::BucketRefresh(lo));
        }

        // An evicted contact needs no teardown: its ping chain ends by
        // itself once it no longer finds the contact in the table.
        if let Some(evicted) = observed.evicted {
            debug!("made room by evicting bad contact {:?}", evicted.info());
        }
    }

    async fn send_response(&mut self, tid: Vec<u8>, response: Response, to: SocketAddrV4) {
        let message = Message {
            transaction_id: tid,
            body: MessageBody::Response(response),
        };

        if let Err(cause) = self.socket.send(&message.encode(), to).await {
            error!("failed to send response to {}: {}", to, cause);
        }
    }

    async fn send_error(&mut self, tid: Vec<u8>, code: u8, text: &str, to: SocketAddrV4) {
        let message = Message {
            transaction_id: tid,
            body: MessageBody::Error(ErrorBody {
                code,
                message: text.to_owned(),
            }),
        };

        if let Err(cause) = self.socket.send(&message.encode(), to).await {
            error!("failed to send error reply to {}: {}", to, cause);
        }
    }

    /// Stop the worker. Pending queries are dropped wholesale: in-flight
    /// lookups go away with their reply channels, which their callers
    /// observe as cancellation. Nothing fires after this returns.
    fn shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        self.transactions.drain();
        self.searches.clear();
        self.timer.clear();
        self.sweep = None;
        self.running = false;

        if let Some(reply) = reply {
            reply.send(()).unwrap_or(());
        }
    }
}
