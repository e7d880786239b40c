pub(crate) use self::handler::DhtHandler;

use crate::id::{InfoHash, NodeId};
use crate::routing::node::ContactInfo;
use crate::transaction::TransactionId;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;

pub(crate) mod handler;
pub(crate) mod lookup;
pub(crate) mod socket;
pub(crate) mod timer;

/// Request sent from the public handle into the worker.
pub(crate) enum Command {
    /// Seed the routing table by looking up our own id, starting at the
    /// given contact.
    Connect {
        addr: SocketAddrV4,
        reply: oneshot::Sender<()>,
    },
    /// Iterative get_peers; with `announce_port` set, announce ourselves to
    /// the closest responders afterwards.
    Search {
        info_hash: InfoHash,
        announce_port: Option<u16>,
        reply: oneshot::Sender<Vec<SocketAddrV4>>,
    },
    /// Stop the worker: cancel all timers, drop pending queries, close the
    /// socket. Acknowledged once nothing can fire anymore.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Entry fired by the worker's deadline queue.
#[derive(Copy, Clone, Debug)]
pub(crate) enum ScheduledTask {
    /// A pending query went unanswered.
    TransactionTimeout(TransactionId),
    /// A tracked contact is due for its liveness ping. The `Instant` is the
    /// contact's `first_seen` stamp, identifying the incarnation this chain
    /// belongs to.
    ContactPing(ContactInfo, Instant),
    /// A bucket (keyed by its stable lower bound) is due for a refresh
    /// lookup.
    BucketRefresh(NodeId),
    /// The peer store has records that may have expired.
    PeerSweep,
}

/// Event surfaced to the embedding application.
#[derive(Clone, Debug)]
pub enum DhtEvent {
    /// The UDP socket is bound and the node is serving queries.
    Listening(SocketAddr),
    /// A peer announced itself for the info hash (first appearance only;
    /// re-announces merely renew).
    PeerNew(InfoHash, SocketAddrV4),
    /// A stored peer record expired without being renewed.
    PeerDelete(InfoHash, SocketAddrV4),
    /// A datagram was dropped; diagnostics only, the node keeps running.
    Error(DhtFault),
}

/// Diagnostic faults reported through [`DhtEvent::Error`]. One datagram
/// produces at most one fault and never affects another exchange.
#[derive(Clone, Debug, Error)]
pub enum DhtFault {
    #[error("malformed datagram from {0}")]
    Malformed(SocketAddrV4),
    #[error("response from {from} does not match the queried address {queried}")]
    ResponderMismatch {
        from: SocketAddrV4,
        queried: SocketAddrV4,
    },
}

/// Why a pending query concluded without a usable response.
#[derive(Debug)]
pub(crate) enum QueryFailure {
    /// No response within the deadline.
    Timeout,
    /// The remote answered with a KRPC error.
    Remote { code: u8, message: String },
    /// The datagram never left: local send failure.
    Transport,
}
