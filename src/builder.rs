use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task,
};

use crate::id::{InfoHash, NodeId};
use crate::routing::table::RoutingTable;
use crate::worker::{socket::Socket, Command, DhtEvent, DhtHandler};

/// The operation could not complete because the node shut down.
#[derive(Debug, Error)]
#[error("the node has shut down")]
pub struct ClosedError;

/// Handle to a running DHT node.
///
/// The node itself lives on a spawned task owning all state; this handle
/// talks to it over a channel and can be cloned freely. Dropping every
/// handle shuts the node down.
#[derive(Clone)]
pub struct Dht {
    command_tx: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
    local_id: NodeId,
}

impl Dht {
    /// Create a new DhtBuilder.
    pub fn builder() -> DhtBuilder {
        DhtBuilder {
            port: 0,
            node_id: None,
            routers: Vec::new(),
        }
    }

    /// Address of the bound UDP socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identifier this node participates under. Generated at startup and
    /// fixed for the node's lifetime.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Seed the routing table through the given contact: an iterative
    /// lookup of our own id, starting there. Resolves when the lookup
    /// settles; the routing table then holds the contact and the closest
    /// nodes it led us to.
    pub async fn connect(&self, addr: SocketAddrV4) -> Result<(), ClosedError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(Command::Connect {
                addr,
                reply: reply_tx,
            })
            .map_err(|_| ClosedError)?;

        reply_rx.await.map_err(|_| ClosedError)
    }

    /// Iterative `get_peers`: collect peers announced for the info hash.
    pub async fn lookup(&self, info_hash: InfoHash) -> Result<Vec<SocketAddrV4>, ClosedError> {
        self.search(info_hash, None).await
    }

    /// Iterative `get_peers` followed by `announce_peer` to the closest
    /// responders: make this node findable as a source for the info hash,
    /// reachable on `port`. Returns the peers found along the way.
    pub async fn advertise(
        &self,
        info_hash: InfoHash,
        port: u16,
    ) -> Result<Vec<SocketAddrV4>, ClosedError> {
        self.search(info_hash, Some(port)).await
    }

    /// Shut the node down: every timer is cancelled, pending lookups
    /// resolve as [`ClosedError`] for their callers, the socket closes.
    /// When this returns nothing of the node runs anymore.
    pub async fn close(self) {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .command_tx
            .send(Command::Shutdown { reply: reply_tx })
            .is_ok()
        {
            reply_rx.await.unwrap_or(());
        }
    }

    async fn search(
        &self,
        info_hash: InfoHash,
        announce_port: Option<u16>,
    ) -> Result<Vec<SocketAddrV4>, ClosedError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(Command::Search {
                info_hash,
                announce_port,
                reply: reply_tx,
            })
            .map_err(|_| ClosedError)?;

        reply_rx.await.map_err(|_| ClosedError)
    }
}

// ----------------------------------------------------------------------------//

/// Configuration for starting a [`Dht`] node.
#[derive(Clone, Debug)]
pub struct DhtBuilder {
    port: u16,
    node_id: Option<NodeId>,
    routers: Vec<SocketAddrV4>,
}

impl DhtBuilder {
    /// Local UDP port to bind. Defaults to 0, letting the OS pick one.
    pub fn bind_port(mut self, port: u16) -> DhtBuilder {
        self.port = port;
        self
    }

    /// Fix the node id instead of generating a random one. Mostly useful
    /// in tests.
    pub fn set_node_id(mut self, node_id: NodeId) -> DhtBuilder {
        self.node_id = Some(node_id);
        self
    }

    /// Add a bootstrap contact to seed the routing table from right after
    /// startup. Equivalent to calling [`Dht::connect`] once running.
    pub fn add_router(mut self, router: SocketAddrV4) -> DhtBuilder {
        self.routers.push(router);
        self
    }

    /// Add bootstrap contacts.
    pub fn add_routers<I>(mut self, routers: I) -> DhtBuilder
    where
        I: IntoIterator<Item = SocketAddrV4>,
    {
        self.routers.extend(routers);
        self
    }

    /// Bind the socket and start the node. The returned receiver carries
    /// [`DhtEvent`]s, beginning with `Listening` once the worker serves.
    pub async fn start(self) -> io::Result<(Dht, mpsc::UnboundedReceiver<DhtEvent>)> {
        let socket = Socket::bind(self.port).await?;
        let local_addr = socket.local_addr()?;
        let local_id = self.node_id.unwrap_or_else(NodeId::random);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let handler = DhtHandler::new(
            RoutingTable::new(local_id),
            socket,
            command_rx,
            event_tx,
        );
        task::spawn(handler.run());

        // Fire-and-forget seeding; failures surface through the routing
        // table staying empty, not through this call.
        for router in self.routers {
            let (reply_tx, _) = oneshot::channel();
            command_tx
                .send(Command::Connect {
                    addr: router,
                    reply: reply_tx,
                })
                .unwrap_or(());
        }

        Ok((
            Dht {
                command_tx,
                local_addr,
                local_id,
            },
            event_rx,
        ))
    }
}
