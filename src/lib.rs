//! A participating node of the BitTorrent Mainline DHT (BEP 5).
//!
//! Each node answers `ping`, `find_node`, `get_peers` and `announce_peer`
//! queries from other nodes and uses the same four operations to keep its
//! routing table populated, locate peers for an info hash and announce
//! itself as a source for one.
//!
//! The crate speaks IPv4 only; the IPv6 extension (BEP 32) is out of scope.

pub mod router;

mod builder;
mod compact;
mod id;
mod message;
mod routing;
mod storage;
mod token;
mod transaction;
mod worker;

pub use crate::builder::{ClosedError, Dht, DhtBuilder};
pub use crate::id::{Id, InfoHash, LengthError, NodeId, ID_LEN};
pub use crate::worker::{DhtEvent, DhtFault};
