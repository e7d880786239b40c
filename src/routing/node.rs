use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::id::NodeId;

/// Time after the last contact before a node is due for a liveness ping and
/// its status decays to questionable.
pub(crate) const REPING_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Number of consecutive failed RPCs a contact survives before it is
/// considered bad.
const MAX_FAIL_COUNT: u8 = 2;

/// Liveness category of a contact.
///
/// Ordering matters: variants further down are considered healthier.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Ord, PartialOrd)]
pub enum ContactStatus {
    Bad,
    Questionable,
    Good,
}

/// Identity of a contact: node id plus UDP address. This is the unit the
/// compact wire encoding carries.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ContactInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl ContactInfo {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        Self { id, addr }
    }
}

/// A remote node tracked by the routing table, owned by exactly one bucket.
#[derive(Clone)]
pub struct Contact {
    info: ContactInfo,
    first_seen: Instant,
    last_seen: Instant,
    fail_count: u8,
    /// Whether this node ever demonstrated liveness to us directly (by
    /// querying us or answering a query of ours), as opposed to being
    /// learned second-hand from another node's response.
    verified: bool,
}

impl Contact {
    /// Create a contact that has just proven itself alive.
    pub fn new(info: ContactInfo) -> Contact {
        let now = Instant::now();

        Contact {
            info,
            first_seen: now,
            last_seen: now,
            fail_count: 0,
            verified: true,
        }
    }

    /// Create a contact learned second-hand (from another node's response).
    /// It starts out questionable and becomes good only by responding to us.
    pub fn new_unverified(info: ContactInfo) -> Contact {
        let now = Instant::now();

        Contact {
            info,
            first_seen: now,
            last_seen: now,
            fail_count: 0,
            verified: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.info.addr
    }

    pub fn info(&self) -> &ContactInfo {
        &self.info
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// When this contact entered the table. Stable for the contact's
    /// lifetime, so it doubles as the identity of its incarnation (the ping
    /// schedule keys on it).
    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    /// Record a successful RPC: the contact responded to one of our queries.
    pub fn thank(&mut self) {
        self.fail_count = 0;
        self.last_seen = Instant::now();
        self.verified = true;
    }

    /// Record a failed RPC (timeout, transport error or error reply).
    pub fn curse(&mut self) {
        self.fail_count = self.fail_count.saturating_add(1);
    }

    /// Record that the contact reached out to us. Freshens `last_seen` but,
    /// unlike [`Self::thank`], does not clear the failure count: a node that
    /// queries us while ignoring our queries stays questionable.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Current liveness category.
    pub fn status(&self) -> ContactStatus {
        self.status_at(Instant::now())
    }

    pub(crate) fn status_at(&self, now: Instant) -> ContactStatus {
        if self.fail_count > MAX_FAIL_COUNT {
            ContactStatus::Bad
        } else if self.fail_count > 0
            || !self.verified
            || now.saturating_duration_since(self.last_seen) >= REPING_INTERVAL
        {
            ContactStatus::Questionable
        } else {
            ContactStatus::Good
        }
    }

    /// Is the contact worth handing out in lookups and responses?
    pub fn is_returnable(&self) -> bool {
        self.status() != ContactStatus::Bad
    }

    /// Is the contact overdue for a liveness ping?
    pub fn needs_ping(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) >= REPING_INTERVAL
    }

    /// When the next liveness ping for this contact is due.
    pub fn next_ping_at(&self) -> Instant {
        self.last_seen + REPING_INTERVAL
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&mut self, when: Instant) {
        self.last_seen = when;
    }
}

impl Eq for Contact {}

impl PartialEq<Contact> for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.info == other.info
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Contact")
            .field("id", &self.info.id)
            .field("addr", &self.info.addr)
            .field("last_seen", &self.last_seen)
            .field("fail_count", &self.fail_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn fresh_contact_is_good() {
        let contact = Contact::new(test::dummy_contact_info());

        assert_eq!(contact.status(), ContactStatus::Good);
    }

    #[test]
    fn unverified_contact_is_questionable() {
        let contact = Contact::new_unverified(test::dummy_contact_info());

        assert_eq!(contact.status(), ContactStatus::Questionable);
        assert!(contact.is_returnable());
    }

    #[test]
    fn failures_decay_to_bad() {
        let mut contact = Contact::new(test::dummy_contact_info());

        contact.curse();
        assert_eq!(contact.status(), ContactStatus::Questionable);

        contact.curse();
        assert_eq!(contact.status(), ContactStatus::Questionable);

        contact.curse();
        assert_eq!(contact.status(), ContactStatus::Bad);
        assert!(!contact.is_returnable());
    }

    #[test]
    fn response_restores_good_status() {
        let mut contact = Contact::new(test::dummy_contact_info());

        for _ in 0..3 {
            contact.curse();
        }
        assert_eq!(contact.status(), ContactStatus::Bad);

        contact.thank();
        assert_eq!(contact.status(), ContactStatus::Good);
    }

    #[test]
    fn request_does_not_clear_failures() {
        let mut contact = Contact::new(test::dummy_contact_info());

        contact.curse();
        contact.touch();

        assert_eq!(contact.status(), ContactStatus::Questionable);
    }

    #[test]
    fn idle_contact_becomes_questionable() {
        let mut contact = Contact::new(test::dummy_contact_info());
        contact.set_last_seen(Instant::now() - REPING_INTERVAL);

        assert_eq!(contact.status(), ContactStatus::Questionable);
        assert!(contact.needs_ping(Instant::now()));
    }

    #[test]
    fn status_ordering() {
        assert!(ContactStatus::Good > ContactStatus::Questionable);
        assert!(ContactStatus::Questionable > ContactStatus::Bad);
    }
}
