use std::slice::Iter;

use crate::id::{Id, NodeId};
use crate::routing::node::{Contact, ContactStatus};

/// Maximum number of contacts a bucket holds (the Kademlia `K`).
pub const MAX_BUCKET_SIZE: usize = 8;

/// Outcome of trying to place a contact into a bucket.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    /// The contact was newly stored, possibly replacing an evicted bad
    /// contact (returned so the caller can retire its timers).
    Inserted { evicted: Option<Contact> },
    /// The contact was already present; its `last_seen` was refreshed.
    Refreshed,
    /// The bucket is full of non-bad contacts and cannot split.
    Rejected,
    /// The bucket is full of non-bad contacts; splitting may make room.
    NeedSplit,
}

/// Fixed-capacity contact holder covering the inclusive id range `[lo, hi]`.
///
/// The bucket ranges of a routing table tile the whole keyspace; only the
/// bucket containing the local node id is splittable.
pub(crate) struct Bucket {
    lo: Id,
    hi: Id,
    splittable: bool,
    contacts: Vec<Contact>,
}

impl Bucket {
    pub fn new(lo: Id, hi: Id, splittable: bool) -> Bucket {
        Bucket {
            lo,
            hi,
            splittable,
            contacts: Vec::with_capacity(MAX_BUCKET_SIZE),
        }
    }

    /// Lower bound of the bucket's range. Stable for the bucket's lifetime,
    /// which makes it usable as the bucket's identity (refresh timers key on
    /// it).
    pub fn lo(&self) -> Id {
        self.lo
    }

    #[allow(unused)]
    pub fn hi(&self) -> Id {
        self.hi
    }

    pub fn is_splittable(&self) -> bool {
        self.splittable
    }

    pub fn contains(&self, id: Id) -> bool {
        self.lo <= id && id <= self.hi
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn iter(&self) -> Iter<Contact> {
        self.contacts.iter()
    }

    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.id() == id)
    }

    /// Pick a refresh target uniformly from the bucket's range.
    pub fn random_id(&self) -> Id {
        Id::random_in_range(self.lo, self.hi)
    }

    /// Try to place the contact into the bucket.
    ///
    /// A contact whose id is already present merely has its `last_seen`
    /// refreshed. When the bucket is full, the oldest-seen bad contact is
    /// evicted to make room; if none exists the caller must either split
    /// (home bucket) or drop the newcomer.
    pub fn insert(&mut self, contact: Contact) -> InsertOutcome {
        debug_assert!(self.contains(contact.id()));

        if let Some(existing) = self.find_mut(contact.id()) {
            existing.touch();
            return InsertOutcome::Refreshed;
        }

        if self.contacts.len() < MAX_BUCKET_SIZE {
            self.contacts.push(contact);
            return InsertOutcome::Inserted { evicted: None };
        }

        if let Some(index) = self.oldest_bad_index() {
            let evicted = self.contacts.swap_remove(index);
            self.contacts.push(contact);
            return InsertOutcome::Inserted {
                evicted: Some(evicted),
            };
        }

        if self.splittable && self.lo != self.hi {
            InsertOutcome::NeedSplit
        } else {
            InsertOutcome::Rejected
        }
    }

    /// Split the bucket at its range midpoint, redistributing the contacts.
    ///
    /// The child whose range contains `local_id` inherits splittability.
    pub fn split(self, local_id: NodeId) -> (Bucket, Bucket) {
        let (lo_right, hi_left) = Id::midpoint(self.lo, self.hi);

        let mut left = Bucket::new(self.lo, hi_left, false);
        let mut right = Bucket::new(lo_right, self.hi, false);

        left.splittable = left.contains(local_id);
        right.splittable = right.contains(local_id);

        for contact in self.contacts {
            if left.contains(contact.id()) {
                left.contacts.push(contact);
            } else {
                right.contacts.push(contact);
            }
        }

        (left, right)
    }

    /// Index of the least recently seen contact in bad state, if any.
    fn oldest_bad_index(&self) -> Option<usize> {
        self.contacts
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status() == ContactStatus::Bad)
            .min_by_key(|(_, c)| c.last_seen())
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Id, ID_LEN};
    use crate::routing::node::{Contact, ContactInfo};
    use crate::test;

    fn upper_half_contact(seq: u8) -> Contact {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = 0x80;
        bytes[ID_LEN - 1] = seq;

        Contact::new(ContactInfo::new(
            bytes.into(),
            test::dummy_socket_addr_v4(seq as u16 + 1),
        ))
    }

    #[test]
    fn insert_until_full() {
        let mut bucket = Bucket::new(Id::MIN, Id::MAX, false);

        for seq in 0..MAX_BUCKET_SIZE {
            let outcome = bucket.insert(upper_half_contact(seq as u8));
            assert_eq!(outcome, InsertOutcome::Inserted { evicted: None });
        }

        assert_eq!(bucket.len(), MAX_BUCKET_SIZE);
        assert_eq!(
            bucket.insert(upper_half_contact(MAX_BUCKET_SIZE as u8)),
            InsertOutcome::Rejected
        );
    }

    #[test]
    fn reinsert_refreshes_instead_of_duplicating() {
        let mut bucket = Bucket::new(Id::MIN, Id::MAX, false);

        bucket.insert(upper_half_contact(0));
        assert_eq!(bucket.insert(upper_half_contact(0)), InsertOutcome::Refreshed);

        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn full_splittable_bucket_asks_for_split() {
        let mut bucket = Bucket::new(Id::MIN, Id::MAX, true);

        for seq in 0..MAX_BUCKET_SIZE {
            bucket.insert(upper_half_contact(seq as u8));
        }

        assert_eq!(
            bucket.insert(upper_half_contact(MAX_BUCKET_SIZE as u8)),
            InsertOutcome::NeedSplit
        );
    }

    #[test]
    fn bad_contact_is_evicted_first() {
        let mut bucket = Bucket::new(Id::MIN, Id::MAX, false);

        let mut stale = upper_half_contact(0);
        for _ in 0..3 {
            stale.curse();
        }
        let stale_id = stale.id();
        bucket.insert(stale);

        for seq in 1..MAX_BUCKET_SIZE {
            bucket.insert(upper_half_contact(seq as u8));
        }

        let newcomer = upper_half_contact(MAX_BUCKET_SIZE as u8);
        let newcomer_id = newcomer.id();

        match bucket.insert(newcomer) {
            InsertOutcome::Inserted { evicted: Some(gone) } => assert_eq!(gone.id(), stale_id),
            other => panic!("expected eviction, got {:?}", other),
        }

        assert!(bucket.find_mut(newcomer_id).is_some());
        assert!(bucket.find_mut(stale_id).is_none());
        assert_eq!(bucket.len(), MAX_BUCKET_SIZE);
    }

    #[test]
    fn split_redistributes_by_range() {
        let local_id = Id::from({
            let mut bytes = [0u8; ID_LEN];
            bytes[0] = 0x01;
            bytes
        });

        let mut bucket = Bucket::new(Id::MIN, Id::MAX, true);
        for seq in 0..MAX_BUCKET_SIZE {
            bucket.insert(upper_half_contact(seq as u8));
        }

        let (left, right) = bucket.split(local_id);

        let (lo_right, hi_left) = Id::midpoint(Id::MIN, Id::MAX);
        assert_eq!(left.lo(), Id::MIN);
        assert_eq!(left.hi(), hi_left);
        assert_eq!(right.lo(), lo_right);
        assert_eq!(right.hi(), Id::MAX);

        // All test contacts live in the upper half.
        assert_eq!(left.len(), 0);
        assert_eq!(right.len(), MAX_BUCKET_SIZE);

        for contact in right.iter() {
            assert!(right.contains(contact.id()));
        }

        // Splittability follows the local id.
        assert!(left.is_splittable());
        assert!(!right.is_splittable());
    }

}
