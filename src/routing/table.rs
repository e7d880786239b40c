use crate::id::{Id, NodeId, ID_LEN};
use crate::routing::{
    bucket::{Bucket, InsertOutcome},
    node::{Contact, ContactInfo},
};

/// Upper bound on the number of buckets: the home bucket can split at most
/// once per bit of the id space.
pub const MAX_BUCKETS: usize = ID_LEN * 8;

/// What [`RoutingTable::observe`] did with a sighting.
#[derive(Debug, Default)]
pub(crate) struct Observed {
    /// The contact was stored for the first time.
    pub added: bool,
    /// A bad contact that was evicted to make room.
    pub evicted: Option<Contact>,
    /// Lower bounds of buckets created by splits, in creation order. The
    /// caller starts a refresh schedule for each.
    pub new_buckets: Vec<Id>,
}

/// Ordered collection of buckets tiling the 160-bit keyspace, together with
/// the id of the local node.
///
/// Exactly one bucket contains the local id (the home bucket) and only that
/// bucket ever splits, which keeps the table at O(log network size) buckets.
pub(crate) struct RoutingTable {
    buckets: Vec<Bucket>,
    local_id: NodeId,
}

impl RoutingTable {
    /// Create a table with a single bucket covering the whole keyspace.
    pub fn new(local_id: NodeId) -> RoutingTable {
        RoutingTable {
            buckets: vec![Bucket::new(Id::MIN, Id::MAX, true)],
            local_id,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    #[allow(unused)]
    pub fn buckets(&self) -> impl ExactSizeIterator<Item = &Bucket> {
        self.buckets.iter()
    }

    /// Index of the unique bucket whose range contains `id`.
    fn locate_index(&self, id: Id) -> usize {
        // Buckets are sorted by `lo` and tile the space, so the containing
        // bucket is the last one starting at or below `id`.
        self.buckets.partition_point(|b| b.lo() <= id) - 1
    }

    /// The unique bucket whose range contains `id`.
    pub fn locate(&self, id: Id) -> &Bucket {
        &self.buckets[self.locate_index(id)]
    }

    /// Find the bucket with the given lower bound, if it still exists.
    pub fn bucket_by_lo(&self, lo: Id) -> Option<&Bucket> {
        let bucket = self.locate(lo);
        (bucket.lo() == lo).then_some(bucket)
    }

    /// Mutable access to a tracked contact.
    pub fn find_contact_mut(&mut self, id: NodeId) -> Option<&mut Contact> {
        let index = self.locate_index(id);
        self.buckets[index].find_mut(id)
    }

    /// Record a sighting of a remote node, inserting it if there is room.
    ///
    /// Splits the home bucket as often as needed (bounded by the id width)
    /// and reports any buckets created that way so refresh schedules can be
    /// attached to them.
    pub fn observe(&mut self, contact: Contact) -> Observed {
        let mut observed = Observed::default();

        // Our own id never enters the table.
        if contact.id() == self.local_id {
            return observed;
        }

        loop {
            let index = self.locate_index(contact.id());

            match self.buckets[index].insert(contact.clone()) {
                InsertOutcome::Inserted { evicted } => {
                    observed.added = true;
                    observed.evicted = evicted;
                    return observed;
                }
                InsertOutcome::Refreshed | InsertOutcome::Rejected => return observed,
                InsertOutcome::NeedSplit => {
                    if self.buckets.len() >= MAX_BUCKETS {
                        return observed;
                    }

                    let bucket = self.buckets.remove(index);
                    let (left, right) = bucket.split(self.local_id);

                    // The left child keeps the original lower bound; the
                    // right child is brand new.
                    observed.new_buckets.push(right.lo());

                    self.buckets.insert(index, left);
                    self.buckets.insert(index + 1, right);
                }
            }
        }
    }

    /// Up to `count` returnable contacts closest to `target` by XOR
    /// distance, ascending.
    pub fn closest(&self, target: Id, count: usize) -> Vec<ContactInfo> {
        let center = self.locate_index(target);
        let mut candidates: Vec<&Contact> = Vec::with_capacity(count * 2);

        // Start with the target's own bucket, then widen to neighbors until
        // enough candidates are gathered (prior bucket first, then next).
        candidates.extend(self.buckets[center].iter());

        let mut offset = 1;
        while candidates.len() < count
            && (offset <= center || center + offset < self.buckets.len())
        {
            if let Some(index) = center.checked_sub(offset) {
                candidates.extend(self.buckets[index].iter());
            }
            if center + offset < self.buckets.len() {
                candidates.extend(self.buckets[center + offset].iter());
            }
            offset += 1;
        }

        let mut candidates: Vec<_> = candidates
            .into_iter()
            .filter(|c| c.is_returnable())
            .collect();
        candidates.sort_by_key(|c| c.id() ^ target);
        candidates.truncate(count);
        candidates.into_iter().map(|c| *c.info()).collect()
    }

    /// Number of contacts across all buckets.
    #[allow(unused)]
    pub fn num_contacts(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Id, ID_LEN};
    use crate::routing::bucket::MAX_BUCKET_SIZE as K;
    use crate::routing::node::{Contact, ContactInfo};
    use crate::test;

    fn local_id() -> NodeId {
        // Local id in the upper half of the keyspace.
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = 0x80;
        bytes.into()
    }

    fn contact_with_prefix(prefix: u8, seq: u8) -> Contact {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = prefix;
        bytes[ID_LEN - 1] = seq;

        Contact::new(ContactInfo::new(
            bytes.into(),
            test::dummy_socket_addr_v4(u16::from(seq) + u16::from(prefix) * 300 + 1),
        ))
    }

    fn assert_tiling(table: &RoutingTable) {
        let buckets: Vec<_> = table.buckets().collect();

        assert_eq!(buckets[0].lo(), Id::MIN);
        assert_eq!(buckets[buckets.len() - 1].hi(), Id::MAX);

        for pair in buckets.windows(2) {
            assert_eq!(pair[0].hi().successor(), pair[1].lo());
        }

        for bucket in &buckets {
            for contact in bucket.iter() {
                assert!(bucket.contains(contact.id()));
            }
            assert!(bucket.len() <= K);
        }

        assert_eq!(
            buckets.iter().filter(|b| b.is_splittable()).count(),
            1,
            "exactly one home bucket"
        );
        assert!(table.locate(table.local_id()).is_splittable());
    }

    #[test]
    fn starts_with_one_full_range_bucket() {
        let table = RoutingTable::new(local_id());

        assert_eq!(table.buckets().len(), 1);
        assert_tiling(&table);
    }

    #[test]
    fn observing_own_id_is_ignored() {
        let mut table = RoutingTable::new(local_id());

        let observed = table.observe(Contact::new(ContactInfo::new(
            local_id(),
            test::dummy_socket_addr_v4(1),
        )));

        assert!(!observed.added);
        assert_eq!(table.num_contacts(), 0);
    }

    #[test]
    fn overflowing_the_home_bucket_splits_once() {
        let mut table = RoutingTable::new(local_id());

        // Nine distinct contacts in the lower half; the local id is in the
        // upper half, so after the split the lower child cannot split again.
        for seq in 0..=K as u8 {
            table.observe(contact_with_prefix(0x00, seq));
        }

        assert_eq!(table.buckets().len(), 2);
        assert_tiling(&table);

        // The lower child kept K contacts and dropped the overflow.
        assert_eq!(table.num_contacts(), K);

        // Another lower-half contact is rejected, not split in.
        let before = table.buckets().len();
        let observed = table.observe(contact_with_prefix(0x01, 0));
        assert!(!observed.added);
        assert_eq!(table.buckets().len(), before);
    }

    #[test]
    fn split_reports_new_bucket() {
        let mut table = RoutingTable::new(local_id());

        for seq in 0..K as u8 {
            table.observe(contact_with_prefix(0x00, seq));
        }

        let observed = table.observe(contact_with_prefix(0x00, K as u8));
        assert_eq!(observed.new_buckets.len(), 1);

        let (lo_right, _) = Id::midpoint(Id::MIN, Id::MAX);
        assert_eq!(observed.new_buckets[0], lo_right);
        assert!(table.bucket_by_lo(lo_right).is_some());
    }

    #[test]
    fn reobserving_refreshes_membership() {
        let mut table = RoutingTable::new(local_id());

        let first = table.observe(contact_with_prefix(0x00, 1));
        assert!(first.added);

        let again = table.observe(contact_with_prefix(0x00, 1));
        assert!(!again.added);
        assert_eq!(table.num_contacts(), 1);
    }

    #[test]
    fn closest_orders_by_distance_and_caps() {
        let mut table = RoutingTable::new(local_id());

        for prefix in [0x00u8, 0x40, 0xc0] {
            for seq in 0..4u8 {
                table.observe(contact_with_prefix(prefix, seq));
            }
        }

        let target = Id::from({
            let mut bytes = [0u8; ID_LEN];
            bytes[0] = 0xc0;
            bytes
        });

        let closest = table.closest(target, K);

        assert!(closest.len() <= K);
        assert!(!closest.is_empty());

        for pair in closest.windows(2) {
            assert!((pair[0].id ^ target) <= (pair[1].id ^ target));
        }

        // No duplicates.
        for (i, a) in closest.iter().enumerate() {
            for b in &closest[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
    }

    #[test]
    fn closest_excludes_bad_contacts() {
        let mut table = RoutingTable::new(local_id());

        table.observe(contact_with_prefix(0x00, 1));
        table.observe(contact_with_prefix(0x00, 2));

        let bad_id = contact_with_prefix(0x00, 1).id();
        let contact = table.find_contact_mut(bad_id).unwrap();
        for _ in 0..3 {
            contact.curse();
        }

        let closest = table.closest(Id::MIN, K);
        assert_eq!(closest.len(), 1);
        assert_ne!(closest[0].id, bad_id);
    }

    #[test]
    fn repeated_splits_stay_bounded() {
        let mut table = RoutingTable::new(local_id());

        // Aim many contacts just below the local id so the home bucket keeps
        // splitting; the total bucket count must stay within bounds and the
        // tiling invariants must hold throughout.
        for seq in 0..64u8 {
            for sub in 0..4u8 {
                let mut bytes = [0u8; ID_LEN];
                bytes[0] = 0x80;
                bytes[1] = seq;
                bytes[ID_LEN - 1] = sub;
                table.observe(Contact::new(ContactInfo::new(
                    bytes.into(),
                    test::dummy_socket_addr_v4(u16::from(seq) * 8 + u16::from(sub) + 1),
                )));
            }
        }

        assert!(table.buckets().len() <= MAX_BUCKETS);
        assert_tiling(&table);
    }
}
