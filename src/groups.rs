// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Group registry: maps a group id to the set of member client ids.
//!
//! Two layers, mirroring the reference implementation: an outer chained-bucket map keyed by
//! `gid`, and an inner open-addressed set for membership (`CidSet`). The inner set uses linear
//! probing with a reserved sentinel for empty slots -- no tombstones, since members are never
//! removed individually in this protocol (a group's membership is fixed at creation).

const EMPTY: u64 = u64::MAX;
const HASH_MULT: u64 = 11_400_714_819_323_198_485;
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

/// Members per batch yielded by `CidIterator` -- sized to match the event loop's completion batch
/// (`CQE_BATCH_SIZE`) so a fan-out over a batch's worth of members submits a bounded number of
/// `Send` operations before the next submit/wait cycle.
const ITER_BATCH_SIZE: usize = 32;

/// Open-addressed set of `u64` client ids, used as group membership storage.
pub struct CidSet {
    slots: Vec<u64>,
    len: usize,
}

impl CidSet {
    pub fn with_capacity(capacity_pow2: usize) -> Self {
        assert!(capacity_pow2.is_power_of_two());
        CidSet {
            slots: vec![EMPTY; capacity_pow2],
            len: 0,
        }
    }

    fn index_of(&self, value: u64) -> usize {
        let mask = (self.slots.len() - 1) as u64;
        (value.wrapping_mul(HASH_MULT) >> 32 & mask) as usize
    }

    fn grow(&mut self) {
        let old = std::mem::replace(&mut self.slots, vec![EMPTY; self.slots.len() * 2]);
        self.len = 0;
        for v in old {
            if v != EMPTY {
                self.insert(v);
            }
        }
    }

    /// Insert a value. No-op if already present.
    pub fn insert(&mut self, value: u64) {
        debug_assert_ne!(value, EMPTY, "sentinel value cannot be a member id");
        if (self.len + 1) * MAX_LOAD_DEN > self.slots.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let mut idx = self.index_of(value);
        loop {
            if self.slots[idx] == EMPTY {
                self.slots[idx] = value;
                self.len += 1;
                return;
            }
            if self.slots[idx] == value {
                return;
            }
            idx = (idx + 1) & (self.slots.len() - 1);
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        let mut idx = self.index_of(value);
        loop {
            match self.slots[idx] {
                v if v == EMPTY => return false,
                v if v == value => return true,
                _ => idx = (idx + 1) & (self.slots.len() - 1),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.iter().copied().filter(|&v| v != EMPTY)
    }

    fn batches(&self) -> CidIterator<'_> {
        CidIterator { slots: &self.slots, pos: 0 }
    }
}

/// Batched iterator over a group's members in arbitrary order, used for fan-out: each `next()`
/// returns up to `ITER_BATCH_SIZE` ids so a chunk's worth of sends fits one submission round
/// instead of queuing the whole membership at once.
pub struct CidIterator<'a> {
    slots: &'a [u64],
    pos: usize,
}

impl Iterator for CidIterator<'_> {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Vec<u64>> {
        while self.pos < self.slots.len() {
            let mut batch = Vec::new();
            while self.pos < self.slots.len() && batch.len() < ITER_BATCH_SIZE {
                let v = self.slots[self.pos];
                self.pos += 1;
                if v != EMPTY {
                    batch.push(v);
                }
            }
            if !batch.is_empty() {
                return Some(batch);
            }
        }
        None
    }
}

struct Node {
    gid: u64,
    members: CidSet,
    next: Option<Box<Node>>,
}

/// Chained-bucket map from group id to membership set.
pub struct GroupMap {
    buckets: Vec<Option<Box<Node>>>,
    mask: u64,
    next_gid: u64,
}

impl GroupMap {
    pub fn new(capacity_pow2: usize) -> Self {
        assert!(capacity_pow2.is_power_of_two());
        GroupMap {
            buckets: (0..capacity_pow2).map(|_| None).collect(),
            mask: (capacity_pow2 - 1) as u64,
            next_gid: 1,
        }
    }

    fn bucket_of(&self, gid: u64) -> usize {
        (gid & self.mask) as usize
    }

    /// Create a group from an issuing client plus the member ids named in the `CREATE_GROUP`
    /// request, and return its freshly minted id. The issuer is always a member even if it did
    /// not name itself.
    pub fn create_group(&mut self, issuer_cid: u64, member_cids: &[u64]) -> u64 {
        let gid = self.next_gid;
        self.next_gid += 1;

        let mut members = CidSet::with_capacity(8);
        members.insert(issuer_cid);
        for &cid in member_cids {
            members.insert(cid);
        }

        let bkt = self.bucket_of(gid);
        let node = Box::new(Node {
            gid,
            members,
            next: self.buckets[bkt].take(),
        });
        self.buckets[bkt] = Some(node);
        gid
    }

    pub fn get(&self, gid: u64) -> Option<&CidSet> {
        let bkt = self.bucket_of(gid);
        let mut cur = self.buckets[bkt].as_deref();
        while let Some(node) = cur {
            if node.gid == gid {
                return Some(&node.members);
            }
            cur = node.next.as_deref();
        }
        None
    }

    /// Batched iterator over `gid`'s members, for fan-out. `None` if the group doesn't exist.
    pub fn iter(&self, gid: u64) -> Option<CidIterator<'_>> {
        self.get(gid).map(CidSet::batches)
    }
}

impl Default for GroupMap {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_set_insert_and_contains() {
        let mut set = CidSet::with_capacity(4);
        set.insert(1);
        set.insert(2);
        set.insert(1); // duplicate, no-op
        assert_eq!(set.len(), 2);
        assert!(set.contains(1));
        assert!(set.contains(2));
        assert!(!set.contains(3));
    }

    #[test]
    fn cid_set_grows_past_load_factor() {
        let mut set = CidSet::with_capacity(4);
        for i in 0..20 {
            set.insert(i);
        }
        assert_eq!(set.len(), 20);
        for i in 0..20 {
            assert!(set.contains(i));
        }
    }

    #[test]
    fn create_group_includes_issuer() {
        let mut groups = GroupMap::new(16);
        let gid = groups.create_group(1, &[2, 3]);
        let members = groups.get(gid).unwrap();
        assert!(members.contains(1));
        assert!(members.contains(2));
        assert!(members.contains(3));
        assert_eq!(members.len(), 3);
    }

    #[test]
    fn group_ids_are_monotonic_and_distinct() {
        let mut groups = GroupMap::new(16);
        let a = groups.create_group(1, &[2]);
        let b = groups.create_group(1, &[3]);
        assert_ne!(a, b);
        assert!(groups.get(a).is_some());
        assert!(groups.get(b).is_some());
    }

    #[test]
    fn issuer_named_twice_stays_single_member() {
        let mut groups = GroupMap::new(16);
        let gid = groups.create_group(1, &[1, 2]);
        assert_eq!(groups.get(gid).unwrap().len(), 2);
    }

    #[test]
    fn iter_batches_cover_every_member_exactly_once() {
        let mut groups = GroupMap::new(16);
        let members: Vec<u64> = (1..=70).collect();
        let gid = groups.create_group(members[0], &members[1..]);

        let mut seen = Vec::new();
        for batch in groups.iter(gid).unwrap() {
            assert!(batch.len() <= 32);
            seen.extend(batch);
        }
        seen.sort_unstable();
        assert_eq!(seen, members);
    }

    #[test]
    fn iter_on_missing_group_is_none() {
        let groups = GroupMap::new(16);
        assert!(groups.iter(999).is_none());
    }
}
