//! Bounded sliding window of proposed-but-not-yet-applied mutations, keyed
//! by decree.

use std::sync::Arc;

use crate::base::{Decree, ErrCode, PartitionStatus};
use crate::replica::Mutation;

/// How far a commit call is willing to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Advance only through contiguously-prepared entries, up to the target.
    Soft,
    /// Force `last_committed_decree` to the target regardless of continuity.
    Hard,
}

/// Fixed-capacity ring over `[min_decree, max_decree]`. Stored decrees are
/// contiguous and `max_decree - min_decree < capacity` at all times.
pub struct PrepareList {
    slots: Vec<Option<Arc<Mutation>>>,
    capacity: usize,
    last_committed_decree: Decree,
    min_decree: Decree,
    max_decree: Decree,
    count: usize,
}

impl PrepareList {
    /// Creates a list positioned right after `init_decree`.
    pub fn new(init_decree: Decree, capacity: usize) -> Self {
        assert!(capacity > 0);
        let mut list = PrepareList {
            slots: Vec::new(),
            capacity,
            last_committed_decree: 0,
            min_decree: 0,
            max_decree: 0,
            count: 0,
        };
        list.slots.resize_with(capacity, || None);
        list.reset(init_decree);
        list
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn last_committed_decree(&self) -> Decree {
        self.last_committed_decree
    }

    pub fn min_decree(&self) -> Decree {
        self.min_decree
    }

    /// Highest decree the window has reached: the highest stored decree or
    /// the committed point, whichever is larger.
    pub fn max_decree(&self) -> Decree {
        if self.count == 0 {
            self.last_committed_decree
        } else {
            self.max_decree.max(self.last_committed_decree)
        }
    }

    /// Fetches the mutation stored at `decree`, if any.
    pub fn get(&self, decree: Decree) -> Option<Arc<Mutation>> {
        let slot = &self.slots[(decree % self.capacity as u64) as usize];
        match slot {
            Some(mu) if mu.header.decree == decree => Some(mu.clone()),
            _ => None,
        }
    }

    /// Admits a mutation into the window. Decrees at or below the committed
    /// point are ignored (idempotent); a decree beyond the window returns
    /// `Timeout` and the proposer must wait for commits to advance. At an
    /// occupied decree the higher ballot wins, ties keeping the incumbent.
    pub fn prepare(
        &mut self,
        mu: Arc<Mutation>,
        _status: PartitionStatus,
    ) -> Result<(), ErrCode> {
        let decree = mu.header.decree;

        if decree <= self.last_committed_decree {
            return Ok(());
        }
        if decree > self.last_committed_decree + self.capacity as u64 {
            return Err(ErrCode::Timeout);
        }

        if let Some(existing) = self.get(decree) {
            if existing.header.ballot >= mu.header.ballot {
                return Ok(());
            }
        }

        let idx = (decree % self.capacity as u64) as usize;
        let evicted = self.slots[idx].take();
        if let Some(old) = evicted {
            if old.header.decree != decree {
                // ring wrapped; the displaced entry must already be history
                debug_assert!(
                    old.header.decree <= self.last_committed_decree
                );
                self.count -= 1;
            } else {
                self.count -= 1;
            }
        }
        self.slots[idx] = Some(mu);
        self.count += 1;

        if self.count == 1 {
            self.min_decree = decree;
            self.max_decree = decree;
        } else {
            if decree > self.max_decree {
                self.max_decree = decree;
            }
            if decree < self.min_decree {
                self.min_decree = decree;
            }
            // eviction on wrap-around slides the window floor forward
            if self.max_decree >= self.capacity as u64
                && self.min_decree < self.max_decree - self.capacity as u64 + 1
            {
                self.min_decree = self.max_decree - self.capacity as u64 + 1;
            }
        }

        debug_assert!(self.max_decree - self.min_decree < self.capacity as u64);
        Ok(())
    }

    /// Advances the committed point toward `decree` per `mode`, returning the
    /// newly-committed mutations in strict decree order for the owner to
    /// apply.
    pub fn commit(
        &mut self,
        decree: Decree,
        mode: CommitMode,
    ) -> Vec<Arc<Mutation>> {
        let mut committed = Vec::new();
        if decree <= self.last_committed_decree {
            return committed;
        }

        match mode {
            CommitMode::Soft => {
                while self.last_committed_decree < decree {
                    let next = self.last_committed_decree + 1;
                    match self.get(next) {
                        Some(mu) => {
                            committed.push(mu);
                            self.last_committed_decree = next;
                        }
                        None => break,
                    }
                }
            }
            CommitMode::Hard => {
                for d in self.last_committed_decree + 1..=decree {
                    if let Some(mu) = self.get(d) {
                        committed.push(mu);
                    }
                }
                self.last_committed_decree = decree;
            }
        }

        committed
    }

    /// Drops every entry with decree at or below `decree`.
    pub fn truncate(&mut self, decree: Decree) {
        for idx in 0..self.capacity {
            if let Some(mu) = &self.slots[idx] {
                if mu.header.decree <= decree {
                    self.slots[idx] = None;
                    self.count -= 1;
                }
            }
        }
        if self.count == 0 {
            self.min_decree = decree + 1;
            self.max_decree = decree;
        } else if self.min_decree <= decree {
            self.min_decree = decree + 1;
        }
    }

    /// Clears everything and repositions right after `decree`.
    pub fn reset(&mut self, decree: Decree) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.count = 0;
        self.last_committed_decree = decree;
        self.min_decree = decree + 1;
        self.max_decree = decree;
    }
}

#[cfg(test)]
mod prepare_list_tests {
    use super::*;
    use crate::base::Gpid;
    use crate::replica::MutationHeader;

    fn mu(ballot: u64, decree: Decree) -> Arc<Mutation> {
        Arc::new(Mutation::new(
            MutationHeader {
                gpid: Gpid::new(1, 0),
                ballot,
                decree,
                log_offset: 0,
                last_committed_decree: 0,
                timestamp_ms: 0,
                client_request_id: 0,
            },
            1,
            vec![decree as u8],
        ))
    }

    fn check_bounds(list: &PrepareList) {
        assert!(list.max_decree() < list.min_decree() + list.capacity() as u64);
        assert!(list.min_decree() <= list.last_committed_decree() + 1);
        assert!(list.last_committed_decree() <= list.max_decree());
    }

    #[test]
    fn prepare_and_soft_commit_in_order() {
        let mut list = PrepareList::new(0, 8);
        for d in 1..=5 {
            list.prepare(mu(1, d), PartitionStatus::Primary).unwrap();
            check_bounds(&list);
        }
        assert_eq!(list.min_decree(), 1);
        assert_eq!(list.max_decree(), 5);

        let committed = list.commit(3, CommitMode::Soft);
        assert_eq!(
            committed.iter().map(|m| m.header.decree).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(list.last_committed_decree(), 3);
        check_bounds(&list);
    }

    #[test]
    fn soft_commit_stops_at_gap() {
        let mut list = PrepareList::new(0, 8);
        list.prepare(mu(1, 1), PartitionStatus::Secondary).unwrap();
        list.prepare(mu(1, 3), PartitionStatus::Secondary).unwrap();

        let committed = list.commit(3, CommitMode::Soft);
        assert_eq!(committed.len(), 1);
        assert_eq!(list.last_committed_decree(), 1);
    }

    #[test]
    fn hard_commit_jumps_gaps() {
        let mut list = PrepareList::new(0, 8);
        list.prepare(mu(1, 1), PartitionStatus::Secondary).unwrap();
        list.prepare(mu(1, 3), PartitionStatus::Secondary).unwrap();

        let committed = list.commit(3, CommitMode::Hard);
        assert_eq!(
            committed.iter().map(|m| m.header.decree).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(list.last_committed_decree(), 3);
    }

    #[test]
    fn low_prepare_is_idempotent() {
        let mut list = PrepareList::new(5, 8);
        assert_eq!(list.prepare(mu(1, 3), PartitionStatus::Secondary), Ok(()));
        assert_eq!(list.count(), 0);
    }

    #[test]
    fn full_window_rejects() {
        let mut list = PrepareList::new(0, 4);
        for d in 1..=4 {
            list.prepare(mu(1, d), PartitionStatus::Primary).unwrap();
        }
        assert_eq!(
            list.prepare(mu(1, 5), PartitionStatus::Primary),
            Err(ErrCode::Timeout)
        );
    }

    #[test]
    fn higher_ballot_wins_ties_keep_existing() {
        let mut list = PrepareList::new(0, 8);
        list.prepare(mu(2, 1), PartitionStatus::Secondary).unwrap();
        // same ballot: incumbent stays
        let other = Arc::new(Mutation::new_empty(MutationHeader {
            gpid: Gpid::new(1, 0),
            ballot: 2,
            decree: 1,
            ..Default::default()
        }));
        list.prepare(other, PartitionStatus::Secondary).unwrap();
        assert!(!list.get(1).unwrap().is_empty_write());

        // higher ballot: replaced
        let newer = Arc::new(Mutation::new_empty(MutationHeader {
            gpid: Gpid::new(1, 0),
            ballot: 3,
            decree: 1,
            ..Default::default()
        }));
        list.prepare(newer, PartitionStatus::Secondary).unwrap();
        assert!(list.get(1).unwrap().is_empty_write());
        assert_eq!(list.count(), 1);
    }

    #[test]
    fn truncate_drops_prefix() {
        let mut list = PrepareList::new(0, 8);
        for d in 1..=5 {
            list.prepare(mu(1, d), PartitionStatus::Primary).unwrap();
        }
        list.commit(5, CommitMode::Soft);
        list.truncate(3);
        assert_eq!(list.min_decree(), 4);
        assert_eq!(list.max_decree(), 5);
        assert_eq!(list.count(), 2);
        assert!(list.get(3).is_none());
        assert!(list.get(4).is_some());
    }

    #[test]
    fn reset_repositions() {
        let mut list = PrepareList::new(0, 8);
        for d in 1..=5 {
            list.prepare(mu(1, d), PartitionStatus::Primary).unwrap();
        }
        list.reset(9);
        assert_eq!(list.count(), 0);
        assert_eq!(list.last_committed_decree(), 9);
        assert_eq!(list.min_decree(), 10);
        assert_eq!(list.max_decree(), 9);
        check_bounds(&list);
    }

    #[test]
    fn window_slides_after_commit() {
        let mut list = PrepareList::new(0, 4);
        for d in 1..=4 {
            list.prepare(mu(1, d), PartitionStatus::Primary).unwrap();
        }
        list.commit(2, CommitMode::Soft);
        // decrees 1 and 2 committed, so 5 and 6 now fit (evicting 1 and 2)
        list.prepare(mu(1, 5), PartitionStatus::Primary).unwrap();
        list.prepare(mu(1, 6), PartitionStatus::Primary).unwrap();
        assert_eq!(list.min_decree(), 3);
        assert_eq!(list.max_decree(), 6);
        check_bounds(&list);
    }
}
