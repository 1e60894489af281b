//! Distance-ordered pending decode queue

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use flume::Sender;

use super::request::{DecodeOutcome, DecodeRequest, DecodeSeed, EnqueueOutcome};

/// Heap entry ordered so the lowest `(priority, seq)` pops first.
struct Ranked(DecodeRequest);

impl Ranked {
    fn rank(&self) -> (usize, u64) {
        (self.0.priority, self.0.seq)
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

/// Pending and running decode work, keyed by source.
///
/// A source key is either pending, running or absent; it is never queued
/// twice.
pub(crate) struct DecodeQueue {
    pending: BinaryHeap<Ranked>,
    pending_keys: HashSet<String>,
    running: HashSet<String>,
    next_seq: u64,
    horizon: usize,
}

impl DecodeQueue {
    pub(crate) fn new(horizon: usize) -> Self {
        Self {
            pending: BinaryHeap::new(),
            pending_keys: HashSet::new(),
            running: HashSet::new(),
            next_seq: 0,
            horizon,
        }
    }

    pub(crate) fn is_tracked(&self, source_key: &str) -> bool {
        self.pending_keys.contains(source_key) || self.running.contains(source_key)
    }

    pub(crate) fn push(
        &mut self,
        seed: DecodeSeed,
        pivot: usize,
        dispatch: &Sender<DecodeOutcome>,
    ) -> EnqueueOutcome {
        if self.is_tracked(&seed.source_key) {
            return EnqueueOutcome::Coalesced;
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        self.pending_keys.insert(seed.source_key.clone());
        self.pending.push(Ranked(DecodeRequest {
            item: seed.item,
            source_key: seed.source_key,
            index: seed.index,
            priority: seed.index.abs_diff(pivot),
            seq,
            dispatch: dispatch.clone(),
        }));
        EnqueueOutcome::Queued
    }

    /// Rescore every pending request against `pivot` and drop those past
    /// the horizon. Returns how many were dropped.
    pub(crate) fn rescore(&mut self, pivot: usize) -> usize {
        let before = self.pending.len();
        let horizon = self.horizon;
        let kept: Vec<Ranked> = std::mem::take(&mut self.pending)
            .into_vec()
            .into_iter()
            .filter_map(|Ranked(mut request)| {
                request.rescore(pivot);
                if request.priority <= horizon {
                    Some(Ranked(request))
                } else {
                    self.pending_keys.remove(&request.source_key);
                    None
                }
            })
            .collect();
        self.pending = BinaryHeap::from(kept);
        before - self.pending.len()
    }

    /// Swap the whole pending set for `seeds` scored against `pivot`.
    /// Running work is untouched, and seeds for running sources are skipped.
    pub(crate) fn replace_pending(
        &mut self,
        seeds: Vec<DecodeSeed>,
        pivot: usize,
        dispatch: &Sender<DecodeOutcome>,
    ) -> usize {
        self.clear_pending();
        seeds
            .into_iter()
            .map(|seed| self.push(seed, pivot, dispatch))
            .filter(|outcome| *outcome == EnqueueOutcome::Queued)
            .count()
    }

    /// Take the nearest pending request and mark its source running.
    pub(crate) fn pop_next(&mut self) -> Option<DecodeRequest> {
        let Ranked(request) = self.pending.pop()?;
        self.pending_keys.remove(&request.source_key);
        self.running.insert(request.source_key.clone());
        Some(request)
    }

    pub(crate) fn finish(&mut self, source_key: &str) {
        self.running.remove(source_key);
    }

    pub(crate) fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.pending_keys.clear();
        dropped
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn running_len(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn horizon(&self) -> usize {
        self.horizon
    }
}
