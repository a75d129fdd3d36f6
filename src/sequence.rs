use std::collections::BTreeMap;

use crate::types::{ReplayRequest, SequenceNumber, ShardId, WritePayload};

/// Highest applied point sequence number per shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    shards: BTreeMap<ShardId, SequenceNumber>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 0 for a shard nothing was applied to yet.
    pub fn current_sequence(&self, shard: ShardId) -> SequenceNumber {
        self.shards.get(&shard).copied().unwrap_or(0)
    }

    pub fn record_if_higher(&mut self, shard: ShardId, sequence: SequenceNumber) {
        let current = self.shards.entry(shard).or_insert(0);
        if sequence > *current {
            *current = sequence;
        }
    }

    /// One update per request with the largest sequence among its points. Points
    /// without a sequence number leave the shard untouched, but the shard key is
    /// still created.
    pub fn record_request(&mut self, request: &ReplayRequest) {
        let highest = request.payload.max_sequence().unwrap_or(0);
        self.record_if_higher(request.shard_id, highest);
    }

    /// Give every point lacking a sequence number the next number of the shard's
    /// space. Points that carry one keep it and raise the counter used for the rest.
    pub fn assign(&self, shard: ShardId, payload: &mut WritePayload) {
        let mut next = self.current_sequence(shard);
        for point in payload.points.iter_mut() {
            match point.sequence_number {
                Some(seq) => next = next.max(seq),
                None => {
                    next = next.saturating_add(1);
                    point.sequence_number = Some(next);
                }
            }
        }
    }

    /// The part of `request` not yet reflected in this tracker: points whose sequence
    /// number is above the shard's current sequence, plus points without one.
    /// `None` when nothing is left to apply.
    pub fn unapplied(&self, request: &ReplayRequest) -> Option<ReplayRequest> {
        let current = self.current_sequence(request.shard_id);
        let points: Vec<_> = request
            .payload
            .points
            .iter()
            .filter(|p| p.sequence_number.is_none_or(|seq| seq > current))
            .cloned()
            .collect();

        if points.is_empty() && !request.payload.points.is_empty() {
            return None;
        }

        Some(ReplayRequest {
            request_number: request.request_number,
            shard_id: request.shard_id,
            payload: WritePayload {
                series: request.payload.series.clone(),
                points,
            },
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShardId, SequenceNumber)> + '_ {
        self.shards.iter().map(|(shard, seq)| (*shard, *seq))
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl FromIterator<(ShardId, SequenceNumber)> for SequenceTracker {
    fn from_iter<I: IntoIterator<Item = (ShardId, SequenceNumber)>>(iter: I) -> Self {
        Self {
            shards: iter.into_iter().collect(),
        }
    }
}
