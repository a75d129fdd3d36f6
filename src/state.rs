use crate::{
    commit::CommitTracker,
    config::{CheckpointPolicy, IndexPolicy},
    index::Index,
    numbering::RequestNumbering,
    sequence::SequenceTracker,
    types::{RequestNumber, ReplayRequest, SequenceNumber, ServerId, ShardId, WalError},
};

/// Checkpoint format written by this crate.
pub const CURRENT_VERSION: u8 = 1;

/// Bookkeeping of one open segment; the unit that is checkpointed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentState {
    pub(crate) version: u8,
    pub(crate) requests_since_checkpoint: u64,
    pub(crate) requests_since_index_entry: u64,
    /// End of the last record covered by this state.
    pub(crate) file_offset: u64,
    pub(crate) index: Index,
    pub(crate) total_requests: u64,
    pub(crate) numbering: RequestNumbering,
    pub(crate) shard_sequence: SequenceTracker,
    pub(crate) server_commit: CommitTracker,
}

impl Default for SegmentState {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentState {
    pub fn new() -> Self {
        Self {
            version: CURRENT_VERSION,
            requests_since_checkpoint: 0,
            requests_since_index_entry: 0,
            file_offset: 0,
            index: Index::new(),
            total_requests: 0,
            numbering: RequestNumbering::new(),
            shard_sequence: SequenceTracker::new(),
            server_commit: CommitTracker::new(),
        }
    }

    /// Initial state of the segment that follows `prior`: numbering and the shard and
    /// server maps carry over, segment-local bookkeeping starts empty.
    pub fn continue_from(prior: &SegmentState) -> Self {
        Self {
            numbering: RequestNumbering::continue_from(&prior.numbering),
            shard_sequence: prior.shard_sequence.clone(),
            server_commit: prior.server_commit.clone(),
            ..Self::new()
        }
    }

    /// Fresh state whose numbering resumes after `largest`. Used when only the
    /// predecessor segment's last request number survived.
    pub fn continue_from_request_number(largest: RequestNumber) -> Self {
        Self {
            numbering: RequestNumbering::starting_at(largest),
            ..Self::new()
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn requests_since_checkpoint(&self) -> u64 {
        self.requests_since_checkpoint
    }

    pub fn requests_since_index_entry(&self) -> u64 {
        self.requests_since_index_entry
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn largest_request_number(&self) -> RequestNumber {
        self.numbering.largest()
    }

    pub fn shard_sequence(&self) -> &SequenceTracker {
        &self.shard_sequence
    }

    pub fn server_commit(&self) -> &CommitTracker {
        &self.server_commit
    }

    pub fn next_request_number(&mut self) -> Result<RequestNumber, WalError> {
        self.numbering.next_request_number()
    }

    pub fn peek_next_request_number(&self) -> Result<RequestNumber, WalError> {
        self.numbering.peek_next()
    }

    /// Fold a replayed request into numbering and the shard's sequence.
    pub fn recover(&mut self, request: &ReplayRequest) {
        self.numbering.observe(request.request_number);
        self.shard_sequence.record_request(request);
    }

    pub fn current_sequence(&self, shard: ShardId) -> SequenceNumber {
        self.shard_sequence.current_sequence(shard)
    }

    pub fn record_sequence_if_higher(&mut self, shard: ShardId, sequence: SequenceNumber) {
        self.shard_sequence.record_if_higher(shard, sequence);
    }

    pub fn commit_request_number(&mut self, server: ServerId, request_number: RequestNumber) {
        self.server_commit.commit(server, request_number);
    }

    pub fn low_water_mark(&self) -> RequestNumber {
        self.server_commit.low_water_mark()
    }

    pub(crate) fn set_server_commit(&mut self, commits: CommitTracker) {
        self.server_commit = commits;
    }

    /// Segment-local bookkeeping for the record of `request_number` that was written
    /// at `offset` and is `len` bytes long.
    pub fn record_append(
        &mut self,
        offset: u64,
        len: u64,
        request_number: RequestNumber,
        policy: &IndexPolicy,
    ) -> Result<(), WalError> {
        let index_due = match self.index.last() {
            None => true,
            Some(last) => {
                self.requests_since_index_entry >= policy.requests_per_entry.max(1)
                    || offset.saturating_sub(last.offset) >= policy.bytes_per_entry.max(1)
            }
        };
        if index_due {
            self.index.append(offset, request_number)?;
            self.requests_since_index_entry = 0;
        }

        self.requests_since_index_entry += 1;
        self.requests_since_checkpoint += 1;
        self.total_requests += 1;
        self.file_offset = offset + len;
        Ok(())
    }

    pub fn needs_checkpoint(&self, policy: &CheckpointPolicy) -> bool {
        self.requests_since_checkpoint > 0
            && self.requests_since_checkpoint >= policy.requests_per_checkpoint
    }

    pub fn mark_checkpoint(&mut self) {
        self.requests_since_checkpoint = 0;
    }
}
