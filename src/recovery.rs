//! Rebuilds the [`SegmentState`] of a segment after a restart.
//!
//! The replayer walks through four phases:
//!
//! - `Hydrating`: load the segment's last checkpoint. An absent, corrupt or
//!   unknown-version checkpoint is replaced by the fallback state and the whole
//!   segment is replayed from offset 0.
//! - `Scanning`: jump to the index entry at or before the checkpoint offset and
//!   scan forward to it. A checkpoint that does not line up with the log also falls
//!   back to a full replay.
//! - `Replaying`: decode every record after the resume offset and fold it into the
//!   state. A torn or damaged record ends the log; everything after it is dropped.
//! - `Ready`: the state reflects every intact record of the segment.

use std::io::{Read, Seek, SeekFrom};

use log::{debug, info, warn};

use crate::{
    checkpoint::deserialize,
    config::IndexPolicy,
    index::ResumeTarget,
    record::read_record,
    state::SegmentState,
    types::{ReplayRequest, WalError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Hydrating,
    Scanning,
    Replaying,
    Ready,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The checkpoint was loaded and matched the log.
    pub hydrated: bool,
    /// Offset replay resumed from.
    pub resume_offset: u64,
    /// Offset the scan for the resume point started at.
    pub scan_start: u64,
    /// Records between the scan start and the resume offset, already covered by the
    /// checkpoint.
    pub records_scanned: u64,
    /// Records folded into the state after the resume offset.
    pub records_replayed: u64,
    /// Points dropped from replayed requests because their shard already had them.
    pub points_skipped: u64,
    /// Length of the intact prefix of the segment.
    pub valid_len: u64,
    /// Bytes after `valid_len` that did not form a record.
    pub discarded_bytes: u64,
}

#[derive(Debug)]
pub struct Recovered {
    pub state: SegmentState,
    /// Requests after the resume offset, restricted to points not applied yet, in
    /// log order.
    pub replayed: Vec<ReplayRequest>,
    pub report: RecoveryReport,
}

pub struct RecoveryReplayer {
    phase: RecoveryPhase,
    index_policy: IndexPolicy,
    fallback: SegmentState,
    state: SegmentState,
    segment_len: u64,
    replayed: Vec<ReplayRequest>,
    report: RecoveryReport,
}

impl RecoveryReplayer {
    pub fn new(index_policy: IndexPolicy) -> Self {
        Self {
            phase: RecoveryPhase::Hydrating,
            index_policy,
            fallback: SegmentState::new(),
            state: SegmentState::new(),
            segment_len: 0,
            replayed: Vec::new(),
            report: RecoveryReport::default(),
        }
    }

    /// State to replay the whole segment on top of when the checkpoint is unusable,
    /// typically a continuation of the predecessor segment.
    pub fn with_fallback(mut self, fallback: SegmentState) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub fn state(&self) -> &SegmentState {
        &self.state
    }

    /// Run all phases against one segment.
    pub fn run<R: Read + Seek>(
        mut self,
        reader: &mut R,
        checkpoint: Option<&[u8]>,
    ) -> Result<Recovered, WalError> {
        self.hydrate(checkpoint)?;
        self.scan(reader)?;
        self.replay(reader)?;
        self.finish()
    }

    fn expect_phase(&self, phase: RecoveryPhase, step: &str) -> Result<(), WalError> {
        if self.phase != phase {
            return Err(WalError::GeneralError(format!(
                "recovery step '{step}' called in phase {:?}",
                self.phase
            )));
        }
        Ok(())
    }

    pub fn hydrate(&mut self, checkpoint: Option<&[u8]>) -> Result<(), WalError> {
        self.expect_phase(RecoveryPhase::Hydrating, "hydrate")?;

        match checkpoint.map(deserialize) {
            Some(Ok(state)) => {
                debug!(
                    "loaded checkpoint at offset {}, largest request {}",
                    state.file_offset(),
                    state.largest_request_number()
                );
                self.state = state;
                self.report.hydrated = true;
            }
            Some(Err(e)) => {
                warn!("unusable WAL checkpoint, replaying the whole segment: {e}");
                self.state = self.fallback.clone();
            }
            None => {
                info!("no WAL checkpoint, replaying the whole segment");
                self.state = self.fallback.clone();
            }
        }

        self.phase = RecoveryPhase::Scanning;
        Ok(())
    }

    pub fn scan<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), WalError> {
        self.expect_phase(RecoveryPhase::Scanning, "scan")?;
        self.segment_len = reader.seek(SeekFrom::End(0))?;

        if self.report.hydrated {
            match self.locate_checkpoint(reader) {
                Ok(()) => {}
                Err(WalError::Io(e)) => return Err(WalError::Io(e)),
                Err(e) => {
                    warn!(
                        "WAL checkpoint does not match the log, replaying the whole segment: {e}"
                    );
                    self.state = self.fallback.clone();
                    self.report = RecoveryReport::default();
                }
            }
        }

        reader.seek(SeekFrom::Start(self.report.resume_offset))?;
        self.phase = RecoveryPhase::Replaying;
        Ok(())
    }

    /// Scan from the index entry at or before the checkpoint offset up to it. The
    /// checkpoint offset must be a record boundary inside the log.
    fn locate_checkpoint<R: Read + Seek>(&mut self, reader: &mut R) -> Result<(), WalError> {
        let target = self.state.file_offset();
        if target > self.segment_len {
            return Err(WalError::Corruption(format!(
                "checkpoint offset {target} is past the end of the log ({})",
                self.segment_len
            )));
        }

        let start = self
            .state
            .index()
            .find_resume_point(ResumeTarget::Offset(target))
            .map_or(target, |entry| entry.offset);
        reader.seek(SeekFrom::Start(start))?;
        self.report.scan_start = start;

        let largest = self.state.largest_request_number();
        let mut position = start;
        while position < target {
            let Some((request, len)) = read_record(reader)? else {
                return Err(WalError::Corruption(format!(
                    "log ends at {position} before checkpoint offset {target}"
                )));
            };
            if request.request_number > largest {
                return Err(WalError::Corruption(format!(
                    "request {} before checkpoint offset is newer than the checkpoint ({largest})",
                    request.request_number
                )));
            }
            position += len;
            self.report.records_scanned += 1;
        }

        if position != target {
            return Err(WalError::Corruption(format!(
                "checkpoint offset {target} is not a record boundary"
            )));
        }
        self.report.resume_offset = target;
        Ok(())
    }

    pub fn replay<R: Read>(&mut self, reader: &mut R) -> Result<(), WalError> {
        self.expect_phase(RecoveryPhase::Replaying, "replay")?;

        let mut position = self.report.resume_offset;
        loop {
            let (request, len) = match read_record(reader) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(WalError::Corruption(reason)) => {
                    warn!("discarding WAL tail from offset {position}: {reason}");
                    break;
                }
                Err(e) => return Err(e),
            };

            let largest = self.state.largest_request_number();
            if request.request_number <= largest {
                return Err(WalError::Duplicate {
                    request_number: request.request_number,
                    largest,
                });
            }

            let total_points = request.payload.points.len() as u64;
            match self.state.shard_sequence.unapplied(&request) {
                Some(fresh) => {
                    let kept = fresh.payload.points.len() as u64;
                    self.report.points_skipped += total_points - kept;
                    self.replayed.push(fresh);
                }
                None => self.report.points_skipped += total_points,
            }

            self.state.recover(&request);
            self.state.record_append(
                position,
                len,
                request.request_number,
                &self.index_policy,
            )?;
            position += len;
            self.report.records_replayed += 1;
        }

        self.report.valid_len = position;
        self.report.discarded_bytes = self.segment_len.saturating_sub(position);
        self.phase = RecoveryPhase::Ready;
        Ok(())
    }

    pub fn finish(self) -> Result<Recovered, WalError> {
        self.expect_phase(RecoveryPhase::Ready, "finish")?;
        info!(
            "WAL recovery complete: largest request {}, {} records replayed, {} bytes discarded",
            self.state.largest_request_number(),
            self.report.records_replayed,
            self.report.discarded_bytes
        );
        Ok(Recovered {
            state: self.state,
            replayed: self.replayed,
            report: self.report,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::checkpoint::{assemble, encode_fields, serialize};
    use crate::record::encode_record;
    use crate::types::{Point, ShardId, WritePayload};
    use crate::writer::SegmentWriter;

    fn policy() -> IndexPolicy {
        IndexPolicy {
            requests_per_entry: 4,
            bytes_per_entry: u64::MAX,
        }
    }

    fn payload(ts: i64) -> WritePayload {
        WritePayload::new("mem.free", vec![Point::new(ts, ts.to_le_bytes().to_vec())])
    }

    /// Writes `before` records, checkpoints, then writes `after` more.
    async fn segment(before: usize, after: usize) -> (Vec<u8>, Vec<u8>, SegmentState) {
        let mut writer = SegmentWriter::new(Vec::new(), SegmentState::new(), policy(), false);
        for i in 0..before {
            writer
                .write(ShardId(i as u32 % 3), payload(i as i64))
                .await
                .unwrap();
        }
        writer.state_mut().mark_checkpoint();
        let checkpoint = serialize(writer.state()).unwrap();
        for i in before..before + after {
            writer
                .write(ShardId(i as u32 % 3), payload(i as i64))
                .await
                .unwrap();
        }
        let (log, state) = writer.into_parts();
        (log, checkpoint, state)
    }

    #[tokio::test]
    async fn test_resume_from_checkpoint_reproduces_state() {
        let (log, checkpoint, expected) = segment(21, 14).await;

        let recovered = RecoveryReplayer::new(policy())
            .run(&mut Cursor::new(&log), Some(&checkpoint))
            .unwrap();

        assert!(recovered.report.hydrated);
        assert_eq!(recovered.state, expected);
        assert_eq!(recovered.report.records_replayed, 14);
        assert_eq!(recovered.replayed.len(), 14);
        assert_eq!(recovered.replayed[0].request_number, 22);
        // 21 records, entries every 4: the last entry before the checkpoint is record 21.
        assert_eq!(recovered.report.records_scanned, 1);
        assert!(recovered.report.scan_start < recovered.report.resume_offset);
        assert_eq!(recovered.report.valid_len, log.len() as u64);
        assert_eq!(recovered.report.discarded_bytes, 0);
    }

    #[tokio::test]
    async fn test_without_checkpoint_replays_everything() {
        let (log, _, expected) = segment(10, 5).await;

        let recovered = RecoveryReplayer::new(policy())
            .run(&mut Cursor::new(&log), None)
            .unwrap();

        assert!(!recovered.report.hydrated);
        assert_eq!(recovered.report.records_replayed, 15);
        assert_eq!(recovered.state.largest_request_number(), 15);
        assert_eq!(recovered.state.index(), expected.index());
        assert_eq!(recovered.state.shard_sequence(), expected.shard_sequence());
        assert_eq!(recovered.state.file_offset(), expected.file_offset());
    }

    #[test]
    fn test_truncated_tail_after_checkpoint_is_discarded() {
        // 100 bytes already covered by a checkpoint at request 50, then 51..=60
        // with the last record cut mid-write.
        let mut log = vec![0u8; 100];
        let mut last_frame_len = 0;
        for n in 51..=60u64 {
            let frame = encode_record(&ReplayRequest {
                request_number: n,
                shard_id: ShardId(1),
                payload: WritePayload::new(
                    "cpu",
                    vec![Point::new(n as i64, vec![1, 2, 3]).with_sequence(n)],
                ),
            })
            .unwrap();
            last_frame_len = frame.len();
            log.extend(frame);
        }
        log.truncate(log.len() - last_frame_len / 2);

        let mut checkpoint_state = SegmentState::continue_from_request_number(50);
        checkpoint_state.file_offset = 100;
        let checkpoint = serialize(&checkpoint_state).unwrap();

        let recovered = RecoveryReplayer::new(policy())
            .run(&mut Cursor::new(&log), Some(&checkpoint))
            .unwrap();

        assert!(recovered.report.hydrated);
        assert_eq!(recovered.state.largest_request_number(), 59);
        assert_eq!(recovered.state.current_sequence(ShardId(1)), 59);
        assert_eq!(recovered.report.records_replayed, 9);
        let numbers: Vec<_> = recovered.replayed
            .iter()
            .map(|r| r.request_number)
            .collect();
        assert_eq!(numbers, (51..=59).collect::<Vec<_>>());
        assert_eq!(
            recovered.report.discarded_bytes,
            (last_frame_len - last_frame_len / 2) as u64
        );
        assert_eq!(
            recovered.report.valid_len + recovered.report.discarded_bytes,
            log.len() as u64
        );
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_falls_back_to_full_replay() {
        let (log, mut checkpoint, _) = segment(6, 3).await;
        let middle = checkpoint.len() / 2;
        checkpoint[middle] ^= 0x01;

        let recovered = RecoveryReplayer::new(policy())
            .run(&mut Cursor::new(&log), Some(&checkpoint))
            .unwrap();
        assert!(!recovered.report.hydrated);
        assert_eq!(recovered.report.resume_offset, 0);
        assert_eq!(recovered.report.records_replayed, 9);
        assert_eq!(recovered.state.largest_request_number(), 9);
    }

    #[tokio::test]
    async fn test_unknown_version_falls_back_to_full_replay() {
        let (log, _, expected) = segment(6, 3).await;
        let future = assemble(9, &encode_fields(&expected).unwrap()).unwrap();

        let recovered = RecoveryReplayer::new(policy())
            .run(&mut Cursor::new(&log), Some(&future))
            .unwrap();
        assert!(!recovered.report.hydrated);
        assert_eq!(recovered.report.records_replayed, 9);
    }

    #[tokio::test]
    async fn test_misaligned_checkpoint_falls_back() {
        let (log, checkpoint, _) = segment(6, 3).await;
        let mut state = deserialize(&checkpoint).unwrap();
        state.file_offset += 1;
        let misaligned = serialize(&state).unwrap();

        let recovered = RecoveryReplayer::new(policy())
            .run(&mut Cursor::new(&log), Some(&misaligned))
            .unwrap();
        assert!(!recovered.report.hydrated);
        assert_eq!(recovered.state.largest_request_number(), 9);

        state.file_offset = log.len() as u64 + 10;
        let beyond = serialize(&state).unwrap();
        let recovered = RecoveryReplayer::new(policy())
            .run(&mut Cursor::new(&log), Some(&beyond))
            .unwrap();
        assert!(!recovered.report.hydrated);
        assert_eq!(recovered.report.records_replayed, 9);
    }

    #[test]
    fn test_fallback_skips_applied_points() {
        let mut log = Vec::new();
        for n in 11..=13u64 {
            let points = (0..3)
                .map(|i| Point::new(0, vec![]).with_sequence((n - 11) * 3 + i + 1))
                .collect();
            log.extend(
                encode_record(&ReplayRequest {
                    request_number: n,
                    shard_id: ShardId(4),
                    payload: WritePayload::new("net", points),
                })
                .unwrap(),
            );
        }

        let mut fallback = SegmentState::continue_from_request_number(10);
        fallback.record_sequence_if_higher(ShardId(4), 5);

        let recovered = RecoveryReplayer::new(policy())
            .with_fallback(fallback)
            .run(&mut Cursor::new(&log), None)
            .unwrap();

        // Sequences 1..=3, 4..=6, 7..=9 against an applied horizon of 5.
        assert_eq!(recovered.report.points_skipped, 5);
        let numbers: Vec<_> = recovered.replayed
            .iter()
            .map(|r| r.request_number)
            .collect();
        assert_eq!(numbers, vec![12, 13]);
        assert_eq!(recovered.replayed[0].payload.points.len(), 1);
        assert_eq!(recovered.state.current_sequence(ShardId(4)), 9);
        assert_eq!(recovered.state.largest_request_number(), 13);
    }

    #[test]
    fn test_repeated_request_number_is_fatal() {
        let mut log = Vec::new();
        for n in [1u64, 2, 2] {
            log.extend(
                encode_record(&ReplayRequest {
                    request_number: n,
                    shard_id: ShardId(1),
                    payload: WritePayload::default(),
                })
                .unwrap(),
            );
        }
        let result = RecoveryReplayer::new(policy()).run(&mut Cursor::new(&log), None);
        assert!(matches!(
            result,
            Err(WalError::Duplicate {
                request_number: 2,
                largest: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let (log, checkpoint, _) = segment(3, 2).await;
        let mut reader = Cursor::new(&log);
        let mut replayer = RecoveryReplayer::new(policy());
        assert_eq!(replayer.phase(), RecoveryPhase::Hydrating);
        assert!(replayer.replay(&mut reader).is_err());

        replayer.hydrate(Some(&checkpoint)).unwrap();
        assert_eq!(replayer.phase(), RecoveryPhase::Scanning);
        assert_eq!(replayer.state().largest_request_number(), 3);

        replayer.scan(&mut reader).unwrap();
        assert_eq!(replayer.phase(), RecoveryPhase::Replaying);

        replayer.replay(&mut reader).unwrap();
        assert_eq!(replayer.phase(), RecoveryPhase::Ready);
        assert_eq!(replayer.finish().unwrap().state.largest_request_number(), 5);
    }
}
