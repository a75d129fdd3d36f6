use std::path::Path;

use log::warn;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::{
    config::IndexPolicy,
    record::encode_record,
    state::SegmentState,
    types::{AppendSink, ReplayRequest, ShardId, WalError, WritePayload},
};

/// Segment file opened for appending.
#[derive(Debug)]
pub struct FileSink {
    buffer: BufWriter<File>,
    len: u64,
}

impl FileSink {
    pub async fn open(path: &Path, truncate_at_start: bool) -> Result<Self, WalError> {
        let mut options = tokio::fs::OpenOptions::new();
        options.read(true).create(true);

        if truncate_at_start {
            options.write(true);
            options.truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(path).await.map_err(|e| {
            WalError::GeneralError(format!("Failed to open WAL file '{}': {e}", path.display()))
        })?;
        let len = file.metadata().await?.len();

        Ok(Self {
            buffer: BufWriter::new(file),
            len,
        })
    }
}

#[async_trait::async_trait]
impl AppendSink for FileSink {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), WalError> {
        self.buffer.write_all(bytes).await?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WalError> {
        self.buffer.flush().await?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<(), WalError> {
        self.buffer.flush().await?;
        self.buffer.get_ref().sync_data().await?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// In-memory sink; every appended byte is immediately "durable".
#[async_trait::async_trait]
impl AppendSink for Vec<u8> {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), WalError> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), WalError> {
        Ok(())
    }

    async fn sync(&mut self) -> Result<(), WalError> {
        Ok(())
    }

    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }
}

/// A request numbered and framed but not yet written.
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    request: ReplayRequest,
    frame: Vec<u8>,
}

impl PreparedRecord {
    pub fn request(&self) -> &ReplayRequest {
        &self.request
    }

    pub fn frame_len(&self) -> u64 {
        self.frame.len() as u64
    }
}

/// The single writer of an open segment. Owns its sink and its [`SegmentState`].
///
/// A request consumes its number only after the sink accepted and flushed the
/// record. A sink failure poisons the writer: the sink may hold a partial record,
/// which only recovery can cut off.
pub struct SegmentWriter<S> {
    sink: S,
    state: SegmentState,
    index_policy: IndexPolicy,
    sync_on_write: bool,
    poisoned: bool,
}

impl<S: AppendSink> SegmentWriter<S> {
    pub fn new(
        sink: S,
        state: SegmentState,
        index_policy: IndexPolicy,
        sync_on_write: bool,
    ) -> Self {
        Self {
            sink,
            state,
            index_policy,
            sync_on_write,
            poisoned: false,
        }
    }

    pub fn state(&self) -> &SegmentState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut SegmentState {
        &mut self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn into_parts(self) -> (S, SegmentState) {
        (self.sink, self.state)
    }

    /// Fill in missing point sequence numbers, number the request and frame it.
    /// Nothing is consumed until [`SegmentWriter::append`].
    pub fn prepare(
        &self,
        shard: ShardId,
        mut payload: WritePayload,
    ) -> Result<PreparedRecord, WalError> {
        if self.poisoned {
            return Err(WalError::Poisoned);
        }
        self.state.shard_sequence.assign(shard, &mut payload);
        let request = ReplayRequest {
            request_number: self.state.peek_next_request_number()?,
            shard_id: shard,
            payload,
        };
        let frame = encode_record(&request)?;
        Ok(PreparedRecord { request, frame })
    }

    /// Whether a record of `frame_len` bytes would push a non-empty segment past
    /// `max_segment_size`.
    pub fn would_exceed(&self, frame_len: u64, max_segment_size: u64) -> bool {
        let offset = self.state.file_offset();
        offset > 0 && offset + frame_len > max_segment_size
    }

    pub async fn append(&mut self, prepared: PreparedRecord) -> Result<ReplayRequest, WalError> {
        if self.poisoned {
            return Err(WalError::Poisoned);
        }
        let expected = self.state.peek_next_request_number()?;
        if prepared.request.request_number != expected {
            // Prepared against an older state; its number is already taken.
            return Err(WalError::Duplicate {
                request_number: prepared.request.request_number,
                largest: self.state.largest_request_number(),
            });
        }

        let offset = self.state.file_offset();
        if let Err(e) = self.write_frame(&prepared.frame).await {
            warn!(
                "WAL append of request {} at offset {offset} failed, poisoning segment writer: {e}",
                prepared.request.request_number
            );
            self.poisoned = true;
            return Err(e);
        }

        let request_number = self.state.next_request_number()?;
        self.state.shard_sequence.record_request(&prepared.request);
        self.state.record_append(
            offset,
            prepared.frame_len(),
            request_number,
            &self.index_policy,
        )?;
        Ok(prepared.request)
    }

    /// `prepare` followed by `append`.
    pub async fn write(
        &mut self,
        shard: ShardId,
        payload: WritePayload,
    ) -> Result<ReplayRequest, WalError> {
        let prepared = self.prepare(shard, payload)?;
        self.append(prepared).await
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), WalError> {
        self.sink.append(frame).await?;
        self.sink.flush().await?;
        if self.sync_on_write {
            self.sink.sync().await?;
        }
        Ok(())
    }

    pub async fn sync(&mut self) -> Result<(), WalError> {
        if self.poisoned {
            return Err(WalError::Poisoned);
        }
        self.sink.sync().await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::record::read_record;
    use crate::types::Point;

    struct FailingSink {
        bytes: Vec<u8>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl AppendSink for FailingSink {
        async fn append(&mut self, bytes: &[u8]) -> Result<(), WalError> {
            if self.fail {
                // Half the record reaches the medium before the failure.
                self.bytes.extend_from_slice(&bytes[..bytes.len() / 2]);
                return Err(std::io::Error::other("disk full").into());
            }
            self.bytes.extend_from_slice(bytes);
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), WalError> {
            Ok(())
        }

        async fn sync(&mut self) -> Result<(), WalError> {
            Ok(())
        }

        fn len(&self) -> u64 {
            self.bytes.len() as u64
        }
    }

    fn payload(points: usize) -> WritePayload {
        WritePayload::new(
            "cpu.load",
            (0..points)
                .map(|i| Point::new(i as i64, vec![i as u8]))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_append_numbers_and_tracks_sequences() {
        let mut writer = SegmentWriter::new(
            Vec::new(),
            SegmentState::new(),
            IndexPolicy::default(),
            true,
        );

        let first = writer.write(ShardId(1), payload(3)).await.unwrap();
        let second = writer.write(ShardId(2), payload(1)).await.unwrap();
        let third = writer.write(ShardId(1), payload(2)).await.unwrap();

        assert_eq!(
            [first.request_number, second.request_number, third.request_number],
            [1, 2, 3]
        );
        let seqs: Vec<_> = third.payload.points
            .iter()
            .map(|p| p.sequence_number)
            .collect();
        assert_eq!(seqs, vec![Some(4), Some(5)]);

        let state = writer.state();
        assert_eq!(state.current_sequence(ShardId(1)), 5);
        assert_eq!(state.current_sequence(ShardId(2)), 1);
        assert_eq!(state.file_offset(), writer.sink().len() as u64);
        assert_eq!(state.total_requests(), 3);

        let mut cursor = Cursor::new(writer.sink().clone());
        let (decoded, _) = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, first);
    }

    #[tokio::test]
    async fn test_failed_append_does_not_consume_number() {
        let sink = FailingSink {
            bytes: Vec::new(),
            fail: false,
        };
        let mut writer =
            SegmentWriter::new(sink, SegmentState::new(), IndexPolicy::default(), true);
        writer.write(ShardId(1), payload(1)).await.unwrap();
        let offset = writer.state().file_offset();

        writer.sink.fail = true;
        let err = writer.write(ShardId(1), payload(1)).await.unwrap_err();
        assert!(matches!(err, WalError::Io(_)));
        assert_eq!(writer.state().largest_request_number(), 1);
        assert_eq!(writer.state().file_offset(), offset);
        assert_eq!(writer.state().current_sequence(ShardId(1)), 1);
        assert!(writer.is_poisoned());

        writer.sink.fail = false;
        assert!(matches!(
            writer.write(ShardId(1), payload(1)).await,
            Err(WalError::Poisoned)
        ));
    }

    #[tokio::test]
    async fn test_stale_prepared_record_is_rejected() {
        let mut writer = SegmentWriter::new(
            Vec::new(),
            SegmentState::new(),
            IndexPolicy::default(),
            false,
        );
        let stale = writer.prepare(ShardId(1), payload(1)).unwrap();
        writer.write(ShardId(1), payload(1)).await.unwrap();

        assert!(matches!(
            writer.append(stale).await,
            Err(WalError::Duplicate {
                request_number: 1,
                largest: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_0000000001.wal");
        {
            let mut sink = FileSink::open(&path, false).await.unwrap();
            sink.append(b"abc").await.unwrap();
            sink.sync().await.unwrap();
        }
        let mut sink = FileSink::open(&path, false).await.unwrap();
        assert_eq!(sink.len(), 3);
        sink.append(b"de").await.unwrap();
        sink.sync().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcde");
    }

    #[test]
    fn test_would_exceed_never_on_empty_segment() {
        let mut state = SegmentState::new();
        let writer = SegmentWriter::new(Vec::new(), state.clone(), IndexPolicy::default(), false);
        assert!(!writer.would_exceed(10_000, 100));

        state
            .record_append(0, 90, 1, &IndexPolicy::default())
            .unwrap();
        let writer = SegmentWriter::new(Vec::new(), state, IndexPolicy::default(), false);
        assert!(writer.would_exceed(11, 100));
        assert!(!writer.would_exceed(10, 100));
    }
}
