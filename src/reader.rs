use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::PathBuf;

use log::{debug, error};

use crate::{
    index::ResumeTarget,
    record::read_record,
    segment::{find_all_segments, find_segment_for_request, segment_filename},
    types::{ReplayRequest, RequestNumber, WalError, WalReader},
    wal::Wal,
};

/// Reads records segment after segment, starting at a given offset of the first.
struct SegmentChain {
    base_dir: PathBuf,
    segment_index: u64,
    reader: BufReader<File>,
    from: RequestNumber,
    is_exclusive: bool,
    done: bool,
}

impl SegmentChain {
    fn open_segment(base_dir: &std::path::Path, idx: u64) -> std::io::Result<BufReader<File>> {
        File::open(base_dir.join(segment_filename(idx))).map(BufReader::new)
    }

    fn wanted(&self, request_number: RequestNumber) -> bool {
        if self.is_exclusive {
            request_number > self.from
        } else {
            request_number >= self.from
        }
    }

    /// Move on to the next segment; false when there is none.
    fn advance(&mut self) -> bool {
        let next = self.segment_index + 1;
        match Self::open_segment(&self.base_dir, next) {
            Ok(reader) => {
                self.reader = reader;
                self.segment_index = next;
                true
            }
            Err(_) => false,
        }
    }

    fn has_successor(&self) -> bool {
        self.base_dir
            .join(segment_filename(self.segment_index + 1))
            .exists()
    }
}

impl Iterator for SegmentChain {
    type Item = Result<ReplayRequest, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            match read_record(&mut self.reader) {
                Ok(Some((request, _))) => {
                    if self.wanted(request.request_number) {
                        return Some(Ok(request));
                    }
                }
                Ok(None) => {
                    if !self.advance() {
                        self.done = true;
                    }
                }
                Err(WalError::Corruption(reason)) if !self.has_successor() => {
                    // The newest segment may end in a record still being written.
                    debug!(
                        "stopping read at unfinished tail of segment {}: {reason}",
                        self.segment_index
                    );
                    self.done = true;
                }
                Err(e) => {
                    error!("Failed to read WAL segment {}: {e}", self.segment_index);
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl WalReader for Wal {
    async fn replay_from(
        &self,
        from: RequestNumber,
        is_exclusive: bool,
    ) -> Box<dyn Iterator<Item = Result<ReplayRequest, WalError>> + Send + '_> {
        let (active_index, active_hint) = {
            let active = self.active.lock().await;
            let hint = active
                .writer
                .state()
                .index()
                .find_resume_point(ResumeTarget::Request(from))
                .map(|entry| entry.offset);
            (active.segment_index, hint)
        };

        let base_dir = self.config.dir.clone();
        let start_segment = if from <= 1 {
            find_all_segments(&base_dir).first().map(|(idx, _)| *idx)
        } else {
            find_segment_for_request(&base_dir, from)
        };
        let Some(start_segment) = start_segment else {
            return Box::new(std::iter::empty());
        };

        // Only the active segment's index is held in memory.
        let start_offset = if start_segment == active_index {
            active_hint.unwrap_or(0)
        } else {
            0
        };

        let mut reader = match SegmentChain::open_segment(&base_dir, start_segment) {
            Ok(reader) => reader,
            Err(e) => {
                return Box::new(std::iter::once(Err(WalError::GeneralError(format!(
                    "Failed to open WAL segment {start_segment}: {e}"
                )))));
            }
        };
        if let Err(e) = reader.seek(SeekFrom::Start(start_offset)) {
            error!("Failed to seek WAL segment {start_segment}: {e}");
            return Box::new(std::iter::once(Err(e.into())));
        }

        Box::new(SegmentChain {
            base_dir,
            segment_index: start_segment,
            reader,
            from,
            is_exclusive,
            done: false,
        })
    }
}
