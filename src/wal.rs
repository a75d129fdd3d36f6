use crate::{
    checkpoint::{FileCheckpointStore, deserialize, serialize},
    commit::CommitTracker,
    config::WalConfig,
    record::read_record,
    recovery::{Recovered, RecoveryReplayer},
    segment::{find_all_segments, read_segment_last_request_number, segment_filename},
    state::SegmentState,
    types::{
        AppendSink, CheckpointStore, CommitLog, RequestNumber, SequenceNumber, ServerId, ShardId,
        StorageEngine, WalCommon, WalError, WalWriter, WritePayload,
    },
    writer::{FileSink, SegmentWriter},
};
use log::{debug, error, info, warn};
use std::{
    io::BufReader,
    path::PathBuf,
    sync::{Arc, Weak},
};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

pub(crate) struct ActiveSegment {
    pub(crate) segment_index: u64,
    pub(crate) writer: SegmentWriter<FileSink>,
}

/// The write-ahead log of one node: a chain of segment files, the open segment's
/// single writer, and the replica acknowledgements that decide truncation.
pub struct Wal {
    pub(crate) config: WalConfig,
    store: Arc<dyn CheckpointStore>,
    engine: Arc<dyn StorageEngine>,
    pub(crate) active: Mutex<ActiveSegment>,
    commits: RwLock<CommitTracker>,
    request_watcher: watch::Sender<RequestNumber>,
}

impl Wal {
    /// Open the WAL in `config.dir`, keeping checkpoints next to the segments.
    pub async fn open(
        config: WalConfig,
        engine: Arc<dyn StorageEngine>,
    ) -> Result<Self, WalError> {
        let store = Arc::new(FileCheckpointStore::new(config.dir.clone()));
        Self::open_with_store(config, store, engine).await
    }

    /// Open the WAL, recovering the newest segment before any write is accepted.
    /// Requests recovered from the log are handed to `engine` in order.
    pub async fn open_with_store(
        config: WalConfig,
        store: Arc<dyn CheckpointStore>,
        engine: Arc<dyn StorageEngine>,
    ) -> Result<Self, WalError> {
        let base_dir = &config.dir;
        if config.truncate_at_start {
            match tokio::fs::remove_dir_all(base_dir).await {
                Ok(()) => info!("deleted WAL dir '{base_dir:?}'"),
                Err(e) => warn!(
                    "Failed to delete WAL dir '{base_dir:?}', this may be ok if no previous WAL \
                     existed: {e}"
                ),
            }
        }

        match tokio::fs::create_dir_all(base_dir).await {
            Ok(()) => info!("created WAL dir '{base_dir:?}'"),
            Err(e) => {
                error!("Failed to create WAL dir '{base_dir:?}': {e}");
                Err(WalError::GeneralError(format!(
                    "Failed to create WAL dir '{base_dir:?}': {e}"
                )))?
            }
        }

        let segments = find_all_segments(base_dir);
        let (segment_index, state, replayed, write_checkpoint) = match segments.last() {
            None => (1, SegmentState::new(), Vec::new(), true),
            Some(&(idx, _)) => {
                let earlier = &segments[..segments.len() - 1];
                let recovered = recover_segment(&config, store.as_ref(), idx, earlier).await?;
                let dirty = !recovered.report.hydrated || recovered.report.records_replayed > 0;
                (idx, recovered.state, recovered.replayed, dirty)
            }
        };

        let sink = FileSink::open(&segment_path(&config, segment_index), false).await?;
        if sink.len() != state.file_offset() {
            return Err(WalError::GeneralError(format!(
                "segment {segment_index} holds {} bytes but its state ends at {}",
                sink.len(),
                state.file_offset()
            )));
        }

        for request in &replayed {
            engine.apply(request).await?;
        }

        let commits = state.server_commit().clone();
        let (request_watcher, _) = watch::channel(state.largest_request_number());
        let writer = SegmentWriter::new(sink, state, config.index, config.sync_on_write);

        let wal = Self {
            config,
            store,
            engine,
            active: Mutex::new(ActiveSegment {
                segment_index,
                writer,
            }),
            commits: RwLock::new(commits),
            request_watcher,
        };

        if write_checkpoint {
            wal.checkpoint().await?;
        }

        info!(
            "WAL open at segment {segment_index}, largest request {}",
            wal.largest_request_number()
        );
        Ok(wal)
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    pub fn largest_request_number(&self) -> RequestNumber {
        *self.request_watcher.borrow()
    }

    pub async fn active_segment_index(&self) -> u64 {
        self.active.lock().await.segment_index
    }

    pub async fn current_sequence(&self, shard: ShardId) -> SequenceNumber {
        self.active.lock().await.writer.state().current_sequence(shard)
    }

    /// Copy of the open segment's state with the current acknowledgements.
    pub async fn snapshot(&self) -> SegmentState {
        let mut state = self.active.lock().await.writer.state().clone();
        state.set_server_commit(self.commits.read().await.clone());
        state
    }

    /// Sync the open segment and overwrite its checkpoint.
    pub async fn checkpoint(&self) -> Result<(), WalError> {
        let mut active = self.active.lock().await;
        self.checkpoint_locked(&mut active).await
    }

    /// Seal the open segment and continue in a new one. Returns the new index.
    pub async fn rotate(&self) -> Result<u64, WalError> {
        let mut active = self.active.lock().await;
        self.rotate_locked(&mut active).await?;
        Ok(active.segment_index)
    }

    async fn checkpoint_locked(&self, active: &mut ActiveSegment) -> Result<(), WalError> {
        active.writer.sync().await?;
        self.write_checkpoint(active).await.map(|_| ())
    }

    /// The caller has synced the sink.
    async fn write_checkpoint(
        &self,
        active: &mut ActiveSegment,
    ) -> Result<SegmentState, WalError> {
        let mut snapshot = active.writer.state().clone();
        snapshot.mark_checkpoint();
        snapshot.set_server_commit(self.commits.read().await.clone());

        self.store
            .write(active.segment_index, &serialize(&snapshot)?)
            .await?;
        active.writer.state_mut().mark_checkpoint();

        debug!(
            "checkpointed segment {} at offset {}, largest request {}",
            active.segment_index,
            snapshot.file_offset(),
            snapshot.largest_request_number()
        );
        Ok(snapshot)
    }

    async fn rotate_locked(&self, active: &mut ActiveSegment) -> Result<(), WalError> {
        // 1. Make the sealed segment durable and record its final state
        active.writer.sync().await?;
        let sealed = self.write_checkpoint(active).await?;

        // 2. Persist the successor's initial state before its file exists
        let old_index = active.segment_index;
        let new_index = old_index + 1;
        let state = SegmentState::continue_from(&sealed);
        self.store.write(new_index, &serialize(&state)?).await?;

        // 3. Open the new file and swap the writer (old file is dropped / closed)
        let sink = FileSink::open(&segment_path(&self.config, new_index), false).await?;
        active.writer = SegmentWriter::new(
            sink,
            state,
            self.config.index,
            self.config.sync_on_write,
        );
        active.segment_index = new_index;

        info!("WAL rotation: segment {old_index} -> {new_index}");
        Ok(())
    }

    async fn checkpoint_if_dirty(&self) -> Result<(), WalError> {
        let mut active = self.active.lock().await;
        if active.writer.state().requests_since_checkpoint() == 0 {
            return Ok(());
        }
        self.checkpoint_locked(&mut active).await
    }

    /// Checkpoint every `config.checkpoint.interval_ms` in the background. The task
    /// ends once the WAL is dropped. `None` when no interval is configured.
    pub fn spawn_checkpointer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.checkpoint.interval()?;
        let wal: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(wal) = wal.upgrade() else {
                    debug!("WAL dropped, stopping background checkpointer");
                    break;
                };
                if let Err(e) = wal.checkpoint_if_dirty().await {
                    warn!("background WAL checkpoint failed: {e}");
                }
            }
        }))
    }

    /// Delete sealed segments, oldest first, whose last request number every known
    /// server acknowledged. Nothing is deleted before some server reported. The
    /// active segment is NEVER deleted. Only the checkpoint of the newest deleted
    /// segment is kept.
    pub async fn purge_acknowledged(&self) -> Result<u32, WalError> {
        let Some(horizon) = self.commits.read().await.truncation_point() else {
            debug!("no server acknowledged any request yet, nothing to purge");
            return Ok(0);
        };
        let active_idx = self.active.lock().await.segment_index;
        let base_dir = &self.config.dir;
        let mut deleted_count = 0;

        for (idx, size) in find_all_segments(base_dir) {
            if idx >= active_idx {
                break;
            }

            match read_segment_last_request_number(base_dir, idx, size) {
                Ok(last) if last <= horizon => {
                    let path = base_dir.join(segment_filename(idx));
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("Failed to delete WAL segment {path:?}: {e}");
                        break;
                    }
                    // The newest purged checkpoint stays as the numbering floor.
                    let previous = idx.saturating_sub(1);
                    if previous > 0
                        && let Err(e) = self.store.remove(previous).await
                    {
                        warn!("Failed to delete checkpoint of WAL segment {previous}: {e}");
                    }
                    info!("Purged WAL segment: {path:?} (last request {last}, horizon {horizon})");
                    deleted_count += 1;
                }
                // Later segments only hold higher request numbers.
                Ok(_) => break,
                Err(e) => {
                    warn!("Failed to read last request number of segment {idx} during purge: {e}");
                    break;
                }
            }
        }

        Ok(deleted_count)
    }
}

fn segment_path(config: &WalConfig, segment_index: u64) -> PathBuf {
    config.dir.join(segment_filename(segment_index))
}

/// State to replay segment `idx` on when its own checkpoint is unusable.
///
/// Starts from the newest readable checkpoint before `idx`. That is the predecessor's,
/// or the one purging kept for the newest deleted segment. The records of every
/// segment after that checkpoint are then folded into numbering and shard sequences.
async fn fallback_state(
    config: &WalConfig,
    store: &dyn CheckpointStore,
    idx: u64,
    earlier: &[(u64, u64)],
) -> SegmentState {
    let oldest = earlier.first().map_or(idx, |(first, _)| *first);
    let mut base = None;
    for candidate in (oldest.saturating_sub(1).max(1)..idx).rev() {
        match store.read_latest(candidate).await {
            Ok(Some(bytes)) => match deserialize(&bytes) {
                Ok(prior) => {
                    base = Some((candidate, SegmentState::continue_from(&prior)));
                    break;
                }
                Err(e) => warn!("unusable checkpoint of earlier segment {candidate}: {e}"),
            },
            Ok(None) => debug!("no checkpoint of earlier segment {candidate}"),
            Err(e) => warn!("Failed to read checkpoint of earlier segment {candidate}: {e}"),
        }
    }

    let (base_idx, mut state) = base.unwrap_or_else(|| (0, SegmentState::new()));
    for &(seg, _) in earlier.iter().filter(|(seg, _)| *seg > base_idx) {
        let path = segment_path(config, seg);
        let mut reader = match std::fs::File::open(&path) {
            Ok(file) => BufReader::new(file),
            Err(e) => {
                warn!("Failed to open WAL segment {path:?} while rebuilding state: {e}");
                continue;
            }
        };
        loop {
            match read_record(&mut reader) {
                Ok(Some((request, _))) => state.recover(&request),
                Ok(None) => break,
                Err(e) => {
                    warn!("stopping state rebuild in segment {seg}: {e}");
                    break;
                }
            }
        }
    }
    state
}

/// Recover segment `idx` and cut off any torn tail so appends continue on a clean
/// record boundary.
async fn recover_segment(
    config: &WalConfig,
    store: &dyn CheckpointStore,
    idx: u64,
    earlier: &[(u64, u64)],
) -> Result<Recovered, WalError> {
    let checkpoint = match store.read_latest(idx).await {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!("Failed to read checkpoint of segment {idx}, replaying it whole: {e}");
            None
        }
    };
    let fallback = fallback_state(config, store, idx, earlier).await;

    let path = segment_path(config, idx);
    let file = std::fs::File::open(&path).map_err(|e| {
        WalError::GeneralError(format!("Failed to open WAL segment '{path:?}': {e}"))
    })?;
    let recovered = RecoveryReplayer::new(config.index)
        .with_fallback(fallback)
        .run(&mut BufReader::new(file), checkpoint.as_deref())?;

    if recovered.report.discarded_bytes > 0 {
        warn!(
            "truncating WAL segment {path:?} to {} bytes, dropping {} bytes of torn tail",
            recovered.report.valid_len, recovered.report.discarded_bytes
        );
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(recovered.report.valid_len)?;
        file.sync_all()?;
    }

    Ok(recovered)
}

#[async_trait::async_trait]
impl WalCommon for Wal {
    async fn io_sync(&self) -> Result<(), WalError> {
        self.active.lock().await.writer.sync().await
    }

    async fn get_request_watcher(&self) -> watch::Receiver<RequestNumber> {
        self.request_watcher.subscribe()
    }
}

#[async_trait::async_trait]
impl WalWriter for Wal {
    async fn append(
        &self,
        shard: ShardId,
        payload: WritePayload,
    ) -> Result<RequestNumber, WalError> {
        let mut active = self.active.lock().await;

        let prepared = active.writer.prepare(shard, payload)?;
        // Never rotate an empty segment, a single oversized record gets its own.
        if active
            .writer
            .would_exceed(prepared.frame_len(), self.config.max_segment_size)
        {
            self.rotate_locked(&mut active).await?;
        }

        let request = active.writer.append(prepared).await?;
        let request_number = request.request_number;
        self.request_watcher.send_replace(request_number);
        self.engine.apply(&request).await?;

        if active.writer.state().needs_checkpoint(&self.config.checkpoint)
            && let Err(e) = self.checkpoint_locked(&mut active).await
        {
            warn!("WAL checkpoint after request {request_number} failed: {e}");
        }

        Ok(request_number)
    }
}

#[async_trait::async_trait]
impl CommitLog for Wal {
    async fn commit(
        &self,
        server: ServerId,
        request_number: RequestNumber,
    ) -> Result<(), WalError> {
        let largest = self.largest_request_number();
        if request_number > largest {
            return Err(WalError::CommitAhead {
                server,
                request_number,
                largest,
            });
        }
        self.commits.write().await.commit(server, request_number);
        debug!("server {server} acknowledged request {request_number}");
        Ok(())
    }

    async fn low_water_mark(&self) -> RequestNumber {
        self.commits.read().await.low_water_mark()
    }
}
