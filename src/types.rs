use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// Identity assigned to every accepted write. Widened to 64 bits; overflow is an
/// error, never a wrap.
pub type RequestNumber = u64;

/// Per-shard ordering of data points.
pub type SequenceNumber = u64;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("Unsupported checkpoint version: {0}")]
    Format(u8),
    #[error("Corrupted WAL data: {0}")]
    Corruption(String),
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Duplicate request number {request_number}, last seen {largest}")]
    Duplicate {
        request_number: RequestNumber,
        largest: RequestNumber,
    },
    #[error("Request number overflow")]
    RequestNumberOverflow,
    #[error("Server {server} acknowledged request {request_number} beyond largest {largest}")]
    CommitAhead {
        server: ServerId,
        request_number: RequestNumber,
        largest: RequestNumber,
    },
    #[error("Segment writer is poisoned by an earlier append failure, reopen the WAL")]
    Poisoned,
    #[error("Storage engine error: {0}")]
    Engine(String),
    #[error("General WAL error: {0}")]
    GeneralError(String),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct ShardId(pub u32);

impl ShardId {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(value: u32) -> Self {
        ShardId(value)
    }
}

/// A downstream replica that acknowledges request numbers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Encode,
    Decode,
    Serialize,
    Deserialize,
)]
pub struct ServerId(pub u32);

impl ServerId {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ServerId {
    fn from(value: u32) -> Self {
        ServerId(value)
    }
}

#[derive(Serialize, Deserialize, Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct Point {
    pub timestamp: i64,
    pub sequence_number: Option<SequenceNumber>,
    pub value: Vec<u8>,
}

impl Point {
    pub fn new(timestamp: i64, value: Vec<u8>) -> Self {
        Self {
            timestamp,
            sequence_number: None,
            value,
        }
    }

    pub fn with_sequence(mut self, sequence_number: SequenceNumber) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }
}

#[derive(Serialize, Deserialize, Encode, Decode, Clone, Debug, Default, PartialEq, Eq)]
pub struct WritePayload {
    pub series: String,
    pub points: Vec<Point>,
}

impl WritePayload {
    pub fn new(series: impl Into<String>, points: Vec<Point>) -> Self {
        Self {
            series: series.into(),
            points,
        }
    }

    /// Highest sequence number carried by any point, if any point carries one.
    pub fn max_sequence(&self) -> Option<SequenceNumber> {
        self.points.iter().filter_map(|p| p.sequence_number).max()
    }
}

/// A logged write as it is read back from a segment.
#[derive(Serialize, Deserialize, Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub struct ReplayRequest {
    pub request_number: RequestNumber,
    pub shard_id: ShardId,
    pub payload: WritePayload,
}

/// Ordered byte sink a segment is appended to.
#[async_trait::async_trait]
pub trait AppendSink: Send {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), WalError>;

    /// Hand buffered bytes to the OS.
    async fn flush(&mut self) -> Result<(), WalError>;

    /// Make everything appended so far durable.
    async fn sync(&mut self) -> Result<(), WalError>;

    /// Bytes accepted by the sink so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable slot holding the latest serialized `SegmentState` of each segment.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn read_latest(&self, segment_index: u64) -> Result<Option<Vec<u8>>, WalError>;

    /// Atomically replace the checkpoint of `segment_index`.
    async fn write(&self, segment_index: u64, bytes: &[u8]) -> Result<(), WalError>;

    async fn remove(&self, segment_index: u64) -> Result<(), WalError>;
}

/// Receives logged writes in request order, both live and during recovery.
#[async_trait::async_trait]
pub trait StorageEngine: Send + Sync {
    async fn apply(&self, request: &ReplayRequest) -> Result<(), WalError>;
}

#[async_trait::async_trait]
pub trait WalCommon: Send + Sync {
    async fn io_sync(&self) -> Result<(), WalError>;

    /// Subscribe to the largest durably logged request number.
    async fn get_request_watcher(&self) -> watch::Receiver<RequestNumber>;
}

#[async_trait::async_trait]
pub trait WalWriter: WalCommon + Send + Sync {
    async fn append(
        &self,
        shard: ShardId,
        payload: WritePayload,
    ) -> Result<RequestNumber, WalError>;
}

#[async_trait::async_trait]
pub trait WalReader: WalCommon + Send + Sync {
    /// Read logged requests starting at `from` across all retained segments.
    /// With `is_exclusive` the request numbered `from` itself is skipped.
    async fn replay_from(
        &self,
        from: RequestNumber,
        is_exclusive: bool,
    ) -> Box<dyn Iterator<Item = Result<ReplayRequest, WalError>> + Send + '_>;
}

/// Replica acknowledgements and the truncation horizon they imply.
#[async_trait::async_trait]
pub trait CommitLog: Send + Sync {
    async fn commit(
        &self,
        server: ServerId,
        request_number: RequestNumber,
    ) -> Result<(), WalError>;

    async fn low_water_mark(&self) -> RequestNumber;
}
