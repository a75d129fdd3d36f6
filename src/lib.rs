//! The write-ahead log core of a clustered time-series database node.
//!
//! [`Wal`] stores every incoming write request in a chain of numbered segment
//! files. Each request gets a node-wide **request number** that strictly increases
//! and is never reused, also across segments and restarts. Alongside the log the
//! WAL tracks, per shard, the highest point sequence number applied and, per
//! replica server, the highest request number it acknowledged.
//!
//! # Features
//!
//! - **Segmented**: when a record would push a segment past `max_segment_size`
//!   bytes, the WAL continues in a new segment that inherits the numbering and the
//!   shard and server maps (rotation).
//! - **Checkpointed**: the state of the open segment is stored in a small,
//!   versioned, checksummed binary checkpoint next to the segment, on a request
//!   count threshold, on a timer and on rotation.
//! - **Recoverable**: on restart the newest segment's checkpoint is loaded, the
//!   log after it is replayed through a sparse offset index, and a torn tail is cut
//!   off. A missing or damaged checkpoint falls back to a full replay.
//! - **Replica aware**: servers acknowledge request numbers through [`CommitLog`];
//!   sealed segments below the low-water mark of all of them can be purged.
//! - **Request watchers**: callers can subscribe to the largest request number via
//!   [`tokio::sync::watch`] channels (useful for replication).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use shardwal::{
//!     CommitLog, Point, ReplayRequest, ServerId, ShardId, StorageEngine, Wal, WalCommon,
//!     WalConfig, WalError, WalReader, WalWriter, WritePayload,
//! };
//!
//! struct Engine;
//!
//! #[async_trait::async_trait]
//! impl StorageEngine for Engine {
//!     async fn apply(&self, request: &ReplayRequest) -> Result<(), WalError> {
//!         println!("apply request {}", request.request_number);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. Create (or reopen and recover) the WAL.
//!     let config = WalConfig::new("./wal_data").with_max_segment_size(1024 * 1024);
//!     let wal = Arc::new(Wal::open(config, Arc::new(Engine)).await?);
//!     let _checkpointer = wal.spawn_checkpointer();
//!
//!     // 2. Append a write; points without a sequence number get the next ones of
//!     //    their shard.
//!     let point = Point::new(1_700_000_000, b"0.7".to_vec());
//!     let payload = WritePayload::new("cpu.load", vec![point]);
//!     let request_number = wal.append(ShardId(1), payload).await?;
//!
//!     // 3. Replay everything after a request number, e.g. for a lagging replica.
//!     for request in wal.replay_from(0, true).await {
//!         let request = request?;
//!         println!("request {} for shard {}", request.request_number, request.shard_id);
//!     }
//!
//!     // 4. Record replica acknowledgements and drop what all of them have.
//!     wal.commit(ServerId(2), request_number).await?;
//!     let purged = wal.purge_acknowledged().await?;
//!     println!("purged {purged} old segment(s)");
//!
//!     // 5. Watch for new request numbers if needed.
//!     let mut watcher = wal.get_request_watcher().await;
//!     // watcher.changed().await will resolve when the next request is appended.
//!     let _ = watcher.borrow_and_update();
//!
//!     Ok(())
//! }
//! ```
//!
//! # Recovery
//!
//! To resume after a restart, call [`Wal::open`] with `truncate_at_start = false`
//! on the same directory. Requests logged after the last checkpoint are handed to
//! the [`StorageEngine`] again, restricted to points their shard has not applied.


pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod index;
pub mod numbering;
mod reader;
mod record;
pub mod recovery;
mod segment;
pub mod sequence;
pub mod state;
mod types;
pub mod user;
pub mod wal;
pub mod writer;

pub use checkpoint::FileCheckpointStore;
pub use commit::CommitTracker;
pub use config::{CheckpointPolicy, IndexPolicy, WalConfig};
pub use index::{Index, IndexEntry, ResumeTarget};
pub use numbering::RequestNumbering;
pub use recovery::{Recovered, RecoveryPhase, RecoveryReplayer, RecoveryReport};
pub use sequence::SequenceTracker;
pub use state::SegmentState;
pub use types::*;
pub use user::{User, hash_password};
pub use wal::Wal;
pub use writer::{FileSink, PreparedRecord, SegmentWriter};
