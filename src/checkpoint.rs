//! Versioned binary layout of a checkpointed [`SegmentState`] and the file-backed
//! slot it is stored in.
//!
//! ```text
//! magic    b"SWCK"
//! version  u8
//! fields   u16            number of fields that follow
//! field    id u8 | len u32 | value
//! crc32    u32            over every preceding byte
//! ```
//!
//! Fields are identified by id, never by position: a reader accepts them in any
//! order and skips ids it does not know. All integers are little-endian.

use std::io::{Cursor, Write};
use std::path::PathBuf;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::{
    commit::CommitTracker,
    index::Index,
    numbering::RequestNumbering,
    segment::checkpoint_filename,
    sequence::SequenceTracker,
    state::{CURRENT_VERSION, SegmentState},
    types::{CheckpointStore, ServerId, ShardId, WalError},
};

const CHECKPOINT_MAGIC: &[u8; 4] = b"SWCK";
const HEADER_LEN: usize = 4 + 1 + 2;
const CRC_LEN: usize = 4;

const FIELD_REQUESTS_SINCE_CHECKPOINT: u8 = 1;
const FIELD_REQUESTS_SINCE_INDEX_ENTRY: u8 = 2;
const FIELD_FILE_OFFSET: u8 = 3;
const FIELD_INDEX: u8 = 4;
const FIELD_TOTAL_REQUESTS: u8 = 5;
const FIELD_LARGEST_REQUEST_NUMBER: u8 = 6;
const FIELD_SHARD_SEQUENCE: u8 = 7;
const FIELD_SERVER_COMMIT: u8 = 8;

fn corrupt(msg: impl Into<String>) -> WalError {
    WalError::Corruption(format!("checkpoint: {}", msg.into()))
}

fn truncated(_: std::io::Error) -> WalError {
    corrupt("truncated")
}

pub fn serialize(state: &SegmentState) -> Result<Vec<u8>, WalError> {
    assemble(CURRENT_VERSION, &encode_fields(state)?)
}

pub(crate) fn encode_fields(state: &SegmentState) -> Result<Vec<(u8, Vec<u8>)>, WalError> {
    let u64_field = |value: u64| value.to_le_bytes().to_vec();

    let mut index = Vec::with_capacity(4 + 16 * state.index.len());
    index.write_u32::<LittleEndian>(state.index.len() as u32)?;
    for entry in state.index.entries() {
        index.write_u64::<LittleEndian>(entry.offset)?;
        index.write_u64::<LittleEndian>(entry.request_number)?;
    }

    let mut shards = Vec::with_capacity(4 + 12 * state.shard_sequence.len());
    shards.write_u32::<LittleEndian>(state.shard_sequence.len() as u32)?;
    for (shard, seq) in state.shard_sequence.iter() {
        shards.write_u32::<LittleEndian>(shard.value())?;
        shards.write_u64::<LittleEndian>(seq)?;
    }

    let mut servers = Vec::with_capacity(4 + 12 * state.server_commit.len());
    servers.write_u32::<LittleEndian>(state.server_commit.len() as u32)?;
    for (server, n) in state.server_commit.iter() {
        servers.write_u32::<LittleEndian>(server.value())?;
        servers.write_u64::<LittleEndian>(n)?;
    }

    Ok(vec![
        (
            FIELD_REQUESTS_SINCE_CHECKPOINT,
            u64_field(state.requests_since_checkpoint),
        ),
        (
            FIELD_REQUESTS_SINCE_INDEX_ENTRY,
            u64_field(state.requests_since_index_entry),
        ),
        (FIELD_FILE_OFFSET, u64_field(state.file_offset)),
        (FIELD_INDEX, index),
        (FIELD_TOTAL_REQUESTS, u64_field(state.total_requests)),
        (
            FIELD_LARGEST_REQUEST_NUMBER,
            u64_field(state.numbering.largest()),
        ),
        (FIELD_SHARD_SEQUENCE, shards),
        (FIELD_SERVER_COMMIT, servers),
    ])
}

pub(crate) fn assemble(version: u8, fields: &[(u8, Vec<u8>)]) -> Result<Vec<u8>, WalError> {
    let mut out = Vec::new();
    out.write_all(CHECKPOINT_MAGIC)?;
    out.write_u8(version)?;
    out.write_u16::<LittleEndian>(fields.len() as u16)?;
    for (id, value) in fields {
        out.write_u8(*id)?;
        out.write_u32::<LittleEndian>(value.len() as u32)?;
        out.write_all(value)?;
    }
    let crc = crc32fast::hash(&out);
    out.write_u32::<LittleEndian>(crc)?;
    Ok(out)
}

pub fn deserialize(bytes: &[u8]) -> Result<SegmentState, WalError> {
    if bytes.len() < 5 {
        return Err(corrupt("truncated header"));
    }
    if &bytes[..4] != CHECKPOINT_MAGIC {
        return Err(corrupt("bad magic"));
    }
    if bytes.len() < HEADER_LEN + CRC_LEN {
        return Err(corrupt("truncated header"));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - CRC_LEN);
    let stored_crc = LittleEndian::read_u32(crc_bytes);
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(corrupt(format!(
            "crc mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    let version = bytes[4];
    if version != CURRENT_VERSION {
        return Err(WalError::Format(version));
    }

    let fields = &body[5..];
    let mut cursor = Cursor::new(fields);
    let count = cursor.read_u16::<LittleEndian>().map_err(truncated)?;

    let mut requests_since_checkpoint = None;
    let mut requests_since_index_entry = None;
    let mut file_offset = None;
    let mut index = None;
    let mut total_requests = None;
    let mut largest_request_number = None;
    let mut shard_sequence = None;
    let mut server_commit = None;

    for _ in 0..count {
        let id = cursor.read_u8().map_err(truncated)?;
        let len = cursor.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let start = cursor.position() as usize;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= fields.len())
            .ok_or_else(|| corrupt(format!("field {id} runs past the end")))?;
        let value = &fields[start..end];
        cursor.set_position(end as u64);

        match id {
            FIELD_REQUESTS_SINCE_CHECKPOINT => {
                set_once(&mut requests_since_checkpoint, id, read_u64_field(id, value)?)?
            }
            FIELD_REQUESTS_SINCE_INDEX_ENTRY => {
                set_once(&mut requests_since_index_entry, id, read_u64_field(id, value)?)?
            }
            FIELD_FILE_OFFSET => set_once(&mut file_offset, id, read_u64_field(id, value)?)?,
            FIELD_INDEX => set_once(&mut index, id, read_index(value)?)?,
            FIELD_TOTAL_REQUESTS => {
                set_once(&mut total_requests, id, read_u64_field(id, value)?)?
            }
            FIELD_LARGEST_REQUEST_NUMBER => {
                set_once(&mut largest_request_number, id, read_u64_field(id, value)?)?
            }
            FIELD_SHARD_SEQUENCE => set_once(
                &mut shard_sequence,
                id,
                read_pairs(id, value)?
                    .into_iter()
                    .map(|(k, v)| (ShardId(k), v))
                    .collect::<SequenceTracker>(),
            )?,
            FIELD_SERVER_COMMIT => set_once(
                &mut server_commit,
                id,
                read_pairs(id, value)?
                    .into_iter()
                    .map(|(k, v)| (ServerId(k), v))
                    .collect::<CommitTracker>(),
            )?,
            unknown => debug!("skipping unknown checkpoint field {unknown} ({len} bytes)"),
        }
    }

    if cursor.position() as usize != fields.len() {
        return Err(corrupt("trailing bytes after last field"));
    }

    let missing = |name: &str| corrupt(format!("missing field {name}"));
    Ok(SegmentState {
        version,
        requests_since_checkpoint: requests_since_checkpoint
            .ok_or_else(|| missing("requests_since_checkpoint"))?,
        requests_since_index_entry: requests_since_index_entry
            .ok_or_else(|| missing("requests_since_index_entry"))?,
        file_offset: file_offset.ok_or_else(|| missing("file_offset"))?,
        index: index.ok_or_else(|| missing("index"))?,
        total_requests: total_requests.ok_or_else(|| missing("total_requests"))?,
        numbering: RequestNumbering::starting_at(
            largest_request_number.ok_or_else(|| missing("largest_request_number"))?,
        ),
        shard_sequence: shard_sequence.ok_or_else(|| missing("shard_sequence"))?,
        server_commit: server_commit.ok_or_else(|| missing("server_commit"))?,
    })
}

fn set_once<T>(slot: &mut Option<T>, id: u8, value: T) -> Result<(), WalError> {
    if slot.is_some() {
        return Err(corrupt(format!("field {id} appears twice")));
    }
    *slot = Some(value);
    Ok(())
}

fn read_u64_field(id: u8, value: &[u8]) -> Result<u64, WalError> {
    if value.len() != 8 {
        return Err(corrupt(format!(
            "field {id} is {} bytes, expected 8",
            value.len()
        )));
    }
    Ok(LittleEndian::read_u64(value))
}

/// Count-prefixed list of fixed-size elements; the value must hold exactly `count`.
fn read_counted(
    id: u8,
    value: &[u8],
    element_len: usize,
) -> Result<(u32, Cursor<&[u8]>), WalError> {
    let mut cursor = Cursor::new(value);
    let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
    let expected = (count as usize)
        .checked_mul(element_len)
        .and_then(|n| n.checked_add(4));
    if expected != Some(value.len()) {
        return Err(corrupt(format!(
            "field {id} holds {} bytes for {count} elements",
            value.len()
        )));
    }
    Ok((count, cursor))
}

fn read_index(value: &[u8]) -> Result<Index, WalError> {
    let (count, mut cursor) = read_counted(FIELD_INDEX, value, 16)?;
    let mut index = Index::new();
    for _ in 0..count {
        let offset = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let request_number = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        index.append(offset, request_number)?;
    }
    Ok(index)
}

/// Map entries, keys strictly ascending.
fn read_pairs(id: u8, value: &[u8]) -> Result<Vec<(u32, u64)>, WalError> {
    let (count, mut cursor) = read_counted(id, value, 12)?;
    let mut pairs: Vec<(u32, u64)> = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let val = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        if let Some((last, _)) = pairs.last()
            && key <= *last
        {
            return Err(corrupt(format!("field {id} keys out of order at {key}")));
        }
        pairs.push((key, val));
    }
    Ok(pairs)
}

/// Keeps the latest checkpoint of every segment as `segment_<index>.ckpt` next to the
/// segment files. Overwrites go through a temporary file and a rename.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, segment_index: u64) -> PathBuf {
        self.dir.join(checkpoint_filename(segment_index))
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read_latest(&self, segment_index: u64) -> Result<Option<Vec<u8>>, WalError> {
        match tokio::fs::read(self.path(segment_index)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, segment_index: u64, bytes: &[u8]) -> Result<(), WalError> {
        use tokio::io::AsyncWriteExt;

        let path = self.path(segment_index);
        let tmp = path.with_extension("ckpt.tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, segment_index: u64) -> Result<(), WalError> {
        match tokio::fs::remove_file(self.path(segment_index)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
