use std::io::SeekFrom;
use std::io::{Read, Seek};
use std::path::Path;

use crate::types::RequestNumber;

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_SUFFIX: &str = ".wal";
const CHECKPOINT_SUFFIX: &str = ".ckpt";

/// Generate a segment filename, e.g. `segment_0000000001.wal`
pub fn segment_filename(segment_index: u64) -> String {
    format!("{SEGMENT_PREFIX}{segment_index:010}{SEGMENT_SUFFIX}")
}

/// Checkpoint slot of a segment, e.g. `segment_0000000001.ckpt`
pub fn checkpoint_filename(segment_index: u64) -> String {
    format!("{SEGMENT_PREFIX}{segment_index:010}{CHECKPOINT_SUFFIX}")
}

fn parse_segment_index(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Return a sorted list of `(segment_index, file_size)` for every segment file
/// inside `base_dir`, ordered by `segment_index` ascending.
pub fn find_all_segments(base_dir: &Path) -> Vec<(u64, u64)> {
    let mut segments: Vec<(u64, u64)> = std::fs::read_dir(base_dir)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().into_string().ok()?;
            let idx = parse_segment_index(&name)?;
            let size = entry.metadata().ok()?.len();
            Some((idx, size))
        })
        .collect();

    segments.sort_by_key(|(idx, _)| *idx);
    segments
}

/// Read the request number footer of the last record in a segment. Only
/// meaningful for segments whose tail is intact (rotated or recovered ones).
pub fn read_segment_last_request_number(
    base_dir: &Path,
    idx: u64,
    size: u64,
) -> Result<RequestNumber, std::io::Error> {
    if size < 8 {
        return Ok(0); // Empty or too-small segment
    }
    let path = base_dir.join(segment_filename(idx));
    let mut file = std::fs::File::open(&path)?;
    file.seek(SeekFrom::End(-8))?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// First segment whose last request number is `>= target`, or the newest segment
/// when `target` lies beyond all of them.
pub fn find_segment_for_request(base_dir: &Path, target: RequestNumber) -> Option<u64> {
    let segments = find_all_segments(base_dir);

    for &(idx, size) in &segments {
        if let Ok(last) = read_segment_last_request_number(base_dir, idx, size)
            && last >= target
        {
            return Some(idx);
        }
    }

    segments.last().map(|(idx, _)| *idx)
}
