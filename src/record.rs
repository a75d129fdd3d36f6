//! Framing of logged requests inside a segment:
//! `len u32 | crc32 u32 | payload | request_number u64`.
//! The payload is the bincode encoding of the [`ReplayRequest`]; the trailing
//! request number lets truncation read a segment's last request from its footer.

use std::io::Read;

use crate::types::{ReplayRequest, WalError};

/// Length header, checksum and request number footer.
pub const FRAME_OVERHEAD: u64 = 4 + 4 + 8;

/// Anything larger is treated as a corrupt length header.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

pub fn encode_record(request: &ReplayRequest) -> Result<Vec<u8>, WalError> {
    let payload = bincode::encode_to_vec(request, bincode::config::standard())
        .map_err(|e| WalError::GeneralError(format!("Failed to encode WAL record: {e}")))?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WalError::GeneralError(format!(
            "WAL record of {} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD as usize + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&request.request_number.to_le_bytes());
    Ok(frame)
}

/// Fill `buf` as far as the reader allows, returning the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_exact_or_torn<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<(), WalError> {
    let n = read_full(reader, buf)?;
    if n < buf.len() {
        return Err(WalError::Corruption(format!(
            "torn record: {what} has {n} of {} bytes",
            buf.len()
        )));
    }
    Ok(())
}

/// Read the record at the reader's position.
///
/// `Ok(None)` at a clean end of the log, `Corruption` for a torn or damaged record
/// and `Io` when the reader itself fails. On success also returns the frame length.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<(ReplayRequest, u64)>, WalError> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(None),
        4 => {}
        n => {
            return Err(WalError::Corruption(format!(
                "torn record: length header has {n} of 4 bytes"
            )));
        }
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(WalError::Corruption(format!(
            "record length {len} exceeds {MAX_PAYLOAD_LEN}"
        )));
    }

    let mut crc_buf = [0u8; 4];
    read_exact_or_torn(reader, &mut crc_buf, "checksum")?;

    let mut payload = vec![0u8; len];
    read_exact_or_torn(reader, &mut payload, "payload")?;

    let mut footer = [0u8; 8];
    read_exact_or_torn(reader, &mut footer, "footer")?;

    let stored_crc = u32::from_le_bytes(crc_buf);
    let computed_crc = crc32fast::hash(&payload);
    if stored_crc != computed_crc {
        return Err(WalError::Corruption(format!(
            "record checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    let (request, consumed) = bincode::decode_from_slice::<ReplayRequest, _>(
        &payload,
        bincode::config::standard(),
    )
    .map_err(|e| WalError::Corruption(format!("Failed to decode WAL record: {e}")))?;
    if consumed != payload.len() {
        return Err(WalError::Corruption(format!(
            "record payload has {} trailing bytes",
            payload.len() - consumed
        )));
    }

    let footer_number = u64::from_le_bytes(footer);
    if footer_number != request.request_number {
        return Err(WalError::Corruption(format!(
            "record footer {footer_number} does not match request {}",
            request.request_number
        )));
    }

    Ok(Some((request, FRAME_OVERHEAD + len as u64)))
}
