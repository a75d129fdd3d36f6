use crate::types::{RequestNumber, WalError};

/// A record boundary inside a segment and the request number of the record that
/// starts there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub request_number: RequestNumber,
}

impl IndexEntry {
    pub fn new(offset: u64, request_number: RequestNumber) -> Self {
        Self {
            offset,
            request_number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeTarget {
    Offset(u64),
    Request(RequestNumber),
}

/// Coarse skip structure over a segment. Lookups land at or before the target;
/// readers scan forward from there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offsets must strictly increase, request numbers must not decrease.
    pub fn append(&mut self, offset: u64, request_number: RequestNumber) -> Result<(), WalError> {
        if let Some(last) = self.entries.last()
            && (offset <= last.offset || request_number < last.request_number)
        {
            return Err(WalError::Corruption(format!(
                "index entry ({offset}, {request_number}) is not after ({}, {})",
                last.offset, last.request_number
            )));
        }
        self.entries.push(IndexEntry::new(offset, request_number));
        Ok(())
    }

    /// Latest entry at or before `target`, `None` if every entry lies after it.
    pub fn find_resume_point(&self, target: ResumeTarget) -> Option<IndexEntry> {
        let after = match target {
            ResumeTarget::Offset(offset) => self.entries.partition_point(|e| e.offset <= offset),
            ResumeTarget::Request(n) => self.entries.partition_point(|e| e.request_number <= n),
        };
        after.checked_sub(1).map(|i| self.entries[i])
    }

    pub fn last(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
