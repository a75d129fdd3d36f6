use std::collections::BTreeMap;

use crate::types::{RequestNumber, ServerId};

/// Highest request number each downstream server acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitTracker {
    servers: BTreeMap<ServerId, RequestNumber>,
}

impl CommitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins: a server that resynchronised may report a lower number.
    pub fn commit(&mut self, server: ServerId, request_number: RequestNumber) {
        self.servers.insert(server, request_number);
    }

    pub fn committed(&self, server: ServerId) -> Option<RequestNumber> {
        self.servers.get(&server).copied()
    }

    /// Minimum over all known servers, `RequestNumber::MAX` while none reported.
    pub fn low_water_mark(&self) -> RequestNumber {
        self.servers
            .values()
            .copied()
            .min()
            .unwrap_or(RequestNumber::MAX)
    }

    /// Highest request number that every known server holds, `None` while no server
    /// has reported and nothing may be truncated.
    pub fn truncation_point(&self) -> Option<RequestNumber> {
        self.servers.values().copied().min()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServerId, RequestNumber)> + '_ {
        self.servers.iter().map(|(server, n)| (*server, *n))
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

impl FromIterator<(ServerId, RequestNumber)> for CommitTracker {
    fn from_iter<I: IntoIterator<Item = (ServerId, RequestNumber)>>(iter: I) -> Self {
        Self {
            servers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_commits_is_pessimistic() {
        let tracker = CommitTracker::new();
        assert_eq!(tracker.low_water_mark(), RequestNumber::MAX);
        assert_eq!(tracker.truncation_point(), None);
    }

    #[test]
    fn test_low_water_mark_waits_for_slowest() {
        let mut tracker = CommitTracker::new();
        let (a, b) = (ServerId(1), ServerId(2));
        tracker.commit(a, 5);
        tracker.commit(b, 3);
        assert_eq!(tracker.low_water_mark(), 3);

        tracker.commit(a, 10);
        assert_eq!(tracker.low_water_mark(), 3);

        tracker.commit(b, 12);
        assert_eq!(tracker.low_water_mark(), 10);
        assert_eq!(tracker.truncation_point(), Some(10));
    }

    #[test]
    fn test_commit_is_last_write_wins() {
        let mut tracker = CommitTracker::new();
        tracker.commit(ServerId(1), 20);
        tracker.commit(ServerId(1), 8);
        assert_eq!(tracker.committed(ServerId(1)), Some(8));
        assert_eq!(tracker.committed(ServerId(2)), None);
    }
}
