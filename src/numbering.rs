use crate::types::{RequestNumber, WalError};

/// Hands out request numbers for one numbering scope. A scope spans a segment and,
/// through [`RequestNumbering::continue_from`], every segment after it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestNumbering {
    largest: RequestNumber,
}

impl RequestNumbering {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn starting_at(largest: RequestNumber) -> Self {
        Self { largest }
    }

    /// Seed a new scope at the last number handed out by `prior`.
    pub fn continue_from(prior: &RequestNumbering) -> Self {
        Self {
            largest: prior.largest,
        }
    }

    pub fn largest(&self) -> RequestNumber {
        self.largest
    }

    /// The number the next call to [`RequestNumbering::next_request_number`] returns.
    pub fn peek_next(&self) -> Result<RequestNumber, WalError> {
        self.largest
            .checked_add(1)
            .ok_or(WalError::RequestNumberOverflow)
    }

    pub fn next_request_number(&mut self) -> Result<RequestNumber, WalError> {
        let next = self.peek_next()?;
        self.largest = next;
        Ok(next)
    }

    /// Raise the high-water mark to a number seen while replaying. Never lowers it.
    pub fn observe(&mut self, request_number: RequestNumber) {
        if request_number > self.largest {
            self.largest = request_number;
        }
    }
}
