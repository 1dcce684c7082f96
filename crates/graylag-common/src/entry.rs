//! Greylist and auto-whitelist entry value encoding.
//!
//! Both stores share one value format: `"<count>,<last_seen>"` in UTF-8,
//! where `count` is the number of times the tuple has passed (0 = seen but
//! not yet passed) and `last_seen` is an integer POSIX timestamp.

use thiserror::Error;

/// Errors raised while decoding a stored entry value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryError {
    /// The value had no `,` separator.
    #[error("entry value without ',' separator")]
    MissingSeparator,
    /// One of the two fields was not a decimal integer.
    #[error("entry field is not an integer: {0:?}")]
    BadField(String),
}

/// One stored entry: a pass count and the last-seen timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Number of state advances past "recorded"; 0 means still pending.
    pub count: u64,
    /// POSIX timestamp of the most recent request for this key.
    pub last_seen: i64,
}

impl Entry {
    /// Creates an entry from its two fields.
    #[must_use]
    pub const fn new(count: u64, last_seen: i64) -> Self {
        Self { count, last_seen }
    }

    /// Serializes the entry for storage.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{},{}", self.count, self.last_seen)
    }

    /// Parses a stored value back into an entry.
    pub fn decode(value: &str) -> Result<Self, EntryError> {
        let (count, last_seen) = value
            .split_once(',')
            .ok_or(EntryError::MissingSeparator)?;
        let count = count
            .trim()
            .parse()
            .map_err(|_| EntryError::BadField(count.to_owned()))?;
        let last_seen = last_seen
            .trim()
            .parse()
            .map_err(|_| EntryError::BadField(last_seen.to_owned()))?;
        Ok(Self { count, last_seen })
    }
}
