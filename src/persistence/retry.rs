//! Retry-with-wait for writes racing another process.
//!
//! The GUI and the scheduler open the same database file. SQLite admits a
//! single writer and rejects the others with `SQLITE_BUSY` instead of
//! queueing them, so writes are retried a bounded number of times.

use std::thread;
use std::time::Duration;

use log::{debug, warn};
use rusqlite::ErrorCode;

use super::error::PersistenceError;

/// Retry budget applied to contended writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Busy results tolerated before giving up
    pub retries: u32,
    /// Pause between attempts
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            wait: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, wait: Duration) -> Self {
        Self { retries, wait }
    }

    /// Runs `operation` until it succeeds, fails for a reason other than
    /// lock contention, or the budget is spent.
    ///
    /// The closure must be atomic (a single statement or a whole
    /// transaction), so a failed attempt leaves nothing behind.
    pub fn run<T, F>(&self, name: &str, mut operation: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> rusqlite::Result<T>,
    {
        let mut busy = 0;
        loop {
            match operation() {
                Ok(value) => {
                    if busy > 0 {
                        debug!("{}: succeeded after {} busy attempt(s)", name, busy);
                    }
                    return Ok(value);
                }
                Err(e) if is_contention(&e) => {
                    if busy >= self.retries {
                        return Err(PersistenceError::Exhausted {
                            operation: name.to_string(),
                            attempts: busy + 1,
                            source: e,
                        });
                    }
                    busy += 1;
                    warn!(
                        "{}: database locked, retrying in {:?} ({}/{})",
                        name, self.wait, busy, self.retries
                    );
                    thread::sleep(self.wait);
                }
                Err(e) => return Err(PersistenceError::storage(name, e)),
            }
        }
    }
}

/// Busy or locked database, i.e. another connection holds the write lock.
pub fn is_contention(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(e, _) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        )
    }

    #[test]
    fn test_succeeds_within_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Cell::new(0);

        let result = policy.run("test", || {
            calls.set(calls.get() + 1);
            if calls.get() <= 3 {
                Err(busy())
            } else {
                Ok(calls.get())
            }
        });

        assert_eq!(result.unwrap(), 4);
    }

    #[test]
    fn test_exhausted_beyond_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = Cell::new(0);

        let result: Result<(), _> = policy.run("append", || {
            calls.set(calls.get() + 1);
            Err(busy())
        });

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_other_errors_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Cell::new(0);

        let result: Result<(), _> = policy.run("query", || {
            calls.set(calls.get() + 1);
            Err(rusqlite::Error::QueryReturnedNoRows)
        });

        assert!(matches!(result, Err(PersistenceError::Storage { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_is_contention() {
        assert!(is_contention(&busy()));
        assert!(!is_contention(&rusqlite::Error::InvalidQuery));
    }
}
