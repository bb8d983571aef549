//! # Finished Transactions History
//!
//! Remembers transactions that have completed so status queries can still
//! answer for them for a while. Entries older than the retention window are
//! removed by the periodic purge; CLEAR wipes everything.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::TransactionId;

/// How a finished transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionOutcome {
    Completed,
    Cancelled,
    Abandoned,
}

/// Store of finished transactions, shared between the cycler and the
/// periodic purge task.
pub trait TransactionHistory: Send + Sync {
    fn record(&self, transaction: TransactionId, outcome: TransactionOutcome);

    /// Removes entries older than the retention window. Returns how many went.
    fn purge_expired_transactions(&self) -> usize;

    fn clear(&self);
}

#[derive(Debug)]
struct Entry {
    outcome: TransactionOutcome,
    finished_at: Instant,
}

#[derive(Debug)]
pub struct FinishedTransactionsHistory {
    retention: Duration,
    entries: Mutex<HashMap<TransactionId, Entry>>,
}

impl FinishedTransactionsHistory {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn outcome(&self, transaction: &TransactionId) -> Option<TransactionOutcome> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(transaction).map(|e| e.outcome)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionHistory for FinishedTransactionsHistory {
    fn record(&self, transaction: TransactionId, outcome: TransactionOutcome) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            transaction,
            Entry {
                outcome,
                finished_at: Instant::now(),
            },
        );
    }

    fn purge_expired_transactions(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.finished_at) < self.retention);
        let purged = before - entries.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = entries.len(), "purged finished transactions");
        }
        purged
    }

    fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;

    fn tx(sequence: u64) -> TransactionId {
        TransactionId {
            entity: EntityId(1),
            sequence,
        }
    }

    #[test]
    fn test_purge_removes_only_expired() {
        let history = FinishedTransactionsHistory::new(Duration::from_millis(200));
        history.record(tx(1), TransactionOutcome::Completed);
        std::thread::sleep(Duration::from_millis(300));
        history.record(tx(2), TransactionOutcome::Cancelled);

        assert_eq!(history.purge_expired_transactions(), 1);
        assert_eq!(history.outcome(&tx(1)), None);
        assert_eq!(history.outcome(&tx(2)), Some(TransactionOutcome::Cancelled));
    }

    #[test]
    fn test_clear_empties_history() {
        let history = FinishedTransactionsHistory::new(Duration::from_secs(60));
        history.record(tx(1), TransactionOutcome::Abandoned);
        history.clear();
        assert!(history.is_empty());
    }
}
