//! Daily ticket number sequences.
//!
//! Numbers are `PREFIX-NNN`, counted per branch, service prefix, and local
//! calendar day. The in-process counter is seeded from the store's highest
//! issued number the first time a (branch, prefix, day) key is touched, so a
//! restart never hands out a duplicate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::branch::BranchId;
use crate::error::Result;
use crate::store::TicketStore;

type SequenceKey = (BranchId, String, String);

/// Allocator of human-readable ticket numbers
pub struct TicketSequencer {
    counters: DashMap<SequenceKey, Arc<AtomicU32>>,
}

impl TicketSequencer {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Allocate the next number for (branch, prefix) on the given local day.
    ///
    /// `day_start` is the UTC instant the branch's local day began; it scopes
    /// the store lookup used to seed a fresh counter.
    pub async fn next_number(
        &self,
        store: &dyn TicketStore,
        branch_id: &BranchId,
        prefix: &str,
        date_key: &str,
        day_start: DateTime<Utc>,
    ) -> Result<String> {
        let key = (branch_id.clone(), prefix.to_string(), date_key.to_string());

        let counter = match self.counters.get(&key) {
            Some(counter) => counter.clone(),
            None => {
                let seed = store.max_ticket_seq(branch_id, prefix, day_start).await?;
                debug!(
                    "🔢 Seeding ticket sequence {}/{}/{} at {}",
                    branch_id, prefix, date_key, seed
                );
                self.counters
                    .entry(key)
                    .or_insert_with(|| Arc::new(AtomicU32::new(seed)))
                    .clone()
            }
        };

        let seq = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-{:03}", prefix, seq))
    }

    /// Drop all sequences of a branch for the given day (queue reset / reopen)
    pub fn reset_day(&self, branch_id: &BranchId, date_key: &str) {
        self.counters
            .retain(|(b, _, d), _| !(b == branch_id && d == date_key));
    }

    /// Parse the numeric part of an issued ticket number
    pub fn parse_seq(ticket_number: &str) -> Option<u32> {
        ticket_number.rsplit('-').next()?.parse().ok()
    }
}

impl Default for TicketSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryTicketStore;

    #[tokio::test]
    async fn numbers_increment_and_zero_pad() {
        let store = MemoryTicketStore::new();
        let sequencer = TicketSequencer::new();
        let branch = BranchId::from("b1");
        let day_start = Utc::now();

        let first = sequencer
            .next_number(&store, &branch, "A", "2026-03-01", day_start)
            .await
            .unwrap();
        let second = sequencer
            .next_number(&store, &branch, "A", "2026-03-01", day_start)
            .await
            .unwrap();
        assert_eq!(first, "A-001");
        assert_eq!(second, "A-002");

        // Separate prefix has its own sequence
        let other = sequencer
            .next_number(&store, &branch, "B", "2026-03-01", day_start)
            .await
            .unwrap();
        assert_eq!(other, "B-001");
    }

    #[tokio::test]
    async fn reset_day_restarts_the_sequence() {
        let store = MemoryTicketStore::new();
        let sequencer = TicketSequencer::new();
        let branch = BranchId::from("b1");
        let day_start = Utc::now();

        sequencer
            .next_number(&store, &branch, "A", "2026-03-01", day_start)
            .await
            .unwrap();
        sequencer.reset_day(&branch, "2026-03-01");

        let after = sequencer
            .next_number(&store, &branch, "A", "2026-03-01", day_start)
            .await
            .unwrap();
        assert_eq!(after, "A-001");
    }

    #[test]
    fn parse_seq_reads_the_numeric_suffix() {
        assert_eq!(TicketSequencer::parse_seq("D-007"), Some(7));
        assert_eq!(TicketSequencer::parse_seq("A-123"), Some(123));
        assert_eq!(TicketSequencer::parse_seq("garbage"), None);
    }
}
