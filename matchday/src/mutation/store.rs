//! Durable storage behind the mutation log.

use super::{LogError, LogResult, MutationRecord};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Durable, append-only record storage
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Records with `seq > after`, in sequence order
    async fn load_from(&self, after: u64) -> LogResult<Vec<MutationRecord>>;

    /// Every stored record, in sequence order
    async fn load(&self) -> LogResult<Vec<MutationRecord>> {
        self.load_from(0).await
    }

    /// Persist consecutive records all at once or not at all. Must reject
    /// a batch whose first sequence number is not the immediate successor of
    /// the last stored one.
    async fn append_batch(&self, records: &[MutationRecord]) -> LogResult<()>;

    /// Persist one record
    async fn append(&self, record: &MutationRecord) -> LogResult<()> {
        self.append_batch(std::slice::from_ref(record)).await
    }
}

/// First sequence gap in `records`, given the stored head
pub(crate) fn check_successors(head: u64, records: &[MutationRecord]) -> LogResult<()> {
    for (expected, record) in (head + 1..).zip(records) {
        if record.seq != expected {
            return Err(LogError::SequenceGap {
                expected,
                found: record.seq,
            });
        }
    }
    Ok(())
}

/// Process-local store for tests and `--memory` runs
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: Mutex<Vec<MutationRecord>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously persisted records
    pub fn with_records(records: Vec<MutationRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn load_from(&self, after: u64) -> LogResult<Vec<MutationRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().filter(|r| r.seq > after).cloned().collect())
    }

    async fn append_batch(&self, batch: &[MutationRecord]) -> LogResult<()> {
        let mut records = self.records.lock().await;
        check_successors(records.last().map_or(0, |r| r.seq), batch)?;
        records.extend_from_slice(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::ChangeCause;
    use crate::schedule::models::{Entrant, Match, MatchId};
    use chrono::Utc;

    fn record(seq: u64) -> MutationRecord {
        let m = Match::new(
            MatchId::new(1, 1, seq as u32),
            [Entrant::Competitor(1), Entrant::Competitor(2)],
            None,
        );
        MutationRecord {
            seq,
            timestamp: Utc::now(),
            match_id: m.id,
            old: None,
            new: m,
            cause: ChangeCause::BracketBuilt,
        }
    }

    #[tokio::test]
    async fn test_append_and_load_suffix() {
        let store = MemoryLogStore::new();
        for seq in 1..=5 {
            store.append(&record(seq)).await.unwrap();
        }
        let suffix = store.load_from(3).await.unwrap();
        assert_eq!(suffix.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(store.load().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_rejects_out_of_order_append() {
        let store = MemoryLogStore::new();
        store.append(&record(1)).await.unwrap();
        let err = store.append(&record(3)).await.unwrap_err();
        assert!(matches!(
            err,
            LogError::SequenceGap {
                expected: 2,
                found: 3
            }
        ));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_batch_with_gap_stores_nothing() {
        let store = MemoryLogStore::new();
        store.append(&record(1)).await.unwrap();

        let err = store
            .append_batch(&[record(2), record(3), record(5)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LogError::SequenceGap {
                expected: 4,
                found: 5
            }
        ));
        assert_eq!(store.len().await, 1);

        store.append_batch(&[record(2), record(3)]).await.unwrap();
        assert_eq!(store.len().await, 3);
    }
}
