//! In-memory view of the mutation log and its single writer.

use super::{ChangeCause, LogError, LogResult, LogStore, MutationRecord};
use crate::config::LogConfig;
use crate::schedule::models::{Match, MatchId};
use crate::schedule::state::ScheduleState;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

struct LogInner {
    /// Fold over every committed record
    state: ScheduleState,
    /// Hot window of recent records, oldest first
    records: VecDeque<Arc<MutationRecord>>,
}

impl LogInner {
    fn head(&self) -> u64 {
        self.state.seq()
    }

    fn first_retained(&self) -> u64 {
        self.records
            .front()
            .map_or(self.state.seq() + 1, |r| r.seq)
    }

    fn suffix(&self, last_seq: u64) -> LogResult<Vec<Arc<MutationRecord>>> {
        let head = self.head();
        if last_seq > head {
            return Err(LogError::AheadOfHead {
                requested: last_seq,
                head,
            });
        }
        let first_retained = self.first_retained();
        if last_seq + 1 < first_retained {
            return Err(LogError::ReplayGap {
                requested: last_seq,
                first_retained,
            });
        }
        Ok(self
            .records
            .iter()
            .filter(|r| r.seq > last_seq)
            .cloned()
            .collect())
    }
}

/// What a new subscriber receives before live records
#[derive(Debug)]
pub enum Backfill {
    /// Full current state
    Snapshot { seq: u64, matches: Vec<Match> },
    /// Exactly the records missed since the presented sequence number
    Suffix {
        records: Vec<Arc<MutationRecord>>,
        head_seq: u64,
    },
    /// The presented sequence number could not be served; full state instead
    Resync {
        reason: LogError,
        seq: u64,
        matches: Vec<Match>,
    },
}

impl Backfill {
    /// Sequence number the subscriber is at once the backfill is applied
    pub fn seq(&self) -> u64 {
        match self {
            Backfill::Snapshot { seq, .. } | Backfill::Resync { seq, .. } => *seq,
            Backfill::Suffix { head_seq, .. } => *head_seq,
        }
    }
}

/// Backfill plus a live stream that continues exactly where it ends
#[derive(Debug)]
pub struct Attachment {
    pub backfill: Backfill,
    pub live: broadcast::Receiver<Arc<MutationRecord>>,
}

/// Read side of the mutation log
pub struct MutationLog {
    inner: RwLock<LogInner>,
    live: broadcast::Sender<Arc<MutationRecord>>,
    store: Arc<dyn LogStore>,
    config: LogConfig,
}

impl std::fmt::Debug for MutationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationLog")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MutationLog {
    /// Open the log over a durable store, rebuilding state from every stored
    /// record. Returns the shared read side and the only writer.
    pub async fn open(
        store: Arc<dyn LogStore>,
        config: LogConfig,
    ) -> LogResult<(Arc<Self>, LogWriter)> {
        let stored = store.load().await?;
        let state = ScheduleState::replay(&stored)?;

        let keep = config.hot_window.unwrap_or(stored.len()).min(stored.len());
        let records: VecDeque<_> = stored
            .into_iter()
            .skip_while({
                let head = state.seq();
                move |r| r.seq + (keep as u64) <= head
            })
            .map(Arc::new)
            .collect();

        log::info!(
            "Mutation log opened at seq {} ({} records retained in memory)",
            state.seq(),
            records.len()
        );

        let next_seq = state.seq() + 1;
        let (live, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let log = Arc::new(Self {
            inner: RwLock::new(LogInner { state, records }),
            live,
            store,
            config,
        });

        let writer = LogWriter {
            log: Arc::clone(&log),
            next_seq,
        };
        Ok((log, writer))
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Sequence number of the latest committed record (0 when empty)
    pub async fn head_seq(&self) -> u64 {
        self.inner.read().await.head()
    }

    /// Oldest sequence number still served from memory
    pub async fn first_retained_seq(&self) -> u64 {
        self.inner.read().await.first_retained()
    }

    /// Records after `last_seq`, in order.
    ///
    /// Fails with [`LogError::ReplayGap`] if part of the suffix has left the
    /// hot window; never returns a partial suffix.
    pub async fn replay_from(&self, last_seq: u64) -> LogResult<Vec<Arc<MutationRecord>>> {
        self.inner.read().await.suffix(last_seq)
    }

    /// Full audit history after `after`, read from the durable store
    pub async fn history_from(&self, after: u64) -> LogResult<Vec<MutationRecord>> {
        self.store.load_from(after).await
    }

    /// Copy of the current folded state
    pub async fn snapshot(&self) -> ScheduleState {
        self.inner.read().await.state.clone()
    }

    /// Live records committed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MutationRecord>> {
        self.live.subscribe()
    }

    /// Attach a subscriber.
    ///
    /// The backfill and the live receiver are taken under the same lock the
    /// writer holds while publishing, so the first live record is always
    /// `backfill.seq() + 1`.
    pub async fn attach(&self, last_seq: Option<u64>) -> Attachment {
        let inner = self.inner.read().await;
        let live = self.live.subscribe();
        let head = inner.head();

        let backfill = match last_seq {
            None => Backfill::Snapshot {
                seq: head,
                matches: inner.state.matches().cloned().collect(),
            },
            Some(last_seq) => match inner.suffix(last_seq) {
                Ok(records) => Backfill::Suffix {
                    records,
                    head_seq: head,
                },
                Err(reason) => {
                    log::warn!("Backfill from seq {last_seq} refused: {reason}; sending snapshot");
                    Backfill::Resync {
                        reason,
                        seq: head,
                        matches: inner.state.matches().cloned().collect(),
                    }
                }
            },
        };

        Attachment { backfill, live }
    }
}

/// The single writer of the mutation log.
///
/// Not `Clone`: whoever owns it is the one serialization point for schedule
/// mutations.
pub struct LogWriter {
    log: Arc<MutationLog>,
    next_seq: u64,
}

impl LogWriter {
    pub fn log(&self) -> &Arc<MutationLog> {
        &self.log
    }

    pub fn head_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Persist and publish the new state of one match.
    ///
    /// The record is durable before it becomes visible to readers. Publishing
    /// never waits for subscribers.
    pub async fn append(&mut self, new: Match, cause: ChangeCause) -> LogResult<Arc<MutationRecord>> {
        let old = self.log.inner.read().await.state.get(&new.id).cloned();
        let record = MutationRecord {
            seq: self.next_seq,
            timestamp: Utc::now(),
            match_id: new.id,
            old,
            new,
            cause,
        };

        let mut appended = self.append_all(vec![record]).await?;
        appended
            .pop()
            .ok_or_else(|| LogError::Storage("empty append".to_string()))
    }

    /// Persist and publish consecutive records prepared by the caller.
    ///
    /// The store takes the whole batch or nothing, so readers never see part
    /// of it. Records must start at the next sequence number and carry the
    /// `old` state the log currently holds.
    pub async fn append_all(
        &mut self,
        records: Vec<MutationRecord>,
    ) -> LogResult<Vec<Arc<MutationRecord>>> {
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };
        if first.seq != self.next_seq {
            return Err(LogError::SequenceGap {
                expected: self.next_seq,
                found: first.seq,
            });
        }

        {
            let inner = self.log.inner.read().await;
            let mut pending: HashMap<MatchId, &Match> = HashMap::new();
            for record in &records {
                let current = match pending.get(&record.match_id) {
                    Some(m) => Some(*m),
                    None => inner.state.get(&record.match_id),
                };
                if current != record.old.as_ref() {
                    return Err(LogError::Diverged {
                        seq: record.seq,
                        match_id: record.match_id,
                    });
                }
                pending.insert(record.match_id, &record.new);
            }
        }

        self.log.store.append_batch(&records).await?;
        let records: Vec<Arc<MutationRecord>> = records.into_iter().map(Arc::new).collect();

        {
            let mut inner = self.log.inner.write().await;
            for record in &records {
                inner.state.apply(record)?;
                inner.records.push_back(Arc::clone(record));
                // No receivers is fine
                let _ = self.log.live.send(Arc::clone(record));
            }
            if let Some(window) = self.log.config.hot_window {
                while inner.records.len() > window {
                    inner.records.pop_front();
                }
            }
        }

        self.next_seq += records.len() as u64;
        for record in &records {
            log::debug!(
                "Appended record {} for match {} ({})",
                record.seq,
                record.match_id,
                record.cause
            );
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MemoryLogStore;
    use crate::schedule::models::{Entrant, MatchId};

    fn fresh_match(position: u32) -> Match {
        Match::new(
            MatchId::new(1, 1, position),
            [Entrant::Competitor(1), Entrant::Competitor(2)],
            None,
        )
    }

    async fn log_with(n: u32, config: LogConfig) -> (Arc<MutationLog>, LogWriter) {
        let (log, mut writer) = MutationLog::open(Arc::new(MemoryLogStore::new()), config)
            .await
            .unwrap();
        for i in 0..n {
            writer
                .append(fresh_match(i), ChangeCause::BracketBuilt)
                .await
                .unwrap();
        }
        (log, writer)
    }

    #[tokio::test]
    async fn test_append_assigns_gapless_sequence() {
        let (log, writer) = log_with(5, LogConfig::default()).await;
        assert_eq!(log.head_seq().await, 5);
        assert_eq!(writer.head_seq(), 5);
        let records = log.replay_from(0).await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_replay_from_head_is_empty() {
        let (log, _writer) = log_with(3, LogConfig::default()).await;
        assert!(log.replay_from(3).await.unwrap().is_empty());
        assert!(matches!(
            log.replay_from(4).await,
            Err(LogError::AheadOfHead {
                requested: 4,
                head: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_hot_window_produces_replay_gap() {
        let config = LogConfig {
            hot_window: Some(41),
            ..Default::default()
        };
        let (log, _writer) = log_with(50, config).await;
        assert_eq!(log.first_retained_seq().await, 10);

        assert!(matches!(
            log.replay_from(5).await,
            Err(LogError::ReplayGap {
                requested: 5,
                first_retained: 10
            })
        ));
        assert_eq!(log.replay_from(9).await.unwrap().len(), 41);
        // The durable store keeps everything
        assert_eq!(log.history_from(0).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_identical_state() {
        let store = Arc::new(MemoryLogStore::new());
        let (log, mut writer) = MutationLog::open(store.clone(), LogConfig::default())
            .await
            .unwrap();
        let m = fresh_match(0);
        writer.append(m.clone(), ChangeCause::BracketBuilt).await.unwrap();
        let mut cancelled = m;
        cancelled.state = crate::schedule::models::MatchState::Cancelled;
        writer.append(cancelled, ChangeCause::Cancelled).await.unwrap();
        let before = log.snapshot().await;
        drop(writer);

        let (reopened, writer) = MutationLog::open(store, LogConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.snapshot().await, before);
        assert_eq!(writer.head_seq(), 2);
    }

    #[tokio::test]
    async fn test_open_with_gap_fails() {
        let (log, _writer) = log_with(3, LogConfig::default()).await;
        let mut records = log.history_from(0).await.unwrap();
        records.remove(1);
        let result = MutationLog::open(
            Arc::new(MemoryLogStore::with_records(records)),
            LogConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(LogError::SequenceGap { .. })));
    }

    #[tokio::test]
    async fn test_attach_splices_without_gap() {
        let (log, mut writer) = log_with(4, LogConfig::default()).await;
        let mut attachment = log.attach(Some(2)).await;
        writer
            .append(fresh_match(10), ChangeCause::BracketBuilt)
            .await
            .unwrap();

        let Backfill::Suffix { records, head_seq } = attachment.backfill else {
            panic!("expected suffix");
        };
        assert_eq!(records.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(head_seq, 4);
        assert_eq!(attachment.live.recv().await.unwrap().seq, 5);
    }

    #[tokio::test]
    async fn test_attach_with_stale_seq_resyncs() {
        let config = LogConfig {
            hot_window: Some(2),
            ..Default::default()
        };
        let (log, _writer) = log_with(6, config).await;
        let attachment = log.attach(Some(1)).await;
        let Backfill::Resync { reason, seq, matches } = attachment.backfill else {
            panic!("expected resync");
        };
        assert!(reason.requires_resync());
        assert_eq!(seq, 6);
        assert_eq!(matches.len(), 6);
    }

    #[tokio::test]
    async fn test_append_all_is_all_or_nothing() {
        let (log, mut writer) = log_with(2, LogConfig::default()).await;
        let mut live = log.subscribe();

        let m = fresh_match(7);
        let mut cancelled = m.clone();
        cancelled.state = crate::schedule::models::MatchState::Cancelled;
        let record = |seq, old: Option<Match>, new: Match| MutationRecord {
            seq,
            timestamp: Utc::now(),
            match_id: new.id,
            old,
            new,
            cause: ChangeCause::BracketBuilt,
        };

        // Second record claims the match did not exist yet
        let bad = vec![record(3, None, m.clone()), record(4, None, cancelled.clone())];
        assert!(matches!(
            writer.append_all(bad).await,
            Err(LogError::Diverged { seq: 4, .. })
        ));
        assert_eq!(log.head_seq().await, 2);
        assert_eq!(log.history_from(0).await.unwrap().len(), 2);
        assert!(live.try_recv().is_err());

        let good = vec![record(3, None, m.clone()), record(4, Some(m), cancelled)];
        let appended = writer.append_all(good).await.unwrap();
        assert_eq!(appended.len(), 2);
        assert_eq!(writer.head_seq(), 4);
        assert_eq!(live.recv().await.unwrap().seq, 3);
        assert_eq!(live.recv().await.unwrap().seq, 4);
    }
}
