//! Realtime hub: client subscriptions over the mutation log.
//!
//! Each subscriber gets its own delivery task and bounded queue fed from the
//! log's live broadcast, so a slow client never holds up the writer or other
//! clients. A client that falls too far behind is disconnected and resyncs
//! through backfill when it comes back.

pub mod connection;
pub mod errors;

pub use connection::{ConnectionEvent, ConnectionState};
pub use errors::{HubError, HubResult};

use crate::config::HubConfig;
use crate::mutation::{Backfill, MutationLog, MutationRecord};
use crate::schedule::models::{CategoryId, Match, VenueId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Client connection identity
pub type ClientId = String;

/// Category/venue subset a client is interested in; `None` means everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    #[serde(default)]
    pub categories: Option<BTreeSet<CategoryId>>,
    #[serde(default)]
    pub venues: Option<BTreeSet<VenueId>>,
}

impl TopicFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, m: &Match) -> bool {
        let category_ok = self
            .categories
            .as_ref()
            .is_none_or(|c| c.contains(&m.category()));
        let venue_ok = self
            .venues
            .as_ref()
            .is_none_or(|v| m.slot.is_some_and(|s| v.contains(&s.venue)));
        category_ok && venue_ok
    }

    /// A record is relevant if the match is in scope before or after the
    /// change, so a match moving off a watched venue is still seen
    pub fn matches_record(&self, record: &MutationRecord) -> bool {
        self.matches(&record.new) || record.old.as_ref().is_some_and(|old| self.matches(old))
    }
}

/// What a subscriber receives before live records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStart {
    /// Full current state matching the filter
    Snapshot { seq: u64, matches: Vec<Match> },
    /// Missed records since the presented sequence number
    Replay {
        records: Vec<Arc<MutationRecord>>,
        head_seq: u64,
    },
    /// The presented sequence number could not be served
    Resync {
        reason: String,
        seq: u64,
        matches: Vec<Match>,
    },
}

impl SyncStart {
    fn from_backfill(backfill: Backfill, filter: &TopicFilter) -> Self {
        match backfill {
            Backfill::Snapshot { seq, matches } => SyncStart::Snapshot {
                seq,
                matches: matches.into_iter().filter(|m| filter.matches(m)).collect(),
            },
            Backfill::Suffix { records, head_seq } => SyncStart::Replay {
                records: records
                    .into_iter()
                    .filter(|r| filter.matches_record(r))
                    .collect(),
                head_seq,
            },
            Backfill::Resync {
                reason,
                seq,
                matches,
            } => SyncStart::Resync {
                reason: reason.to_string(),
                seq,
                matches: matches.into_iter().filter(|m| filter.matches(m)).collect(),
            },
        }
    }

    /// Sequence number covered once this start is applied
    pub fn seq(&self) -> u64 {
        match self {
            SyncStart::Snapshot { seq, .. } | SyncStart::Resync { seq, .. } => *seq,
            SyncStart::Replay { head_seq, .. } => *head_seq,
        }
    }
}

/// Why the hub stopped delivering to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Closed,
    BacklogExceeded,
    SequenceBroken,
    HeartbeatTimeout,
    ConnectionLost,
    GraceExpired,
    Superseded,
}

/// Connection status published to the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub reason: Option<DisconnectReason>,
}

/// A live subscription
pub struct Subscription {
    pub client_id: ClientId,
    pub start: SyncStart,
    generation: u64,
    events: mpsc::Receiver<Arc<MutationRecord>>,
    status: watch::Receiver<ClientStatus>,
}

impl Subscription {
    /// Next live record in commit order.
    ///
    /// Records already queued are still delivered after a disconnect; the
    /// error comes once the queue is drained.
    pub async fn next(&mut self) -> HubResult<Arc<MutationRecord>> {
        match self.events.recv().await {
            Some(record) => Ok(record),
            None => Err(match self.status.borrow().reason {
                Some(DisconnectReason::BacklogExceeded) => {
                    HubError::BacklogExceeded(self.client_id.clone())
                }
                Some(DisconnectReason::SequenceBroken) => {
                    HubError::SequenceBroken(self.client_id.clone())
                }
                _ => HubError::Disconnected(self.client_id.clone()),
            }),
        }
    }

    /// Which connection of this client the subscription belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current connection status
    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    /// Watch for status changes
    pub fn status_changes(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }
}

struct ClientEntry {
    state: ConnectionState,
    filter: TopicFilter,
    last_acked: u64,
    last_heartbeat: Instant,
    /// When the client entered its current state
    since: Instant,
    /// Bumped on every (re)connect so stale delivery tasks can be told apart
    generation: u64,
    status: watch::Sender<ClientStatus>,
    task: Option<JoinHandle<()>>,
}

impl ClientEntry {
    fn transition(&mut self, event: ConnectionEvent, reason: Option<DisconnectReason>) -> HubResult<()> {
        self.state = self.state.on(event)?;
        self.since = Instant::now();
        if !self.state.is_connected() {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
        self.status.send_replace(ClientStatus {
            state: self.state,
            reason,
        });
        Ok(())
    }
}

/// Clients moved by one [`RealtimeHub::sweep`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Live clients that missed their heartbeat
    pub timed_out: Vec<ClientId>,
    /// Reconnecting clients whose grace period ran out
    pub expired: Vec<ClientId>,
    /// Disconnected clients forgotten entirely
    pub removed: Vec<ClientId>,
}

fn close_client(clients: &mut HashMap<ClientId, ClientEntry>, client_id: &str) -> HubResult<()> {
    let mut entry = clients
        .remove(client_id)
        .ok_or_else(|| HubError::UnknownClient(client_id.to_string()))?;
    if entry.state != ConnectionState::Disconnected {
        entry.transition(ConnectionEvent::Close, Some(DisconnectReason::Closed))?;
    }
    log::info!("Client {} unsubscribed", client_id);
    Ok(())
}

fn lose_client(clients: &mut HashMap<ClientId, ClientEntry>, client_id: &str) -> HubResult<()> {
    let entry = clients
        .get_mut(client_id)
        .ok_or_else(|| HubError::UnknownClient(client_id.to_string()))?;
    if entry.state.is_connected() {
        entry.transition(
            ConnectionEvent::ConnectionLost,
            Some(DisconnectReason::ConnectionLost),
        )?;
        log::info!("Client {} lost connection; awaiting reconnect", client_id);
    }
    Ok(())
}

/// Realtime hub; cheap to clone
#[derive(Clone)]
pub struct RealtimeHub {
    log: Arc<MutationLog>,
    clients: Arc<RwLock<HashMap<ClientId, ClientEntry>>>,
    config: HubConfig,
}

impl RealtimeHub {
    pub fn new(log: Arc<MutationLog>, config: HubConfig) -> HubResult<Self> {
        config.validate().map_err(HubError::InvalidConfig)?;
        Ok(Self {
            log,
            clients: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    pub fn log(&self) -> &Arc<MutationLog> {
        &self.log
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Subscribe a client.
    ///
    /// Without `last_seq` the subscription starts from a filtered snapshot.
    /// With it, the exact missed suffix is replayed, or a snapshot is sent
    /// instead if that suffix is no longer retained. Live records continue
    /// from the start's sequence number with no gap and no duplicate.
    ///
    /// Subscribing with the id of a connected client supersedes the old
    /// connection.
    pub async fn subscribe(
        &self,
        client_id: impl Into<ClientId>,
        filter: TopicFilter,
        last_seq: Option<u64>,
    ) -> HubResult<Subscription> {
        let client_id = client_id.into();
        let attachment = self.log.attach(last_seq).await;
        let start = SyncStart::from_backfill(attachment.backfill, &filter);
        let start_seq = start.seq();

        let (tx, events) = mpsc::channel(self.config.client_backlog);
        let now = Instant::now();

        let mut clients = self.clients.write().await;
        let generation = match clients.remove(&client_id) {
            Some(mut entry) => {
                if entry.state.is_connected() {
                    entry.transition(ConnectionEvent::Close, Some(DisconnectReason::Superseded))?;
                }
                entry.state.on(ConnectionEvent::Reconnect)?;
                log::info!(
                    "Client {} reconnected at seq {} (last acked {})",
                    client_id,
                    start_seq,
                    entry.last_acked
                );
                entry.generation + 1
            }
            None => {
                log::info!("Client {} connected at seq {}", client_id, start_seq);
                0
            }
        };
        let (status, _) = watch::channel(ClientStatus {
            state: ConnectionState::connect(),
            reason: None,
        });

        let task = tokio::spawn(deliver(
            self.clone(),
            client_id.clone(),
            generation,
            attachment.live,
            tx,
            filter.clone(),
            start_seq,
        ));

        let mut entry = ClientEntry {
            state: ConnectionState::connect(),
            filter,
            last_acked: last_seq.unwrap_or(0).min(start_seq),
            last_heartbeat: now,
            since: now,
            generation,
            status,
            task: Some(task),
        };
        entry.transition(ConnectionEvent::Synced, None)?;
        let status = entry.status.subscribe();
        clients.insert(client_id.clone(), entry);

        Ok(Subscription {
            client_id,
            start,
            generation,
            events,
            status,
        })
    }

    /// Explicit close; the client is forgotten
    pub async fn unsubscribe(&self, client_id: &str) -> HubResult<()> {
        let mut clients = self.clients.write().await;
        close_client(&mut clients, client_id)
    }

    /// Record a heartbeat from a connected client
    pub async fn heartbeat(&self, client_id: &str) -> HubResult<()> {
        let mut clients = self.clients.write().await;
        let entry = clients
            .get_mut(client_id)
            .ok_or_else(|| HubError::UnknownClient(client_id.to_string()))?;
        entry.state = entry.state.on(ConnectionEvent::Heartbeat)?;
        entry.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Record the highest sequence number the client has applied. Acks
    /// also count as heartbeats.
    pub async fn ack(&self, client_id: &str, seq: u64) -> HubResult<()> {
        let mut clients = self.clients.write().await;
        let entry = clients
            .get_mut(client_id)
            .ok_or_else(|| HubError::UnknownClient(client_id.to_string()))?;
        entry.state = entry.state.on(ConnectionEvent::Heartbeat)?;
        entry.last_heartbeat = Instant::now();
        entry.last_acked = entry.last_acked.max(seq);
        Ok(())
    }

    /// Transport for a client went away without an explicit close
    pub async fn connection_lost(&self, client_id: &str) -> HubResult<()> {
        let mut clients = self.clients.write().await;
        lose_client(&mut clients, client_id)
    }

    /// End the connection behind one subscription: forget the client if it
    /// `closed`, otherwise wait for it to reconnect.
    ///
    /// Does nothing once the client has reconnected under a newer
    /// generation, so a stale connection cannot tear down its successor.
    pub async fn release(&self, client_id: &str, generation: u64, closed: bool) -> HubResult<()> {
        let mut clients = self.clients.write().await;
        let current = clients
            .get(client_id)
            .ok_or_else(|| HubError::UnknownClient(client_id.to_string()))?
            .generation;
        if current != generation {
            log::debug!(
                "Client {} released generation {} but is now at {}",
                client_id,
                generation,
                current
            );
            return Ok(());
        }
        if closed {
            close_client(&mut clients, client_id)
        } else {
            lose_client(&mut clients, client_id)
        }
    }

    /// Apply heartbeat timeouts and reconnect grace periods as of `now`
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut clients = self.clients.write().await;

        for (client_id, entry) in clients.iter_mut() {
            match entry.state {
                ConnectionState::Connecting | ConnectionState::Live
                    if now.duration_since(entry.last_heartbeat) >= self.config.heartbeat_timeout =>
                {
                    if entry
                        .transition(
                            ConnectionEvent::HeartbeatTimeout,
                            Some(DisconnectReason::HeartbeatTimeout),
                        )
                        .is_ok()
                    {
                        entry.since = now;
                        log::warn!("Client {} missed heartbeat; awaiting reconnect", client_id);
                        report.timed_out.push(client_id.clone());
                    }
                }
                ConnectionState::Reconnecting
                    if now.duration_since(entry.since) >= self.config.reconnect_grace =>
                {
                    if entry
                        .transition(
                            ConnectionEvent::GraceExpired,
                            Some(DisconnectReason::GraceExpired),
                        )
                        .is_ok()
                    {
                        entry.since = now;
                        log::info!("Client {} did not reconnect in time", client_id);
                        report.expired.push(client_id.clone());
                    }
                }
                _ => {}
            }
        }

        clients.retain(|client_id, entry| {
            let forget = entry.state == ConnectionState::Disconnected
                && now.duration_since(entry.since) >= self.config.reconnect_grace;
            if forget {
                report.removed.push(client_id.clone());
            }
            !forget
        });

        report
    }

    pub async fn connection_state(&self, client_id: &str) -> Option<ConnectionState> {
        self.clients.read().await.get(client_id).map(|e| e.state)
    }

    pub async fn last_acked(&self, client_id: &str) -> Option<u64> {
        self.clients.read().await.get(client_id).map(|e| e.last_acked)
    }

    pub async fn filter_of(&self, client_id: &str) -> Option<TopicFilter> {
        self.clients
            .read()
            .await
            .get(client_id)
            .map(|e| e.filter.clone())
    }

    /// Clients currently receiving records
    pub async fn client_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|e| e.state.is_connected())
            .count()
    }

    /// Stop delivery to every client
    pub async fn shutdown(&self) {
        let mut clients = self.clients.write().await;
        for entry in clients.values_mut() {
            if entry.state != ConnectionState::Disconnected {
                let _ = entry.transition(ConnectionEvent::Close, Some(DisconnectReason::Closed));
            }
        }
        clients.clear();
    }

    /// Called by a delivery task that has to give up on its client
    async fn drop_client(&self, client_id: &str, generation: u64, reason: DisconnectReason) {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.get_mut(client_id) else {
            return;
        };
        if entry.generation != generation || !entry.state.is_connected() {
            return;
        }

        let event = match reason {
            DisconnectReason::ConnectionLost => ConnectionEvent::ConnectionLost,
            DisconnectReason::BacklogExceeded | DisconnectReason::SequenceBroken => {
                ConnectionEvent::BacklogExceeded
            }
            _ => ConnectionEvent::Close,
        };
        // The task is ending on its own; do not abort it from inside
        entry.task = None;
        if let Err(e) = entry.transition(event, Some(reason)) {
            log::error!("Client {}: {}", client_id, e);
        }
    }
}

/// Per-client delivery loop
async fn deliver(
    hub: RealtimeHub,
    client_id: ClientId,
    generation: u64,
    mut live: broadcast::Receiver<Arc<MutationRecord>>,
    queue: mpsc::Sender<Arc<MutationRecord>>,
    filter: TopicFilter,
    mut last_seq: u64,
) {
    loop {
        let record = match live.recv().await {
            Ok(record) => record,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!(
                    "Client {} lagged the live stream by {} records; disconnecting",
                    client_id,
                    missed
                );
                hub.drop_client(&client_id, generation, DisconnectReason::BacklogExceeded)
                    .await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if record.seq <= last_seq {
            continue;
        }
        if record.seq != last_seq + 1 {
            log::error!(
                "Client {} expected seq {} but got {}; forcing resync",
                client_id,
                last_seq + 1,
                record.seq
            );
            hub.drop_client(&client_id, generation, DisconnectReason::SequenceBroken)
                .await;
            return;
        }
        last_seq = record.seq;

        if !filter.matches_record(&record) {
            continue;
        }

        match queue.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "Client {} exceeded its backlog of {}; disconnecting",
                    client_id,
                    hub.config.client_backlog
                );
                hub.drop_client(&client_id, generation, DisconnectReason::BacklogExceeded)
                    .await;
                return;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                hub.drop_client(&client_id, generation, DisconnectReason::ConnectionLost)
                    .await;
                return;
            }
        }
    }
}
