//! Schedule engine actor.
//!
//! The engine owns the [`LogWriter`], so every schedule mutation in the
//! process goes through its inbox one message at a time. Callers talk to it
//! through a cloneable [`ScheduleHandle`].

use super::errors::{ScheduleError, ScheduleResult};
use super::messages::{
    BracketReport, DeferReason, DeferredMatch, ManualPlacement, PlacedMatch, PlacementOutcome,
    ResultReport, ScheduleMessage, ScheduleReport, WithdrawReport,
};
use super::models::{
    CategoryId, CompetitorId, Entrant, Match, MatchId, MatchState, Outcome, Slot, VenueId,
};
use super::state::ScheduleState;
use crate::bracket::{self, BracketFormat};
use crate::clash::{ClashCheck, GapPolicy, check_placement};
use crate::config::SchedulerConfig;
use crate::mutation::{ChangeCause, LogWriter, MutationRecord};
use crate::registry::Registry;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Handle for sending commands to the schedule engine
#[derive(Clone)]
pub struct ScheduleHandle {
    sender: mpsc::Sender<ScheduleMessage>,
}

impl ScheduleHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<ScheduleResult<T>>) -> ScheduleMessage,
    ) -> ScheduleResult<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| ScheduleError::EngineClosed)?;
        rx.await.map_err(|_| ScheduleError::EngineClosed)?
    }

    /// Whether the engine has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn commit_bracket(&self, category: CategoryId) -> ScheduleResult<BracketReport> {
        self.request(|response| ScheduleMessage::CommitBracket { category, response })
            .await
    }

    pub async fn place_match(
        &self,
        match_id: MatchId,
        venue: Option<VenueId>,
    ) -> ScheduleResult<PlacementOutcome> {
        self.request(|response| ScheduleMessage::PlaceMatch {
            match_id,
            venue,
            response,
        })
        .await
    }

    pub async fn schedule_all(&self) -> ScheduleResult<ScheduleReport> {
        self.request(|response| ScheduleMessage::ScheduleAll { response })
            .await
    }

    pub async fn reschedule(
        &self,
        match_id: MatchId,
        venue: VenueId,
        start: DateTime<Utc>,
        expected_seq: Option<u64>,
    ) -> ScheduleResult<Slot> {
        self.request(|response| ScheduleMessage::Reschedule {
            match_id,
            venue,
            start,
            expected_seq,
            response,
        })
        .await
    }

    pub async fn manual_place(
        &self,
        match_id: MatchId,
        venue: VenueId,
        start: DateTime<Utc>,
        expected_seq: Option<u64>,
    ) -> ScheduleResult<ManualPlacement> {
        self.request(|response| ScheduleMessage::ManualPlace {
            match_id,
            venue,
            start,
            expected_seq,
            response,
        })
        .await
    }

    pub async fn start_match(&self, match_id: MatchId) -> ScheduleResult<Match> {
        self.request(|response| ScheduleMessage::StartMatch { match_id, response })
            .await
    }

    pub async fn record_result(
        &self,
        match_id: MatchId,
        winner: CompetitorId,
    ) -> ScheduleResult<ResultReport> {
        self.request(|response| ScheduleMessage::RecordResult {
            match_id,
            winner,
            response,
        })
        .await
    }

    pub async fn cancel_match(&self, match_id: MatchId) -> ScheduleResult<Match> {
        self.request(|response| ScheduleMessage::CancelMatch { match_id, response })
            .await
    }

    pub async fn withdraw(
        &self,
        category: CategoryId,
        competitor: CompetitorId,
    ) -> ScheduleResult<WithdrawReport> {
        self.request(|response| ScheduleMessage::Withdraw {
            category,
            competitor,
            response,
        })
        .await
    }

    pub async fn deferred(&self) -> ScheduleResult<Vec<DeferredMatch>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ScheduleMessage::ListDeferred { response: tx })
            .await
            .map_err(|_| ScheduleError::EngineClosed)?;
        rx.await.map_err(|_| ScheduleError::EngineClosed)
    }
}

/// Side effects of a decided match rippling through its bracket
#[derive(Debug, Default)]
struct Cascade {
    advanced: Vec<MatchId>,
    resolved: Vec<MatchId>,
    placements: Vec<(MatchId, PlacementOutcome)>,
    champions: Vec<(CategoryId, CompetitorId)>,
}

impl Cascade {
    fn placement_of(&self, id: MatchId) -> Option<PlacementOutcome> {
        self.placements
            .iter()
            .find(|(placed, _)| *placed == id)
            .map(|(_, outcome)| outcome.clone())
    }
}

/// Decide a match that has a bye on at least one side
fn resolve_without_play(m: &Match, outcome: Outcome) -> Option<Match> {
    if !m.state.can_resolve_without_play() {
        return None;
    }
    let winner = match m.entrants {
        [Entrant::Competitor(c), Entrant::Bye] | [Entrant::Bye, Entrant::Competitor(c)] => Some(c),
        [Entrant::Bye, Entrant::Bye] => None,
        _ => return None,
    };

    let mut resolved = m.clone();
    // Only a match actually under way keeps its slot
    if resolved.state != MatchState::InProgress {
        resolved.slot = None;
    }
    resolved.state = MatchState::Completed;
    resolved.winner = winner;
    resolved.outcome = Some(outcome);
    Some(resolved)
}

/// Log a request whose caller stopped waiting
fn abandoned<T>(response: &oneshot::Sender<T>) -> bool {
    if response.is_closed() {
        log::debug!("Caller went away before commit; request dropped");
        true
    } else {
        false
    }
}

/// Schedule engine actor: the single writer of the mutation log
pub struct ScheduleEngine {
    config: SchedulerConfig,

    registry: Arc<dyn Registry>,

    writer: LogWriter,

    /// Working copy of the folded log, ahead of it by the staged changes
    state: ScheduleState,

    /// Message inbox
    inbox: mpsc::Receiver<ScheduleMessage>,

    policy: GapPolicy,

    /// Per-category match duration overrides
    durations: BTreeMap<CategoryId, TimeDelta>,

    /// Matches whose last placement attempt found no slot
    deferred: BTreeMap<MatchId, DeferReason>,

    /// Changes of the running command not yet in the log
    staged: Vec<MutationRecord>,
}

impl ScheduleEngine {
    /// Create an engine over an opened log
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler configuration
    /// * `registry` - Read-only competitor and category data
    /// * `writer` - The log's single writer
    ///
    /// # Returns
    ///
    /// * `(ScheduleEngine, ScheduleHandle)` - Actor and handle for sending messages
    pub async fn new(
        config: SchedulerConfig,
        registry: Arc<dyn Registry>,
        writer: LogWriter,
    ) -> ScheduleResult<(Self, ScheduleHandle)> {
        config.validate().map_err(ScheduleError::InvalidConfig)?;

        let mut policy = GapPolicy::uniform(config.effective_min_gap());
        let mut durations = BTreeMap::new();
        for category in registry.categories() {
            // Without an explicit gap anywhere, a category's gap follows its own match length
            let implied = if config.min_gap.is_none() {
                category.match_duration
            } else {
                None
            };
            if let Some(gap) = category.min_gap.or(implied) {
                policy = policy.with_category(category.id, gap);
            }
            if let Some(duration) = category.match_duration {
                durations.insert(category.id, duration);
            }
        }

        let state = writer.log().snapshot().await;
        let (sender, inbox) = mpsc::channel(config.inbox_capacity);

        let engine = Self {
            config,
            registry,
            writer,
            state,
            inbox,
            policy,
            durations,
            deferred: BTreeMap::new(),
            staged: Vec::new(),
        };

        Ok((engine, ScheduleHandle { sender }))
    }

    /// Create the engine and run it on the current runtime
    pub async fn start(
        config: SchedulerConfig,
        registry: Arc<dyn Registry>,
        writer: LogWriter,
    ) -> ScheduleResult<(ScheduleHandle, JoinHandle<()>)> {
        let (engine, handle) = Self::new(config, registry, writer).await?;
        Ok((handle, tokio::spawn(engine.run())))
    }

    /// Run the engine event loop until every handle is dropped
    pub async fn run(mut self) {
        log::info!(
            "Schedule engine starting at seq {} with {} venues",
            self.state.seq(),
            self.config.venues.len()
        );

        while let Some(message) = self.inbox.recv().await {
            self.handle_message(message).await;
        }

        log::info!("Schedule engine stopped at seq {}", self.state.seq());
    }

    /// Handle one message.
    ///
    /// Nothing reaches the log before a command finishes, so checking the
    /// caller here is enough to guarantee an abandoned request leaves no
    /// record.
    async fn handle_message(&mut self, message: ScheduleMessage) {
        match message {
            ScheduleMessage::CommitBracket { category, response } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.commit_bracket(category).await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::PlaceMatch {
                match_id,
                venue,
                response,
            } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.place_match(match_id, venue).await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::ScheduleAll { response } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.schedule_all().await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::Reschedule {
                match_id,
                venue,
                start,
                expected_seq,
                response,
            } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.reschedule(match_id, venue, start, expected_seq).await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::ManualPlace {
                match_id,
                venue,
                start,
                expected_seq,
                response,
            } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.manual_place(match_id, venue, start, expected_seq).await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::StartMatch { match_id, response } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.start_match(match_id).await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::RecordResult {
                match_id,
                winner,
                response,
            } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.record_result(match_id, winner).await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::CancelMatch { match_id, response } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.cancel_match(match_id).await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::Withdraw {
                category,
                competitor,
                response,
            } => {
                if abandoned(&response) {
                    return;
                }
                let checkpoint = self.deferred.clone();
                let result = self.withdraw(category, competitor).await;
                let _ = response.send(self.settle(checkpoint, result).await);
            }

            ScheduleMessage::ListDeferred { response } => {
                let deferred = self
                    .deferred
                    .iter()
                    .map(|(match_id, reason)| DeferredMatch {
                        match_id: *match_id,
                        reason: reason.clone(),
                    })
                    .collect();
                let _ = response.send(deferred);
            }
        }
    }

    /// Fold a change into the working state and stage it for the log.
    ///
    /// Staged changes reach the log together when the command finishes.
    fn commit(&mut self, new: Match, cause: ChangeCause) -> ScheduleResult<MutationRecord> {
        let record = MutationRecord {
            seq: self.state.seq() + 1,
            timestamp: Utc::now(),
            match_id: new.id,
            old: self.state.get(&new.id).cloned(),
            new,
            cause,
        };
        self.state.apply(&record)?;
        if record.new.state != MatchState::Pending {
            self.deferred.remove(&record.match_id);
        }
        self.staged.push(record.clone());
        Ok(record)
    }

    /// Append a finished command's changes as one batch.
    ///
    /// A failed command, or a batch the log refuses, leaves no trace: the
    /// working state is rebuilt from the log and the deferred list restored.
    async fn settle<T>(
        &mut self,
        deferred: BTreeMap<MatchId, DeferReason>,
        result: ScheduleResult<T>,
    ) -> ScheduleResult<T> {
        let staged = std::mem::take(&mut self.staged);
        let result = match result {
            Ok(value) if staged.is_empty() => return Ok(value),
            Ok(value) => match self.writer.append_all(staged).await {
                Ok(_) => return Ok(value),
                Err(e) => {
                    log::error!("Failed to append schedule changes: {}", e);
                    Err(e.into())
                }
            },
            Err(e) => Err(e),
        };

        if self.state.seq() != self.writer.head_seq() {
            self.state = self.writer.log().snapshot().await;
            log::warn!("Command rolled back to seq {}", self.state.seq());
        }
        self.deferred = deferred;
        result
    }

    fn get(&self, id: MatchId) -> ScheduleResult<Match> {
        self.state
            .get(&id)
            .cloned()
            .ok_or(ScheduleError::UnknownMatch(id))
    }

    fn check_venue(&self, venue: VenueId) -> ScheduleResult<()> {
        if self.config.venues.iter().any(|v| v.id == venue) {
            Ok(())
        } else {
            Err(ScheduleError::UnknownVenue(venue))
        }
    }

    fn duration_for(&self, category: CategoryId) -> TimeDelta {
        self.durations
            .get(&category)
            .copied()
            .unwrap_or(self.config.match_duration)
    }

    fn is_elimination(&self, category: CategoryId) -> bool {
        self.registry
            .category(category)
            .map(|c| c.bracket.is_elimination())
            .unwrap_or(false)
    }

    /// Venue ids in search order, preferred venue first
    fn venue_order(&self, preferred: Option<VenueId>) -> Vec<VenueId> {
        let mut order: Vec<VenueId> = self.config.venues.iter().map(|v| v.id).collect();
        if let Some(preferred) = preferred {
            if let Some(idx) = order.iter().position(|v| *v == preferred) {
                let venue = order.remove(idx);
                order.insert(0, venue);
            }
        }
        order
    }

    /// First candidate start time for automatic placement: `day_start`, or
    /// with `place_from_now` the first grid time not in the past
    fn search_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let day_start = self.config.day_start;
        if !self.config.place_from_now || now <= day_start {
            return Some(day_start);
        }
        let step = self.config.slot_granularity.num_milliseconds().max(1);
        let elapsed = (now - day_start).num_milliseconds();
        let steps = elapsed.checked_add(step - 1)? / step;
        let offset = TimeDelta::try_milliseconds(steps.checked_mul(step)?)?;
        day_start.checked_add_signed(offset)
    }

    /// Earliest clash-free slot on a free venue.
    ///
    /// Candidate start times step through the window on the configured grid;
    /// at each time the competitors' gaps are checked once, then venues are
    /// tried in preference order. The window ends `lookahead` after the first
    /// candidate.
    fn find_slot(&self, m: &Match, preferred: Option<VenueId>) -> Result<Slot, DeferReason> {
        let duration = self.duration_for(m.category());
        let venues = self.venue_order(preferred);
        let mut last_violation = None;

        let first = self.search_start(Utc::now());
        let horizon_end = first
            .and_then(|start| start.checked_add_signed(self.config.lookahead))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let Some(&first_venue) = venues.first() else {
            return Err(DeferReason::NoSlotWithinHorizon {
                horizon_end,
                last_violation,
            });
        };

        let mut candidate = first;
        while let Some(start) = candidate {
            let Some(trial) =
                Slot::try_new(first_venue, start, duration).filter(|s| s.end <= horizon_end)
            else {
                break;
            };
            match check_placement(m, &trial, &self.state, &self.policy) {
                ClashCheck::Violation(violation) => last_violation = Some(violation),
                ClashCheck::Ok => {
                    for venue in &venues {
                        let slot = Slot {
                            venue: *venue,
                            ..trial
                        };
                        if self.state.venue_occupant(*venue, &slot, &m.id).is_none() {
                            return Ok(slot);
                        }
                    }
                }
            }
            candidate = start.checked_add_signed(self.config.slot_granularity);
        }

        Err(DeferReason::NoSlotWithinHorizon {
            horizon_end,
            last_violation,
        })
    }

    /// Reject a write based on a view older than the latest change to `id`
    fn check_expected(&self, id: MatchId, expected_seq: Option<u64>) -> ScheduleResult<()> {
        let Some(expected_seq) = expected_seq else {
            return Ok(());
        };
        match self.state.last_modified(&id) {
            Some(committed_seq) if committed_seq > expected_seq => {
                Err(ScheduleError::ConcurrentWriteConflict {
                    match_id: id,
                    committed_seq,
                    expected_seq,
                })
            }
            _ => Ok(()),
        }
    }

    /// Physical venue overlap is never allowed. If the occupant arrived after
    /// the caller's view, report a conflict so the caller refreshes.
    fn check_venue_free(
        &self,
        m: &Match,
        slot: &Slot,
        expected_seq: Option<u64>,
    ) -> ScheduleResult<()> {
        let Some(occupant) = self.state.venue_occupant(slot.venue, slot, &m.id) else {
            return Ok(());
        };
        self.check_expected(occupant.id, expected_seq)?;
        Err(ScheduleError::VenueOccupied {
            venue: slot.venue,
            occupant: occupant.id,
        })
    }

    async fn commit_bracket(&mut self, category_id: CategoryId) -> ScheduleResult<BracketReport> {
        let category = self.registry.category(category_id)?;
        if self.state.category_matches(category_id).next().is_some() {
            return Err(ScheduleError::BracketExists(category_id));
        }

        let bracket = bracket::build(&category, self.registry.as_ref())?;
        for m in bracket.matches() {
            self.commit(m.clone(), ChangeCause::BracketBuilt)?;
        }

        let mut byes = Vec::new();
        for m in bracket.rounds.first().into_iter().flatten() {
            if let Some(resolved) = resolve_without_play(m, Outcome::Bye) {
                self.commit(resolved, ChangeCause::Resolved)?;
                byes.push(m.id);
            }
        }
        let cascade = self.cascade(byes.clone(), false).await?;
        byes.extend(cascade.resolved);

        Ok(BracketReport {
            category: category_id,
            format: bracket.format.name().to_string(),
            rounds: bracket.round_count(),
            matches: bracket.match_count(),
            byes,
            seq: self.state.seq(),
        })
    }

    async fn place_match(
        &mut self,
        match_id: MatchId,
        venue: Option<VenueId>,
    ) -> ScheduleResult<PlacementOutcome> {
        if let Some(venue) = venue {
            self.check_venue(venue)?;
        }
        let m = self.get(match_id)?;
        if m.state != MatchState::Pending {
            return Err(ScheduleError::InvalidTransition {
                match_id,
                from: m.state,
                to: MatchState::Scheduled,
            });
        }
        if !m.has_both_competitors() {
            return Ok(PlacementOutcome::Deferred(
                DeferReason::AwaitingPrerequisites,
            ));
        }

        match self.find_slot(&m, venue) {
            Ok(slot) => {
                let mut placed = m;
                placed.slot = Some(slot);
                placed.state = MatchState::Scheduled;
                self.commit(placed, ChangeCause::Placed)?;
                log::info!(
                    "Placed match {} on venue {} at {}",
                    match_id,
                    slot.venue,
                    slot.start
                );
                Ok(PlacementOutcome::Scheduled(slot))
            }
            Err(reason) => {
                log::warn!("Deferred match {}: {}", match_id, reason);
                self.deferred.insert(match_id, reason.clone());
                Ok(PlacementOutcome::Deferred(reason))
            }
        }
    }

    async fn schedule_all(&mut self) -> ScheduleResult<ScheduleReport> {
        let mut eligible: Vec<MatchId> = self
            .state
            .matches()
            .filter(|m| m.is_eligible())
            .map(|m| m.id)
            .collect();
        eligible.sort_by_key(|id| (id.round, id.category, id.position));

        let mut report = ScheduleReport::default();
        for match_id in eligible {
            match self.place_match(match_id, None).await? {
                PlacementOutcome::Scheduled(slot) => {
                    report.placed.push(PlacedMatch { match_id, slot });
                }
                PlacementOutcome::Deferred(reason) => {
                    report.deferred.push(DeferredMatch { match_id, reason });
                }
            }
        }
        report.seq = self.state.seq();

        log::info!(
            "Scheduling pass: {} placed, {} deferred",
            report.placed.len(),
            report.deferred.len()
        );
        Ok(report)
    }

    async fn reschedule(
        &mut self,
        match_id: MatchId,
        venue: VenueId,
        start: DateTime<Utc>,
        expected_seq: Option<u64>,
    ) -> ScheduleResult<Slot> {
        self.check_venue(venue)?;
        let m = self.get(match_id)?;
        if m.state != MatchState::Scheduled {
            return Err(ScheduleError::InvalidTransition {
                match_id,
                from: m.state,
                to: MatchState::Scheduled,
            });
        }
        self.check_expected(match_id, expected_seq)?;

        let slot = Slot::try_new(venue, start, self.duration_for(m.category()))
            .ok_or(ScheduleError::StartOutOfRange(start))?;
        self.check_venue_free(&m, &slot, expected_seq)?;
        check_placement(&m, &slot, &self.state, &self.policy)
            .into_result()
            .map_err(ScheduleError::Clash)?;

        let mut moved = m;
        moved.slot = Some(slot);
        self.commit(moved, ChangeCause::Rescheduled)?;
        log::info!(
            "Rescheduled match {} to venue {} at {}",
            match_id,
            slot.venue,
            slot.start
        );
        Ok(slot)
    }

    async fn manual_place(
        &mut self,
        match_id: MatchId,
        venue: VenueId,
        start: DateTime<Utc>,
        expected_seq: Option<u64>,
    ) -> ScheduleResult<ManualPlacement> {
        self.check_venue(venue)?;
        let m = self.get(match_id)?;
        match m.state {
            MatchState::Pending if !m.has_both_competitors() => {
                return Err(ScheduleError::AwaitingEntrants(match_id));
            }
            MatchState::Pending | MatchState::Scheduled => {}
            from => {
                return Err(ScheduleError::InvalidTransition {
                    match_id,
                    from,
                    to: MatchState::Scheduled,
                });
            }
        }
        self.check_expected(match_id, expected_seq)?;

        let slot = Slot::try_new(venue, start, self.duration_for(m.category()))
            .ok_or(ScheduleError::StartOutOfRange(start))?;
        self.check_venue_free(&m, &slot, expected_seq)?;

        let overridden = match check_placement(&m, &slot, &self.state, &self.policy) {
            ClashCheck::Ok => None,
            ClashCheck::Violation(violation)
                if violation.is_soft() && self.config.allow_soft_gap_override =>
            {
                log::warn!(
                    "Manual placement of match {} overrides minimum gap: {}",
                    match_id,
                    violation
                );
                Some(violation)
            }
            ClashCheck::Violation(violation) => return Err(ScheduleError::Clash(violation)),
        };

        let mut placed = m;
        placed.slot = Some(slot);
        placed.state = MatchState::Scheduled;
        let record = self.commit(placed, ChangeCause::ManualPlaced)?;

        Ok(ManualPlacement {
            match_id,
            slot,
            overridden,
            seq: record.seq,
        })
    }

    async fn start_match(&mut self, match_id: MatchId) -> ScheduleResult<Match> {
        let m = self.get(match_id)?;
        if !m.state.can_transition_to(MatchState::InProgress) {
            return Err(ScheduleError::InvalidTransition {
                match_id,
                from: m.state,
                to: MatchState::InProgress,
            });
        }
        let mut started = m;
        started.state = MatchState::InProgress;
        let record = self.commit(started, ChangeCause::Started)?;
        Ok(record.new)
    }

    async fn record_result(
        &mut self,
        match_id: MatchId,
        winner: CompetitorId,
    ) -> ScheduleResult<ResultReport> {
        let m = self.get(match_id)?;
        if !matches!(m.state, MatchState::Scheduled | MatchState::InProgress) {
            return Err(ScheduleError::InvalidResult {
                match_id,
                reason: format!("match is {}", m.state),
            });
        }
        if !m.involves(winner) {
            return Err(ScheduleError::InvalidResult {
                match_id,
                reason: format!("competitor {winner} does not play in this match"),
            });
        }

        let mut done = m;
        done.state = MatchState::Completed;
        done.winner = Some(winner);
        done.outcome = Some(Outcome::Played);
        let dropped_to = done.loser_next.map(|adv| adv.match_id);
        self.commit(done, ChangeCause::ResultRecorded)?;
        log::info!("Result recorded for match {}: winner {}", match_id, winner);

        let cascade = self
            .cascade(vec![match_id], self.config.auto_place_on_advance)
            .await?;
        let advanced_to = cascade.advanced.first().copied();

        Ok(ResultReport {
            match_id,
            winner,
            advanced_to,
            placement: advanced_to.and_then(|id| cascade.placement_of(id)),
            dropped_to,
            champion: cascade.champions.first().map(|(_, champion)| *champion),
            seq: self.state.seq(),
        })
    }

    async fn cancel_match(&mut self, match_id: MatchId) -> ScheduleResult<Match> {
        let m = self.get(match_id)?;
        if !m.state.can_transition_to(MatchState::Cancelled) {
            return Err(ScheduleError::InvalidTransition {
                match_id,
                from: m.state,
                to: MatchState::Cancelled,
            });
        }
        let mut cancelled = m;
        cancelled.state = MatchState::Cancelled;
        let record = self.commit(cancelled, ChangeCause::Cancelled)?;
        log::info!("Cancelled match {}", match_id);

        // Nobody advances from a cancelled elimination match
        if self.is_elimination(match_id.category) {
            self.cascade(vec![match_id], self.config.auto_place_on_advance)
                .await?;
        }
        Ok(record.new)
    }

    async fn withdraw(
        &mut self,
        category_id: CategoryId,
        competitor: CompetitorId,
    ) -> ScheduleResult<WithdrawReport> {
        let category = self.registry.category(category_id)?;
        if !category.competitors.contains(&competitor) {
            return Err(ScheduleError::UnknownCompetitor {
                category: category_id,
                competitor,
            });
        }

        let open: Vec<Match> = self
            .state
            .category_matches(category_id)
            .filter(|m| m.involves(competitor) && !m.state.is_terminal())
            .cloned()
            .collect();

        let mut affected = Vec::with_capacity(open.len());
        let mut decided = Vec::new();

        for m in open {
            let Some(side) = m
                .entrants
                .iter()
                .position(|e| *e == Entrant::Competitor(competitor))
            else {
                continue;
            };
            let opponent = m.entrants[1 - side];

            if category.bracket.is_elimination() {
                let mut emptied = m.clone();
                emptied.entrants[side] = Entrant::Bye;
                let outcome = if opponent.competitor().is_some() {
                    Outcome::Walkover
                } else {
                    Outcome::Bye
                };
                match resolve_without_play(&emptied, outcome) {
                    Some(resolved) => {
                        self.commit(resolved, ChangeCause::Withdrawn)?;
                        decided.push(m.id);
                    }
                    // Opponent not known yet; it will advance by bye later
                    None => {
                        self.commit(emptied, ChangeCause::Withdrawn)?;
                    }
                }
            } else if m.state == MatchState::InProgress {
                let mut walkover = m.clone();
                walkover.state = MatchState::Completed;
                walkover.winner = opponent.competitor();
                walkover.outcome = Some(Outcome::Walkover);
                self.commit(walkover, ChangeCause::Withdrawn)?;
            } else {
                let mut cancelled = m.clone();
                cancelled.state = MatchState::Cancelled;
                self.commit(cancelled, ChangeCause::Withdrawn)?;
            }
            affected.push(m.id);
        }

        let cascade = self
            .cascade(decided, self.config.auto_place_on_advance)
            .await?;

        log::info!(
            "Competitor {} withdrew from category {}: {} match(es) affected",
            competitor,
            category_id,
            affected.len()
        );

        Ok(WithdrawReport {
            category: category_id,
            competitor,
            affected,
            advanced: cascade.advanced,
            seq: self.state.seq(),
        })
    }

    /// Move the winners of decided matches into their downstream matches,
    /// and losers into the losers bracket where there is one.
    ///
    /// A match decided without a winner sends a bye forward. Downstream
    /// matches left with a bye are resolved in turn; ones that become
    /// playable are placed when `auto_place` is set.
    async fn cascade(&mut self, decided: Vec<MatchId>, auto_place: bool) -> ScheduleResult<Cascade> {
        let mut out = Cascade::default();
        let mut queue: VecDeque<MatchId> = decided.into();

        while let Some(id) = queue.pop_front() {
            let done = self.get(id)?;
            if !done.state.is_terminal() {
                continue;
            }

            if done.next.is_none() {
                if let Some(champion) = done.winner {
                    if self.is_elimination(done.category()) {
                        log::info!(
                            "Category {} decided: champion {}",
                            done.category(),
                            champion
                        );
                        out.champions.push((done.category(), champion));
                    }
                }
            }

            // Winner's route first; results report it as `advanced_to`
            let routes = [
                done.next
                    .map(|adv| (adv, done.winner.map_or(Entrant::Bye, Entrant::Competitor))),
                done.loser_next.map(|adv| (adv, done.loser())),
            ];

            for (advance, entrant) in routes.into_iter().flatten() {
                let mut downstream = self.get(advance.match_id)?;
                if downstream.state.is_terminal() {
                    continue;
                }
                downstream.entrants[advance.side] = entrant;
                self.commit(downstream.clone(), ChangeCause::Advanced)?;
                out.advanced.push(downstream.id);

                if let Some(resolved) = resolve_without_play(&downstream, Outcome::Bye) {
                    self.commit(resolved, ChangeCause::Resolved)?;
                    out.resolved.push(downstream.id);
                    queue.push_back(downstream.id);
                } else if auto_place && downstream.is_eligible() {
                    let outcome = self.place_match(downstream.id, None).await?;
                    out.placements.push((downstream.id, outcome));
                }
            }
        }

        Ok(out)
    }
}
