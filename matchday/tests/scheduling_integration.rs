//! Integration tests for scheduling across categories
//!
//! These tests drive the engine through its handle and check the resulting
//! schedule through the mutation log, the way the server does.

#[cfg(test)]
mod scheduling_tests {
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};
    use matchday::{
        BracketType, Category, ClashViolation, Competitor, DoubleElimination, Elimination, Entrant,
        InMemoryRegistry,
        LogConfig, MatchId, MatchState, MemoryLogStore, MutationLog, PlacementOutcome,
        RegistryData, RoundRobin, ScheduleEngine, ScheduleError, ScheduleHandle, SchedulerConfig,
        Venue,
        schedule::models::{CategoryId, CompetitorId, Outcome},
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const X: CompetitorId = 100;
    const Y: CompetitorId = 101;
    const Z: CompetitorId = 102;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 9, h, m, 0).unwrap()
    }

    /// Build a registry from (category, format, roster with optional seeds)
    fn registry(
        categories: Vec<(CategoryId, BracketType, Vec<(CompetitorId, Option<u32>)>)>,
    ) -> Arc<InMemoryRegistry> {
        let mut competitors: BTreeMap<CompetitorId, Competitor> = BTreeMap::new();
        let mut cats = Vec::new();
        for (id, bracket, roster) in categories {
            for (c, seed) in &roster {
                let entry = competitors.entry(*c).or_insert_with(|| Competitor {
                    id: *c,
                    name: format!("Athlete {c}"),
                    seed: *seed,
                    categories: Default::default(),
                });
                entry.categories.insert(id);
            }
            cats.push(Category {
                id,
                name: format!("Category {id}"),
                competitors: roster.into_iter().map(|(c, _)| c).collect(),
                bracket,
                draw_seed: None,
                match_duration: None,
                min_gap: None,
            });
        }
        Arc::new(
            InMemoryRegistry::new(RegistryData {
                competitors: competitors.into_values().collect(),
                categories: cats,
            })
            .expect("valid registry"),
        )
    }

    fn config(venues: u32) -> SchedulerConfig {
        SchedulerConfig {
            venues: (1..=venues)
                .map(|id| Venue::new(id, format!("Mat {id}")))
                .collect(),
            day_start: at(9, 0),
            match_duration: TimeDelta::minutes(20),
            min_gap: Some(TimeDelta::minutes(15)),
            slot_granularity: TimeDelta::minutes(5),
            lookahead: TimeDelta::hours(8),
            ..Default::default()
        }
    }

    async fn start(
        config: SchedulerConfig,
        registry: Arc<InMemoryRegistry>,
    ) -> (ScheduleHandle, Arc<MutationLog>, Arc<MemoryLogStore>) {
        let store = Arc::new(MemoryLogStore::new());
        let (log, writer) = MutationLog::open(store.clone(), LogConfig::default())
            .await
            .unwrap();
        let (handle, _task) = ScheduleEngine::start(config, registry, writer)
            .await
            .unwrap();
        (handle, log, store)
    }

    #[tokio::test]
    async fn test_five_seeded_elimination_gives_top_seed_the_bye() {
        let roster = (1..=5).map(|s| (s as CompetitorId, Some(s))).collect();
        let reg = registry(vec![(1, Elimination {}.into(), roster)]);
        let (handle, log, _store) = start(config(2), reg).await;

        let report = handle.commit_bracket(1).await.unwrap();
        assert_eq!(report.rounds, 3);
        assert_eq!(report.format, "elimination");

        let state = log.snapshot().await;
        let byes: Vec<_> = state
            .category_matches(1)
            .filter(|m| m.round() == 1 && m.outcome == Some(Outcome::Bye))
            .collect();
        assert_eq!(byes.len(), 1, "exactly one round-one bye");
        assert_eq!(byes[0].winner, Some(1), "bye goes to seed 1");

        // Seed 1 already sits in its round-two match
        let next = byes[0].next.expect("bye feeds round two");
        let downstream = state.get(&next.match_id).unwrap();
        assert_eq!(downstream.entrants[next.side], Entrant::Competitor(1));
    }

    #[tokio::test]
    async fn test_cross_category_clash_at_venue_two() {
        let reg = registry(vec![
            (1, RoundRobin {}.into(), vec![(X, None), (Y, None)]),
            (2, RoundRobin {}.into(), vec![(X, None), (Z, None)]),
        ]);
        let (handle, log, _store) = start(config(2), reg).await;
        handle.commit_bracket(1).await.unwrap();
        handle.commit_bracket(2).await.unwrap();

        let a = MatchId::new(1, 1, 0);
        let b = MatchId::new(2, 1, 0);
        handle.manual_place(a, 1, at(10, 0), None).await.unwrap();

        // 10:15 on venue 2 overlaps A by five minutes
        let head = log.head_seq().await;
        let err = handle.manual_place(b, 2, at(10, 15), None).await.unwrap_err();
        let ScheduleError::Clash(ClashViolation {
            conflicting_match,
            competitor,
            required_gap,
            actual_gap,
            overlapping,
        }) = err
        else {
            panic!("expected a clash");
        };
        assert_eq!(conflicting_match, a);
        assert_eq!(competitor, X);
        assert_eq!(required_gap, TimeDelta::minutes(15));
        assert_eq!(actual_gap, TimeDelta::minutes(5));
        assert!(overlapping);
        assert_eq!(log.head_seq().await, head, "rejected placement leaves no record");

        // Back to back is accepted only as an explicit gap override
        let placed = handle.manual_place(b, 2, at(10, 20), None).await.unwrap();
        let overridden = placed.overridden.expect("gap override recorded");
        assert_eq!(overridden.actual_gap, TimeDelta::zero());
        assert!(!overridden.overlapping);

        // A strict reschedule keeps the full gap
        assert!(matches!(
            handle.reschedule(b, 2, at(10, 25), None).await,
            Err(ScheduleError::Clash(_))
        ));
        let slot = handle.reschedule(b, 2, at(10, 35), None).await.unwrap();
        assert_eq!(slot.start, at(10, 35));
        assert_eq!(slot.end, at(10, 55));
    }

    #[tokio::test]
    async fn test_schedule_all_keeps_shared_competitor_apart() {
        let reg = registry(vec![
            (1, RoundRobin {}.into(), vec![(X, None), (Y, None)]),
            (2, RoundRobin {}.into(), vec![(X, None), (Z, None)]),
        ]);
        let (handle, _log, _store) = start(config(2), reg).await;
        handle.commit_bracket(1).await.unwrap();
        handle.commit_bracket(2).await.unwrap();

        let report = handle.schedule_all().await.unwrap();
        assert!(report.deferred.is_empty());
        assert_eq!(report.placed.len(), 2);

        let first = &report.placed[0];
        let second = &report.placed[1];
        assert_eq!(first.match_id, MatchId::new(1, 1, 0));
        assert_eq!(first.slot.start, at(9, 0));
        // 9:20 end plus 15 minutes, even though venue 2 is free earlier
        assert_eq!(second.slot.start, at(9, 35));
    }

    #[tokio::test]
    async fn test_horizon_exhaustion_defers_match() {
        let reg = registry(vec![
            (1, RoundRobin {}.into(), vec![(X, None), (Y, None)]),
            (2, RoundRobin {}.into(), vec![(X, None), (Z, None)]),
        ]);
        let config = SchedulerConfig {
            lookahead: TimeDelta::minutes(40),
            ..config(2)
        };
        let (handle, _log, _store) = start(config, reg).await;
        handle.commit_bracket(1).await.unwrap();
        handle.commit_bracket(2).await.unwrap();

        let report = handle.schedule_all().await.unwrap();
        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.deferred.len(), 1);

        let deferred = handle.deferred().await.unwrap();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].match_id, MatchId::new(2, 1, 0));

        // An operator can still place it by hand, which clears the deferral
        handle
            .manual_place(MatchId::new(2, 1, 0), 2, at(9, 40), None)
            .await
            .unwrap();
        assert!(handle.deferred().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_advance_and_place_final() {
        let roster = (1..=4).map(|c| (c, None)).collect();
        let reg = registry(vec![(1, Elimination {}.into(), roster)]);
        let (handle, log, _store) = start(config(2), reg).await;
        handle.commit_bracket(1).await.unwrap();
        handle.schedule_all().await.unwrap();

        let semis: Vec<_> = log
            .snapshot()
            .await
            .category_matches(1)
            .filter(|m| m.round() == 1)
            .cloned()
            .collect();
        assert_eq!(semis.len(), 2);
        assert!(semis.iter().all(|m| m.slot.unwrap().start == at(9, 0)));

        let w0 = semis[0].entrants[0].competitor().unwrap();
        let w1 = semis[1].entrants[1].competitor().unwrap();

        let first = handle.record_result(semis[0].id, w0).await.unwrap();
        assert!(first.advanced_to.is_some());
        assert!(first.placement.is_none(), "final still awaits the other semi");
        assert!(first.champion.is_none());

        let second = handle.record_result(semis[1].id, w1).await.unwrap();
        let final_id = second.advanced_to.unwrap();
        let Some(PlacementOutcome::Scheduled(slot)) = second.placement else {
            panic!("final should be placed automatically");
        };
        assert_eq!(slot.start, at(9, 35));

        handle.start_match(final_id).await.unwrap();
        let done = handle.record_result(final_id, w1).await.unwrap();
        assert_eq!(done.champion, Some(w1));
        assert_eq!(
            log.snapshot().await.get(&final_id).unwrap().state,
            MatchState::Completed
        );
    }

    /// Place whatever is eligible, then record the winner
    async fn decide(
        handle: &ScheduleHandle,
        id: MatchId,
        winner: CompetitorId,
    ) -> matchday::schedule::messages::ResultReport {
        handle.schedule_all().await.unwrap();
        handle.record_result(id, winner).await.unwrap()
    }

    #[tokio::test]
    async fn test_double_elimination_gives_a_second_chance() {
        let roster = (1..=4).map(|s| (s as CompetitorId, Some(s as u32))).collect();
        let reg = registry(vec![(1, DoubleElimination {}.into(), roster)]);
        let (handle, log, _store) = start(config(2), reg).await;

        let report = handle.commit_bracket(1).await.unwrap();
        assert_eq!(report.format, "double_elimination");
        assert_eq!(report.rounds, 5);
        assert_eq!(report.matches, 6);

        // 1v4 and 2v3; both losers drop into the same losers-bracket match
        let first = decide(&handle, MatchId::new(1, 1, 0), 1).await;
        assert_eq!(first.dropped_to, Some(MatchId::new(1, 3, 0)));
        decide(&handle, MatchId::new(1, 1, 1), 2).await;
        assert_eq!(
            log.snapshot().await.get(&MatchId::new(1, 3, 0)).unwrap().entrants,
            [Entrant::Competitor(4), Entrant::Competitor(3)]
        );

        // Winners final loser gets another match; losers-bracket loser is out
        let winners_final = decide(&handle, MatchId::new(1, 2, 0), 1).await;
        assert_eq!(winners_final.advanced_to, Some(MatchId::new(1, 5, 0)));
        assert_eq!(winners_final.dropped_to, Some(MatchId::new(1, 4, 0)));
        let eliminated = decide(&handle, MatchId::new(1, 3, 0), 3).await;
        assert_eq!(eliminated.dropped_to, None);

        let losers_final = decide(&handle, MatchId::new(1, 4, 0), 2).await;
        assert_eq!(losers_final.advanced_to, Some(MatchId::new(1, 5, 0)));
        assert!(losers_final.champion.is_none());

        let grand_final = log
            .snapshot()
            .await
            .get(&MatchId::new(1, 5, 0))
            .cloned()
            .unwrap();
        assert_eq!(
            grand_final.entrants,
            [Entrant::Competitor(1), Entrant::Competitor(2)]
        );

        let done = decide(&handle, grand_final.id, 2).await;
        assert_eq!(done.champion, Some(2));
    }

    #[tokio::test]
    async fn test_double_elimination_bye_passes_dropped_loser_through() {
        let roster = (1..=3).map(|s| (s as CompetitorId, Some(s as u32))).collect();
        let reg = registry(vec![(1, DoubleElimination {}.into(), roster)]);
        let (handle, log, _store) = start(config(2), reg).await;

        let report = handle.commit_bracket(1).await.unwrap();
        assert_eq!(report.byes, vec![MatchId::new(1, 1, 0)]);
        assert_eq!(
            log.snapshot().await.get(&MatchId::new(1, 3, 0)).unwrap().entrants,
            [Entrant::Bye, Entrant::Awaiting]
        );

        // The seed-1 bye dropped nobody, so the 2v3 loser walks through
        let result = decide(&handle, MatchId::new(1, 1, 1), 2).await;
        assert_eq!(result.dropped_to, Some(MatchId::new(1, 3, 0)));

        let state = log.snapshot().await;
        let passed = state.get(&MatchId::new(1, 3, 0)).unwrap();
        assert_eq!(passed.outcome, Some(Outcome::Bye));
        assert_eq!(passed.winner, Some(3));
        assert_eq!(
            state.get(&MatchId::new(1, 4, 0)).unwrap().entrants[0],
            Entrant::Competitor(3)
        );
    }

    #[tokio::test]
    async fn test_withdrawal_gives_walkover_and_advances() {
        let roster = (1..=4).map(|c| (c, None)).collect();
        let reg = registry(vec![(1, Elimination {}.into(), roster)]);
        let (handle, log, _store) = start(config(2), reg).await;
        handle.commit_bracket(1).await.unwrap();
        handle.schedule_all().await.unwrap();

        let semi = log
            .snapshot()
            .await
            .get(&MatchId::new(1, 1, 0))
            .cloned()
            .unwrap();
        let quitter = semi.entrants[0].competitor().unwrap();
        let opponent = semi.entrants[1].competitor().unwrap();

        let report = handle.withdraw(1, quitter).await.unwrap();
        assert_eq!(report.affected, vec![semi.id]);
        assert_eq!(report.advanced.len(), 1);

        let state = log.snapshot().await;
        let resolved = state.get(&semi.id).unwrap();
        assert_eq!(resolved.outcome, Some(Outcome::Walkover));
        assert_eq!(resolved.winner, Some(opponent));
        assert!(resolved.slot.is_none(), "walkover releases the venue");

        assert!(matches!(
            handle.withdraw(1, 999).await,
            Err(ScheduleError::UnknownCompetitor { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_expected_seq_is_a_conflict() {
        let reg = registry(vec![
            (1, RoundRobin {}.into(), vec![(X, None), (Y, None)]),
            (2, RoundRobin {}.into(), vec![(Z, None), (200, None)]),
        ]);
        let (handle, log, _store) = start(config(1), reg).await;
        handle.commit_bracket(1).await.unwrap();
        handle.commit_bracket(2).await.unwrap();

        // Both operators look at the same schedule
        let seen = log.head_seq().await;
        handle
            .manual_place(MatchId::new(1, 1, 0), 1, at(11, 0), Some(seen))
            .await
            .unwrap();

        let err = handle
            .manual_place(MatchId::new(2, 1, 0), 1, at(11, 0), Some(seen))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ScheduleError::ConcurrentWriteConflict { committed_seq, .. } if committed_seq > seen)
        );

        // With a fresh view the same request is a plain venue conflict
        let err = handle
            .manual_place(MatchId::new(2, 1, 0), 1, at(11, 0), Some(log.head_seq().await))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::VenueOccupied { venue: 1, .. }));
    }

    #[tokio::test]
    async fn test_restart_rebuilds_identical_schedule() {
        let reg = registry(vec![
            (1, Elimination {}.into(), (1..=6).map(|c| (c, None)).collect()),
            (2, RoundRobin {}.into(), vec![(1, None), (7, None), (8, None)]),
        ]);
        let (handle, log, store) = start(config(3), reg.clone()).await;
        handle.commit_bracket(1).await.unwrap();
        handle.commit_bracket(2).await.unwrap();
        handle.schedule_all().await.unwrap();
        let before = log.snapshot().await;

        drop(handle);
        let (reopened, writer) = MutationLog::open(store, LogConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.snapshot().await, before);
        assert_eq!(writer.head_seq(), before.seq());

        // The restarted engine refuses to rebuild what the log already holds
        let (handle, _task) = ScheduleEngine::start(config(3), reg, writer)
            .await
            .unwrap();
        assert!(matches!(
            handle.commit_bracket(1).await,
            Err(ScheduleError::BracketExists(1))
        ));
    }
}
