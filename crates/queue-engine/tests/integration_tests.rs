//! Integration tests for the queue engine
//!
//! These tests exercise the dispatch engine end to end: check-in through
//! completion, claim races across counters, queue-level operations, alert
//! derivation, and the operating-hours scheduler.

use std::collections::HashSet;
use std::sync::Arc;

use branchq_queue_engine::prelude::*;
use chrono::{Duration, NaiveTime, TimeZone, Timelike};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_test::serial;
use tokio::time::timeout;

const BRANCH: &str = "b1";
const DEPOSITS: &str = "deposits";
const LOANS: &str = "loans";

fn service(id: &str, prefix: &str, avg_mins: u32) -> ServiceCategory {
    ServiceCategory {
        id: ServiceId::from(id),
        branch_id: BranchId::from(BRANCH),
        name: format!("{} desk", prefix),
        prefix: prefix.to_string(),
        priority_weight: 1,
        avg_service_time_mins: avg_mins,
        use_dynamic_service_time: false,
        is_active: true,
    }
}

fn create_test_engine() -> Arc<DispatchEngine> {
    let engine = DispatchEngine::new(
        QueueEngineConfig::default(),
        Arc::new(MemoryTicketStore::new()),
        Arc::new(NullSink),
    )
    .expect("engine creation failed");

    engine
        .branches()
        .upsert_branch(Branch::new(BranchId::from(BRANCH), "Main Branch"));
    engine.branches().upsert_service(service(DEPOSITS, "D", 10));
    engine.branches().upsert_service(service(LOANS, "L", 15));

    engine
}

/// Register counter `number` (serving every service) and open it
async fn open_counter(engine: &Arc<DispatchEngine>, number: u32) -> CounterId {
    let id = CounterId::from(format!("c{}", number).as_str());
    let mut counter = Counter::new(id.clone(), BranchId::from(BRANCH), number);
    counter.assigned_user_id = Some(format!("teller-{}", number));
    engine.counters().upsert(counter);
    engine.open_counter(&id).await.expect("counter open failed");
    id
}

async fn checkin(engine: &Arc<DispatchEngine>, service_id: &str) -> CheckinReceipt {
    engine
        .checkin(CheckinRequest::kiosk(
            BranchId::from(BRANCH),
            ServiceId::from(service_id),
        ))
        .await
        .expect("checkin failed")
}

async fn checkin_vip(engine: &Arc<DispatchEngine>, service_id: &str) -> CheckinReceipt {
    engine
        .checkin(CheckinRequest {
            priority: TicketPriority::Vip,
            ..CheckinRequest::kiosk(BranchId::from(BRANCH), ServiceId::from(service_id))
        })
        .await
        .expect("vip checkin failed")
}

#[tokio::test]
async fn vip_ranks_first_and_positions_follow_arrival() {
    let engine = create_test_engine();

    // A(vip), then B and C normal
    let a = checkin_vip(&engine, DEPOSITS).await;
    let b = checkin(&engine, DEPOSITS).await;
    let c = checkin(&engine, DEPOSITS).await;

    let snapshot = engine
        .branch_snapshot(&BranchId::from(BRANCH))
        .await
        .unwrap();
    let order: Vec<&str> = snapshot
        .waiting
        .iter()
        .map(|w| w.ticket_number.as_str())
        .collect();
    assert_eq!(
        order,
        vec![
            a.ticket.ticket_number.as_str(),
            b.ticket.ticket_number.as_str(),
            c.ticket.ticket_number.as_str()
        ]
    );

    for (receipt, expected) in [(&a, 1), (&b, 2), (&c, 3)] {
        let info = engine.ticket_position(&receipt.ticket.id).await.unwrap();
        assert_eq!(info.position, Some(expected));
    }
}

#[tokio::test]
async fn estimate_divides_queue_across_open_counters() {
    let engine = create_test_engine();
    open_counter(&engine, 1).await;
    open_counter(&engine, 2).await;

    // 5 tickets, 2 counters, 10 min average: position 5 waits ceil(5/2)*10
    let mut last = None;
    for _ in 0..5 {
        last = Some(checkin(&engine, DEPOSITS).await);
    }
    let last = last.unwrap();
    assert_eq!(last.position, 5);
    assert_eq!(last.estimated_wait_mins, 30);
}

#[tokio::test]
async fn call_next_claims_in_ranking_order() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    let normal = checkin(&engine, DEPOSITS).await;
    let vip = checkin_vip(&engine, DEPOSITS).await;

    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();
    assert_eq!(claimed.ticket.id, vip.ticket.id);
    assert_eq!(claimed.ticket.status, TicketStatus::Serving);
    assert_eq!(claimed.ticket.counter_id, Some(counter.clone()));
    assert!(claimed.ticket.called_at.is_some());
    assert!(claimed.ticket.serving_started_at.is_some());

    // The normal ticket moved up to position 1
    let info = engine.ticket_position(&normal.ticket.id).await.unwrap();
    assert_eq!(info.position, Some(1));
}

#[tokio::test]
async fn busy_counter_cannot_call_next() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    checkin(&engine, DEPOSITS).await;
    let waiting = checkin(&engine, DEPOSITS).await;
    engine.call_next(&counter, "teller-1").await.unwrap();

    let err = engine.call_next(&counter, "teller-1").await.unwrap_err();
    assert!(matches!(err, QueueEngineError::InvalidTransition(_)));

    // State unchanged: the second ticket is still waiting
    let info = engine.ticket_position(&waiting.ticket.id).await.unwrap();
    assert_eq!(info.status, TicketStatus::Waiting);
    assert_eq!(info.position, Some(1));
}

#[tokio::test]
async fn empty_queue_reports_no_eligible_ticket() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    let err = engine.call_next(&counter, "teller-1").await.unwrap_err();
    assert!(matches!(err, QueueEngineError::NoEligibleTicket(_)));
}

#[tokio::test]
async fn call_next_by_service_skips_other_queues() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    checkin(&engine, DEPOSITS).await;
    let loan = checkin(&engine, LOANS).await;

    let claimed = engine
        .call_next_by_service(&counter, &ServiceId::from(LOANS), "teller-1")
        .await
        .unwrap();
    assert_eq!(claimed.ticket.id, loan.ticket.id);
}

#[tokio::test]
async fn counters_only_claim_their_assigned_services() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;
    engine
        .counters()
        .assign_services(&counter, HashSet::from([ServiceId::from(LOANS)]))
        .unwrap();

    checkin(&engine, DEPOSITS).await;
    let err = engine.call_next(&counter, "teller-1").await.unwrap_err();
    assert!(matches!(err, QueueEngineError::NoEligibleTicket(_)));

    let loan = checkin(&engine, LOANS).await;
    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();
    assert_eq!(claimed.ticket.id, loan.ticket.id);
}

#[tokio::test]
async fn complete_is_not_idempotent_by_design() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    checkin(&engine, DEPOSITS).await;
    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();

    let completed = engine
        .complete_ticket(&claimed.ticket.id, "teller-1", None)
        .await
        .unwrap();
    assert_eq!(completed.status, TicketStatus::Completed);
    assert!(completed.completed_at.is_some());
    assert!(completed.counter_id.is_none());

    // Second completion fails and changes nothing
    let err = engine
        .complete_ticket(&claimed.ticket.id, "teller-1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueEngineError::InvalidTransition(_)));

    let stored = engine
        .store()
        .ticket(&claimed.ticket.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.completed_at, completed.completed_at);

    // The counter is free again
    assert!(engine.counters().get(&counter).unwrap().is_free());
}

#[tokio::test]
async fn only_the_serving_teller_can_complete() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    checkin(&engine, DEPOSITS).await;
    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();

    let err = engine
        .complete_ticket(&claimed.ticket.id, "teller-9", None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueEngineError::InvalidTransition(_)));
}

#[tokio::test]
async fn no_show_frees_the_counter() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    checkin(&engine, DEPOSITS).await;
    let second = checkin(&engine, DEPOSITS).await;

    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();
    let no_show = engine
        .mark_no_show(&claimed.ticket.id, "teller-1")
        .await
        .unwrap();
    assert_eq!(no_show.status, TicketStatus::NoShow);
    assert!(no_show.completed_at.is_none());

    // The freed counter can immediately serve the next customer
    let next = engine.call_next(&counter, "teller-1").await.unwrap();
    assert_eq!(next.ticket.id, second.ticket.id);
}

#[tokio::test]
async fn transfer_preserves_checkin_time_fairness() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    let first = checkin(&engine, DEPOSITS).await;
    checkin(&engine, DEPOSITS).await;

    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();
    assert_eq!(claimed.ticket.id, first.ticket.id);

    let transferred = engine
        .transfer_ticket(&claimed.ticket.id, &ServiceId::from(LOANS), "teller-1")
        .await
        .unwrap();
    assert_eq!(transferred.status, TicketStatus::Waiting);
    assert_eq!(transferred.service_category_id, ServiceId::from(LOANS));
    assert_eq!(transferred.created_at, first.ticket.created_at);
    assert!(transferred.counter_id.is_none());

    // Original arrival time puts the transferred ticket back at the head
    let info = engine.ticket_position(&first.ticket.id).await.unwrap();
    assert_eq!(info.position, Some(1));

    // And its old counter is free again
    assert!(engine.counters().get(&counter).unwrap().is_free());
}

#[tokio::test]
async fn bump_makes_a_waiting_ticket_next_in_line() {
    let engine = create_test_engine();

    checkin(&engine, DEPOSITS).await;
    checkin(&engine, DEPOSITS).await;
    let third = checkin(&engine, DEPOSITS).await;
    assert_eq!(third.position, 3);

    let bumped = engine
        .bump_priority(&third.ticket.id, "manager-1", Some("elderly customer".to_string()))
        .await
        .unwrap();
    assert_eq!(bumped.priority, TicketPriority::Vip);
    assert_eq!(bumped.prioritized_by.as_deref(), Some("manager-1"));

    let info = engine.ticket_position(&third.ticket.id).await.unwrap();
    assert_eq!(info.position, Some(1));

    // Bumping an already-claimed ticket is rejected
    let counter = open_counter(&engine, 1).await;
    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();
    assert_eq!(claimed.ticket.id, third.ticket.id);
    let err = engine
        .bump_priority(&third.ticket.id, "manager-1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueEngineError::InvalidTransition(_)));
}

#[tokio::test]
async fn cancel_only_works_from_waiting() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    let ticket = checkin(&engine, DEPOSITS).await;
    let cancelled = engine
        .cancel_ticket(&ticket.ticket.id, "customer")
        .await
        .unwrap();
    assert_eq!(cancelled.status, TicketStatus::Cancelled);

    let other = checkin(&engine, DEPOSITS).await;
    engine.call_next(&counter, "teller-1").await.unwrap();
    let err = engine
        .cancel_ticket(&other.ticket.id, "customer")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueEngineError::InvalidTransition(_)));
}

#[tokio::test]
async fn paused_and_closed_queues_reject_checkin() {
    let engine = create_test_engine();
    let branch_id = BranchId::from(BRANCH);

    engine.pause_queue(&branch_id, "manager-1").await.unwrap();
    let err = engine
        .checkin(CheckinRequest::kiosk(branch_id.clone(), ServiceId::from(DEPOSITS)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueEngineError::QueuePaused(_)));

    engine.resume_queue(&branch_id, "manager-1").await.unwrap();
    checkin(&engine, DEPOSITS).await;

    engine
        .branches()
        .update_branch(&branch_id, |b| {
            b.queue_status = QueueStatus::Closed;
            Ok(())
        })
        .unwrap();
    let err = engine
        .checkin(CheckinRequest::kiosk(branch_id, ServiceId::from(DEPOSITS)))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueEngineError::QueueClosed(_)));
}

#[tokio::test]
async fn reset_cancels_everything_and_restarts_numbering() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;
    let branch_id = BranchId::from(BRANCH);

    let first = checkin(&engine, DEPOSITS).await;
    assert_eq!(first.ticket.ticket_number, "D-001");
    checkin(&engine, DEPOSITS).await;
    engine.call_next(&counter, "teller-1").await.unwrap();

    let cancelled = engine.reset_queue(&branch_id, "manager-1").await.unwrap();
    assert_eq!(cancelled, 2);

    let snapshot = engine.branch_snapshot(&branch_id).await.unwrap();
    assert!(snapshot.waiting.is_empty());
    assert!(engine.counters().get(&counter).unwrap().is_free());

    // Numbering restarts from 1... but never re-issues a number already used
    // today, because the sequencer re-seeds from the store
    let next = checkin(&engine, DEPOSITS).await;
    assert_eq!(next.ticket.ticket_number, "D-003");
}

#[tokio::test]
async fn counters_never_share_a_ticket() {
    let engine = create_test_engine();
    let c1 = open_counter(&engine, 1).await;
    let c2 = open_counter(&engine, 2).await;

    checkin(&engine, DEPOSITS).await;
    checkin(&engine, DEPOSITS).await;

    let first = engine.call_next(&c1, "teller-1").await.unwrap();
    let second = engine.call_next(&c2, "teller-2").await.unwrap();
    assert_ne!(first.ticket.id, second.ticket.id);

    // Mutual consistency: each active ticket points at its own counter
    for (claim, counter_id) in [(&first, &c1), (&second, &c2)] {
        let stored = engine.store().ticket(&claim.ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.counter_id.as_ref(), Some(counter_id));
        let counter = engine.counters().get(counter_id).unwrap();
        assert_eq!(counter.current_ticket_id, Some(claim.ticket.id.clone()));
    }
}

#[tokio::test]
#[serial]
async fn concurrent_call_next_claims_each_ticket_exactly_once() {
    // N counters race over M < N waiting tickets, across several
    // randomized interleavings
    for seed in 0..10u64 {
        let engine = create_test_engine();
        let mut counters = Vec::new();
        for number in 1..=4 {
            counters.push(open_counter(&engine, number).await);
        }

        checkin(&engine, DEPOSITS).await;
        checkin(&engine, LOANS).await;

        let mut rng = StdRng::seed_from_u64(seed);
        let tasks: Vec<_> = counters
            .iter()
            .enumerate()
            .map(|(i, counter_id)| {
                let engine = engine.clone();
                let counter_id = counter_id.clone();
                let jitter = rng.gen_range(0..500u64);
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_micros(jitter)).await;
                    engine.call_next(&counter_id, &format!("teller-{}", i + 1)).await
                })
            })
            .collect();

        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.expect("task panicked"))
            .collect();

        let claimed: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let empty = results
            .iter()
            .filter(|r| matches!(r, Err(QueueEngineError::NoEligibleTicket(_))))
            .count();

        assert_eq!(claimed.len(), 2, "seed {}: exactly M tickets claimed", seed);
        assert_eq!(empty, 2, "seed {}: the rest report NoEligibleTicket", seed);

        let unique: HashSet<_> = claimed.iter().map(|c| c.ticket.id.clone()).collect();
        assert_eq!(unique.len(), 2, "seed {}: zero duplicate claims", seed);
    }
}

#[tokio::test]
async fn long_waits_escalate_to_critical_alerts() {
    let engine = create_test_engine();
    let branch_id = BranchId::from(BRANCH);

    // Put the branch's local midnight twelve hours away so the backdated
    // ticket below cannot fall outside today's window
    let offset_mins = ((12 - Utc::now().hour() as i32) % 24) * 60;
    engine
        .branches()
        .update_branch(&branch_id, |b| {
            b.utc_offset_minutes = offset_mins;
            Ok(())
        })
        .unwrap();

    // A ticket that checked in 31 minutes ago (threshold 20, critical at 30)
    let req = CheckinRequest::kiosk(branch_id.clone(), ServiceId::from(DEPOSITS));
    let mut stale = Ticket::new(&req, "D-900".to_string(), Utc::now() - Duration::minutes(31));
    stale.id = TicketId::from("stale-ticket");
    let entry = TicketHistoryEntry::new(
        stale.id.clone(),
        TicketAction::Created,
        None,
        serde_json::json!({}),
        stale.created_at,
    );
    engine.store().insert_ticket(&stale, &entry).await.unwrap();

    let alerts = engine.evaluate_branch_alerts(&branch_id).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::LongWait);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
}

#[tokio::test]
async fn overdue_breaks_raise_alerts() {
    let engine = create_test_engine();
    let branch_id = BranchId::from(BRANCH);
    let counter = open_counter(&engine, 1).await;

    engine
        .start_break(&counter, BreakReason::Personal, 15)
        .await
        .unwrap();
    assert_eq!(
        engine.counters().get(&counter).unwrap().status,
        CounterStatus::OnBreak
    );

    // Within the window: quiet
    assert!(engine.evaluate_branch_alerts(&branch_id).await.is_empty());
    engine.end_break(&counter).await.unwrap();

    // A lunch break started 45 minutes ago with a 30 minute window is 15
    // minutes over: past the critical margin
    engine
        .counters()
        .start_break(
            &counter,
            BreakReason::Lunch,
            30,
            Utc::now() - Duration::minutes(45),
        )
        .unwrap();

    let alerts = engine.evaluate_branch_alerts(&branch_id).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::BreakOvertime);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
}

#[tokio::test]
async fn events_arrive_in_commit_order() {
    let engine = create_test_engine();
    let branch_id = BranchId::from(BRANCH);
    let counter = open_counter(&engine, 1).await;

    let mut rx = engine.broadcaster().subscribe_branch(&branch_id);

    checkin(&engine, DEPOSITS).await;
    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();
    engine
        .complete_ticket(&claimed.ticket.id, "teller-1", None)
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Ok(Ok(event)) = timeout(std::time::Duration::from_millis(100), rx.recv()).await {
        names.push(event.name());
    }

    let created = names.iter().position(|n| *n == "ticket:created").unwrap();
    let called = names.iter().position(|n| *n == "ticket:called").unwrap();
    let serving = names.iter().position(|n| *n == "ticket:serving").unwrap();
    let completed = names.iter().position(|n| *n == "ticket:completed").unwrap();
    assert!(created < called && called < serving && serving < completed);
}

#[tokio::test]
async fn ticket_room_receives_position_updates() {
    let engine = create_test_engine();
    let counter = open_counter(&engine, 1).await;

    checkin(&engine, DEPOSITS).await;
    let second = checkin(&engine, DEPOSITS).await;
    let mut rx = engine.broadcaster().subscribe_ticket(&second.ticket.id);

    engine.call_next(&counter, "teller-1").await.unwrap();

    let event = timeout(std::time::Duration::from_millis(100), rx.recv())
        .await
        .expect("no event")
        .unwrap();
    match event {
        QueueEvent::TicketPositionUpdated {
            position, urgency, ..
        } => {
            assert_eq!(position, 1);
            assert_eq!(urgency, PositionUrgency::Imminent);
        }
        other => panic!("unexpected event {:?}", other.name()),
    }
}

#[tokio::test]
async fn scheduler_closes_and_reopens_branches() {
    let engine = create_test_engine();
    let branch_id = BranchId::from(BRANCH);
    engine
        .branches()
        .update_branch(&branch_id, |b| {
            b.auto_schedule_enabled = true;
            b.operating_hours = Some(OperatingHours {
                opening: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                closing: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                closed_on_weekends: true,
            });
            Ok(())
        })
        .unwrap();

    let leftover = checkin(&engine, DEPOSITS).await;

    // Wednesday 18:00 — past closing: the queue closes and leftovers are
    // cancelled as system actions
    let evening = Utc.with_ymd_and_hms(2026, 3, 4, 18, 0, 0).unwrap();
    engine.run_schedule_tick(evening).await;
    assert_eq!(
        engine.branches().branch(&branch_id).unwrap().queue_status,
        QueueStatus::Closed
    );
    let stored = engine
        .store()
        .ticket(&leftover.ticket.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TicketStatus::Cancelled);
    let history = engine.store().history(&leftover.ticket.id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.action, TicketAction::AutoCancelled);
    assert_eq!(last.actor_id.as_deref(), Some(SYSTEM_ACTOR_ID));

    // Thursday 09:00 — inside hours: the queue reopens
    let morning = Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap();
    engine.run_schedule_tick(morning).await;
    assert_eq!(
        engine.branches().branch(&branch_id).unwrap().queue_status,
        QueueStatus::Open
    );

    // Saturday stays closed despite being inside opening hours
    let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap();
    engine.run_schedule_tick(saturday).await;
    assert_eq!(
        engine.branches().branch(&branch_id).unwrap().queue_status,
        QueueStatus::Closed
    );
}

#[tokio::test]
async fn sqlite_store_backs_the_full_lifecycle() {
    let store = SqliteTicketStore::in_memory().await.unwrap();
    let engine = DispatchEngine::new(
        QueueEngineConfig::default(),
        Arc::new(store),
        Arc::new(NullSink),
    )
    .unwrap();
    engine
        .branches()
        .upsert_branch(Branch::new(BranchId::from(BRANCH), "Main Branch"));
    engine.branches().upsert_service(service(DEPOSITS, "D", 10));
    let counter = open_counter(&engine, 1).await;

    let receipt = checkin(&engine, DEPOSITS).await;
    assert_eq!(receipt.ticket.ticket_number, "D-001");

    let claimed = engine.call_next(&counter, "teller-1").await.unwrap();
    assert_eq!(claimed.ticket.id, receipt.ticket.id);

    let completed = engine
        .complete_ticket(&claimed.ticket.id, "teller-1", Some("done".to_string()))
        .await
        .unwrap();
    assert_eq!(completed.status, TicketStatus::Completed);

    let history = engine.store().history(&receipt.ticket.id).await.unwrap();
    let actions: Vec<TicketAction> = history.iter().map(|h| h.action).collect();
    assert_eq!(
        actions,
        vec![TicketAction::Created, TicketAction::Called, TicketAction::Completed]
    );
}
