use super::*;
use crate::limits::*;

use std::time::Duration;

use chrono::NaiveDate;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const H: Minutes = 60;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2099, 7, 14).unwrap()
}

fn studio_hours() -> OperatingHours {
    OperatingHours::new(8 * H, 22 * H).unwrap()
}

fn new_engine(path: PathBuf) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), EngineConfig::default()).unwrap()
}

async fn engine_with_studio(name: &str) -> (Engine, Ulid) {
    let engine = new_engine(test_wal_path(name));
    let rid = Ulid::new();
    engine
        .create_resource(rid, Some("Studio A".into()), studio_hours(), SlotStep::default(), Some(1200))
        .await
        .unwrap();
    (engine, rid)
}

fn request(resource_id: Ulid, date: NaiveDate, start: Minutes, duration: Minutes) -> NewReservation {
    NewReservation {
        id: Ulid::new(),
        resource_id,
        date,
        start,
        duration,
        customer: CustomerInfo {
            name: "Anand".into(),
            ..Default::default()
        },
    }
}

async fn book(engine: &Engine, rid: Ulid, start: Minutes, duration: Minutes) -> Result<Reservation, EngineError> {
    engine.create_reservation(request(rid, day(), start, duration)).await
}

fn assert_pairwise_disjoint(active: &[Reservation]) {
    for (i, a) in active.iter().enumerate() {
        for b in &active[i + 1..] {
            assert!(
                !overlaps(a.start, a.duration, b.start, b.duration),
                "{} [{}+{}) overlaps {} [{}+{})",
                a.id,
                a.start,
                a.duration,
                b.id,
                b.start,
                b.duration
            );
        }
    }
}

// ── Resources ────────────────────────────────────────────

#[tokio::test]
async fn create_and_list_resource() {
    let (engine, rid) = engine_with_studio("create_resource.wal").await;
    let all = engine.list_resources().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, rid);
    assert_eq!(all[0].name.as_deref(), Some("Studio A"));
    assert_eq!(all[0].hours, studio_hours());
    assert_eq!(all[0].hourly_rate, Some(1200));
}

#[tokio::test]
async fn duplicate_resource_rejected() {
    let (engine, rid) = engine_with_studio("duplicate_resource.wal").await;
    let err = engine
        .create_resource(rid, None, studio_hours(), SlotStep::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == rid));
}

#[tokio::test]
async fn resource_name_limit() {
    let engine = new_engine(test_wal_path("name_limit.wal"));
    let err = engine
        .create_resource(
            Ulid::new(),
            Some("x".repeat(MAX_NAME_LEN + 1)),
            studio_hours(),
            SlotStep::default(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn hourly_rate_limit() {
    let engine = new_engine(test_wal_path("rate_limit.wal"));
    let rid = Ulid::new();
    let err = engine
        .create_resource(rid, None, studio_hours(), SlotStep::default(), Some(MAX_HOURLY_RATE + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    engine
        .create_resource(rid, None, studio_hours(), SlotStep::default(), Some(MAX_HOURLY_RATE))
        .await
        .unwrap();
    assert_eq!(engine.quote(rid, 24 * H).await.unwrap(), Some(MAX_HOURLY_RATE * 24));
    let err = engine
        .update_resource(rid, None, studio_hours(), SlotStep::default(), Some(u64::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn update_resource_reshapes_grid() {
    let (engine, rid) = engine_with_studio("update_resource.wal").await;
    engine
        .update_resource(
            rid,
            Some("Studio A (short day)".into()),
            OperatingHours::new(10 * H, 18 * H).unwrap(),
            SlotStep::new(30).unwrap(),
            None,
        )
        .await
        .unwrap();

    let slots = engine.get_availability(rid, day(), 60).await.unwrap();
    assert_eq!(slots.first().unwrap().start, 10 * H);
    assert_eq!(slots.last().unwrap().start, 18 * H);
    assert_eq!(slots.len(), 17);
    assert_eq!(engine.quote(rid, 60).await.unwrap(), None);
}

#[tokio::test]
async fn delete_resource_with_reservations_fails() {
    let (engine, rid) = engine_with_studio("delete_with_reservations.wal").await;
    let r = book(&engine, rid, 10 * H, 60).await.unwrap();

    let err = engine.delete_resource(rid).await.unwrap_err();
    assert!(matches!(err, EngineError::HasReservations(_)));

    engine.cancel_reservation(r.id).await.unwrap();
    engine.delete_resource(rid).await.unwrap();
    assert!(matches!(
        engine.get_availability(rid, day(), 60).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(engine.get_reservation(r.id).await, Err(EngineError::NotFound(_))));
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn book_then_conflict() {
    let (engine, rid) = engine_with_studio("book_then_conflict.wal").await;
    let first = book(&engine, rid, 10 * H, 2 * H).await.unwrap();
    assert_eq!(first.quoted_price, Some(2400));
    assert_eq!(first.status, ReservationStatus::Active);

    let err = book(&engine, rid, 11 * H, 60).await.unwrap_err();
    match err {
        EngineError::SlotConflict(conflicts) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].reservation_id, first.id);
            assert_eq!((conflicts[0].start, conflicts[0].end), (10 * H, 12 * H));
        }
        other => panic!("expected SlotConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn touching_bookings_allowed() {
    let (engine, rid) = engine_with_studio("touching.wal").await;
    book(&engine, rid, 10 * H, 60).await.unwrap();
    book(&engine, rid, 11 * H, 60).await.unwrap();
    book(&engine, rid, 9 * H, 60).await.unwrap();
    assert_eq!(engine.list_active(rid, Some(day())).await.unwrap().len(), 3);
}

#[tokio::test]
async fn other_dates_do_not_conflict() {
    let (engine, rid) = engine_with_studio("other_dates.wal").await;
    book(&engine, rid, 10 * H, 60).await.unwrap();
    let tomorrow = day().succ_opt().unwrap();
    engine
        .create_reservation(request(rid, tomorrow, 10 * H, 60))
        .await
        .unwrap();
    assert_eq!(engine.list_active(rid, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn fractional_duration_books_real_span() {
    let (engine, rid) = engine_with_studio("fractional.wal").await;
    let r = book(&engine, rid, 9 * H, 150).await.unwrap();
    assert_eq!(r.span(), Span::new(9 * H, 11 * H + 30));
    assert_eq!(r.quoted_price, Some(3000));

    let slots = engine.get_availability(rid, day(), 60).await.unwrap();
    let at = |t: Minutes| slots.iter().find(|s| s.start == t).unwrap();
    assert!(at(11 * H).booked);
    assert!(!at(12 * H).booked);
    assert!(at(12 * H).startable);
}

#[tokio::test]
async fn trailing_slots_checked_before_conflicts() {
    let (engine, rid) = engine_with_studio("trailing.wal").await;
    book(&engine, rid, 21 * H, 60).await.unwrap();
    let err = book(&engine, rid, 21 * H, 2 * H).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InsufficientTrailingSlots { needed: 2, available: 1, .. }
    ));
    // the closing boundary is on the grid but never startable
    let err = book(&engine, rid, 22 * H, 60).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientTrailingSlots { available: 0, .. }));
}

#[tokio::test]
async fn off_grid_and_out_of_hours_start() {
    let (engine, rid) = engine_with_studio("off_grid.wal").await;
    assert!(matches!(
        book(&engine, rid, 10 * H + 30, 60).await,
        Err(EngineError::InvalidStart { .. })
    ));
    assert!(matches!(
        book(&engine, rid, 7 * H, 60).await,
        Err(EngineError::InvalidStart { .. })
    ));
}

#[tokio::test]
async fn invalid_duration_rejected() {
    let (engine, rid) = engine_with_studio("bad_duration.wal").await;
    assert!(matches!(book(&engine, rid, 10 * H, 0).await, Err(EngineError::InvalidDuration(_))));
    assert!(matches!(book(&engine, rid, 10 * H, -30).await, Err(EngineError::InvalidDuration(_))));
    assert!(matches!(
        engine.get_availability(rid, day(), 0).await,
        Err(EngineError::InvalidDuration(_))
    ));
}

#[tokio::test]
async fn duplicate_reservation_id_rejected() {
    let (engine, rid) = engine_with_studio("duplicate_reservation.wal").await;
    let req = request(rid, day(), 10 * H, 60);
    engine.create_reservation(req.clone()).await.unwrap();
    let again = NewReservation { start: 14 * H, ..req };
    assert!(matches!(
        engine.create_reservation(again).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn unknown_resource_is_not_found() {
    let engine = new_engine(test_wal_path("unknown_resource.wal"));
    let missing = Ulid::new();
    assert!(matches!(book(&engine, missing, 10 * H, 60).await, Err(EngineError::NotFound(_))));
    assert!(matches!(
        engine.get_availability(missing, day(), 60).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(engine.list_active(missing, None).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn past_dates_follow_config() {
    let yesterday = chrono::Local::now().date_naive().pred_opt().unwrap();

    let (strict, rid) = engine_with_studio("past_strict.wal").await;
    assert!(matches!(
        strict.create_reservation(request(rid, yesterday, 10 * H, 60)).await,
        Err(EngineError::PastDate(_))
    ));

    let lenient = Engine::new(
        test_wal_path("past_lenient.wal"),
        Arc::new(NotifyHub::new()),
        EngineConfig {
            reject_past_dates: false,
            ..Default::default()
        },
    )
    .unwrap();
    lenient
        .create_resource(rid, None, studio_hours(), SlotStep::default(), None)
        .await
        .unwrap();
    lenient
        .create_reservation(request(rid, yesterday, 10 * H, 60))
        .await
        .unwrap();
}

// ── Edit / cancel ────────────────────────────────────────

#[tokio::test]
async fn edit_may_overlap_its_own_old_range() {
    let (engine, rid) = engine_with_studio("edit_self_overlap.wal").await;
    let r = book(&engine, rid, 10 * H, 2 * H).await.unwrap();
    let moved = engine.update_reservation(r.id, day(), 11 * H, 2 * H).await.unwrap();
    assert_eq!(moved.span(), Span::new(11 * H, 13 * H));
    assert_eq!(moved.customer.name, "Anand");

    let active = engine.list_active(rid, Some(day())).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].start, 11 * H);
}

#[tokio::test]
async fn failed_edit_keeps_original() {
    let (engine, rid) = engine_with_studio("failed_edit.wal").await;
    let a = book(&engine, rid, 10 * H, 60).await.unwrap();
    let b = book(&engine, rid, 12 * H, 60).await.unwrap();

    let err = engine.update_reservation(a.id, day(), 12 * H, 60).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotConflict(ref c) if c[0].reservation_id == b.id));

    let kept = engine.get_reservation(a.id).await.unwrap();
    assert_eq!(kept.span(), Span::new(10 * H, 11 * H));
    assert!(kept.is_active());
}

#[tokio::test]
async fn edit_to_another_date_frees_old_slot() {
    let (engine, rid) = engine_with_studio("edit_date.wal").await;
    let r = book(&engine, rid, 10 * H, 60).await.unwrap();
    let tomorrow = day().succ_opt().unwrap();
    let moved = engine.update_reservation(r.id, tomorrow, 10 * H, 90).await.unwrap();
    assert_eq!(moved.date, tomorrow);
    assert_eq!(moved.quoted_price, Some(1800));

    assert!(engine.list_active(rid, Some(day())).await.unwrap().is_empty());
    book(&engine, rid, 10 * H, 60).await.unwrap();
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let (engine, rid) = engine_with_studio("cancel_idempotent.wal").await;
    let r = book(&engine, rid, 10 * H, 60).await.unwrap();
    assert!(engine.cancel_reservation(r.id).await.unwrap());
    assert!(!engine.cancel_reservation(r.id).await.unwrap());
    assert_eq!(
        engine.get_reservation(r.id).await.unwrap().status,
        ReservationStatus::Cancelled
    );
    // slot is free again
    book(&engine, rid, 10 * H, 60).await.unwrap();
}

#[tokio::test]
async fn cancelled_reservation_cannot_be_edited() {
    let (engine, rid) = engine_with_studio("edit_cancelled.wal").await;
    let r = book(&engine, rid, 10 * H, 60).await.unwrap();
    engine.cancel_reservation(r.id).await.unwrap();
    assert!(matches!(
        engine.update_reservation(r.id, day(), 14 * H, 60).await,
        Err(EngineError::NotActive(_))
    ));
    assert!(matches!(
        engine.cancel_reservation(Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Reads ────────────────────────────────────────────────

#[tokio::test]
async fn availability_reports_conflict_ids() {
    let (engine, rid) = engine_with_studio("availability_ids.wal").await;
    let r = book(&engine, rid, 13 * H, 60).await.unwrap();
    let slots = engine.get_availability(rid, day(), 2 * H).await.unwrap();
    assert_eq!(slots.len(), 15);

    let at = |t: Minutes| slots.iter().find(|s| s.start == t).unwrap();
    assert!(at(13 * H).booked);
    assert_eq!(at(13 * H).conflicts, vec![r.id]);
    assert!(!at(12 * H).booked);
    assert!(!at(12 * H).startable);
    assert!(at(14 * H).startable);
    assert!(!at(21 * H).startable);
}

#[tokio::test]
async fn free_windows_with_minimum() {
    let (engine, rid) = engine_with_studio("free_windows.wal").await;
    book(&engine, rid, 9 * H, 60).await.unwrap();
    book(&engine, rid, 11 * H, 60).await.unwrap();

    let all = engine.free_windows(rid, day(), None).await.unwrap();
    assert_eq!(
        all,
        vec![Span::new(8 * H, 9 * H), Span::new(10 * H, 11 * H), Span::new(12 * H, 22 * H)]
    );
    let long = engine.free_windows(rid, day(), Some(2 * H)).await.unwrap();
    assert_eq!(long, vec![Span::new(12 * H, 22 * H)]);
}

#[tokio::test]
async fn quote_uses_hourly_rate() {
    let (engine, rid) = engine_with_studio("quote.wal").await;
    assert_eq!(engine.quote(rid, 90).await.unwrap(), Some(1800));
    assert!(matches!(engine.quote(rid, 0).await, Err(EngineError::InvalidDuration(_))));
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_bookings_one_winner() {
    let (engine, rid) = engine_with_studio("race.wal").await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        // every request covers 11:00-12:00
        let start = if i % 2 == 0 { 10 * H } else { 11 * H };
        handles.push(tokio::spawn(async move {
            engine.create_reservation(request(rid, day(), start, 2 * H)).await
        }));
    }

    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::SlotConflict(_)) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(won, 1);
    let active = engine.list_active(rid, Some(day())).await.unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn lock_timeout_reports_busy() {
    let engine = Engine::new(
        test_wal_path("busy.wal"),
        Arc::new(NotifyHub::new()),
        EngineConfig {
            lock_timeout: Duration::from_millis(20),
            ..Default::default()
        },
    )
    .unwrap();
    let rid = Ulid::new();
    engine
        .create_resource(rid, None, studio_hours(), SlotStep::default(), None)
        .await
        .unwrap();

    let rs = engine.get_resource(&rid).unwrap();
    let held = rs.write().await;
    let err = book(&engine, rid, 10 * H, 60).await.unwrap_err();
    assert!(matches!(err, EngineError::Busy(id) if id == rid));
    drop(held);

    book(&engine, rid, 10 * H, 60).await.unwrap();
}

#[tokio::test]
async fn booking_queued_behind_delete_is_refused() {
    let (engine, rid) = engine_with_studio("delete_race.wal").await;
    let engine = Arc::new(engine);

    // Both writers resolve the resource before either gets the lock.
    let held = engine.get_resource(&rid).unwrap().write_owned().await;
    let delete = tokio::spawn({
        let engine = engine.clone();
        async move { engine.delete_resource(rid).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let req = request(rid, day(), 10 * H, 60);
    let reservation_id = req.id;
    let booking = tokio::spawn({
        let engine = engine.clone();
        async move { engine.create_reservation(req).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(held);

    delete.await.unwrap().unwrap();
    let err = booking.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == rid));
    assert!(matches!(engine.get_reservation(reservation_id).await, Err(EngineError::NotFound(_))));
    assert!(engine.list_resources().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_and_book_never_both_succeed() {
    for round in 0..20 {
        let (engine, rid) = engine_with_studio(&format!("delete_vs_book_{round}.wal")).await;
        let (deleted, booked) = tokio::join!(engine.delete_resource(rid), book(&engine, rid, 10 * H, 60));
        match booked {
            Ok(r) => {
                assert!(matches!(deleted, Err(EngineError::HasReservations(_))));
                assert_eq!(engine.get_reservation(r.id).await.unwrap().id, r.id);
            }
            Err(e) => {
                assert!(matches!(e, EngineError::NotFound(_)), "unexpected {e:?}");
                assert!(deleted.is_ok());
            }
        }
    }
}

#[tokio::test]
async fn random_bookings_never_overlap() {
    let engine = new_engine(test_wal_path("random_bookings.wal"));
    let rid = Ulid::new();
    engine
        .create_resource(
            rid,
            None,
            OperatingHours::new(6 * H, 24 * H).unwrap(),
            SlotStep::new(30).unwrap(),
            None,
        )
        .await
        .unwrap();

    let mut rng = SmallRng::seed_from_u64(0x5107_b00c);
    let mut committed = 0;
    for _ in 0..400 {
        let start = 6 * H + 30 * rng.gen_range(0..36);
        let duration = rng.gen_range(10..=240);
        let attempt = engine.create_reservation(request(rid, day(), start, duration)).await;
        match attempt {
            Ok(_) => committed += 1,
            Err(EngineError::SlotConflict(_)) | Err(EngineError::InsufficientTrailingSlots { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }

        if rng.gen_bool(0.1) {
            let active = engine.list_active(rid, Some(day())).await.unwrap();
            if let Some(victim) = active.first() {
                engine.cancel_reservation(victim.id).await.unwrap();
            }
        }
        assert_pairwise_disjoint(&engine.list_active(rid, Some(day())).await.unwrap());
    }
    assert!(committed > 0);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn committed_events_are_broadcast() {
    let (engine, rid) = engine_with_studio("notify.wal").await;
    let mut rx = engine.notify.subscribe(rid);

    let r = book(&engine, rid, 10 * H, 60).await.unwrap();
    match rx.recv().await.unwrap() {
        Event::ReservationCreated { reservation } => assert_eq!(reservation.id, r.id),
        other => panic!("expected ReservationCreated, got {other:?}"),
    }

    // rejected requests emit nothing
    let _ = book(&engine, rid, 10 * H, 60).await.unwrap_err();
    engine.cancel_reservation(r.id).await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), Event::ReservationCancelled { id, .. } if id == r.id));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let rid = Ulid::new();
    let (kept, moved, cancelled);
    {
        let engine = new_engine(path.clone());
        engine
            .create_resource(rid, Some("Hall".into()), studio_hours(), SlotStep::default(), Some(600))
            .await
            .unwrap();
        kept = book(&engine, rid, 9 * H, 60).await.unwrap();
        moved = book(&engine, rid, 12 * H, 60).await.unwrap();
        cancelled = book(&engine, rid, 15 * H, 60).await.unwrap();
        engine.update_reservation(moved.id, day(), 13 * H, 2 * H).await.unwrap();
        engine.cancel_reservation(cancelled.id).await.unwrap();
    }

    let engine = new_engine(path);
    let active = engine.list_active(rid, Some(day())).await.unwrap();
    let spans: Vec<_> = active.iter().map(|r| (r.id, r.span())).collect();
    assert_eq!(
        spans,
        vec![(kept.id, Span::new(9 * H, 10 * H)), (moved.id, Span::new(13 * H, 15 * H))]
    );
    assert!(!engine.cancel_reservation(cancelled.id).await.unwrap());
    assert_eq!(engine.get_reservation(moved.id).await.unwrap().quoted_price, Some(1200));
    assert!(matches!(book(&engine, rid, 14 * H, 60).await, Err(EngineError::SlotConflict(_))));
}

#[tokio::test]
async fn replay_drops_deleted_resources() {
    let path = test_wal_path("replay_deleted.wal");
    let rid = Ulid::new();
    {
        let engine = new_engine(path.clone());
        engine
            .create_resource(rid, None, studio_hours(), SlotStep::default(), None)
            .await
            .unwrap();
        engine.delete_resource(rid).await.unwrap();
    }
    let engine = new_engine(path);
    assert!(engine.list_resources().await.is_empty());
}

#[tokio::test]
async fn compaction_shrinks_log_and_keeps_state() {
    let path = test_wal_path("compaction.wal");
    let rid = Ulid::new();
    let survivor;
    let gone;
    {
        let engine = new_engine(path.clone());
        engine
            .create_resource(rid, None, studio_hours(), SlotStep::default(), None)
            .await
            .unwrap();
        for _ in 0..25 {
            let r = book(&engine, rid, 10 * H, 60).await.unwrap();
            engine.update_reservation(r.id, day(), 11 * H, 60).await.unwrap();
            engine.cancel_reservation(r.id).await.unwrap();
        }
        survivor = book(&engine, rid, 16 * H, 2 * H).await.unwrap();
        gone = book(&engine, rid, 8 * H, 60).await.unwrap();
        engine.cancel_reservation(gone.id).await.unwrap();

        assert!(engine.wal_appends_since_compact().await > 70);
        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL ({after}) should be smaller than {before}");
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // appends after compaction land in the new file
        book(&engine, rid, 19 * H, 60).await.unwrap();
    }

    let engine = new_engine(path);
    let active = engine.list_active(rid, Some(day())).await.unwrap();
    assert_eq!(active.len(), 2);
    assert_eq!(active[0].id, survivor.id);
    assert!(!engine.cancel_reservation(gone.id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commits_during_compaction_survive_restart() {
    let path = test_wal_path("compaction_race.wal");
    let engine = Arc::new(new_engine(path.clone()));
    let mut rids = Vec::new();
    for _ in 0..8 {
        let rid = Ulid::new();
        engine
            .create_resource(rid, None, studio_hours(), SlotStep::default(), None)
            .await
            .unwrap();
        rids.push(rid);
    }
    rids.sort();

    // Park compaction partway through its snapshot.
    let held = engine.get_resource(&rids[4]).unwrap().write_owned().await;
    let compaction = tokio::spawn({
        let engine = engine.clone();
        async move { engine.compact_wal().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut bookings = Vec::new();
    for &rid in rids.iter().filter(|&&rid| rid != rids[4]) {
        let engine = engine.clone();
        bookings.push(tokio::spawn(async move { book(&engine, rid, 10 * H, 60).await }));
    }
    let late_rid = Ulid::new();
    let late_resource = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .create_resource(late_rid, None, studio_hours(), SlotStep::default(), None)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    compaction.await.unwrap().unwrap();
    late_resource.await.unwrap().unwrap();
    let mut committed = Vec::new();
    for b in bookings {
        committed.push(b.await.unwrap().unwrap());
    }
    assert_eq!(committed.len(), 7);
    drop(engine);

    let engine = new_engine(path);
    for r in &committed {
        assert_eq!(engine.get_reservation(r.id).await.unwrap().resource_id, r.resource_id);
    }
    assert!(engine.get_resource(&late_rid).is_some());
    assert_eq!(engine.list_resources().await.len(), 9);
}
