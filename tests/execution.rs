mod common;

use std::{
    thread,
    time::{Duration, Instant},
};

use common::{Fixture, fast_retry, ints, numbers};
use sluice::{Error, ExecutionStatus, protocol::OperationState};

#[test]
fn direct_result_needs_no_further_calls() {
    let fx = Fixture::new(|w| w, |c| c);
    fx.warehouse.register("SELECT 1", numbers(3));

    let mut handle = fx.session.execute("SELECT 1", &[]).unwrap();
    assert!(handle.returned_as_direct_result());
    assert_eq!(handle.status(), ExecutionStatus::Finished);
    let calls = fx.calls();

    let rows = handle.get_results().unwrap().fetch_all().unwrap();

    assert_eq!(ints(&rows), vec![0, 1, 2]);
    assert_eq!(fx.calls(), calls);
}

#[test]
fn async_run_is_polled_until_finished() {
    let fx = Fixture::new(|w| w.with_polls_until_finished(3), |c| c.with_run_async(true));
    fx.warehouse.register("SELECT * FROM t", numbers(50));

    let mut handle = fx.session.execute("SELECT * FROM t", &[]).unwrap();
    assert_eq!(handle.status(), ExecutionStatus::Running);
    assert!(!handle.returned_as_direct_result());

    let rows = handle.get_results().unwrap().fetch_all().unwrap();

    assert_eq!(ints(&rows), (0..50).collect::<Vec<_>>());
    assert_eq!(handle.status(), ExecutionStatus::Finished);
    // submit, 4 polls, metadata, one page
    assert_eq!(fx.calls(), 7);
}

#[test]
fn terminal_handle_does_not_poll() {
    let fx = Fixture::new(|w| w, |c| c.with_run_async(true));
    fx.warehouse.register("SELECT * FROM t", numbers(5));
    let mut handle = fx.session.execute("SELECT * FROM t", &[]).unwrap();
    assert_eq!(handle.sync_status().unwrap(), ExecutionStatus::Finished);
    let calls = fx.calls();

    assert_eq!(handle.sync_status().unwrap(), ExecutionStatus::Finished);
    assert_eq!(handle.sync_status().unwrap(), ExecutionStatus::Finished);

    assert_eq!(fx.calls(), calls);
}

#[test]
fn resumed_handle_yields_identical_rows() {
    let fx = Fixture::new(
        |w| w.with_rows_per_file(64).with_polls_until_finished(1),
        |c| c.with_run_async(true).with_max_inline_rows(100),
    );
    fx.warehouse.register("SELECT * FROM big", numbers(1_000));

    let mut original = fx.session.execute("SELECT * FROM big", &[]).unwrap();
    let serialized = original.serialize().unwrap();

    let other = Fixture::session(&fx.transport, |c| c);
    let mut resumed = other.resume_serialized(&serialized).unwrap();
    assert_eq!(resumed.query_id(), original.query_id());
    assert_eq!(resumed.query_secret(), original.query_secret());

    let from_resumed = resumed.get_results().unwrap().fetch_all().unwrap();
    let from_original = original.get_results().unwrap().fetch_all().unwrap();

    assert_eq!(from_resumed, from_original);
    assert_eq!(ints(&from_resumed), (0..1_000).collect::<Vec<_>>());
}

#[test]
fn detached_run_survives_its_session() {
    let fx = Fixture::new(|w| w, |c| c.with_run_async(true));
    fx.warehouse.register("SELECT * FROM t", numbers(10));

    let first = Fixture::session(&fx.transport, |c| c.with_run_async(true));
    let serialized = first.execute("SELECT * FROM t", &[]).unwrap().detach().unwrap();
    first.close();

    let mut resumed = fx.session.resume_serialized(&serialized).unwrap();
    let rows = resumed.get_results().unwrap().fetch_all().unwrap();

    assert_eq!(rows.len(), 10);
}

#[test]
fn cancel_on_finished_handle_is_noop() {
    let fx = Fixture::new(|w| w, |c| c);
    fx.warehouse.register("SELECT 1", numbers(1));
    let mut handle = fx.session.execute("SELECT 1", &[]).unwrap();
    let calls = fx.calls();

    handle.cancel().unwrap();

    assert_eq!(handle.status(), ExecutionStatus::Finished);
    assert_eq!(fx.calls(), calls);
    assert_eq!(handle.get_results().unwrap().fetch_all().unwrap().len(), 1);
}

#[test]
fn canceled_run_raises_on_result_access() {
    let fx = Fixture::new(|w| w.with_polls_until_finished(100), |c| c.with_run_async(true));
    fx.warehouse.register("SELECT * FROM slow", numbers(5));
    let mut handle = fx.session.execute("SELECT * FROM slow", &[]).unwrap();

    handle.cancel().unwrap();

    assert_eq!(handle.status(), ExecutionStatus::Canceled);
    assert_eq!(
        fx.warehouse.run_state(handle.query_id()),
        Some(OperationState::Canceled)
    );
    assert!(matches!(handle.get_results(), Err(Error::Cancellation)));
}

#[test]
fn canceller_interrupts_blocking_wait() {
    let fx = Fixture::new(
        |w| w.with_polls_until_finished(u32::MAX),
        |c| {
            c.with_run_async(true).with_retry(
                fast_retry()
                    .with_delay_min(Duration::from_millis(200))
                    .with_delay_max(Duration::from_secs(1)),
            )
        },
    );
    fx.warehouse.register("SELECT * FROM slow", numbers(5));
    let mut handle = fx.session.execute("SELECT * FROM slow", &[]).unwrap();
    let canceller = handle.canceller();

    let started = Instant::now();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceller.cancel()
    });
    let outcome = handle.get_results();

    trigger.join().unwrap().unwrap();
    assert!(matches!(outcome, Err(Error::Cancellation)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn failed_run_raises_server_detail() {
    let fx = Fixture::new(|w| w.with_polls_until_finished(1), |c| c.with_run_async(true));
    fx.warehouse
        .register_failure("SELECT 1/0", "DIVIDE_BY_ZERO", "division by zero");
    let mut handle = fx.session.execute("SELECT 1/0", &[]).unwrap();

    let err = handle.get_results().unwrap_err();

    assert_eq!(handle.status(), ExecutionStatus::Failed);
    match err {
        Error::ServerOperation { code, message } => {
            assert_eq!(code, "DIVIDE_BY_ZERO");
            assert_eq!(message, "division by zero");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn synchronously_failed_run_fetches_nothing() {
    let fx = Fixture::new(|w| w, |c| c);
    fx.warehouse
        .register_failure("SELECT 1/0", "DIVIDE_BY_ZERO", "division by zero");
    let mut handle = fx.session.execute("SELECT 1/0", &[]).unwrap();
    assert_eq!(handle.status(), ExecutionStatus::Failed);
    let calls = fx.calls();

    assert!(matches!(
        handle.get_results(),
        Err(Error::ServerOperation { .. })
    ));
    assert!(matches!(
        handle.get_results(),
        Err(Error::ServerOperation { .. })
    ));
    assert_eq!(fx.calls(), calls);
}

#[test]
fn closed_handle_raises() {
    let fx = Fixture::new(|w| w, |c| c.with_run_async(true));
    fx.warehouse.register("SELECT * FROM t", numbers(5));
    let mut handle = fx.session.execute("SELECT * FROM t", &[]).unwrap();

    handle.close();

    assert_eq!(handle.status(), ExecutionStatus::Closed);
    assert_eq!(
        fx.warehouse.run_state(handle.query_id()),
        Some(OperationState::Closed)
    );
    assert!(matches!(handle.get_results(), Err(Error::Closed)));
    assert!(matches!(handle.sync_status(), Err(Error::Closed)));
    assert!(matches!(handle.serialize(), Err(Error::Closed)));
    assert!(matches!(handle.cancel(), Err(Error::Closed)));
    assert_eq!(fx.session.open_handles(), 0);
}

#[test]
fn close_failure_is_swallowed() {
    let fx = Fixture::new(|w| w, |c| c.with_run_async(true));
    fx.warehouse.register("SELECT * FROM t", numbers(5));
    let mut handle = fx.session.execute("SELECT * FROM t", &[]).unwrap();
    fx.warehouse.reject_next(403, None, None);

    handle.close();

    assert_eq!(handle.status(), ExecutionStatus::Closed);
}

#[test]
fn resuming_direct_result_is_unrecoverable() {
    let fx = Fixture::new(|w| w, |c| c);
    fx.warehouse.register("SELECT 1", numbers(1));
    let handle = fx.session.execute("SELECT 1", &[]).unwrap();
    assert!(handle.returned_as_direct_result());

    let err = fx
        .session
        .resume_serialized(&handle.serialize().unwrap())
        .unwrap_err();

    assert!(matches!(err, Error::UnrecoverableResult(_)));
}

#[test]
fn resuming_expired_run_is_unrecoverable() {
    let fx = Fixture::new(|w| w, |c| c.with_run_async(true));
    fx.warehouse.register("SELECT * FROM t", numbers(5));
    let handle = fx.session.execute("SELECT * FROM t", &[]).unwrap();
    fx.warehouse.expire(handle.query_id());

    let err = fx
        .session
        .resume(handle.query_id(), handle.query_secret())
        .unwrap_err();

    assert!(matches!(err, Error::UnrecoverableResult(_)));
}

#[test]
fn malformed_identifier_is_rejected() {
    let fx = Fixture::new(|w| w, |c| c);

    assert!(matches!(
        fx.session.resume_serialized("nonsense"),
        Err(Error::InvalidIdentifier(_))
    ));
    assert_eq!(fx.calls(), 0);
}

#[test]
fn session_close_releases_operations() {
    let fx = Fixture::new(|w| w.with_polls_until_finished(10), |c| c.with_run_async(true));
    fx.warehouse.register("SELECT * FROM t", numbers(5));
    let first = fx.session.execute("SELECT * FROM t", &[]).unwrap();
    let second = fx.session.execute("SELECT * FROM t", &[]).unwrap();
    assert_eq!(fx.warehouse.open_runs(), 2);

    fx.session.close();

    assert_eq!(first.status(), ExecutionStatus::Closed);
    assert_eq!(second.status(), ExecutionStatus::Closed);
    assert_eq!(fx.warehouse.open_runs(), 0);
    assert!(matches!(
        fx.session.execute("SELECT * FROM t", &[]),
        Err(Error::Closed)
    ));
}

#[test]
fn transient_rejections_are_retried() {
    let fx = Fixture::new(|w| w, |c| c);
    fx.warehouse.register("SELECT 1", numbers(1));
    fx.warehouse.reject_next(503, None, None);
    fx.warehouse.reject_next(429, Some(Duration::from_millis(2)), None);

    let handle = fx.session.execute("SELECT 1", &[]).unwrap();

    assert!(handle.returned_as_direct_result());
    assert_eq!(fx.calls(), 3);
}

#[test]
fn unauthorized_is_not_retried() {
    let fx = Fixture::new(|w| w, |c| c);
    fx.warehouse.register("SELECT 1", numbers(1));
    fx.warehouse.reject_next(401, None, None);

    let err = fx.session.execute("SELECT 1", &[]).unwrap_err();

    assert!(matches!(err, Error::Auth { status: 401, .. }));
    assert_eq!(fx.calls(), 1);
}

#[test]
fn query_owns_its_operation() {
    let fx = Fixture::new(|w| w.with_rows_per_file(10), |c| c.with_max_inline_rows(20));
    fx.warehouse.register("SELECT * FROM big", numbers(100));

    let mut results = fx.session.query("SELECT * FROM big", &[]).unwrap();
    assert_eq!(fx.warehouse.open_runs(), 1);
    assert_eq!(results.fetch_all().unwrap().len(), 100);

    drop(results);

    assert_eq!(fx.warehouse.open_runs(), 0);
    assert_eq!(fx.session.open_handles(), 0);
}
