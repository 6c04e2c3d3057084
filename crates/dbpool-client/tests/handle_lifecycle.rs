//! Connection handle lifecycle tests.
//!
//! These run against the in-memory driver from `dbpool-testing`; no database
//! server is required.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dbpool_client::{
    AdapterKind, ConnectionHandle, ConnectionString, Error, HandleOwner, QueryReactor,
    SessionState,
};
use dbpool_testing::{MockBehavior, MockDriver};
use proptest::prelude::*;

struct TestOwner {
    connection_string: ConnectionString,
    reports: AtomicUsize,
    refuse: AtomicBool,
}

impl TestOwner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connection_string: ConnectionString::new("Server=db;Database=game;Pwd=secret"),
            reports: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    fn reports(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }
}

impl HandleOwner for TestOwner {
    fn connection_string(&self) -> &ConnectionString {
        &self.connection_string
    }

    fn report_done(&self, _handle: &ConnectionHandle) -> bool {
        self.reports.fetch_add(1, Ordering::SeqCst);
        !self.refuse.load(Ordering::SeqCst)
    }
}

fn new_handle(owner: &Arc<TestOwner>, driver: &MockDriver) -> ConnectionHandle {
    let owner: Arc<dyn HandleOwner> = owner.clone();
    ConnectionHandle::new(1, &owner, driver).unwrap()
}

// =============================================================================
// Construction
// =============================================================================

#[test]
fn test_handle_uses_owner_connection_string() {
    let owner = TestOwner::new();
    let driver = MockDriver::new();
    let _handle = new_handle(&owner, &driver);

    assert_eq!(
        driver.connection_strings(),
        vec!["Server=db;Database=game;Pwd=secret"]
    );
}

// =============================================================================
// Checkout cycle
// =============================================================================

#[tokio::test]
async fn test_full_checkout_cycle() {
    let owner = TestOwner::new();
    let driver = MockDriver::new();
    let handle = new_handle(&owner, &driver);

    handle.connect().await.unwrap();
    assert_eq!(handle.connection_state(), SessionState::Open);

    for auto_commit in [true, false, true] {
        handle.prepare(auto_commit).unwrap();
        let adapter = handle.query_reactor().expect("adapter assigned");
        let expected = if auto_commit {
            AdapterKind::AutoCommit
        } else {
            AdapterKind::Transactional
        };
        assert_eq!(adapter.kind(), expected);

        adapter.execute("UPDATE stats SET hits = hits + 1").await.unwrap();
        if let Some(tx) = adapter.as_transactional() {
            tx.commit().await.unwrap();
        }
        drop(adapter);

        handle.report_done();
        assert!(handle.is_available());
    }

    assert_eq!(owner.reports(), 3);
    assert_eq!(driver.sessions()[0].open_count(), 1);
}

#[test]
fn test_refused_return_keeps_adapter() {
    let owner = TestOwner::new();
    let driver = MockDriver::new();
    let handle = new_handle(&owner, &driver);
    handle.prepare(false).unwrap();
    let adapter = handle.query_reactor().unwrap();

    owner.refuse.store(true, Ordering::SeqCst);
    assert!(!handle.report_done());
    assert!(!handle.is_available());
    assert!(Arc::ptr_eq(&handle.query_reactor().unwrap(), &adapter));

    owner.refuse.store(false, Ordering::SeqCst);
    assert!(handle.report_done());
    assert!(handle.is_available());
    assert_eq!(owner.reports(), 2);
}

#[tokio::test]
async fn test_connect_failure_propagates() {
    let owner = TestOwner::new();
    let driver = MockDriver::new();
    driver.set_behavior(MockBehavior::default().fail_open(true));
    let handle = new_handle(&owner, &driver);

    let err = handle.connect().await.unwrap_err();
    assert!(err.is_connection_error());
    assert!(matches!(err, Error::Connect { .. }));
}

#[tokio::test]
async fn test_disconnect_after_failure_does_not_error() {
    let owner = TestOwner::new();
    let driver = MockDriver::new();
    driver.set_behavior(MockBehavior::default().fail_close(true));
    let handle = new_handle(&owner, &driver);

    handle.connect().await.unwrap();
    driver.sessions()[0].break_session();
    handle.disconnect().await;
    handle.disconnect().await;
    assert_eq!(handle.connection_state(), SessionState::Broken);
}

// =============================================================================
// Availability invariant
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Prepare(bool),
    Dispose,
    ReportDone,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<bool>().prop_map(Op::Prepare),
        Just(Op::Dispose),
        Just(Op::ReportDone),
    ]
}

proptest! {
    #[test]
    fn prop_available_iff_no_adapter(ops in proptest::collection::vec(op(), 1..40)) {
        let owner = TestOwner::new();
        let driver = MockDriver::new();
        let handle = new_handle(&owner, &driver);
        let mut assigned = false;
        let mut expected_reports = 0;

        for op in ops {
            match op {
                Op::Prepare(auto_commit) => {
                    let result = handle.prepare(auto_commit);
                    prop_assert_eq!(result.is_ok(), !assigned);
                    assigned = true;
                }
                Op::Dispose => {
                    handle.dispose();
                    assigned = false;
                }
                Op::ReportDone => {
                    handle.report_done();
                    expected_reports += 1;
                    assigned = false;
                }
            }

            prop_assert_eq!(handle.is_available(), !assigned);
            prop_assert_eq!(handle.query_reactor().is_none(), handle.is_available());
        }

        prop_assert_eq!(owner.reports(), expected_reports);
    }
}
