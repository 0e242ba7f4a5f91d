//! Exhaustive transition table and the book's single chokepoint

use phoenix_core::audit::{AuditQuery, AuditRecordType};
use phoenix_core::core::position_fsm::{is_declared, TRANSITIONS};
use phoenix_core::core::{LifecycleError, Position, PositionId, PositionState, Side};
use phoenix_core::broker::Brokerage;
use phoenix_core::testing::Harness;
use rust_decimal_macros::dec;

fn position_in(state: PositionState) -> Position {
    let mut p = Position::new(PositionId(1), "AAPL", Side::Buy, dec!(10), Some(dec!(100)));
    p.state = state;
    p
}

#[test]
fn test_every_pair_against_declared_table() {
    let mut accepted = 0;
    for from in PositionState::ALL {
        for to in PositionState::ALL {
            let mut p = position_in(from);
            let result = p.apply(to, 1_700_000_000_000, "table");
            let declared = TRANSITIONS.contains(&(from, to));
            assert_eq!(result.is_ok(), declared, "{from} -> {to}");
            assert_eq!(is_declared(from, to), declared);

            if declared {
                accepted += 1;
                assert_eq!(p.state, to);
                assert_eq!(p.history.len(), 1);
                assert_eq!(p.history[0].from, from);
                assert_eq!(p.history[0].cause, "table");
            } else {
                assert_eq!(p.state, from);
                assert!(p.history.is_empty());
            }
        }
    }
    assert_eq!(accepted, 11);
}

#[test]
fn test_terminal_states_have_no_exits() {
    for from in PositionState::ALL.into_iter().filter(|s| s.is_terminal()) {
        for to in PositionState::ALL {
            assert!(!is_declared(from, to), "{from} -> {to}");
        }
    }
}

#[test]
fn test_undeclared_request_is_audited_and_refused() {
    let h = Harness::new();
    h.connect().unwrap();
    let id = h.approved("AAPL", Side::Buy, dec!(10)).unwrap();

    let err = h
        .book
        .attempt_transition(id, PositionState::Managed, "skip ahead")
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition(_)));
    assert_eq!(h.state_of(id), Some(PositionState::Approved));

    let rejected = h
        .audit
        .query(&AuditQuery::of_type(AuditRecordType::PositionTransitionRejected));
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].payload["from"], "APPROVED");
    assert_eq!(rejected[0].payload["to"], "MANAGED");
}

#[test]
fn test_archived_position_refuses_transitions() {
    let h = Harness::new();
    let id = h.approved("AAPL", Side::Buy, dec!(10)).unwrap();
    h.book.cancel(id, "operator withdrew").unwrap();

    assert_eq!(h.state_of(id), Some(PositionState::Cancelled));
    assert_eq!(h.book.archive().len(), 1);
    assert!(h.book.positions().is_empty());

    assert!(h.book.approve(id, "again").is_err());
    assert_eq!(h.audit_count(AuditRecordType::PositionTransitionRejected), 1);
}

#[test]
fn test_full_path_to_closed() {
    let h = Harness::new();
    h.connect().unwrap();
    let fills = h.broker.subscribe_fills().unwrap();

    let id = h.approved("AAPL", Side::Buy, dec!(10)).unwrap();
    h.book.submit(id).unwrap();
    while let Ok(event) = fills.try_recv() {
        h.book.on_event(&event).unwrap();
    }
    assert_eq!(h.state_of(id), Some(PositionState::Managed));

    h.book.close(id, "take profit").unwrap();
    assert_eq!(h.state_of(id), Some(PositionState::Managed));
    while let Ok(event) = fills.try_recv() {
        h.book.on_event(&event).unwrap();
    }
    let closed = h.book.get(id).unwrap();
    assert_eq!(closed.state, PositionState::Closed);
    assert_eq!(closed.filled_quantity, dec!(10));

    let path: Vec<PositionState> = closed.history.iter().map(|e| e.to).collect();
    assert_eq!(
        path,
        vec![
            PositionState::Approved,
            PositionState::Submitted,
            PositionState::Filled,
            PositionState::Managed,
            PositionState::Closed,
        ]
    );
    // PROPOSED plus five transitions
    assert_eq!(h.audit_count(AuditRecordType::PositionTransition), 6);
}
