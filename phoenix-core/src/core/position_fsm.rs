//! Position lifecycle state machine
//!
//! Nine states and an explicit transition table. Every transition is checked
//! against [`is_declared`] before anything is mutated; an undeclared pair
//! returns [`TransitionError`] and leaves the position untouched.
//!
//! # State Diagram
//!
//! ```text
//!   PROPOSED ──▶ APPROVED ──▶ SUBMITTED ──┬──▶ FILLED ──▶ MANAGED ──▶ CLOSED
//!      │            │                      │      ▲
//!      │            │                      ├──▶ STALLED ──▶ CANCELLED
//!      │            │                      │
//!      │            │                      └──▶ REJECTED
//!      └────────────┴──────────────────────────────────────▶ CANCELLED
//! ```
//!
//! CLOSED, CANCELLED and REJECTED are terminal.

use super::errors::TransitionError;
use super::types::{ActionKind, PositionId, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Lifecycle state of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Proposed,
    Approved,
    Submitted,
    Stalled,
    Filled,
    Managed,
    Closed,
    Cancelled,
    Rejected,
}

impl PositionState {
    /// Every state, in declaration order
    pub const ALL: [PositionState; 9] = [
        PositionState::Proposed,
        PositionState::Approved,
        PositionState::Submitted,
        PositionState::Stalled,
        PositionState::Filled,
        PositionState::Managed,
        PositionState::Closed,
        PositionState::Cancelled,
        PositionState::Rejected,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionState::Closed | PositionState::Cancelled | PositionState::Rejected
        )
    }

    /// Open = holds or may hold exposure at the broker
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            PositionState::Submitted
                | PositionState::Stalled
                | PositionState::Filled
                | PositionState::Managed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Proposed => "PROPOSED",
            PositionState::Approved => "APPROVED",
            PositionState::Submitted => "SUBMITTED",
            PositionState::Stalled => "STALLED",
            PositionState::Filled => "FILLED",
            PositionState::Managed => "MANAGED",
            PositionState::Closed => "CLOSED",
            PositionState::Cancelled => "CANCELLED",
            PositionState::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The declared transition table
pub const TRANSITIONS: [(PositionState, PositionState); 11] = {
    use PositionState::*;
    [
        (Proposed, Approved),
        (Proposed, Cancelled),
        (Approved, Submitted),
        (Approved, Cancelled),
        (Submitted, Filled),
        (Submitted, Stalled),
        (Submitted, Rejected),
        (Stalled, Cancelled),
        (Stalled, Filled),
        (Filled, Managed),
        (Managed, Closed),
    ]
};

/// Whether `from -> to` is in the declared table
pub fn is_declared(from: PositionState, to: PositionState) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

/// How a declared transition is treated by tier and halt gating
pub fn action_kind(from: PositionState, to: PositionState) -> ActionKind {
    use PositionState::*;
    match (from, to) {
        (Approved, Submitted) => ActionKind::CapitalCommitting,
        (Managed, Closed) | (_, Cancelled) => ActionKind::RiskReducing,
        _ => ActionKind::Bookkeeping,
    }
}

/// One entry of a position's transition history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEntry {
    pub from: PositionState,
    pub to: PositionState,
    /// Wall-clock milliseconds since the Unix epoch
    pub at_ms: u64,
    pub cause: String,
}

/// A position tracked from proposal to archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub side: Side,
    pub state: PositionState,
    pub broker_order_ref: Option<String>,
    pub exit_order_ref: Option<String>,
    /// Quantity filled on the working exit order
    #[serde(default)]
    pub exit_filled_quantity: Decimal,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub limit_price: Option<Decimal>,
    /// Volume-weighted average fill price
    pub avg_fill_price: Option<Decimal>,
    pub acknowledged: bool,
    pub history: Vec<TransitionEntry>,
    #[serde(skip)]
    pub submitted_at: Option<Instant>,
}

impl Position {
    /// A new position in PROPOSED
    pub fn new(
        id: PositionId,
        symbol: impl Into<String>,
        side: Side,
        requested_quantity: Decimal,
        limit_price: Option<Decimal>,
    ) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            side,
            state: PositionState::Proposed,
            broker_order_ref: None,
            exit_order_ref: None,
            exit_filled_quantity: Decimal::ZERO,
            requested_quantity,
            filled_quantity: Decimal::ZERO,
            limit_price,
            avg_fill_price: None,
            acknowledged: false,
            history: Vec::new(),
            submitted_at: None,
        }
    }

    /// Move to `to` if the pair is declared; otherwise leave `self` unchanged
    pub fn apply(
        &mut self,
        to: PositionState,
        at_ms: u64,
        cause: impl Into<String>,
    ) -> Result<&TransitionEntry, TransitionError> {
        let from = self.state;
        if !is_declared(from, to) {
            return Err(TransitionError { from, to });
        }
        self.state = to;
        self.history.push(TransitionEntry {
            from,
            to,
            at_ms,
            cause: cause.into(),
        });
        // push above guarantees a last element
        Ok(&self.history[self.history.len() - 1])
    }

    pub fn remaining_quantity(&self) -> Decimal {
        (self.requested_quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.requested_quantity
    }

    /// Record a fill against this position, updating the average price
    ///
    /// Does not change `state`; the book decides when to transition.
    pub fn add_fill(&mut self, quantity: Decimal, price: Decimal) {
        let prior_notional = self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_quantity;
        let total = self.filled_quantity + quantity;
        if total > Decimal::ZERO {
            self.avg_fill_price = Some((prior_notional + price * quantity) / total);
        }
        self.filled_quantity = total;
    }

    /// Net signed quantity currently held (positive long, negative short)
    pub fn signed_exposure(&self) -> Decimal {
        match self.state {
            PositionState::Closed | PositionState::Cancelled | PositionState::Rejected => {
                Decimal::ZERO
            }
            _ => self.filled_quantity * Decimal::from(self.side.sign()),
        }
    }
}
