//! Brokerage capability interface
//!
//! The governance layer only ever talks to a [`Brokerage`]. Which backend is
//! wired in is decided once, from configuration, by [`build_brokerage`];
//! nothing downstream branches on the backend.

pub mod simulated;

pub use simulated::{FaultProfile, SimulatedBroker};

use crate::core::clock::Clock;
use crate::core::errors::BrokerError;
use crate::core::types::Side;
use crossbeam::channel::Receiver;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An order sent to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Our reference (the position id)
    pub client_ref: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub limit_price: Option<Decimal>,
    /// Exit order: may only reduce existing exposure
    pub reduce_only: bool,
}

/// Synchronous answer to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub broker_order_ref: String,
    /// False when the broker took the order but has not acknowledged it yet
    pub acknowledged: bool,
}

/// Broker-side status of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerOrderState {
    PendingAck,
    Working,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrderStatus {
    pub broker_order_ref: String,
    pub client_ref: String,
    pub state: BrokerOrderState,
    pub filled_quantity: Decimal,
}

/// Broker-reported position for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed: positive long, negative short
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Account and session view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub account_id: String,
    /// Changes on every successful connect
    pub session_id: u64,
    pub cash: Decimal,
    /// Orders the broker knows about in this session
    pub orders: Vec<BrokerOrderStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub broker_order_ref: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp_ms: u64,
}

/// Asynchronous broker responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerEvent {
    Acknowledged { broker_order_ref: String },
    Fill(FillEvent),
    Rejected { broker_order_ref: String, reason: String },
    Cancelled { broker_order_ref: String },
}

impl BrokerEvent {
    pub fn broker_order_ref(&self) -> &str {
        match self {
            BrokerEvent::Acknowledged { broker_order_ref }
            | BrokerEvent::Rejected { broker_order_ref, .. }
            | BrokerEvent::Cancelled { broker_order_ref } => broker_order_ref,
            BrokerEvent::Fill(fill) => &fill.broker_order_ref,
        }
    }
}

/// Capabilities the governance layer consumes from a brokerage
///
/// Implementations must be callable from several threads (the supervisor,
/// the lifecycle book and the reconciler each hold a handle).
pub trait Brokerage: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    fn connect(&self) -> Result<(), BrokerError>;

    fn disconnect(&self) -> Result<(), BrokerError>;

    fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError>;

    fn cancel_order(&self, broker_order_ref: &str) -> Result<(), BrokerError>;

    fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    fn get_account(&self) -> Result<AccountState, BrokerError>;

    /// Stream of acks, fills, rejections and cancellations
    fn subscribe_fills(&self) -> Result<Receiver<BrokerEvent>, BrokerError>;
}

/// Backend selection from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    Simulated,
}

impl BrokerMode {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "simulated" => Some(BrokerMode::Simulated),
            _ => None,
        }
    }
}

/// Build the configured backend
pub fn build_brokerage(
    mode: BrokerMode,
    account_id: &str,
    profile: FaultProfile,
    clock: Arc<dyn Clock>,
) -> Arc<dyn Brokerage> {
    match mode {
        BrokerMode::Simulated => Arc::new(SimulatedBroker::new(account_id, profile, clock)),
    }
}
