//! Fault-injecting brokerage double
//!
//! Satisfies the same [`Brokerage`] contract as a production gateway, with a
//! seeded RNG driving fill, partial-fill, rejection, acknowledgment and
//! latency behavior. Test controls simulate crashes, panicking connectors,
//! identity changes and drifted broker truth.

use super::{
    AccountState, BrokerEvent, BrokerOrderState, BrokerOrderStatus, BrokerPosition, Brokerage,
    FillEvent, OrderAck, OrderRequest,
};
use crate::core::clock::Clock;
use crate::core::errors::BrokerError;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default mark when no price has been set for a symbol
const DEFAULT_MARK: Decimal = Decimal::ONE_HUNDRED;

/// Configuration for simulated broker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct FaultProfile {
    /// Probability an acknowledged order fills at all (0.0 to 1.0)
    pub fill_probability: f64,
    /// Probability a fill is partial rather than complete
    pub partial_fill_probability: f64,
    /// Probability a submission is rejected outright
    pub rejection_probability: f64,
    /// Probability a submission is acknowledged (otherwise it goes silent)
    pub ack_probability: f64,
    /// Uniform per-call latency range, real milliseconds
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    pub seed: u64,
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self {
            fill_probability: 0.9,
            partial_fill_probability: 0.2,
            rejection_probability: 0.02,
            ack_probability: 0.98,
            latency_min_ms: 0,
            latency_max_ms: 5,
            seed: 42,
        }
    }
}

impl FaultProfile {
    /// Every order acknowledged and filled in full, no latency
    pub fn perfect() -> Self {
        Self {
            fill_probability: 1.0,
            partial_fill_probability: 0.0,
            rejection_probability: 0.0,
            ack_probability: 1.0,
            latency_min_ms: 0,
            latency_max_ms: 0,
            seed: 7,
        }
    }

    /// Orders accepted but never acknowledged (stall scenarios)
    pub fn silent() -> Self {
        Self {
            ack_probability: 0.0,
            ..Self::perfect()
        }
    }

    /// Hostile venue for stress runs
    pub fn hostile() -> Self {
        Self {
            fill_probability: 0.5,
            partial_fill_probability: 0.5,
            rejection_probability: 0.2,
            ack_probability: 0.8,
            latency_min_ms: 1,
            latency_max_ms: 20,
            seed: 1337,
        }
    }
}

#[derive(Debug, Clone)]
struct SimOrder {
    request: OrderRequest,
    state: BrokerOrderState,
    filled: Decimal,
}

#[derive(Debug, Clone, Default)]
struct SimPosition {
    quantity: Decimal,
    avg_price: Decimal,
}

struct SimState {
    rng: StdRng,
    account_id: String,
    session_id: u64,
    cash: Decimal,
    orders: HashMap<String, SimOrder>,
    positions: HashMap<String, SimPosition>,
    marks: HashMap<String, Decimal>,
    positions_override: Option<Vec<BrokerPosition>>,
    subscribers: Vec<Sender<BrokerEvent>>,
    failing_connects: u32,
}

/// In-process brokerage double
pub struct SimulatedBroker {
    profile: FaultProfile,
    clock: Arc<dyn Clock>,
    connected: AtomicBool,
    crashed: AtomicBool,
    panic_on_call: AtomicBool,
    submitted: AtomicU64,
    next_order: AtomicU64,
    state: Mutex<SimState>,
}

impl SimulatedBroker {
    pub fn new(account_id: &str, profile: FaultProfile, clock: Arc<dyn Clock>) -> Self {
        info!(
            "Simulated broker for account {} (fill={:.2} partial={:.2} reject={:.2} ack={:.2})",
            account_id,
            profile.fill_probability,
            profile.partial_fill_probability,
            profile.rejection_probability,
            profile.ack_probability
        );
        Self {
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(profile.seed),
                account_id: account_id.to_string(),
                session_id: 0,
                cash: Decimal::from(1_000_000),
                orders: HashMap::new(),
                positions: HashMap::new(),
                marks: HashMap::new(),
                positions_override: None,
                subscribers: Vec::new(),
                failing_connects: 0,
            }),
            profile,
            clock,
            connected: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
            panic_on_call: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            next_order: AtomicU64::new(1),
        }
    }

    // ------------------------------------------------------------------
    // Test controls
    // ------------------------------------------------------------------

    /// Kill the connector: every call fails with `Disconnected` until `restore`
    pub fn crash(&self) {
        warn!("Simulated broker crashed");
        self.crashed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make every call panic (a connector bug) until cleared
    pub fn panic_on_call(&self, enabled: bool) {
        self.panic_on_call.store(enabled, Ordering::SeqCst);
    }

    /// Undo `crash` and `panic_on_call`; a fresh `connect` is still required
    pub fn restore(&self) {
        info!("Simulated broker restored");
        self.crashed.store(false, Ordering::SeqCst);
        self.panic_on_call.store(false, Ordering::SeqCst);
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().failing_connects = n;
    }

    /// Change the identity reported by `get_account`
    pub fn set_account_id(&self, account_id: &str) {
        self.state.lock().account_id = account_id.to_string();
    }

    /// Replace broker-reported positions (drift injection); `None` restores
    pub fn override_positions(&self, positions: Option<Vec<BrokerPosition>>) {
        self.state.lock().positions_override = positions;
    }

    /// Force the broker-side state of an order
    pub fn override_order_status(&self, broker_order_ref: &str, state: BrokerOrderState) {
        if let Some(order) = self.state.lock().orders.get_mut(broker_order_ref) {
            order.state = state;
        }
    }

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().marks.insert(symbol.to_string(), price);
    }

    /// Deliver a fill for a known order (simulating a late broker response)
    pub fn emit_fill(&self, broker_order_ref: &str, quantity: Decimal, price: Decimal) {
        let mut state = self.state.lock();
        self.fill_locked(&mut state, broker_order_ref, quantity, price);
    }

    /// Deliver a late acknowledgment
    pub fn emit_ack(&self, broker_order_ref: &str) {
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(broker_order_ref) {
            if order.state == BrokerOrderState::PendingAck {
                order.state = BrokerOrderState::Working;
            }
        }
        Self::publish(
            &mut state,
            BrokerEvent::Acknowledged {
                broker_order_ref: broker_order_ref.to_string(),
            },
        );
    }

    /// Orders that reached the broker's submit path
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn enter(&self) -> Result<(), BrokerError> {
        if self.panic_on_call.load(Ordering::SeqCst) {
            panic!("simulated connector crash");
        }
        if self.crashed.load(Ordering::SeqCst) || !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected);
        }
        self.simulate_latency();
        Ok(())
    }

    fn simulate_latency(&self) {
        let (lo, hi) = (self.profile.latency_min_ms, self.profile.latency_max_ms);
        if hi == 0 {
            return;
        }
        let ms = if hi > lo {
            self.state.lock().rng.gen_range(lo..=hi)
        } else {
            lo
        };
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    fn roll(state: &mut SimState, probability: f64) -> bool {
        probability >= 1.0 || (probability > 0.0 && state.rng.gen_bool(probability))
    }

    fn publish(state: &mut SimState, event: BrokerEvent) {
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn mark(state: &SimState, symbol: &str) -> Decimal {
        state.marks.get(symbol).copied().unwrap_or(DEFAULT_MARK)
    }

    fn fill_locked(&self, state: &mut SimState, broker_order_ref: &str, quantity: Decimal, price: Decimal) {
        let Some(order) = state.orders.get_mut(broker_order_ref) else {
            warn!("Simulated fill for unknown order {}", broker_order_ref);
            return;
        };
        let remaining = order.request.quantity - order.filled;
        let quantity = quantity.min(remaining);
        if quantity <= Decimal::ZERO {
            return;
        }
        order.filled += quantity;
        order.state = if order.filled >= order.request.quantity {
            BrokerOrderState::Filled
        } else {
            BrokerOrderState::PartiallyFilled
        };
        let symbol = order.request.symbol.clone();
        let signed = quantity * Decimal::from(order.request.side.sign());

        let position = state.positions.entry(symbol).or_default();
        let new_qty = position.quantity + signed;
        if position.quantity.is_zero() || position.quantity.is_sign_positive() == signed.is_sign_positive() {
            let notional = position.avg_price * position.quantity.abs() + price * quantity;
            if !new_qty.is_zero() {
                position.avg_price = notional / new_qty.abs();
            }
        } else if new_qty.is_zero() || new_qty.is_sign_positive() != position.quantity.is_sign_positive() {
            position.avg_price = price;
        }
        position.quantity = new_qty;
        state.cash -= signed * price;

        debug!("Simulated fill {} x {} @ {}", broker_order_ref, quantity, price);
        Self::publish(
            state,
            BrokerEvent::Fill(FillEvent {
                broker_order_ref: broker_order_ref.to_string(),
                quantity,
                price,
                timestamp_ms: self.clock.wall_millis(),
            }),
        );
    }
}

impl Brokerage for SimulatedBroker {
    fn name(&self) -> &str {
        "simulated"
    }

    fn connect(&self) -> Result<(), BrokerError> {
        if self.panic_on_call.load(Ordering::SeqCst) {
            panic!("simulated connector crash during connect");
        }
        if self.crashed.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected);
        }
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Timeout(5_000));
        }
        state.session_id += 1;
        self.connected.store(true, Ordering::SeqCst);
        info!("Simulated broker connected (session {})", state.session_id);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, BrokerError> {
        self.enter()?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let broker_order_ref = format!("SIM-{}", self.next_order.fetch_add(1, Ordering::SeqCst));

        let mut state = self.state.lock();
        if Self::roll(&mut state, self.profile.rejection_probability) {
            state.orders.insert(
                broker_order_ref.clone(),
                SimOrder {
                    request: order.clone(),
                    state: BrokerOrderState::Rejected,
                    filled: Decimal::ZERO,
                },
            );
            return Err(BrokerError::Rejected("simulated rejection".to_string()));
        }

        let acknowledged = Self::roll(&mut state, self.profile.ack_probability);
        state.orders.insert(
            broker_order_ref.clone(),
            SimOrder {
                request: order.clone(),
                state: if acknowledged {
                    BrokerOrderState::Working
                } else {
                    BrokerOrderState::PendingAck
                },
                filled: Decimal::ZERO,
            },
        );
        if !acknowledged {
            debug!("Simulated broker silent on {}", broker_order_ref);
            return Ok(OrderAck {
                broker_order_ref,
                acknowledged: false,
            });
        }

        Self::publish(
            &mut state,
            BrokerEvent::Acknowledged {
                broker_order_ref: broker_order_ref.clone(),
            },
        );

        if Self::roll(&mut state, self.profile.fill_probability) {
            let price = order
                .limit_price
                .unwrap_or_else(|| Self::mark(&state, &order.symbol));
            let quantity = if Self::roll(&mut state, self.profile.partial_fill_probability) {
                let fraction = Decimal::from_f64(state.rng.gen_range(0.1..0.9))
                    .unwrap_or(Decimal::ONE)
                    .round_dp(2);
                (order.quantity * fraction).round_dp(4).max(Decimal::new(1, 4))
            } else {
                order.quantity
            };
            self.fill_locked(&mut state, &broker_order_ref, quantity, price);
        }

        Ok(OrderAck {
            broker_order_ref,
            acknowledged: true,
        })
    }

    fn cancel_order(&self, broker_order_ref: &str) -> Result<(), BrokerError> {
        self.enter()?;
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(broker_order_ref)
            .ok_or_else(|| BrokerError::UnknownOrder(broker_order_ref.to_string()))?;
        match order.state {
            BrokerOrderState::Filled | BrokerOrderState::Rejected => {
                Err(BrokerError::Rejected(format!("order {broker_order_ref} is final")))
            }
            _ => {
                order.state = BrokerOrderState::Cancelled;
                Self::publish(
                    &mut state,
                    BrokerEvent::Cancelled {
                        broker_order_ref: broker_order_ref.to_string(),
                    },
                );
                Ok(())
            }
        }
    }

    fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.enter()?;
        let state = self.state.lock();
        if let Some(positions) = &state.positions_override {
            return Ok(positions.clone());
        }
        let mut positions: Vec<BrokerPosition> = state
            .positions
            .iter()
            .filter(|(_, p)| !p.quantity.is_zero())
            .map(|(symbol, p)| {
                let mark = Self::mark(&state, symbol);
                BrokerPosition {
                    symbol: symbol.clone(),
                    quantity: p.quantity,
                    avg_price: p.avg_price,
                    mark_price: mark,
                    unrealized_pnl: (mark - p.avg_price) * p.quantity,
                }
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    fn get_account(&self) -> Result<AccountState, BrokerError> {
        self.enter()?;
        let state = self.state.lock();
        let mut orders: Vec<BrokerOrderStatus> = state
            .orders
            .iter()
            .map(|(r, o)| BrokerOrderStatus {
                broker_order_ref: r.clone(),
                client_ref: o.request.client_ref.clone(),
                state: o.state,
                filled_quantity: o.filled,
            })
            .collect();
        orders.sort_by(|a, b| a.broker_order_ref.cmp(&b.broker_order_ref));
        Ok(AccountState {
            account_id: state.account_id.clone(),
            session_id: state.session_id,
            cash: state.cash,
            orders,
        })
    }

    fn subscribe_fills(&self) -> Result<Receiver<BrokerEvent>, BrokerError> {
        let (tx, rx) = unbounded();
        self.state.lock().subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::types::Side;
    use rust_decimal_macros::dec;

    fn order(qty: Decimal) -> OrderRequest {
        OrderRequest {
            client_ref: "P-1".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            quantity: qty,
            limit_price: Some(dec!(190)),
            reduce_only: false,
        }
    }

    fn connected(profile: FaultProfile) -> SimulatedBroker {
        let broker = SimulatedBroker::new("DU123", profile, ManualClock::shared());
        broker.connect().unwrap();
        broker
    }

    #[test]
    fn test_perfect_profile_fills_in_full() {
        let broker = connected(FaultProfile::perfect());
        let events = broker.subscribe_fills().unwrap();

        let ack = broker.submit_order(&order(dec!(10))).unwrap();
        assert!(ack.acknowledged);
        assert_eq!(events.try_recv().unwrap(), BrokerEvent::Acknowledged {
            broker_order_ref: ack.broker_order_ref.clone()
        });
        match events.try_recv().unwrap() {
            BrokerEvent::Fill(fill) => assert_eq!(fill.quantity, dec!(10)),
            other => panic!("expected fill, got {other:?}"),
        }

        let positions = broker.get_positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(10));
        assert_eq!(positions[0].avg_price, dec!(190));
    }

    #[test]
    fn test_silent_profile_never_acks() {
        let broker = connected(FaultProfile::silent());
        let events = broker.subscribe_fills().unwrap();
        let ack = broker.submit_order(&order(dec!(1))).unwrap();
        assert!(!ack.acknowledged);
        assert!(events.try_recv().is_err());

        let account = broker.get_account().unwrap();
        assert_eq!(account.orders[0].state, BrokerOrderState::PendingAck);
    }

    #[test]
    fn test_crash_and_restore() {
        let broker = connected(FaultProfile::perfect());
        broker.crash();
        assert_eq!(broker.get_account().unwrap_err(), BrokerError::Disconnected);
        assert_eq!(broker.connect().unwrap_err(), BrokerError::Disconnected);

        broker.restore();
        broker.connect().unwrap();
        let account = broker.get_account().unwrap();
        assert_eq!(account.account_id, "DU123");
        assert_eq!(account.session_id, 2);
    }

    #[test]
    fn test_panic_on_call() {
        let broker = connected(FaultProfile::perfect());
        broker.panic_on_call(true);
        let result = crate::resilience::panic::contain(|| broker.get_account());
        assert!(result.is_err());
    }

    #[test]
    fn test_seeded_runs_are_deterministic() {
        let run = || {
            let broker = connected(FaultProfile {
                latency_max_ms: 0,
                ..FaultProfile::hostile()
            });
            (0..50)
                .map(|_| broker.submit_order(&order(dec!(3))).is_ok())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_override_positions() {
        let broker = connected(FaultProfile::perfect());
        broker.override_positions(Some(vec![]));
        broker.submit_order(&order(dec!(5))).unwrap();
        assert!(broker.get_positions().unwrap().is_empty());
        broker.override_positions(None);
        assert_eq!(broker.get_positions().unwrap().len(), 1);
    }
}
