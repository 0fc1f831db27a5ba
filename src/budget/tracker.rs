//! Hourly node/request budget tracking and enforcement.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::config::BudgetConfig;
use super::parser::RateLimitSnapshot;

/// Amount of rate-limit budget consumed (or expected to be consumed) by a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cost {
    /// Graph nodes returned.
    pub nodes: u64,
    /// Requests issued.
    pub requests: u64,
}

impl Cost {
    pub const ZERO: Cost = Cost {
        nodes: 0,
        requests: 0,
    };

    pub fn new(nodes: u64, requests: u64) -> Self {
        Self { nodes, requests }
    }

    /// Cost of one request returning `nodes` nodes.
    pub fn single_request(nodes: u64) -> Self {
        Self { nodes, requests: 1 }
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost {
            nodes: self.nodes.saturating_add(rhs.nodes),
            requests: self.requests.saturating_add(rhs.requests),
        }
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} nodes / {} requests", self.nodes, self.requests)
    }
}

/// Snapshot of the current rate-limit window.
///
/// Owned by [`BudgetTracker`]; everything else only ever sees copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetWindow {
    pub window_start_time: DateTime<Utc>,
    pub nodes_consumed: u64,
    pub node_cap: u64,
    pub requests_consumed: u64,
    pub request_cap: u64,
    /// Allowance held by outstanding reservations.
    pub reserved: Cost,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl BudgetWindow {
    /// Nodes still available after consumption and outstanding reservations.
    pub fn nodes_remaining(&self) -> u64 {
        self.node_cap
            .saturating_sub(self.nodes_consumed)
            .saturating_sub(self.reserved.nodes)
    }

    /// Requests still available after consumption and outstanding reservations.
    pub fn requests_remaining(&self) -> u64 {
        self.request_cap
            .saturating_sub(self.requests_consumed)
            .saturating_sub(self.reserved.requests)
    }

    /// Wall-clock time at which this window resets.
    pub fn resets_at(&self) -> DateTime<Utc> {
        self.window_start_time + chrono::Duration::seconds(self.window_secs as i64)
    }

    /// Whether `cost` fits in what is left of this window.
    pub fn can_afford(&self, cost: Cost) -> bool {
        cost.nodes <= self.nodes_remaining() && cost.requests <= self.requests_remaining()
    }

    /// Fraction of the node cap already consumed.
    pub fn node_usage_percent(&self) -> f64 {
        if self.node_cap == 0 {
            return 1.0;
        }
        self.nodes_consumed as f64 / self.node_cap as f64
    }
}

/// Allowance held between [`BudgetTracker::reserve`] and a matching
/// [`BudgetTracker::commit`] or [`BudgetTracker::release`].
///
/// Not `Clone`: a reservation can be settled exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    cost: Cost,
    window_start: DateTime<Utc>,
}

impl Reservation {
    /// The reserved (estimated) cost.
    pub fn cost(&self) -> Cost {
        self.cost
    }
}

/// Result of asking the tracker for budget.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// The estimate fits; the allowance is held until committed or released.
    Admitted(Reservation),
    /// The estimate does not fit in the current window.
    Deferred {
        /// When the current window resets.
        retry_after: DateTime<Utc>,
    },
}

/// Tracks node and request consumption for one credential.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
    clock: Arc<dyn Clock>,
    window_start_time: DateTime<Utc>,
    nodes_consumed: u64,
    requests_consumed: u64,
    reserved: Cost,
    last_observed: Option<RateLimitSnapshot>,
}

impl BudgetTracker {
    /// Create a tracker using the system clock. The first window starts now.
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a tracker with an injected clock.
    pub fn with_clock(config: BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let window_start_time = clock.now();
        Self {
            config,
            clock,
            window_start_time,
            nodes_consumed: 0,
            requests_consumed: 0,
            reserved: Cost::ZERO,
            last_observed: None,
        }
    }

    /// Try to hold `estimate` against the current window.
    ///
    /// Fails closed: anything that does not fit in full is deferred until the
    /// window resets.
    pub fn reserve(&mut self, estimate: Cost) -> Admission {
        self.roll_window();
        let window = self.snapshot();

        if !window.can_afford(estimate) {
            debug!(
                estimate = %estimate,
                nodes_remaining = window.nodes_remaining(),
                requests_remaining = window.requests_remaining(),
                "budget reservation deferred"
            );
            return Admission::Deferred {
                retry_after: window.resets_at(),
            };
        }

        self.reserved += estimate;
        Admission::Admitted(Reservation {
            cost: estimate,
            window_start: self.window_start_time,
        })
    }

    /// Settle a reservation with the cost the API actually reported.
    pub fn commit(&mut self, reservation: Reservation, actual: Cost) {
        self.roll_window();
        self.drop_reservation(&reservation);
        self.nodes_consumed = self.nodes_consumed.saturating_add(actual.nodes);
        self.requests_consumed = self.requests_consumed.saturating_add(actual.requests);
        debug!(
            estimated = %reservation.cost,
            actual = %actual,
            nodes_consumed = self.nodes_consumed,
            "budget committed"
        );
    }

    /// Return a reservation's allowance without consuming anything.
    pub fn release(&mut self, reservation: Reservation) {
        self.roll_window();
        self.drop_reservation(&reservation);
    }

    /// Current window, after applying any pending reset.
    pub fn remaining(&mut self) -> BudgetWindow {
        self.roll_window();
        self.snapshot()
    }

    /// Record the server's own view of the rate limit.
    ///
    /// Kept for reporting only; local accounting stays authoritative.
    pub fn observe(&mut self, snapshot: RateLimitSnapshot) {
        self.last_observed = Some(snapshot);
    }

    /// Last rate-limit snapshot reported by the server, if any.
    pub fn last_observed(&self) -> Option<&RateLimitSnapshot> {
        self.last_observed.as_ref()
    }

    /// Get the configuration.
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn snapshot(&self) -> BudgetWindow {
        BudgetWindow {
            window_start_time: self.window_start_time,
            nodes_consumed: self.nodes_consumed,
            node_cap: self.config.node_cap,
            requests_consumed: self.requests_consumed,
            request_cap: self.config.request_cap,
            reserved: self.reserved,
            window_secs: self.config.window_secs.max(1),
        }
    }

    fn drop_reservation(&mut self, reservation: &Reservation) {
        // Reservations from an earlier window were wiped by the reset.
        if reservation.window_start != self.window_start_time {
            return;
        }
        self.reserved = Cost {
            nodes: self.reserved.nodes.saturating_sub(reservation.cost.nodes),
            requests: self
                .reserved
                .requests
                .saturating_sub(reservation.cost.requests),
        };
    }

    /// Advance the window start in whole-window steps once a window has elapsed.
    fn roll_window(&mut self) {
        let now = self.clock.now();
        let length = self.config.window_chrono();
        let elapsed = now - self.window_start_time;
        if elapsed < length {
            return;
        }

        let periods = elapsed.num_seconds() / length.num_seconds();
        let previous = self.window_start_time;
        self.window_start_time += chrono::Duration::seconds(length.num_seconds() * periods);
        self.nodes_consumed = 0;
        self.requests_consumed = 0;
        self.reserved = Cost::ZERO;
        debug!(
            previous = %previous,
            window_start = %self.window_start_time,
            "budget window reset"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn tracker(node_cap: u64, request_cap: u64) -> (BudgetTracker, ManualClock) {
        let clock = ManualClock::new(start());
        let config = BudgetConfig::new()
            .with_node_cap(node_cap)
            .with_request_cap(request_cap);
        (
            BudgetTracker::with_clock(config, Arc::new(clock.clone())),
            clock,
        )
    }

    fn admitted(admission: Admission) -> Reservation {
        match admission {
            Admission::Admitted(reservation) => reservation,
            Admission::Deferred { retry_after } => {
                panic!("expected admission, deferred until {}", retry_after)
            }
        }
    }

    #[test]
    fn test_cost_addition_saturates() {
        let total = Cost::new(u64::MAX, 1) + Cost::new(5, 2);
        assert_eq!(total, Cost::new(u64::MAX, 3));
    }

    #[test]
    fn test_reserve_within_budget() {
        let (mut tracker, _) = tracker(10, 5);

        let reservation = admitted(tracker.reserve(Cost::new(4, 1)));
        assert_eq!(reservation.cost(), Cost::new(4, 1));

        let window = tracker.remaining();
        assert_eq!(window.nodes_remaining(), 6);
        assert_eq!(window.requests_remaining(), 4);
        assert_eq!(window.nodes_consumed, 0);
    }

    #[test]
    fn test_reserve_fails_closed_on_nodes() {
        let (mut tracker, _) = tracker(10, 5);
        let _held = admitted(tracker.reserve(Cost::new(8, 1)));

        let admission = tracker.reserve(Cost::new(3, 1));
        assert_eq!(
            admission,
            Admission::Deferred {
                retry_after: start() + Duration::hours(1)
            }
        );
    }

    #[test]
    fn test_reserve_fails_closed_on_requests() {
        let (mut tracker, _) = tracker(1_000, 1);
        let first = admitted(tracker.reserve(Cost::single_request(1)));
        tracker.commit(first, Cost::single_request(1));

        assert!(matches!(
            tracker.reserve(Cost::single_request(1)),
            Admission::Deferred { .. }
        ));
    }

    #[test]
    fn test_commit_applies_actual_cost() {
        let (mut tracker, _) = tracker(10, 5);
        let reservation = admitted(tracker.reserve(Cost::new(5, 1)));

        tracker.commit(reservation, Cost::new(2, 1));

        let window = tracker.remaining();
        assert_eq!(window.nodes_consumed, 2);
        assert_eq!(window.requests_consumed, 1);
        assert_eq!(window.reserved, Cost::ZERO);
        assert_eq!(window.nodes_remaining(), 8);
    }

    #[test]
    fn test_release_restores_reserved_budget() {
        let (mut tracker, _) = tracker(10, 5);
        let reservation = admitted(tracker.reserve(Cost::new(10, 1)));
        assert_eq!(tracker.remaining().nodes_remaining(), 0);

        tracker.release(reservation);

        let window = tracker.remaining();
        assert_eq!(window.nodes_remaining(), 10);
        assert_eq!(window.nodes_consumed, 0);
        assert!(matches!(
            tracker.reserve(Cost::new(10, 1)),
            Admission::Admitted(_)
        ));
    }

    #[test]
    fn test_window_resets_in_exact_hour_steps() {
        let (mut tracker, clock) = tracker(10, 5);
        let reservation = admitted(tracker.reserve(Cost::new(10, 1)));
        tracker.commit(reservation, Cost::new(10, 1));

        clock.advance(Duration::minutes(61));
        let window = tracker.remaining();

        assert_eq!(window.window_start_time, start() + Duration::hours(1));
        assert_eq!(window.nodes_consumed, 0);
        assert_eq!(window.requests_consumed, 0);
        assert_eq!(window.resets_at(), start() + Duration::hours(2));
    }

    #[test]
    fn test_window_does_not_reset_early() {
        let (mut tracker, clock) = tracker(10, 5);
        let reservation = admitted(tracker.reserve(Cost::new(6, 1)));
        tracker.commit(reservation, Cost::new(6, 1));

        clock.advance(Duration::minutes(59));

        let window = tracker.remaining();
        assert_eq!(window.window_start_time, start());
        assert_eq!(window.nodes_consumed, 6);
    }

    #[test]
    fn test_window_reset_after_several_hours_stays_aligned() {
        let (mut tracker, clock) = tracker(10, 5);

        clock.advance(Duration::minutes(3 * 60 + 20));

        let window = tracker.remaining();
        assert_eq!(window.window_start_time, start() + Duration::hours(3));
    }

    #[test]
    fn test_deferred_retry_after_admits_at_reset() {
        let (mut tracker, clock) = tracker(4, 5);
        let reservation = admitted(tracker.reserve(Cost::new(4, 1)));
        tracker.commit(reservation, Cost::new(4, 1));

        let retry_after = match tracker.reserve(Cost::new(1, 1)) {
            Admission::Deferred { retry_after } => retry_after,
            Admission::Admitted(_) => panic!("expected deferral"),
        };

        clock.set(retry_after);
        assert!(matches!(
            tracker.reserve(Cost::new(1, 1)),
            Admission::Admitted(_)
        ));
    }

    #[test]
    fn test_stale_reservation_does_not_leak_into_new_window() {
        let (mut tracker, clock) = tracker(10, 5);
        let stale = admitted(tracker.reserve(Cost::new(7, 1)));

        clock.advance(Duration::minutes(65));
        let fresh = admitted(tracker.reserve(Cost::new(3, 1)));
        tracker.release(stale);

        let window = tracker.remaining();
        assert_eq!(window.reserved, Cost::new(3, 1));
        tracker.release(fresh);
        assert_eq!(tracker.remaining().reserved, Cost::ZERO);
    }

    #[test]
    fn test_consumption_over_cap_saturates_remaining() {
        let (mut tracker, _) = tracker(5, 5);
        let reservation = admitted(tracker.reserve(Cost::new(5, 1)));
        tracker.commit(reservation, Cost::new(7, 1));

        let window = tracker.remaining();
        assert_eq!(window.nodes_consumed, 7);
        assert_eq!(window.nodes_remaining(), 0);
    }

    #[test]
    fn test_observe_keeps_local_accounting() {
        let (mut tracker, _) = tracker(10, 5);
        tracker.observe(RateLimitSnapshot {
            remaining: Some(1),
            ..RateLimitSnapshot::default()
        });

        assert_eq!(tracker.remaining().nodes_remaining(), 10);
        assert_eq!(tracker.last_observed().and_then(|s| s.remaining), Some(1));
    }
}
