//! Multi-window spend governance.
//!
//! Three independent windows (hour, day, month, aligned to UTC calendar
//! boundaries) each hold a limit, realized spend and outstanding
//! reservations. A request reserves its worst-case cost against all three at
//! once or not at all; the reservation is later committed with the actual
//! cost (successful attempt) or released (failed attempt).
//!
//! Window resets are derived from timestamps alone, so rolling twice inside
//! the same window is a no-op and a restart never double-resets.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::BudgetConfig;
use crate::events::{CascadeEvent, SharedEventSink};
use crate::sync::lock;

/// Tolerance for float accumulation when comparing spend to a limit.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Hourly,
    Daily,
    Monthly,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [Self::Hourly, Self::Daily, Self::Monthly];

    fn index(self) -> usize {
        match self {
            Self::Hourly => 0,
            Self::Daily => 1,
            Self::Monthly => 2,
        }
    }

    /// `[start, end)` of the window containing `now_ms`, in epoch millis.
    pub fn bounds(self, now_ms: u64) -> (u64, u64) {
        let now = DateTime::<Utc>::from_timestamp_millis(now_ms as i64).unwrap_or_default();
        let date = now.date_naive();
        let start: Option<NaiveDateTime> = match self {
            Self::Hourly => date.and_hms_opt(now.hour(), 0, 0),
            Self::Daily => date.and_hms_opt(0, 0, 0),
            Self::Monthly => NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        };
        let end = start.and_then(|s| match self {
            Self::Hourly => s.checked_add_signed(chrono::Duration::hours(1)),
            Self::Daily => s.checked_add_signed(chrono::Duration::days(1)),
            Self::Monthly => s.checked_add_months(Months::new(1)),
        });
        match (start, end) {
            (Some(s), Some(e)) => (
                s.and_utc().timestamp_millis() as u64,
                e.and_utc().timestamp_millis() as u64,
            ),
            _ => (now_ms, now_ms.saturating_add(3_600_000)),
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// One rolling spend counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetWindow {
    pub kind: WindowKind,
    /// Realized USD. Non-decreasing until `reset_at_ms`.
    pub spent: f64,
    /// USD held by outstanding reservations.
    #[serde(default)]
    pub reserved: f64,
    pub limit: f64,
    pub started_at_ms: u64,
    pub reset_at_ms: u64,
    /// Alert percentages already fired in this window.
    #[serde(default)]
    pub alerted_thresholds: BTreeSet<u32>,
}

impl BudgetWindow {
    fn new(kind: WindowKind, limit: f64, now_ms: u64) -> Self {
        let (started_at_ms, reset_at_ms) = kind.bounds(now_ms);
        Self {
            kind,
            spent: 0.0,
            reserved: 0.0,
            limit,
            started_at_ms,
            reset_at_ms,
            alerted_thresholds: BTreeSet::new(),
        }
    }

    /// Reset if `now_ms` is past this window. Returns whether it rolled.
    fn roll(&mut self, now_ms: u64) -> bool {
        if now_ms < self.reset_at_ms {
            return false;
        }
        let (start, end) = self.kind.bounds(now_ms);
        self.started_at_ms = start;
        self.reset_at_ms = end;
        self.spent = 0.0;
        self.reserved = 0.0;
        self.alerted_thresholds.clear();
        true
    }

    fn would_exceed(&self, cost: f64) -> bool {
        self.spent + self.reserved + cost > self.limit + EPSILON
    }

    pub fn remaining(&self) -> f64 {
        (self.limit - self.spent - self.reserved).max(0.0)
    }

    pub fn utilization_pct(&self) -> f64 {
        if self.limit > 0.0 {
            self.spent / self.limit * 100.0
        } else {
            0.0
        }
    }
}

/// Rejection from the governor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetExceeded {
    pub window: WindowKind,
    pub spent: f64,
    pub limit: f64,
    pub requested: f64,
}

/// Worst-case cost held against every window until committed or released.
#[derive(Debug)]
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    amount: f64,
    /// `started_at_ms` of each window when reserved.
    epochs: [u64; 3],
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

pub struct BudgetGovernor {
    windows: Mutex<[BudgetWindow; 3]>,
    thresholds: Vec<u32>,
    clock: SharedClock,
    events: SharedEventSink,
}

/// Order in which windows are reported when several would be breached:
/// the longest-lived ceiling first, since it is the one that will not clear soon.
const REPORT_ORDER: [WindowKind; 3] = [WindowKind::Monthly, WindowKind::Daily, WindowKind::Hourly];

impl BudgetGovernor {
    pub fn new(config: &BudgetConfig, clock: SharedClock, events: SharedEventSink) -> Self {
        let now = clock.now_ms();
        let mut thresholds = config.alert_thresholds.clone();
        thresholds.sort_unstable();
        thresholds.dedup();
        Self {
            windows: Mutex::new([
                BudgetWindow::new(WindowKind::Hourly, config.hourly_limit, now),
                BudgetWindow::new(WindowKind::Daily, config.daily_limit, now),
                BudgetWindow::new(WindowKind::Monthly, config.monthly_limit, now),
            ]),
            thresholds,
            clock,
            events,
        }
    }

    /// Whether `cost` fits every window right now. Reserves nothing.
    pub fn can_afford(&self, cost: f64) -> Result<(), BudgetExceeded> {
        let now = self.clock.now_ms();
        let mut windows = lock(&self.windows);
        Self::roll_all(&mut windows, now);
        Self::first_breach(&windows, cost)
    }

    /// Hold `estimated_cost` against all three windows, all or nothing.
    pub fn check_and_reserve(&self, estimated_cost: f64) -> Result<Reservation, BudgetExceeded> {
        let cost = sanitize(estimated_cost);
        let now = self.clock.now_ms();
        let mut windows = lock(&self.windows);
        Self::roll_all(&mut windows, now);
        if let Err(breach) = Self::first_breach(&windows, cost) {
            debug!(window = %breach.window, requested = cost, "budget reservation refused");
            return Err(breach);
        }
        for w in windows.iter_mut() {
            w.reserved += cost;
        }
        Ok(Reservation {
            amount: cost,
            epochs: [
                windows[0].started_at_ms,
                windows[1].started_at_ms,
                windows[2].started_at_ms,
            ],
        })
    }

    /// Replace a reservation with the actual charge.
    pub fn commit(&self, reservation: Reservation, actual_cost: f64) {
        let actual = sanitize(actual_cost);
        let now = self.clock.now_ms();
        let alerts = {
            let mut windows = lock(&self.windows);
            Self::roll_all(&mut windows, now);
            Self::drop_hold(&mut windows, &reservation);
            for w in windows.iter_mut() {
                w.spent += actual;
            }
            self.collect_alerts(&mut windows, now)
        };
        if actual > reservation.amount + EPSILON {
            warn!(
                reserved = reservation.amount,
                actual, "actual cost exceeded the reserved estimate"
            );
        }
        self.emit_all(alerts);
    }

    /// Give a reservation back without spending anything.
    pub fn release(&self, reservation: Reservation) {
        let now = self.clock.now_ms();
        let mut windows = lock(&self.windows);
        Self::roll_all(&mut windows, now);
        Self::drop_hold(&mut windows, &reservation);
    }

    /// Add a realized cost with no prior reservation.
    pub fn record_actual_cost(&self, cost: f64) {
        let cost = sanitize(cost);
        let now = self.clock.now_ms();
        let alerts = {
            let mut windows = lock(&self.windows);
            Self::roll_all(&mut windows, now);
            for w in windows.iter_mut() {
                w.spent += cost;
            }
            self.collect_alerts(&mut windows, now)
        };
        self.emit_all(alerts);
    }

    /// Reset every window whose boundary has passed as of `now_ms`. Idempotent.
    pub fn roll_windows(&self, now_ms: u64) -> Vec<WindowKind> {
        let mut windows = lock(&self.windows);
        Self::roll_all(&mut windows, now_ms)
    }

    pub fn window(&self, kind: WindowKind) -> BudgetWindow {
        let now = self.clock.now_ms();
        let mut windows = lock(&self.windows);
        Self::roll_all(&mut windows, now);
        windows[kind.index()].clone()
    }

    pub fn snapshot(&self) -> Vec<BudgetWindow> {
        let now = self.clock.now_ms();
        let mut windows = lock(&self.windows);
        Self::roll_all(&mut windows, now);
        windows.to_vec()
    }

    /// Re-apply persisted spend, keeping whichever of live and saved spend is
    /// higher. Windows that have since ended are ignored; limits always come
    /// from the current configuration.
    pub fn restore(&self, saved: &[BudgetWindow]) -> usize {
        let now = self.clock.now_ms();
        let mut windows = lock(&self.windows);
        Self::roll_all(&mut windows, now);
        let mut restored = 0;
        for s in saved {
            let w = &mut windows[s.kind.index()];
            if s.started_at_ms == w.started_at_ms && now < s.reset_at_ms {
                // Spend never goes down inside a window.
                w.spent = w.spent.max(sanitize(s.spent));
                w.alerted_thresholds
                    .extend(s.alerted_thresholds.iter().copied());
                restored += 1;
            }
        }
        restored
    }

    fn roll_all(windows: &mut [BudgetWindow; 3], now: u64) -> Vec<WindowKind> {
        let mut rolled = Vec::new();
        for w in windows.iter_mut() {
            if w.roll(now) {
                info!(window = %w.kind, reset_at_ms = w.reset_at_ms, "budget window reset");
                rolled.push(w.kind);
            }
        }
        rolled
    }

    fn first_breach(windows: &[BudgetWindow; 3], cost: f64) -> Result<(), BudgetExceeded> {
        for kind in REPORT_ORDER {
            let w = &windows[kind.index()];
            if w.would_exceed(cost) {
                return Err(BudgetExceeded {
                    window: kind,
                    spent: w.spent,
                    limit: w.limit,
                    requested: cost,
                });
            }
        }
        Ok(())
    }

    fn drop_hold(windows: &mut [BudgetWindow; 3], reservation: &Reservation) {
        for (w, epoch) in windows.iter_mut().zip(reservation.epochs) {
            // A hold made in an earlier window vanished with that window's reset.
            if w.started_at_ms == epoch {
                w.reserved = (w.reserved - reservation.amount).max(0.0);
            }
        }
    }

    fn collect_alerts(&self, windows: &mut [BudgetWindow; 3], now: u64) -> Vec<CascadeEvent> {
        let mut alerts = Vec::new();
        for w in windows.iter_mut() {
            let pct = w.utilization_pct();
            for &threshold in &self.thresholds {
                if pct + EPSILON >= f64::from(threshold) && w.alerted_thresholds.insert(threshold) {
                    warn!(
                        window = %w.kind,
                        threshold_pct = threshold,
                        spent = w.spent,
                        limit = w.limit,
                        "budget alert"
                    );
                    alerts.push(CascadeEvent::BudgetAlert {
                        window: w.kind,
                        threshold_pct: threshold,
                        spent: w.spent,
                        limit: w.limit,
                        timestamp_ms: now,
                    });
                }
            }
        }
        alerts
    }

    fn emit_all(&self, events: Vec<CascadeEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

fn sanitize(cost: f64) -> f64 {
    if cost.is_finite() {
        cost.max(0.0)
    } else {
        0.0
    }
}
