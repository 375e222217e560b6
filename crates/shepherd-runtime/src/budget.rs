//! Multi-window budget ledger.
//!
//! A reservation debits every window at once or none of them. Consumption never
//! exceeds a window's limit: cost beyond what the smallest window can absorb is
//! reported as overrun instead of being debited. Windows with a period roll forward
//! in whole periods from their own start; each roll bumps the window's epoch so a
//! reservation made in an earlier period never refunds into or debits a newer one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use shepherd_core::config::{WindowConfig, WindowKind};
use shepherd_core::{Clock, Result};
use shepherd_store::{BudgetWindowRecord, SqliteStore};

/// Scope of windows shared by every session.
pub const GLOBAL_SCOPE: &str = "global";

/// Provisional debit against every window, returned by [`BudgetLedger::reserve`].
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    id: u64,
    amount: u64,
    /// Epoch of each window at reservation time, by window position.
    epochs: Vec<u64>,
}

impl Reservation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Reserved(Reservation),
    /// No headroom now. `None` means a blocking window never resets.
    Denied { retry_after: Option<Duration> },
    /// The estimate alone exceeds a window's total limit. Never retried.
    PermanentlyOversized { window: WindowKind, limit: u64 },
}

/// How a reservation was reconciled with the actual cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settlement {
    pub charged: u64,
    pub refunded: u64,
    /// Cost consumed beyond what the windows could absorb.
    pub overrun: u64,
}

#[derive(Debug, Clone)]
struct Window {
    record: BudgetWindowRecord,
    period: Option<chrono::Duration>,
}

impl Window {
    fn new(scope: &str, config: &WindowConfig, now: DateTime<Utc>) -> Self {
        let period = config.kind.period();
        Self {
            record: BudgetWindowRecord {
                scope: scope.to_string(),
                kind: config.kind,
                limit: config.limit,
                consumed: 0,
                window_start: now,
                window_end: period.map(|p| now + p),
                epoch: 0,
            },
            period,
        }
    }

    fn headroom(&self) -> u64 {
        self.record.limit.saturating_sub(self.record.consumed)
    }

    /// Advance past every period boundary that `now` has crossed.
    fn roll(&mut self, now: DateTime<Utc>) {
        let (Some(period), Some(end)) = (self.period, self.record.window_end) else {
            return;
        };
        if now < end {
            return;
        }
        let period_ms = period.num_milliseconds().max(1);
        let elapsed_ms = (now - self.record.window_start).num_milliseconds();
        let periods = elapsed_ms / period_ms;
        let start = self.record.window_start + chrono::Duration::milliseconds(periods * period_ms);
        debug!(
            "Budget window {}/{} reset ({} consumed of {})",
            self.record.scope, self.record.kind, self.record.consumed, self.record.limit
        );
        self.record.window_start = start;
        self.record.window_end = Some(start + period);
        self.record.consumed = 0;
        self.record.epoch += 1;
    }

    fn time_until_reset(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.record
            .window_end
            .map(|end| (end - now).to_std().unwrap_or(Duration::ZERO))
    }
}

struct LedgerState {
    windows: Vec<Window>,
    next_id: u64,
}

impl LedgerState {
    /// Take consumption, position and epoch from the stored rows. Limits and periods
    /// always come from configuration.
    fn adopt(&mut self, stored: &[BudgetWindowRecord]) {
        for window in &mut self.windows {
            let Some(prev) = stored
                .iter()
                .find(|s| s.scope == window.record.scope && s.kind == window.record.kind)
            else {
                continue;
            };
            window.record.consumed = prev.consumed.min(window.record.limit);
            window.record.window_start = prev.window_start;
            window.record.window_end = window.period.map(|p| prev.window_start + p);
            window.record.epoch = prev.epoch;
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        for window in &mut self.windows {
            window.roll(now);
        }
    }

    fn records(&self) -> Vec<BudgetWindowRecord> {
        self.windows.iter().map(|w| w.record.clone()).collect()
    }
}

/// Debits and refunds every budget window. Safe to share between workers.
///
/// With a store, the stored rows are authoritative: each operation reads them, applies
/// its change and writes them back in one transaction, so ledgers of concurrent
/// sessions share the global windows.
pub struct BudgetLedger {
    state: Mutex<LedgerState>,
    clock: Arc<dyn Clock>,
    store: Option<Arc<SqliteStore>>,
    session_scope: String,
}

impl BudgetLedger {
    /// In-memory ledger. Session windows are scoped to `session_id`, the rest are
    /// global.
    pub fn new(windows: &[WindowConfig], session_id: &str, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let windows = windows
            .iter()
            .map(|w| Window::new(Self::scope_for(w.kind, session_id), w, now))
            .collect();
        Self {
            state: Mutex::new(LedgerState {
                windows,
                next_id: 1,
            }),
            clock,
            store: None,
            session_scope: session_id.to_string(),
        }
    }

    /// Ledger backed by the windows in `store`, created there if absent.
    pub fn with_store(
        windows: &[WindowConfig],
        session_id: &str,
        clock: Arc<dyn Clock>,
        store: Arc<SqliteStore>,
    ) -> Result<Self> {
        let mut ledger = Self::new(windows, session_id, clock);
        ledger.store = Some(store);
        ledger.update(|_, _| ())?;
        Ok(ledger)
    }

    fn scope_for<'a>(kind: WindowKind, session_id: &'a str) -> &'a str {
        match kind {
            WindowKind::Session => session_id,
            _ => GLOBAL_SCOPE,
        }
    }

    /// Run `f` against the current windows, rolled forward to now.
    fn update<T>(&self, f: impl FnOnce(&mut LedgerState, DateTime<Utc>) -> T) -> Result<T> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(store) = &self.store else {
            state.roll(now);
            return Ok(f(&mut state, now));
        };
        let scopes = [GLOBAL_SCOPE, self.session_scope.as_str()];
        store.update_budget_windows(&scopes, |stored| {
            state.adopt(stored);
            state.roll(now);
            let out = f(&mut state, now);
            (state.records(), out)
        })
    }

    /// Debit `estimated` from every window, or none.
    pub fn reserve(&self, estimated: u64) -> Result<Admission> {
        self.update(|state, now| {
            if let Some(w) = state.windows.iter().find(|w| estimated > w.record.limit) {
                return Admission::PermanentlyOversized {
                    window: w.record.kind,
                    limit: w.record.limit,
                };
            }

            if state.windows.iter().any(|w| w.headroom() < estimated) {
                let retry_after = Self::headroom_wait(state, estimated, now);
                debug!(
                    "Budget denied {} units, retry after {:?}",
                    estimated, retry_after
                );
                return Admission::Denied { retry_after };
            }

            for window in &mut state.windows {
                window.record.consumed += estimated;
            }
            let id = state.next_id;
            state.next_id += 1;
            Admission::Reserved(Reservation {
                id,
                amount: estimated,
                epochs: state.windows.iter().map(|w| w.record.epoch).collect(),
            })
        })
    }

    /// Reconcile a reservation with the cost actually consumed.
    pub fn settle(&self, reservation: Reservation, actual: u64) -> Result<Settlement> {
        self.update(|state, _| {
            let live: Vec<usize> = state
                .windows
                .iter()
                .enumerate()
                .filter(|(i, w)| reservation.epochs.get(*i) == Some(&w.record.epoch))
                .map(|(i, _)| i)
                .collect();

            if actual <= reservation.amount {
                let refund = reservation.amount - actual;
                for &i in &live {
                    let record = &mut state.windows[i].record;
                    record.consumed = record.consumed.saturating_sub(refund);
                }
                return Settlement {
                    charged: actual,
                    refunded: refund,
                    overrun: 0,
                };
            }

            let extra = actual - reservation.amount;
            let absorb = live
                .iter()
                .map(|&i| state.windows[i].headroom())
                .min()
                .map_or(extra, |headroom| headroom.min(extra));
            for &i in &live {
                state.windows[i].record.consumed += absorb;
            }
            let overrun = extra - absorb;
            if overrun > 0 {
                warn!(
                    "Budget overrun on reservation {}: estimated {}, actual {}, {} units unabsorbed",
                    reservation.id, reservation.amount, actual, overrun
                );
            }
            Settlement {
                charged: reservation.amount + absorb,
                refunded: 0,
                overrun,
            }
        })
    }

    /// Return an unused reservation in full.
    pub fn release(&self, reservation: Reservation) -> Result<()> {
        self.settle(reservation, 0).map(|_| ())
    }

    /// Time until every window can admit `amount`. `Some(ZERO)` when it fits now,
    /// `None` when a blocking window never resets or `amount` exceeds a limit.
    pub fn time_until_headroom(&self, amount: u64) -> Result<Option<Duration>> {
        self.update(|state, now| Self::headroom_wait(state, amount, now))
    }

    fn headroom_wait(state: &LedgerState, amount: u64, now: DateTime<Utc>) -> Option<Duration> {
        let mut wait = Duration::ZERO;
        for window in state.windows.iter().filter(|w| w.headroom() < amount) {
            if amount > window.record.limit {
                return None;
            }
            wait = wait.max(window.time_until_reset(now)?);
        }
        Some(wait)
    }

    /// Set the session window's consumption, e.g. from recorded costs on resume.
    pub fn rebase_session_window(&self, consumed: u64) -> Result<()> {
        self.update(|state, _| {
            for window in &mut state.windows {
                if window.record.kind == WindowKind::Session {
                    window.record.consumed = consumed.min(window.record.limit);
                }
            }
        })
    }

    /// True if a window that never resets has no headroom left for `amount`.
    pub fn session_exhausted(&self, amount: u64) -> Result<bool> {
        self.update(|state, _| {
            state
                .windows
                .iter()
                .any(|w| w.period.is_none() && w.headroom() < amount)
        })
    }

    /// Current state of every window.
    pub fn snapshot(&self) -> Result<Vec<BudgetWindowRecord>> {
        self.update(|state, _| state.records())
    }

    pub fn session_scope(&self) -> &str {
        &self.session_scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_core::ManualClock;

    fn rolling(seconds: u64, limit: u64) -> WindowConfig {
        WindowConfig {
            kind: WindowKind::Rolling { seconds },
            limit,
        }
    }

    fn ledger(windows: &[WindowConfig]) -> (BudgetLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        (BudgetLedger::new(windows, "s1", clock.clone()), clock)
    }

    fn reserved(admission: Admission) -> Reservation {
        match admission {
            Admission::Reserved(r) => r,
            other => panic!("expected reservation, got {other:?}"),
        }
    }

    fn consumed(ledger: &BudgetLedger) -> Vec<u64> {
        ledger.snapshot().unwrap().iter().map(|w| w.consumed).collect()
    }

    #[test]
    fn test_third_reservation_denied_until_reset() {
        let (ledger, clock) = ledger(&[rolling(60, 5)]);
        let a = reserved(ledger.reserve(2).unwrap());
        let _b = reserved(ledger.reserve(2).unwrap());
        match ledger.reserve(2).unwrap() {
            Admission::Denied { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(60)))
            }
            other => panic!("expected denial, got {other:?}"),
        }
        assert_eq!(consumed(&ledger), vec![4]);

        ledger.settle(a, 2).unwrap();
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(consumed(&ledger), vec![0]);
        assert!(matches!(ledger.reserve(2).unwrap(), Admission::Reserved(_)));
    }

    #[test]
    fn test_all_or_nothing_across_windows() {
        let (ledger, _clock) = ledger(&[rolling(60, 10), rolling(3600, 3)]);
        let _r = reserved(ledger.reserve(3).unwrap());
        assert!(matches!(ledger.reserve(1).unwrap(), Admission::Denied { .. }));
        assert_eq!(consumed(&ledger), vec![3, 3]);
    }

    #[test]
    fn test_oversized_is_permanent() {
        let (ledger, _clock) = ledger(&[rolling(60, 5)]);
        assert_eq!(
            ledger.reserve(6).unwrap(),
            Admission::PermanentlyOversized {
                window: WindowKind::Rolling { seconds: 60 },
                limit: 5
            }
        );
        assert_eq!(ledger.time_until_headroom(6).unwrap(), None);
    }

    #[test]
    fn test_settle_refunds_and_clamps_overrun() {
        let (ledger, _clock) = ledger(&[rolling(60, 10), rolling(3600, 8)]);
        let r = reserved(ledger.reserve(4).unwrap());
        let s = ledger.settle(r, 1).unwrap();
        assert_eq!(s, Settlement { charged: 1, refunded: 3, overrun: 0 });
        assert_eq!(consumed(&ledger), vec![1, 1]);

        let r = reserved(ledger.reserve(5).unwrap());
        let s = ledger.settle(r, 12).unwrap();
        // Headroom left is min(10-6, 8-6) = 2.
        assert_eq!(s, Settlement { charged: 7, refunded: 0, overrun: 5 });
        assert_eq!(consumed(&ledger), vec![8, 8]);
        for w in ledger.snapshot().unwrap() {
            assert!(w.consumed <= w.limit);
        }
    }

    #[test]
    fn test_settlement_never_touches_newer_epoch() {
        let (ledger, clock) = ledger(&[rolling(60, 5)]);
        let r = reserved(ledger.reserve(4).unwrap());
        clock.advance(chrono::Duration::seconds(60));
        let _fresh = reserved(ledger.reserve(3).unwrap());
        ledger.settle(r, 0).unwrap();
        assert_eq!(consumed(&ledger), vec![3]);
    }

    #[test]
    fn test_roll_advances_in_whole_periods() {
        let (ledger, clock) = ledger(&[rolling(60, 5)]);
        let start = clock.now();
        clock.advance(chrono::Duration::seconds(150));
        let window = &ledger.snapshot().unwrap()[0];
        assert_eq!(window.window_start, start + chrono::Duration::seconds(120));
        assert_eq!(window.window_end, Some(start + chrono::Duration::seconds(180)));
        assert_eq!(window.epoch, 1);
        assert_eq!(ledger.time_until_headroom(1).unwrap(), Some(Duration::ZERO));
    }

    #[test]
    fn test_session_window_never_resets() {
        let windows = [
            WindowConfig {
                kind: WindowKind::Session,
                limit: 4,
            },
            rolling(60, 100),
        ];
        let (ledger, clock) = ledger(&windows);
        let _r = reserved(ledger.reserve(4).unwrap());
        assert!(ledger.session_exhausted(1).unwrap());
        assert_eq!(ledger.reserve(1).unwrap(), Admission::Denied { retry_after: None });
        clock.advance(chrono::Duration::days(2));
        assert!(matches!(ledger.reserve(1).unwrap(), Admission::Denied { .. }));
        assert_eq!(ledger.snapshot().unwrap()[0].scope, "s1");
        assert_eq!(ledger.snapshot().unwrap()[1].scope, GLOBAL_SCOPE);

        ledger.rebase_session_window(1).unwrap();
        assert!(matches!(ledger.reserve(1).unwrap(), Admission::Reserved(_)));
    }

    #[test]
    fn test_persisted_windows_are_resumed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::at_epoch());
        let windows = [rolling(60, 5)];
        {
            let ledger =
                BudgetLedger::with_store(&windows, "s1", clock.clone(), store.clone()).unwrap();
            let r = reserved(ledger.reserve(3).unwrap());
            ledger.settle(r, 3).unwrap();
        }
        let ledger = BudgetLedger::with_store(&windows, "s2", clock, store).unwrap();
        assert_eq!(consumed(&ledger), vec![3]);
        assert!(matches!(ledger.reserve(3).unwrap(), Admission::Denied { .. }));
    }

    #[test]
    fn test_live_ledgers_share_global_windows() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let clock = Arc::new(ManualClock::at_epoch());
        let windows = [
            WindowConfig {
                kind: WindowKind::Hourly,
                limit: 5,
            },
            WindowConfig {
                kind: WindowKind::Session,
                limit: 100,
            },
        ];
        // Both ledgers exist before either one spends.
        let a = BudgetLedger::with_store(&windows, "s1", clock.clone(), store.clone()).unwrap();
        let b = BudgetLedger::with_store(&windows, "s2", clock.clone(), store.clone()).unwrap();

        let _b1 = reserved(b.reserve(2).unwrap());
        let _b2 = reserved(b.reserve(2).unwrap());
        assert!(matches!(a.reserve(2).unwrap(), Admission::Denied { .. }));
        let a1 = reserved(a.reserve(1).unwrap());
        assert_eq!(consumed(&b), vec![5, 4]);
        assert_eq!(consumed(&a), vec![5, 1]);

        a.settle(a1, 0).unwrap();
        assert_eq!(consumed(&b)[0], 4);
        let hourly = store.budget_windows(&[GLOBAL_SCOPE]).unwrap();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].consumed, 4);

        clock.advance(chrono::Duration::hours(1));
        assert!(matches!(a.reserve(5).unwrap(), Admission::Reserved(_)));
        assert_eq!(consumed(&b)[0], 5);
    }

    #[test]
    fn test_concurrent_reservations_never_overdebit() {
        let (ledger, _clock) = ledger(&[rolling(60, 50)]);
        let ledger = Arc::new(ledger);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    let mut granted = 0;
                    for _ in 0..20 {
                        if let Admission::Reserved(_) = ledger.reserve(1).unwrap() {
                            granted += 1;
                        }
                        assert!(ledger.snapshot().unwrap()[0].consumed <= 50);
                    }
                    granted
                })
            })
            .collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(consumed(&ledger), vec![50]);
    }
}
