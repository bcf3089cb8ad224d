//! Scheduling gate — decides, before each cycle, whether ingestion runs and
//! whether the control loop should stop afterwards.
//!
//! Two states, `Armed` and `Halted`. Inside the trading window the gate stays
//! armed indefinitely. Outside it, a one-shot override arms the gate for
//! exactly one more cycle; otherwise the gate halts with no cycle run.
//! `Halted` is terminal.

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Weekday};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("weekday range {first}..={last} is reversed")]
    ReversedWeekdays { first: Weekday, last: Weekday },

    #[error("hour range {start}..{end} is empty or beyond 24")]
    InvalidHours { start: u32, end: u32 },
}

/// Weekday range (inclusive) and hour-of-day range (start inclusive, end
/// exclusive), both in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradingWindow {
    first_weekday: Weekday,
    last_weekday: Weekday,
    start_hour: u32,
    end_hour: u32,
}

impl TradingWindow {
    pub fn new(
        first_weekday: Weekday,
        last_weekday: Weekday,
        start_hour: u32,
        end_hour: u32,
    ) -> Result<Self, WindowError> {
        if first_weekday.num_days_from_monday() > last_weekday.num_days_from_monday() {
            return Err(WindowError::ReversedWeekdays {
                first: first_weekday,
                last: last_weekday,
            });
        }
        if start_hour >= end_hour || end_hour > 24 {
            return Err(WindowError::InvalidHours {
                start: start_hour,
                end: end_hour,
            });
        }
        Ok(Self {
            first_weekday,
            last_weekday,
            start_hour,
            end_hour,
        })
    }

    pub fn contains(&self, at: &DateTime<FixedOffset>) -> bool {
        let day = at.weekday().num_days_from_monday();
        let in_days = day >= self.first_weekday.num_days_from_monday()
            && day <= self.last_weekday.num_days_from_monday();
        let in_hours = (self.start_hour..self.end_hour).contains(&at.hour());
        in_days && in_hours
    }
}

impl Default for TradingWindow {
    /// Monday to Friday, 09:00 to 16:00.
    fn default() -> Self {
        Self {
            first_weekday: Weekday::Mon,
            last_weekday: Weekday::Fri,
            start_hour: 9,
            end_hour: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Armed,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Run a cycle. `last` is set when the override authorised it, and the
    /// loop must shut down right after the cycle without sleeping.
    Run { last: bool },
    Halt,
}

#[derive(Debug)]
pub struct SchedulingGate {
    window: TradingWindow,
    override_pending: bool,
    state: GateState,
}

impl SchedulingGate {
    pub fn new(window: TradingWindow, run_once_override: bool) -> Self {
        Self {
            window,
            override_pending: run_once_override,
            state: GateState::Armed,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn window(&self) -> &TradingWindow {
        &self.window
    }

    /// Evaluate the gate for `now`. Call once per loop iteration.
    pub fn evaluate(&mut self, now: &DateTime<FixedOffset>) -> GateDecision {
        if self.state == GateState::Halted {
            return GateDecision::Halt;
        }
        if self.window.contains(now) {
            return GateDecision::Run { last: false };
        }
        if self.override_pending {
            self.override_pending = false;
            self.state = GateState::Halted;
            info!(at = %now, "outside trading window; override authorises one cycle");
            return GateDecision::Run { last: true };
        }
        self.state = GateState::Halted;
        info!(at = %now, "outside trading window; gate halted");
        GateDecision::Halt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::manual_clock;
    use snapfeed_core::Clock;

    // 2025-04-21 is a Monday; 2025-04-26 a Saturday.
    fn at(day: u32, hour: u32) -> DateTime<FixedOffset> {
        manual_clock(2025, 4, day, hour, 0).now()
    }

    #[test]
    fn default_window_bounds() {
        let w = TradingWindow::default();
        assert!(w.contains(&at(21, 9)));
        assert!(w.contains(&at(25, 15)));
        assert!(!w.contains(&at(21, 8)));
        assert!(!w.contains(&at(21, 16)), "end hour is exclusive");
        assert!(!w.contains(&at(26, 10)), "saturday");
    }

    #[test]
    fn invalid_windows_are_rejected() {
        assert!(matches!(
            TradingWindow::new(Weekday::Fri, Weekday::Mon, 9, 16),
            Err(WindowError::ReversedWeekdays { .. })
        ));
        assert!(TradingWindow::new(Weekday::Mon, Weekday::Fri, 16, 9).is_err());
        assert!(TradingWindow::new(Weekday::Mon, Weekday::Fri, 9, 25).is_err());
        assert!(TradingWindow::new(Weekday::Mon, Weekday::Sun, 0, 24).is_ok());
    }

    #[test]
    fn in_window_stays_armed() {
        let mut gate = SchedulingGate::new(TradingWindow::default(), false);
        for hour in 9..16 {
            assert_eq!(gate.evaluate(&at(22, hour)), GateDecision::Run { last: false });
        }
        assert_eq!(gate.state(), GateState::Armed);
    }

    #[test]
    fn out_of_window_without_override_halts() {
        let mut gate = SchedulingGate::new(TradingWindow::default(), false);
        assert_eq!(gate.evaluate(&at(26, 10)), GateDecision::Halt);
        assert_eq!(gate.state(), GateState::Halted);
        // Terminal even if the window opens again.
        assert_eq!(gate.evaluate(&at(21, 10)), GateDecision::Halt);
    }

    #[test]
    fn override_grants_exactly_one_cycle() {
        let mut gate = SchedulingGate::new(TradingWindow::default(), true);
        assert_eq!(gate.evaluate(&at(26, 10)), GateDecision::Run { last: true });
        assert_eq!(gate.evaluate(&at(26, 10)), GateDecision::Halt);
    }

    #[test]
    fn override_is_kept_while_in_window() {
        let mut gate = SchedulingGate::new(TradingWindow::default(), true);
        assert_eq!(gate.evaluate(&at(21, 15)), GateDecision::Run { last: false });
        // Window closes: the unused override buys one final cycle.
        assert_eq!(gate.evaluate(&at(21, 16)), GateDecision::Run { last: true });
        assert_eq!(gate.evaluate(&at(21, 16)), GateDecision::Halt);
    }
}
