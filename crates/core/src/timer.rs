//! Session Countdown
//!
//! A tick-driven state machine. One tick is one simulated minute; the caller
//! owns the clock and calls [`SessionTimer::tick`] on a fixed period.

use std::collections::BTreeSet;
use tracing::debug;

pub const DEFAULT_SESSION_MINUTES: u32 = 60;
pub const DEFAULT_THRESHOLDS: [u32; 3] = [10, 5, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Idle,
    Running,
    Expired,
    Stopped,
}

/// Events produced by the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Remaining time crossed a positive threshold.
    ThresholdReached { minutes_remaining: u32 },
    /// Remaining time reached zero. Terminal.
    Expired,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerState {
    pub remaining_ticks: u32,
    pub fired_thresholds: BTreeSet<u32>,
}

#[derive(Debug, Clone)]
pub struct SessionTimer {
    phase: TimerPhase,
    state: TimerState,
    /// Sorted in descending order.
    thresholds: Vec<u32>,
}

impl Default for SessionTimer {
    fn default() -> Self {
        Self::new(&DEFAULT_THRESHOLDS)
    }
}

impl SessionTimer {
    /// Creates an idle timer. Zero is always treated as a threshold, since
    /// reaching it ends the session.
    pub fn new(thresholds: &[u32]) -> Self {
        let mut thresholds: Vec<u32> = thresholds.to_vec();
        thresholds.push(0);
        thresholds.sort_unstable_by(|a, b| b.cmp(a));
        thresholds.dedup();
        Self {
            phase: TimerPhase::Idle,
            state: TimerState::default(),
            thresholds,
        }
    }

    pub fn phase(&self) -> TimerPhase {
        self.phase
    }

    pub fn state(&self) -> &TimerState {
        &self.state
    }

    pub fn remaining(&self) -> u32 {
        self.state.remaining_ticks
    }

    pub fn is_running(&self) -> bool {
        self.phase == TimerPhase::Running
    }

    /// Starts a fresh countdown from any phase.
    ///
    /// Starting with zero minutes expires on the first tick.
    pub fn start(&mut self, total_minutes: u32) {
        debug!(total_minutes, previous = ?self.phase, "Starting session timer");
        self.phase = TimerPhase::Running;
        self.state = TimerState {
            remaining_ticks: total_minutes,
            fired_thresholds: BTreeSet::new(),
        };
    }

    /// Stops a running countdown without expiring it.
    pub fn stop(&mut self) {
        if self.phase == TimerPhase::Running {
            self.phase = TimerPhase::Stopped;
        }
    }

    /// Continues a stopped countdown where it left off.
    pub fn resume(&mut self) {
        if self.phase == TimerPhase::Stopped {
            self.phase = TimerPhase::Running;
        }
    }

    /// Advances the countdown by one minute.
    pub fn tick(&mut self) -> Vec<TimerEvent> {
        if self.phase != TimerPhase::Running {
            return Vec::new();
        }
        let before = self.state.remaining_ticks;
        let after = before.saturating_sub(1);
        // A zero start has nothing to decrement but still has to expire.
        let before = if before == 0 { 1 } else { before };
        self.advance(before, after)
    }

    /// Adopts a remaining time reported by the backend.
    ///
    /// Only moves the countdown forward; a higher value is ignored.
    pub fn sync_remaining(&mut self, minutes: u32) -> Vec<TimerEvent> {
        if self.phase != TimerPhase::Running || minutes >= self.state.remaining_ticks {
            return Vec::new();
        }
        self.advance(self.state.remaining_ticks, minutes)
    }

    fn advance(&mut self, before: u32, after: u32) -> Vec<TimerEvent> {
        self.state.remaining_ticks = after;
        let mut events = Vec::new();
        for &threshold in &self.thresholds {
            let crossed = before > threshold && after <= threshold;
            if !crossed || !self.state.fired_thresholds.insert(threshold) {
                continue;
            }
            if threshold == 0 {
                self.phase = TimerPhase::Expired;
                events.push(TimerEvent::Expired);
            } else {
                events.push(TimerEvent::ThresholdReached {
                    minutes_remaining: threshold,
                });
            }
        }
        events
    }
}
