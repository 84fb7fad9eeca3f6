//! CSMA/CA backoff engine
//!
//! Computes randomised backoff windows and adapts the contention
//! window on success, failure and fairness triggers.
//
// https://github.com/rust-iot/rust-plc-mac
// Copyright 2021 Ryan Kurte

use log::{debug, trace};

use rand_core::RngCore;

use super::config::CsmaConfig;

/// Adaptive CSMA/CA backoff state.
///
/// The contention window and minimum-window streak persist across
/// transmit requests; the attempt counters (NB, NBF) are reset per
/// request.
#[derive(Debug, Clone, PartialEq)]
pub struct CsmaBackoff {
    config: CsmaConfig,

    /// Contention window in slots
    cw: u32,
    /// Consecutive attempts scored at the minimum window
    min_streak: u32,

    /// All-priority attempt counter for the active request
    nb: u32,
    /// Normal-priority fairness attempt counter
    nbf: u32,

    /// Last attempt failed on a busy channel and has not been
    /// compensated or superseded
    busy_pending: bool,
}

impl CsmaBackoff {
    pub fn new(config: CsmaConfig) -> Self {
        let cw = config.min_window();

        Self {
            config,
            cw,
            min_streak: 0,
            nb: 0,
            nbf: 0,
            busy_pending: false,
        }
    }

    /// Current contention window in slots
    pub fn window(&self) -> u32 {
        self.cw
    }

    /// Attempts scored for the active request
    pub fn attempts(&self) -> u32 {
        self.nb
    }

    /// Begin a new transmit request: attempt counters reset, adaptive
    /// window state carries over
    pub fn start_request(&mut self) {
        self.nb = 0;
        self.nbf = 0;
        self.busy_pending = false;
    }

    /// Reset all adaptive state (full MAC reset)
    pub fn reset(&mut self) {
        self.cw = self.config.min_window();
        self.min_streak = 0;
        self.start_request();
    }

    /// Draw a randomised backoff for the next attempt, in slots
    pub fn backoff_slots<R: RngCore>(&mut self, rng: &mut R, high_priority: bool, broadcast: bool) -> u32 {
        if high_priority {
            return rng.next_u32() % self.config.high_priority_window;
        }

        // Repeated wins at the minimum window starve other nodes;
        // force the window back up once the streak crosses the limit
        if self.cw == self.config.min_window() {
            self.min_streak += 1;
        } else {
            self.min_streak = 0;
        }
        if self.min_streak > self.config.min_cw_streak {
            debug!("Minimum window streak {} hit, forcing maximum window", self.min_streak);
            self.cw = self.config.max_window();
            self.min_streak = 0;
        }

        let window = if broadcast && self.config.cap_broadcast_window {
            self.config.max_window()
        } else {
            self.cw
        };

        rng.next_u32() % window
    }

    /// Backoff delay for the next attempt in microseconds
    pub fn backoff_us<R: RngCore>(
        &mut self,
        rng: &mut R,
        high_priority: bool,
        broadcast: bool,
        slot_us: u64,
    ) -> u64 {
        let slots = self.backoff_slots(rng, high_priority, broadcast);

        trace!("Backoff {} slots (window {})", slots, self.cw);

        slots as u64 * slot_us
    }

    /// Fixed wait preceding the randomised backoff: one slot for high
    /// priority, the whole high-priority window plus one otherwise
    pub fn period_wait_us(&self, high_priority: bool, slot_us: u64) -> u64 {
        if high_priority {
            slot_us
        } else {
            (1 + self.config.high_priority_window as u64) * slot_us
        }
    }

    /// Score a failed channel access. Returns true once the attempt
    /// budget is exhausted.
    pub fn on_busy(&mut self, high_priority: bool) -> bool {
        self.nb += 1;
        self.busy_pending = true;

        if !high_priority {
            self.nbf += 1;

            if self.nbf > self.config.fairness_limit {
                // Fairness: periodically shrink rather than grow, so a
                // long-throttled node converges back to the floor
                if self.nbf % self.config.cw_shrink_every == 0 {
                    self.shrink();
                }
            } else {
                self.cw = (self.cw * 2).min(self.config.max_window());
            }
        }

        debug!("Busy attempt scored, nb {} nbf {} window {}", self.nb, self.nbf, self.cw);

        self.nb >= self.config.max_csma_backoffs
    }

    /// Score a fully successful transmission
    pub fn on_success(&mut self) {
        self.shrink();
        self.busy_pending = false;
    }

    /// Reverse one busy increment: the busy report was caused by a
    /// reception rather than contention. Returns true when an
    /// increment was actually reversed.
    pub fn compensate_rx(&mut self, high_priority: bool) -> bool {
        if !self.busy_pending {
            return false;
        }

        debug!("Reversing busy increment after valid reception");

        self.nb = self.nb.saturating_sub(1);
        if !high_priority {
            self.nbf = self.nbf.saturating_sub(1);
        }
        self.busy_pending = false;

        true
    }

    fn shrink(&mut self) {
        let step = self.config.cw_shrink_factor * self.config.min_window();
        self.cw = self.cw.saturating_sub(step).max(self.config.min_window());
    }
}

#[cfg(test)]
mod test {
    use rand::rngs::mock::StepRng;

    use super::*;

    fn config() -> CsmaConfig {
        CsmaConfig::default()
    }

    #[test]
    fn window_stays_bounded() {
        let cfg = config();
        let mut csma = CsmaBackoff::new(cfg.clone());
        let mut rng = StepRng::new(0, 0xdead_beef);

        csma.start_request();

        // Arbitrary mix of outcomes, window must never leave its range
        for i in 0..200 {
            if i % 7 == 0 {
                csma.on_success();
            } else {
                csma.on_busy(false);
            }
            let _ = csma.backoff_slots(&mut rng, false, false);

            assert!(csma.window() >= cfg.min_window(), "window {} below floor", csma.window());
            assert!(csma.window() <= cfg.max_window(), "window {} above cap", csma.window());

            if csma.attempts() >= cfg.max_csma_backoffs {
                csma.start_request();
            }
        }
    }

    #[test]
    fn window_doubles_then_caps() {
        let cfg = config();
        let mut csma = CsmaBackoff::new(cfg.clone());
        csma.start_request();

        let mut prev = csma.window();
        for _ in 0..cfg.fairness_limit {
            csma.on_busy(false);
            assert!(csma.window() >= prev);
            prev = csma.window();
        }

        assert_eq!(csma.window(), cfg.max_window());
    }

    #[test]
    fn fairness_throttles_window_growth() {
        let cfg = config();
        let mut csma = CsmaBackoff::new(cfg.clone());
        csma.start_request();

        // Push past the fairness limit
        for _ in 0..cfg.fairness_limit {
            csma.on_busy(false);
        }
        assert_eq!(csma.window(), cfg.max_window());

        // Beyond the limit the window only shrinks, on every K-th attempt
        let mut prev = csma.window();
        for _ in 0..(cfg.cw_shrink_every * 10) {
            csma.on_busy(false);
            assert!(csma.window() <= prev);
            prev = csma.window();
        }
        assert_eq!(csma.window(), cfg.min_window());
    }

    #[test]
    fn success_shrinks_once() {
        let cfg = config();
        let mut csma = CsmaBackoff::new(cfg.clone());
        csma.start_request();

        for _ in 0..4 {
            csma.on_busy(false);
        }
        let grown = csma.window();

        csma.on_success();
        assert_eq!(
            csma.window(),
            (grown - cfg.cw_shrink_factor * cfg.min_window()).max(cfg.min_window())
        );
    }

    #[test]
    fn high_priority_leaves_window_untouched() {
        let cfg = config();
        let mut csma = CsmaBackoff::new(cfg.clone());
        let mut rng = StepRng::new(3, 1);
        csma.start_request();

        for _ in 0..20 {
            csma.on_busy(true);
            let b = csma.backoff_slots(&mut rng, true, false);
            assert!(b < cfg.high_priority_window);
        }

        assert_eq!(csma.window(), cfg.min_window());
        assert_eq!(csma.attempts(), 20);
    }

    #[test]
    fn min_window_streak_forces_maximum() {
        let cfg = config();
        let mut csma = CsmaBackoff::new(cfg.clone());
        let mut rng = StepRng::new(0, 1);
        csma.start_request();

        // Stay at the minimum window up to the streak limit
        for _ in 0..cfg.min_cw_streak {
            let _ = csma.backoff_slots(&mut rng, false, false);
        }
        assert_eq!(csma.window(), cfg.min_window());

        let _ = csma.backoff_slots(&mut rng, false, false);
        assert_eq!(csma.window(), cfg.max_window());
    }

    #[test]
    fn busy_increment_reversed_by_reception() {
        let cfg = config();
        let mut csma = CsmaBackoff::new(cfg);
        csma.start_request();

        csma.on_busy(false);
        assert_eq!(csma.attempts(), 1);

        // A decoded frame explains the busy report; reverse it once
        assert!(csma.compensate_rx(false));
        assert_eq!(csma.attempts(), 0);

        // No double compensation
        assert!(!csma.compensate_rx(false));
        assert_eq!(csma.attempts(), 0);
    }

    #[test]
    fn exhaustion_after_attempt_budget() {
        let cfg = config();
        let mut csma = CsmaBackoff::new(cfg.clone());
        csma.start_request();

        for i in 1..cfg.max_csma_backoffs {
            assert_eq!(csma.on_busy(false), false, "exhausted early at {}", i);
        }
        assert_eq!(csma.on_busy(false), true);
        assert_eq!(csma.attempts(), cfg.max_csma_backoffs);
    }
}
