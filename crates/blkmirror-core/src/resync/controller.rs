//! Resync rate controller.
//!
//! With a planning horizon (`c_plan_ahead`) the controller keeps a FIFO of
//! corrections spread over the next ticks. Each tick it compares the
//! sectors it wants in flight (`c_fill_target`, or enough to cover
//! `c_delay_target` at the observed completion rate) with what is in flight
//! and planned, spreads the difference over the plan, and releases the head
//! of the plan plus whatever completed since the last tick. Without a plan
//! the fixed `resync_rate` applies.

use std::collections::VecDeque;

use crate::config::ResyncConfig;

/// Sectors per tick at `rate_kib` KiB/s.
pub fn sectors_per_tick(rate_kib: u64, tick_ms: u64) -> u64 {
    rate_kib * 2 * tick_ms / 1000
}

/// Resync yields to application I/O once it runs faster than `c_min_rate`.
pub fn should_slow_down(app_io_active: bool, current_rate_kib: u64, c_min_rate_kib: u64) -> bool {
    app_io_active && c_min_rate_kib > 0 && current_rate_kib > c_min_rate_kib
}

/// FIFO-plan rate controller of one resync run.
#[derive(Debug, Clone)]
pub struct RateController {
    plan: VecDeque<i64>,
    total: i64,
    sect_in: u64,
}

impl RateController {
    /// Creates a controller for `cfg`.
    pub fn new(cfg: &ResyncConfig) -> Self {
        let steps = Self::steps(cfg);
        Self {
            plan: std::iter::repeat(0).take(steps).collect(),
            total: 0,
            sect_in: 0,
        }
    }

    fn steps(cfg: &ResyncConfig) -> usize {
        let tick = cfg.tick_ms.max(1);
        ((cfg.c_plan_ahead as u64 * 100) / tick).max(1) as usize
    }

    /// Accounts resync sectors that completed since the last tick.
    pub fn completed(&mut self, sectors: u64) {
        self.sect_in += sectors;
    }

    /// Sectors to request this tick, given `in_flight` sectors requested
    /// and not yet completed.
    pub fn sectors_for_tick(&mut self, cfg: &ResyncConfig, in_flight: u64) -> u64 {
        let sect_in = std::mem::take(&mut self.sect_in);
        if cfg.c_plan_ahead == 0 {
            return sectors_per_tick(cfg.resync_rate_kib, cfg.tick_ms);
        }
        if self.plan.len() != Self::steps(cfg) {
            *self = Self::new(cfg);
        }
        let steps = self.plan.len() as i64;
        let tick = cfg.tick_ms.max(1);

        let want = if in_flight + sect_in == 0 {
            sectors_per_tick(cfg.resync_rate_kib, tick) as i64 * steps
        } else if cfg.c_fill_target > 0 {
            cfg.c_fill_target as i64
        } else {
            (sect_in * cfg.c_delay_target as u64 * 100 / tick) as i64
        };

        let correction = want - in_flight as i64 - self.total;
        let per_step = correction / steps;
        for slot in self.plan.iter_mut() {
            *slot += per_step;
        }
        self.total += per_step * steps;

        let current = self.plan.pop_front().unwrap_or(0);
        self.plan.push_back(0);
        self.total -= current;

        let requested = (sect_in as i64 + current).max(0) as u64;
        requested.min(sectors_per_tick(cfg.c_max_rate_kib, tick))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(plan_ahead: u32) -> ResyncConfig {
        ResyncConfig {
            resync_rate_kib: 250,
            c_plan_ahead: plan_ahead,
            c_fill_target: 100,
            c_delay_target: 10,
            c_max_rate_kib: 102_400,
            c_min_rate_kib: 250,
            tick_ms: 100,
            resync_extents: 61,
        }
    }

    #[test]
    fn test_fixed_rate() {
        let cfg = cfg(0);
        let mut c = RateController::new(&cfg);
        assert_eq!(c.sectors_for_tick(&cfg, 0), 50);
        c.completed(1000);
        assert_eq!(c.sectors_for_tick(&cfg, 4000), 50);
    }

    #[test]
    fn test_first_tick_starts_at_resync_rate() {
        let cfg = cfg(20);
        let mut c = RateController::new(&cfg);
        assert_eq!(c.sectors_for_tick(&cfg, 0), 50);
    }

    #[test]
    fn test_max_rate_caps() {
        let mut cfg = cfg(20);
        cfg.c_max_rate_kib = 100;
        let mut c = RateController::new(&cfg);
        assert_eq!(c.sectors_for_tick(&cfg, 0), 20);
        c.completed(5000);
        assert_eq!(c.sectors_for_tick(&cfg, 10), 20);
    }

    #[test]
    fn test_fill_target_bounds_in_flight() {
        let cfg = cfg(20);
        let mut c = RateController::new(&cfg);
        let mut in_flight = 0u64;
        for _ in 0..400 {
            let req = c.sectors_for_tick(&cfg, in_flight);
            // everything requested completes during the next tick
            c.completed(in_flight);
            in_flight = req;
        }
        assert!(in_flight > 0);
        assert!(in_flight <= 2 * cfg.c_fill_target, "in flight {}", in_flight);
    }

    #[test]
    fn test_slow_down() {
        assert!(should_slow_down(true, 1000, 250));
        assert!(!should_slow_down(false, 1000, 250));
        assert!(!should_slow_down(true, 200, 250));
        assert!(!should_slow_down(true, 1000, 0));
    }
}
