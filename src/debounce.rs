//! Dead-time debounce for digital inputs.
//!
//! A raw transition is accepted only when more than the configured window has
//! passed since the previous accepted transition on the same pin. Rejected
//! transitions still move the reference level, so the next raw change is
//! judged against what the line last did rather than what was last reported.
//! A level that holds after a rejected bounce produces no event of its own;
//! the next raw change is reported against it.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Rising,
    Falling,
}

impl Transition {
    pub fn from_level(level: bool) -> Self {
        if level {
            Transition::Rising
        } else {
            Transition::Falling
        }
    }

    pub fn level(self) -> bool {
        self == Transition::Rising
    }
}

#[derive(Debug, Clone)]
pub struct EdgeFilter {
    window: Duration,
    reference: Option<bool>,
    accepted: Option<bool>,
    last_accepted_at: Option<Instant>,
}

impl EdgeFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            reference: None,
            accepted: None,
            last_accepted_at: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Last level that was reported (or established by the first sample).
    pub fn stable_level(&self) -> Option<bool> {
        self.accepted
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.accepted = None;
        self.last_accepted_at = None;
    }

    /// Feeds one logical level sampled at `at`. Returns the accepted
    /// transition, if any.
    pub fn observe(&mut self, level: bool, at: Instant) -> Option<Transition> {
        let Some(reference) = self.reference else {
            self.reference = Some(level);
            self.accepted = Some(level);
            return None;
        };

        if level == reference {
            return None;
        }
        self.reference = Some(level);

        if !self.window_elapsed(at) {
            return None;
        }
        self.accepted = Some(level);
        self.last_accepted_at = Some(at);
        Some(Transition::from_level(level))
    }

    fn window_elapsed(&self, at: Instant) -> bool {
        if self.window.is_zero() {
            return true;
        }
        match self.last_accepted_at {
            None => true,
            Some(prev) => at.saturating_duration_since(prev) > self.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn first_sample_only_establishes_level() {
        let mut filter = EdgeFilter::new(ms(50));
        assert_eq!(filter.observe(true, Instant::now()), None);
        assert_eq!(filter.stable_level(), Some(true));
    }

    #[test]
    fn bounce_inside_window_is_suppressed() {
        let t0 = Instant::now();
        let mut filter = EdgeFilter::new(ms(50));
        filter.observe(false, t0);

        let accepted: Vec<_> = [(true, 0), (false, 10), (true, 60)]
            .into_iter()
            .filter_map(|(level, at)| {
                filter
                    .observe(level, t0 + ms(at))
                    .map(|edge| (edge, at))
            })
            .collect();

        assert_eq!(
            accepted,
            vec![(Transition::Rising, 0), (Transition::Rising, 60)]
        );
    }

    #[test]
    fn chatter_within_one_window_yields_at_most_one_edge() {
        let t0 = Instant::now();
        let mut filter = EdgeFilter::new(ms(50));
        filter.observe(false, t0);

        let mut level = false;
        let mut edges = 0;
        for step in 1..=49 {
            level = !level;
            if filter.observe(level, t0 + ms(step)).is_some() {
                edges += 1;
            }
        }
        assert!(edges <= 1);
    }

    #[test]
    fn held_level_after_bounce_is_not_reported() {
        let t0 = Instant::now();
        let mut filter = EdgeFilter::new(ms(20));
        filter.observe(false, t0);

        assert_eq!(filter.observe(true, t0 + ms(1)), Some(Transition::Rising));
        assert_eq!(filter.observe(false, t0 + ms(5)), None);
        // polled samples of the held level after the window passes
        for at in [15, 22, 40, 60] {
            assert_eq!(filter.observe(false, t0 + ms(at)), None);
        }
        assert_eq!(filter.stable_level(), Some(true));
        assert_eq!(filter.observe(true, t0 + ms(61)), Some(Transition::Rising));
    }

    #[test]
    fn polled_bounce_scenario_yields_two_rising_edges() {
        let t0 = Instant::now();
        let mut filter = EdgeFilter::new(ms(50));
        filter.observe(false, t0);

        // sampled every millisecond: high from 0, low from 10, high from 60
        let accepted: Vec<_> = (0..120u64)
            .filter_map(|at| {
                let level = !(10..60).contains(&at);
                filter.observe(level, t0 + ms(at)).map(|edge| (edge, at))
            })
            .collect();

        assert_eq!(
            accepted,
            vec![(Transition::Rising, 0), (Transition::Rising, 60)]
        );
    }

    #[test]
    fn zero_window_passes_every_change() {
        let t0 = Instant::now();
        let mut filter = EdgeFilter::new(Duration::ZERO);
        filter.observe(false, t0);
        assert_eq!(filter.observe(true, t0), Some(Transition::Rising));
        assert_eq!(filter.observe(false, t0), Some(Transition::Falling));
    }

    #[test]
    fn reset_forgets_state() {
        let t0 = Instant::now();
        let mut filter = EdgeFilter::new(ms(10));
        filter.observe(false, t0);
        filter.observe(true, t0 + ms(1));
        filter.reset();
        assert_eq!(filter.stable_level(), None);
        assert_eq!(filter.observe(false, t0 + ms(2)), None);
    }
}
