//! Lookahead step scheduler.
//!
//! The scheduler holds the time of the next step and the step index. Each
//! [`StepScheduler::due`] call emits every step whose fire time (step time
//! minus lookahead) has been reached, stamped with its exact audio-clock time.
//! The host re-arms a single timer for [`StepScheduler::wake_at`].

/// Seconds per sixteenth note.
pub fn step_interval(bpm: f32) -> f64 {
    60.0 / bpm as f64 / 4.0
}

/// Swing delay for `step`: odd steps are pushed back by a fraction of half
/// the step interval.
pub fn swing_offset(step: usize, swing: f32, interval: f64) -> f64 {
    if step % 2 == 1 {
        (swing.clamp(0.0, 100.0) as f64 / 100.0) * (interval / 2.0)
    } else {
        0.0
    }
}

/// Step after `current`, wrapping at `length`. `None` starts at 0.
pub fn next_step(current: Option<usize>, length: usize) -> usize {
    match current {
        Some(step) => (step + 1) % length.max(1),
        None => 0,
    }
}

/// Steps the scheduler may fall behind the clock before it re-anchors
/// instead of firing the backlog.
const MAX_LAG_STEPS: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledStep {
    pub step: usize,
    /// Audio-clock time the step sounds at, swing included.
    pub time: f64,
}

/// Timing parameters read from the pattern on every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub length: usize,
    pub bpm: f32,
    pub swing: f32,
}

#[derive(Debug, Clone)]
pub struct StepScheduler {
    state: TransportState,
    lookahead: f64,
    next_time: f64,
    current: Option<usize>,
    /// Unswung time of the last scheduled step.
    last_time: Option<f64>,
}

impl StepScheduler {
    pub fn new(lookahead: f64) -> Self {
        StepScheduler {
            state: TransportState::Stopped,
            lookahead: lookahead.max(0.0),
            next_time: 0.0,
            current: None,
            last_time: None,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == TransportState::Playing
    }

    pub fn current_step(&self) -> Option<usize> {
        self.current
    }

    pub fn next_time(&self) -> f64 {
        self.next_time
    }

    /// Begin at step 0, sounding at `now`.
    pub fn start(&mut self, now: f64) {
        self.state = TransportState::Playing;
        self.next_time = now;
        self.current = None;
        self.last_time = None;
    }

    pub fn stop(&mut self) {
        self.state = TransportState::Stopped;
        self.current = None;
        self.last_time = None;
    }

    /// Re-anchor the timeline for a new tempo, keeping the step position.
    /// The next step lands one new interval after the last scheduled one,
    /// never earlier than `now`.
    pub fn restart(&mut self, now: f64, bpm: f32) {
        if !self.is_playing() {
            return;
        }
        self.next_time = match self.last_time {
            Some(last) => (last + step_interval(bpm)).max(now),
            None => now,
        };
    }

    /// Keep the step position inside a new pattern length.
    pub fn fit_length(&mut self, length: usize) {
        if let Some(step) = self.current {
            self.current = Some(step % length.max(1));
        }
    }

    /// Clock time at which the next step must be scheduled.
    pub fn wake_at(&self) -> Option<f64> {
        self.is_playing().then(|| self.next_time - self.lookahead)
    }

    /// Every step that falls due by `now`.
    pub fn due(&mut self, now: f64, timing: Timing) -> Vec<ScheduledStep> {
        let mut out = Vec::new();
        if !self.is_playing() {
            return out;
        }
        let interval = step_interval(timing.bpm);
        if now - self.next_time > MAX_LAG_STEPS * interval {
            log::warn!(
                "sequencer fell {:.3}s behind the clock, re-anchoring",
                now - self.next_time
            );
            self.next_time = now;
        }
        while self.next_time - self.lookahead <= now {
            let step = next_step(self.current, timing.length);
            let time = self.next_time + swing_offset(step, timing.swing, interval);
            out.push(ScheduledStep { step, time });
            self.current = Some(step);
            self.last_time = Some(self.next_time);
            self.next_time += interval;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(length: usize, bpm: f32, swing: f32) -> Timing {
        Timing { length, bpm, swing }
    }

    fn run(sched: &mut StepScheduler, t: Timing, until: f64, dt: f64) -> Vec<ScheduledStep> {
        let mut out = Vec::new();
        let mut now = 0.0;
        while now <= until {
            out.extend(sched.due(now, t));
            now += dt;
        }
        out
    }

    #[test]
    fn sixteen_steps_at_eighth_of_a_second() {
        let mut sched = StepScheduler::new(0.05);
        sched.start(0.0);
        let steps = run(&mut sched, timing(16, 120.0, 0.0), 2.5, 0.01);
        assert!(steps.len() >= 16);
        for (i, s) in steps.iter().take(16).enumerate() {
            assert_eq!(s.step, i);
            assert_eq!(s.time, i as f64 * 0.125);
        }
        for pair in steps.windows(2).take(15) {
            assert_eq!(pair[1].time - pair[0].time, 0.125);
        }
    }

    #[test]
    fn step_index_stays_in_range_and_visits_every_step() {
        for &len in &[8usize, 16, 32] {
            let mut cur = None;
            let mut seen = vec![false; len];
            for _ in 0..=len {
                let next = next_step(cur, len);
                assert!(next < len);
                seen[next] = true;
                cur = Some(next);
            }
            assert!(seen.iter().all(|&s| s), "length {len}");
        }
    }

    #[test]
    fn swing_only_moves_odd_steps() {
        let interval = step_interval(120.0);
        for swing in [0.0, 25.0, 50.0, 100.0] {
            for step in 0..16 {
                let off = swing_offset(step, swing, interval);
                if step % 2 == 0 {
                    assert_eq!(off, 0.0);
                } else {
                    let expected = swing as f64 / 100.0 * interval / 2.0;
                    assert!((off - expected).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn swung_steps_keep_the_straight_grid() {
        let mut sched = StepScheduler::new(0.05);
        sched.start(0.0);
        let steps = run(&mut sched, timing(8, 120.0, 50.0), 0.5, 0.01);
        assert_eq!(steps[0].time, 0.0);
        assert!((steps[1].time - (0.125 + 0.03125)).abs() < 1e-12);
        assert_eq!(steps[2].time, 0.25);
    }

    #[test]
    fn only_lookahead_window_is_scheduled() {
        let mut sched = StepScheduler::new(0.05);
        sched.start(0.0);
        let first = sched.due(0.0, timing(16, 120.0, 0.0));
        assert_eq!(first.len(), 1);
        assert_eq!(sched.wake_at(), Some(0.125 - 0.05));
        assert!(sched.due(0.05, timing(16, 120.0, 0.0)).is_empty());
        assert_eq!(sched.due(0.08, timing(16, 120.0, 0.0)).len(), 1);
    }

    #[test]
    fn stop_clears_timer_and_position() {
        let mut sched = StepScheduler::new(0.05);
        sched.start(0.0);
        sched.due(0.3, timing(16, 120.0, 0.0));
        sched.stop();
        assert_eq!(sched.wake_at(), None);
        assert_eq!(sched.current_step(), None);
        assert!(sched.due(10.0, timing(16, 120.0, 0.0)).is_empty());
    }

    #[test]
    fn restart_keeps_step_and_reanchors() {
        let mut sched = StepScheduler::new(0.0);
        sched.start(0.0);
        sched.due(0.3, timing(16, 120.0, 0.0));
        assert_eq!(sched.current_step(), Some(2));
        sched.restart(0.31, 60.0);
        assert!(sched.due(0.31, timing(16, 60.0, 0.0)).is_empty());
        let next = sched.due(0.5, timing(16, 60.0, 0.0));
        assert_eq!(next, vec![ScheduledStep { step: 3, time: 0.5 }]);
        assert_eq!(sched.wake_at(), Some(0.75));

        sched.restart(2.0, 120.0);
        assert_eq!(sched.due(2.0, timing(16, 120.0, 0.0))[0].time, 2.0);
    }

    #[test]
    fn shrinking_wraps_position() {
        let mut sched = StepScheduler::new(0.0);
        sched.start(0.0);
        run(&mut sched, timing(16, 120.0, 0.0), 1.4, 0.01);
        assert_eq!(sched.current_step(), Some(11));
        sched.fit_length(8);
        assert_eq!(sched.current_step(), Some(3));
    }

    #[test]
    fn long_stall_drops_the_backlog() {
        let mut sched = StepScheduler::new(0.0);
        let t = timing(16, 120.0, 0.0);
        sched.start(0.0);
        assert_eq!(sched.due(0.0, t).len(), 1);
        let after = sched.due(5.0, t);
        assert_eq!(after, vec![ScheduledStep { step: 1, time: 5.0 }]);
        assert_eq!(sched.wake_at(), Some(5.125));
    }

    #[test]
    fn lag_threshold_follows_tempo() {
        // seven steps behind at 60 bpm is 1.75s, still caught up step by step
        let mut sched = StepScheduler::new(0.0);
        let t = timing(16, 60.0, 0.0);
        sched.start(0.0);
        let steps = sched.due(1.75, t);
        assert_eq!(steps.len(), 8);
        assert_eq!(steps[7], ScheduledStep { step: 7, time: 1.75 });
    }
}
