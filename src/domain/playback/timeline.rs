//! Look-ahead window selection and played/scheduled bookkeeping.
//!
//! All values are seconds. Offsets are positions inside the recording;
//! `start_time` is on the output graph clock.

/// Tolerance for accumulated floating point part durations
const EPSILON: f64 = 1e-6;

/// Outcome of offering one part to a [`WindowCursor`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowStep {
    /// Part starts before the window
    Skip,
    /// Part starts inside the window at `delta` seconds from the recording start
    Take { delta: f64 },
    /// Part starts at or after the window end; stop walking
    Done,
}

/// Walks parts in index order, accumulating their durations, and selects
/// those whose start offset falls inside `[from, to)`.
#[derive(Debug, Clone)]
pub struct WindowCursor {
    from: f64,
    to: f64,
    elapsed: f64,
}

impl WindowCursor {
    pub fn new(from: f64, to: f64) -> Self {
        Self {
            from,
            to,
            elapsed: 0.0,
        }
    }

    /// Offer the next part (by its duration).
    pub fn offer(&mut self, duration: f64) -> WindowStep {
        let delta = self.elapsed;
        if delta >= self.to - EPSILON {
            return WindowStep::Done;
        }
        self.elapsed += duration;
        if delta >= self.from - EPSILON {
            WindowStep::Take { delta }
        } else {
            WindowStep::Skip
        }
    }
}

/// Played/scheduled positions of one playback session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackTimeline {
    /// Recording position the session started from
    offset: f64,
    /// Graph time corresponding to `offset`
    start_time: f64,
    played: f64,
    scheduled: f64,
}

impl PlaybackTimeline {
    /// Start a session at `offset`; the first buffer may start `lead_in`
    /// seconds after `graph_now`.
    pub fn new(offset: f64, graph_now: f64, lead_in: f64) -> Self {
        Self {
            offset,
            start_time: graph_now + lead_in,
            played: offset,
            scheduled: offset,
        }
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn played(&self) -> f64 {
        self.played
    }

    pub fn scheduled(&self) -> f64 {
        self.scheduled
    }

    /// Graph time at which a part starting at `delta` must begin
    pub fn start_at(&self, delta: f64) -> f64 {
        self.start_time + delta - self.offset
    }

    /// A part was committed to the output graph
    pub fn mark_scheduled(&mut self, delta: f64, duration: f64) {
        self.scheduled = self.scheduled.max(delta + duration);
    }

    /// A part finished playing; returns the new played position
    pub fn mark_played(&mut self, delta: f64, duration: f64) -> f64 {
        self.played = self.played.max(delta + duration);
        self.played
    }

    /// Fraction of the scheduled span that has been played
    pub fn played_ratio(&self) -> f64 {
        let span = self.scheduled - self.offset;
        if span <= EPSILON {
            return 0.0;
        }
        (self.played - self.offset) / span
    }

    /// Whether the next window should be scheduled now
    pub fn refill_due(&self, ratio: f64) -> bool {
        self.scheduled - self.offset > EPSILON && self.played_ratio() + EPSILON >= ratio
    }

    /// Bounds of the window that follows everything scheduled so far
    pub fn next_window(&self, look_ahead: f64) -> (f64, f64) {
        (self.scheduled, self.scheduled + look_ahead)
    }
}
