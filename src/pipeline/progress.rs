use std::collections::VecDeque;
use std::time::Duration;

/// Average of the `y` values whose `x` lies in the last `window` units
/// (relative to the largest `x` seen).
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: f64,
    samples: VecDeque<(f64, f64)>,
    sum: f64,
    max_x: Option<f64>,
}

impl MovingAverage {
    pub fn new(window: f64) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            sum: 0.0,
            max_x: None,
        }
    }

    pub fn insert(&mut self, x: f64, y: f64) {
        let at = self.samples.partition_point(|(sx, _)| *sx <= x);
        self.samples.insert(at, (x, y));
        self.sum += y;
        let max_x = self.max_x.map_or(x, |max| max.max(x));
        self.max_x = Some(max_x);

        let start = max_x - self.window;
        while let Some(&(sx, sy)) = self.samples.front() {
            if sx > start {
                break;
            }
            self.sum -= sy;
            self.samples.pop_front();
        }
    }

    /// `None` until a sample is inside the window.
    pub fn get(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn window_start(&self) -> Option<f64> {
        self.max_x.map(|max| max - self.window)
    }

    pub fn window_end(&self) -> Option<f64> {
        self.max_x
    }
}

/// Snapshot handed to the progress callback after each verified record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub processed: u64,
    pub in_flight: usize,
    pub elapsed: Duration,
    /// Records per second since the first record was pulled.
    pub average_rate: f64,
    /// Records per second over the recent window.
    pub current_rate: Option<f64>,
}

/// Throughput bookkeeping: overall average plus a moving average of the
/// interval between completions.
#[derive(Debug)]
pub(crate) struct Throughput {
    processed: u64,
    last: Option<f64>,
    intervals: MovingAverage,
}

impl Throughput {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            processed: 0,
            last: None,
            intervals: MovingAverage::new(window.as_secs_f64()),
        }
    }

    pub(crate) fn record(&mut self, elapsed: Duration, in_flight: usize) -> Progress {
        let now = elapsed.as_secs_f64();
        self.processed += 1;
        let previous = self.intervals.window_end().or(self.last).unwrap_or(0.0);
        self.intervals.insert(now, now - previous);
        self.last = Some(now);

        let average_rate = if now > 0.0 {
            self.processed as f64 / now
        } else {
            0.0
        };
        let current_rate = self
            .intervals
            .get()
            .filter(|interval| *interval > 0.0)
            .map(|interval| 1.0 / interval);
        Progress {
            processed: self.processed,
            in_flight,
            elapsed,
            average_rate,
            current_rate,
        }
    }
}
