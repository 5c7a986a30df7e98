use std::collections::VecDeque;

/// Fixed-capacity sliding window with O(1) min, max and average.
///
/// Min and max are tracked with monotonic deques of `(index, value)`; the
/// average with a running sum.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    values: VecDeque<f64>,
    min: VecDeque<(u64, f64)>,
    max: VecDeque<(u64, f64)>,
    sum: f64,
    next_index: u64,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
            min: VecDeque::with_capacity(capacity),
            max: VecDeque::with_capacity(capacity),
            sum: 0.0,
            next_index: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        let index = self.next_index;
        self.next_index += 1;

        if self.values.len() == self.capacity {
            if let Some(evicted) = self.values.pop_front() {
                self.sum -= evicted;
            }
        }
        self.values.push_back(value);
        self.sum += value;

        let oldest = index + 1 - self.values.len() as u64;
        while self.min.front().is_some_and(|&(i, _)| i < oldest) {
            self.min.pop_front();
        }
        while self.max.front().is_some_and(|&(i, _)| i < oldest) {
            self.max.pop_front();
        }
        while self.min.back().is_some_and(|&(_, v)| v >= value) {
            self.min.pop_back();
        }
        while self.max.back().is_some_and(|&(_, v)| v <= value) {
            self.max.pop_back();
        }
        self.min.push_back((index, value));
        self.max.push_back((index, value));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn min(&self) -> Option<f64> {
        self.min.front().map(|&(_, v)| v)
    }

    pub fn max(&self) -> Option<f64> {
        self.max.front().map(|&(_, v)| v)
    }

    pub fn average(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.sum / self.values.len() as f64)
        }
    }
}

/// Summary of one window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSummary {
    pub min: f64,
    pub max: f64,
    pub average: f64,
}

impl SlidingWindow {
    pub fn summary(&self) -> Option<WindowSummary> {
        Some(WindowSummary {
            min: self.min()?,
            max: self.max()?,
            average: self.average()?,
        })
    }
}

/// Compression time and ratio over the last N encoded frames. Purely
/// observational.
#[derive(Debug, Clone)]
pub struct CompressionStats {
    time_ms: SlidingWindow,
    ratio_pct: SlidingWindow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionSummary {
    pub samples: usize,
    pub time_ms: WindowSummary,
    pub ratio_pct: WindowSummary,
}

impl CompressionStats {
    pub fn new(window: usize) -> Self {
        Self {
            time_ms: SlidingWindow::new(window),
            ratio_pct: SlidingWindow::new(window),
        }
    }

    /// Record one operation. The ratio is compressed size as a percentage of
    /// the original.
    pub fn record(&mut self, elapsed_ms: f64, original_bytes: usize, compressed_bytes: usize) {
        self.time_ms.push(elapsed_ms);
        if original_bytes > 0 {
            self.ratio_pct
                .push(compressed_bytes as f64 * 100.0 / original_bytes as f64);
        }
    }

    pub fn summary(&self) -> Option<CompressionSummary> {
        Some(CompressionSummary {
            samples: self.time_ms.len(),
            time_ms: self.time_ms.summary()?,
            ratio_pct: self.ratio_pct.summary()?,
        })
    }
}
