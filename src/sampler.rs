//! Bounded sliding-window statistics.
//!
//! [`SampleWindow`] is a fixed-capacity ring of integer samples used for
//! ping and throughput tracking: the newest sample evicts the oldest once
//! the window is full. All statistics are computed in integer arithmetic;
//! an empty window returns the neutral element (0) everywhere rather than
//! erroring, so callers can poll statistics unconditionally.

/// A bounded ring of `i64` samples with summary statistics.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: Vec<i64>,
    /// Index of the oldest sample while the ring is full.
    head: usize,
    capacity: usize,
}

impl SampleWindow {
    /// Creates a window holding at most `capacity` samples (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    /// Number of samples currently held.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no samples have been recorded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The configured capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, sample: i64) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.head] = sample;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// Discards all samples.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.head = 0;
    }

    /// The most recently recorded sample, or 0 when empty.
    #[must_use]
    pub fn last(&self) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        let newest = if self.samples.len() < self.capacity {
            self.samples.len() - 1
        } else {
            (self.head + self.capacity - 1) % self.capacity
        };
        self.samples[newest]
    }

    /// The largest sample in the window, or 0 when empty.
    #[must_use]
    pub fn max(&self) -> i64 {
        self.samples.iter().copied().max().unwrap_or(0)
    }

    /// Arithmetic mean (truncating), or 0 when empty.
    #[must_use]
    pub fn mean(&self) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: i128 = self.samples.iter().map(|&s| i128::from(s)).sum();
        (sum / self.samples.len() as i128) as i64
    }

    /// Mean over the samples falling inside `[min, max]`, or 0 when no
    /// sample qualifies. Useful for ignoring ping spikes.
    #[must_use]
    pub fn mean_clamped(&self, min: i64, max: i64) -> i64 {
        let mut sum: i128 = 0;
        let mut count: i128 = 0;
        for &sample in &self.samples {
            if (min..=max).contains(&sample) {
                sum += i128::from(sample);
                count += 1;
            }
        }
        if count == 0 {
            return 0;
        }
        (sum / count) as i64
    }

    /// The median sample, or 0 when empty. For an even number of samples,
    /// the truncating mean of the two middle elements.
    #[must_use]
    pub fn median(&self) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            ((i128::from(sorted[mid - 1]) + i128::from(sorted[mid])) / 2) as i64
        }
    }

    /// Population standard deviation (integer floor), or 0 when empty.
    #[must_use]
    pub fn stddev(&self) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        let count = self.samples.len() as i128;
        let sum: i128 = self.samples.iter().map(|&s| i128::from(s)).sum();
        let mean = sum / count;
        let variance: i128 = self
            .samples
            .iter()
            .map(|&s| {
                let d = i128::from(s) - mean;
                d * d
            })
            .sum::<i128>()
            / count;
        isqrt_i128(variance)
    }

    /// Iterates samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        let (wrapped, linear) = self.samples.split_at(self.head);
        linear.iter().chain(wrapped.iter()).copied()
    }
}

fn isqrt_i128(value: i128) -> i64 {
    debug_assert!(value >= 0);
    let value = value as u128;
    if value < 2 {
        return value as i64;
    }
    let shift = (128 - value.leading_zeros()).div_ceil(2);
    let mut guess = 1u128 << shift;
    loop {
        let next = (guess + value / guess) / 2;
        if next >= guess {
            return guess as i64;
        }
        guess = next;
    }
}

// #########
// # TESTS #
// #########


// =============================================================================
// Property-Based Tests
// =============================================================================
