/// Median of three filter over (rate, time) correction pairs.
///
/// Once three pairs have been seen, the pair whose rate correction is the
/// median of the last three is used, so that a single bad pulse is
/// outvoted by its neighbours. Until then pairs pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct MedianCorrectionQueue {
    slots: [(f64, f64); 3],
    next: usize,
    len: usize,
}

impl MedianCorrectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all history.
    pub fn flush(&mut self) {
        self.next = 0;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn filter(&mut self, rate_correction: f64, time_correction: f64) -> (f64, f64) {
        self.slots[self.next] = (rate_correction, time_correction);
        self.next = (self.next + 1) % 3;
        if self.len < 3 {
            self.len += 1;
        }
        if self.len < 3 {
            return (rate_correction, time_correction);
        }

        let [a, b, c] = self.slots;
        if (a.0 - b.0) * (a.0 - c.0) <= 0.0 {
            a
        } else if (b.0 - a.0) * (b.0 - c.0) <= 0.0 {
            b
        } else {
            c
        }
    }
}
