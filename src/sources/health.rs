//! # Outcome Window
//! Fixed-size window over the most recent fetch outcomes of one source.
//!
//! Health is derived from the error rate inside the window, so a source
//! that fails for a while turns unhealthy and recovers on its own once
//! enough successes push the failures out.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct OutcomeWindow {
    /// `true` = success, most recent at the back.
    buf: VecDeque<bool>,
    cap: usize,
}

impl OutcomeWindow {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Record one outcome, evicting the oldest once the window is full.
    pub fn record(&mut self, success: bool) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(success);
    }

    /// Share of failures in the window; 0.0 while empty.
    pub fn error_rate(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        let failures = self.buf.iter().filter(|ok| !**ok).count();
        failures as f64 / self.buf.len() as f64
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}
