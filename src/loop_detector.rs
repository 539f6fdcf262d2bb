// src/loop_detector.rs

//! Repetition detection over recent agent responses.
//!
//! Each response is normalized (case, whitespace and digits folded away),
//! hashed together with its milestone id, and pushed into a sliding window.
//! Seeing the same fingerprint `threshold` times inside the window is a loop.

use std::collections::VecDeque;

use blake3::Hasher;
use tracing::debug;

pub const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    /// Not (yet) repetitive; `occurrences` counts this response.
    Fresh { occurrences: usize },
    Loop { occurrences: usize },
}

impl LoopVerdict {
    pub fn is_loop(self) -> bool {
        matches!(self, LoopVerdict::Loop { .. })
    }
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    window: VecDeque<blake3::Hash>,
    capacity: usize,
    threshold: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD)
    }
}

impl LoopDetector {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            threshold: threshold.max(2),
        }
    }

    /// Record a response for `milestone_id` and report whether it completes
    /// a loop.
    pub fn record(&mut self, milestone_id: &str, response: &str) -> LoopVerdict {
        let print = fingerprint(milestone_id, response);
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(print);

        let occurrences = self.window.iter().filter(|h| **h == print).count();
        if occurrences >= self.threshold {
            debug!(milestone = %milestone_id, occurrences, "repetitive agent output");
            LoopVerdict::Loop { occurrences }
        } else {
            LoopVerdict::Fresh { occurrences }
        }
    }

    /// Forget everything; called after a corrective prompt.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

/// Lowercase, fold every digit to `#`, collapse whitespace runs.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            word.chars()
                .map(|c| if c.is_ascii_digit() { '#' } else { c })
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn fingerprint(milestone_id: &str, response: &str) -> blake3::Hash {
    let mut hasher = Hasher::new();
    hasher.update(milestone_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(normalize(response).as_bytes());
    hasher.finalize()
}
