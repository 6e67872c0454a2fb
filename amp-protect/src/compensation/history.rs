use std::collections::VecDeque;

use serde::Serialize;

/// Samples kept between the sampler and the compensator.
pub const HISTORY_CAPACITY: usize = 10;

/// One reading taken by the periodic sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Sample {
    pub id: u32,
    /// Tenths of a degree Celsius.
    pub temperature: i32,
    pub battery_mv: Option<u32>,
}

/// Bounded FIFO between the sampler and the compensator.
///
/// A push into a full history discards the new sample but still consumes a
/// sequence id, so the gap shows up as a jump in ids and in
/// [`dropped`](Self::dropped).
#[derive(Debug, Clone)]
pub struct SampleHistory {
    samples: VecDeque<Sample>,
    capacity: usize,
    next_id: u32,
    dropped: u32,
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 0,
            dropped: 0,
        }
    }

    /// Queue a reading. Returns the stored sample, or `None` when the
    /// history was full and the reading was dropped.
    pub fn push(&mut self, temperature: i32, battery_mv: Option<u32>) -> Option<Sample> {
        let sample = Sample {
            id: self.next_id,
            temperature,
            battery_mv,
        };
        self.next_id = self.next_id.wrapping_add(1);

        if self.samples.len() >= self.capacity {
            self.dropped = self.dropped.wrapping_add(1);
            return None;
        }

        self.samples.push_back(sample);
        Some(sample)
    }

    pub fn pop(&mut self) -> Option<Sample> {
        self.samples.pop_front()
    }

    /// Buffered temperatures, oldest first, without consuming them.
    pub fn temperatures(&self) -> Vec<i32> {
        self.samples.iter().map(|s| s.temperature).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Ids handed out so far, including those of dropped samples.
    pub fn sequence(&self) -> u32 {
        self.next_id
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl Default for SampleHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}
