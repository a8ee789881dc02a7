use std::collections::VecDeque;
use crate::drivers::BridgeError;
/// Trailing window of decoded transport text.
///
/// Holds at most `capacity` bytes; older text is dropped from the front,
/// always on a character boundary.
#[derive(Clone, Debug)]
pub struct RingBuffer {
    text: String,
    capacity: usize,
}
impl RingBuffer {
    pub fn with_capacity(capacity: usize) -> Result<Self, BridgeError> {
        if capacity == 0 {
            return Err(BridgeError::Config("ring buffer capacity must be greater than zero".into()));
        }
        Ok(Self {
            text: String::with_capacity(capacity),
            capacity,
        })
    }
    pub fn len(&self) -> usize {
        self.text.len()
    }
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
    pub fn as_str(&self) -> &str {
        &self.text
    }
    pub fn push_str(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.capacity {
            let mut cut = self.text.len() - self.capacity;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }
    /// The newest line known to be complete: the second-to-last newline-separated segment.
    ///
    /// The last segment may still be receiving bytes, so it is never returned.
    pub fn last_completed_line(&self) -> Option<&str> {
        let mut segments = self.text.rsplit('\n');
        segments.next()?;
        segments.next().map(str::trim)
    }
}
/// Bounded history of values; the oldest entry is evicted once full.
#[derive(Clone, Debug)]
pub struct SampleSeries<T> {
    items: VecDeque<T>,
    capacity: usize,
}
impl<T: Clone> SampleSeries<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }
    pub fn push(&mut self, value: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(value);
    }
    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }
    pub fn len(&self) -> usize {
        self.items.len()
    }
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    #[test]
    fn ring_truncates_from_front() {
        let mut ring = RingBuffer::with_capacity(8).unwrap();
        ring.push_str("abcdef");
        ring.push_str("ghij");
        assert_eq!(ring.as_str(), "cdefghij");
        assert_eq!(ring.len(), 8);
    }
    #[test]
    fn ring_cut_respects_char_boundaries() {
        let mut ring = RingBuffer::with_capacity(4).unwrap();
        ring.push_str("aΩΩ");
        assert!(ring.len() <= 4);
        assert_eq!(ring.as_str(), "ΩΩ");
    }
    #[test]
    fn last_completed_line_skips_partial_tail() {
        let mut ring = RingBuffer::with_capacity(64).unwrap();
        ring.push_str("first\r\nsecond\r\nthi");
        assert_eq!(ring.last_completed_line(), Some("second"));
        ring.push_str("rd\n");
        assert_eq!(ring.last_completed_line(), Some("third"));
    }
    #[test]
    fn no_completed_line_without_newline() {
        let mut ring = RingBuffer::with_capacity(64).unwrap();
        ring.push_str("partial");
        assert_eq!(ring.last_completed_line(), None);
    }
    #[test]
    fn series_evicts_oldest() {
        let mut series = SampleSeries::with_capacity(3);
        for v in 0..5 {
            series.push(v);
        }
        assert_eq!(series.len(), 3);
        assert_eq!(series.latest(), Some(&4));
    }
    proptest! {
        #[test]
        fn ring_never_exceeds_capacity(
            capacity in 1usize..256,
            chunks in proptest::collection::vec(".{0,64}", 0..40),
        ) {
            let mut ring = RingBuffer::with_capacity(capacity).unwrap();
            for chunk in &chunks {
                ring.push_str(chunk);
                prop_assert!(ring.len() <= capacity);
            }
        }
    }
}
