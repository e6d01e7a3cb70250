// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Fixed capacity staging area between socket reads and frame extraction.
///
/// `[consumed, filled)` holds bytes read but not parsed yet, `[filled, capacity)`
/// is where the next read lands. The backing store never grows; space at the
/// head is reclaimed by [`ReceiveBuffer::compact`].
///
/// Invariant: `0 <= consumed <= filled <= capacity`.
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Box<[u8]>,
    consumed: usize,
    filled: usize,
}

impl ReceiveBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        ReceiveBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            consumed: 0,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Free space behind the filled region.
    pub fn free(&self) -> usize {
        self.capacity() - self.filled
    }

    /// Bytes read but not consumed.
    pub fn pending(&self) -> usize {
        self.filled - self.consumed
    }

    pub fn consumed_up_to(&self) -> usize {
        self.consumed
    }

    pub fn filled_up_to(&self) -> usize {
        self.filled
    }

    pub fn unparsed(&self) -> &[u8] {
        &self.data[self.consumed..self.filled]
    }

    /// Region the next socket read should fill.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Records `n` bytes written into [`ReceiveBuffer::unfilled_mut`].
    pub fn fill(&mut self, n: usize) {
        assert!(n <= self.free(), "filled past buffer capacity");
        self.filled += n;
    }

    /// Marks `n` unparsed bytes as handed out.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.pending(), "consumed past filled region");
        self.consumed += n;
    }

    /// Moves the unparsed bytes to offset 0.
    pub fn compact(&mut self) {
        if self.consumed == 0 {
            return;
        }
        self.data.copy_within(self.consumed..self.filled, 0);
        self.filled -= self.consumed;
        self.consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_with(buffer: &mut ReceiveBuffer, bytes: &[u8]) {
        buffer.unfilled_mut()[..bytes.len()].copy_from_slice(bytes);
        buffer.fill(bytes.len());
    }

    #[test]
    fn test_cursors_follow_fill_and_consume() {
        let mut buffer = ReceiveBuffer::with_capacity(16);
        assert_eq!(buffer.free(), 16);
        filled_with(&mut buffer, b"hello world");
        assert_eq!(buffer.pending(), 11);
        assert_eq!(buffer.free(), 5);

        buffer.consume(6);
        assert_eq!(buffer.unparsed(), b"world");
        assert_eq!(buffer.consumed_up_to(), 6);
        assert_eq!(buffer.filled_up_to(), 11);
        // consuming does not give space back until compaction
        assert_eq!(buffer.free(), 5);
    }

    #[test]
    fn test_compact_moves_unparsed_to_front() {
        let mut buffer = ReceiveBuffer::with_capacity(16);
        filled_with(&mut buffer, b"0123456789abcdef");
        buffer.consume(10);
        assert_eq!(buffer.free(), 0);

        buffer.compact();
        assert_eq!(buffer.consumed_up_to(), 0);
        assert_eq!(buffer.filled_up_to(), 6);
        assert_eq!(buffer.unparsed(), b"abcdef");
        assert_eq!(buffer.free(), 10);

        filled_with(&mut buffer, b"gh");
        assert_eq!(buffer.unparsed(), b"abcdefgh");
    }

    #[test]
    fn test_compact_fully_consumed() {
        let mut buffer = ReceiveBuffer::with_capacity(8);
        filled_with(&mut buffer, b"abcd");
        buffer.consume(4);
        buffer.compact();
        assert_eq!(buffer.pending(), 0);
        assert_eq!(buffer.free(), 8);
    }

    #[test]
    #[should_panic]
    fn test_fill_past_capacity_panics() {
        let mut buffer = ReceiveBuffer::with_capacity(4);
        buffer.fill(5);
    }
}
