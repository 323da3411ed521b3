//! Fixed-capacity ring buffer backing the echo loop.

/// A cyclic byte buffer split into a *data* region (bytes read in, waiting
/// to be written out) and a *prepared* region (free space waiting to be
/// read into).
///
/// Either region can wrap around the end of the storage, so both are
/// exposed as a pair of contiguous segments; the second segment is empty
/// when no wrap occurred. After every operation
/// `filled() + unfilled() == capacity()`.
#[derive(Debug)]
pub struct CyclicBuffer {
    storage: Box<[u8]>,
    data_start: usize,
    data_len: usize,
}

impl CyclicBuffer {
    /// Create a buffer of `capacity` bytes, all of them initially prepared.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cyclic buffer capacity must be non-zero");
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            data_start: 0,
            data_len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes currently in the data region.
    pub fn filled(&self) -> usize {
        self.data_len
    }

    /// Bytes currently in the prepared region.
    pub fn unfilled(&self) -> usize {
        self.storage.len() - self.data_len
    }

    /// Empty both regions: every byte becomes prepared again.
    pub fn reset(&mut self) {
        self.data_start = 0;
        self.data_len = 0;
    }

    /// The front of the data region, clipped to at most `max` bytes.
    pub fn data(&self, max: usize) -> (&[u8], &[u8]) {
        let cap = self.storage.len();
        let len = self.data_len.min(max);
        let first_len = len.min(cap - self.data_start);
        let first = &self.storage[self.data_start..self.data_start + first_len];
        let second = &self.storage[..len - first_len];
        (first, second)
    }

    /// The front of the prepared region, clipped to at most `max` bytes.
    pub fn prepared(&mut self, max: usize) -> (&mut [u8], &mut [u8]) {
        let cap = self.storage.len();
        let len = (cap - self.data_len).min(max);
        let start = (self.data_start + self.data_len) % cap;
        if len <= cap - start {
            let first = &mut self.storage[start..start + len];
            (first, Default::default())
        } else {
            let second_len = len - (cap - start);
            let (head, tail) = self.storage.split_at_mut(start);
            (tail, &mut head[..second_len])
        }
    }

    /// Move `k` freshly filled bytes from the front of the prepared region
    /// into the data region.
    ///
    /// # Panics
    ///
    /// Panics if `k` exceeds the prepared size.
    pub fn commit(&mut self, k: usize) {
        assert!(
            k <= self.unfilled(),
            "commit of {} bytes exceeds prepared size {}",
            k,
            self.unfilled()
        );
        self.data_len += k;
    }

    /// Release `k` written-out bytes from the front of the data region back
    /// into the prepared region.
    ///
    /// # Panics
    ///
    /// Panics if `k` exceeds the data size.
    pub fn consume(&mut self, k: usize) {
        assert!(
            k <= self.data_len,
            "consume of {} bytes exceeds data size {}",
            k,
            self.data_len
        );
        self.data_start = (self.data_start + k) % self.storage.len();
        self.data_len -= k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_data(buf: &CyclicBuffer, max: usize) -> Vec<u8> {
        let (a, b) = buf.data(max);
        let mut out = a.to_vec();
        out.extend_from_slice(b);
        out
    }

    fn fill(buf: &mut CyclicBuffer, bytes: &[u8]) {
        let (a, b) = buf.prepared(bytes.len());
        let split = a.len().min(bytes.len());
        a[..split].copy_from_slice(&bytes[..split]);
        b[..bytes.len() - split].copy_from_slice(&bytes[split..]);
        buf.commit(bytes.len());
    }

    #[test]
    fn starts_fully_prepared() {
        let buf = CyclicBuffer::new(8);
        assert_eq!(buf.filled(), 0);
        assert_eq!(buf.unfilled(), 8);
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn commit_then_consume_round_trips_in_order() {
        let mut buf = CyclicBuffer::new(8);
        fill(&mut buf, b"abcde");
        assert_eq!(buf.filled(), 5);
        assert_eq!(buf.unfilled(), 3);
        assert_eq!(collect_data(&buf, 8), b"abcde");

        buf.consume(2);
        assert_eq!(collect_data(&buf, 8), b"cde");
        assert_eq!(buf.filled() + buf.unfilled(), buf.capacity());
    }

    #[test]
    fn regions_wrap_into_two_segments() {
        let mut buf = CyclicBuffer::new(8);
        fill(&mut buf, b"abcdef");
        buf.consume(6);

        // Data region now starts at offset 6; seven bytes must wrap.
        fill(&mut buf, b"0123456");
        let (first, second) = buf.data(8);
        assert_eq!(first, b"01");
        assert_eq!(second, b"23456");
        assert_eq!(collect_data(&buf, 8), b"0123456");
        assert_eq!(buf.filled() + buf.unfilled(), buf.capacity());
    }

    #[test]
    fn data_and_prepared_clip_to_max() {
        let mut buf = CyclicBuffer::new(8);
        fill(&mut buf, b"abcdef");

        let (first, second) = buf.data(4);
        assert_eq!(first.len() + second.len(), 4);

        let (first, second) = buf.prepared(1);
        assert_eq!(first.len() + second.len(), 1);
    }

    #[test]
    fn interleaved_operations_preserve_byte_order() {
        let mut buf = CyclicBuffer::new(4);
        let mut seen = Vec::new();
        let mut next = 0u8;

        for step in 0..32 {
            let n = (step % 3) + 1;
            let n = n.min(buf.unfilled());
            let chunk: Vec<u8> = (0..n).map(|i| next.wrapping_add(i as u8)).collect();
            next = next.wrapping_add(n as u8);
            fill(&mut buf, &chunk);
            assert_eq!(buf.filled() + buf.unfilled(), 4);

            let take = buf.filled().min((step % 2) + 1);
            seen.extend_from_slice(&collect_data(&buf, take));
            buf.consume(take);
            assert_eq!(buf.filled() + buf.unfilled(), 4);
        }

        // Everything consumed so far came back in commit order.
        for (i, b) in seen.iter().enumerate() {
            assert_eq!(*b, i as u8);
        }
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut buf = CyclicBuffer::new(8);
        fill(&mut buf, b"abc");
        buf.consume(1);
        buf.reset();
        assert_eq!(buf.filled(), 0);
        assert_eq!(buf.unfilled(), 8);
    }

    #[test]
    #[should_panic(expected = "consume")]
    fn consume_past_data_panics() {
        let mut buf = CyclicBuffer::new(4);
        fill(&mut buf, b"ab");
        buf.consume(3);
    }

    #[test]
    #[should_panic(expected = "commit")]
    fn commit_past_prepared_panics() {
        let mut buf = CyclicBuffer::new(4);
        buf.commit(5);
    }
}
