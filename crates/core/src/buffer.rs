//! Growable byte buffer with separate read and write cursors.
//!
//! ```text
//! core: [ consumed | readable           | writable        ]
//!       0          rpos                 wpos              capacity
//! ```
//!
//! Growing first tries to slide the readable region back to offset 0; only
//! when that does not free enough room is a larger block allocated. Sizes
//! double up to [`GROW_LINEAR_THRESHOLD`] and then grow in steps of it.

pub const GROW_LINEAR_THRESHOLD: usize = 1024 * 1024;

#[derive(Debug, Default, Clone)]
pub struct Buffer {
    core: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            core: vec![0; capacity],
            rpos: 0,
            wpos: 0,
        }
    }

    /// Readable bytes.
    pub fn len(&self) -> usize {
        self.wpos - self.rpos
    }

    pub fn is_empty(&self) -> bool {
        self.rpos == self.wpos
    }

    pub fn capacity(&self) -> usize {
        self.core.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.core[self.rpos..self.wpos]
    }

    /// Consume up to `n` readable bytes.
    pub fn skip(&mut self, n: usize) {
        self.rpos += n.min(self.len());
        if self.rpos == self.wpos {
            self.rpos = 0;
            self.wpos = 0;
        }
    }

    /// Make at least `n` writable bytes available and return them.
    ///
    /// The bytes become readable only after [`flush`](Self::flush).
    pub fn reserve(&mut self, n: usize) -> &mut [u8] {
        self.grow(n);
        &mut self.core[self.wpos..self.wpos + n]
    }

    /// Commit `n` bytes previously obtained through [`reserve`](Self::reserve).
    pub fn flush(&mut self, n: usize) {
        self.wpos += n.min(self.core.len() - self.wpos);
    }

    pub fn write(&mut self, data: &[u8]) {
        self.reserve(data.len()).copy_from_slice(data);
        self.flush(data.len());
    }

    /// Drop all readable bytes, keeping the allocation.
    pub fn reset(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    fn grow(&mut self, n: usize) {
        let writable = self.core.len() - self.wpos;
        if writable >= n {
            return;
        }
        if self.rpos + writable >= n {
            self.core.copy_within(self.rpos..self.wpos, 0);
            self.wpos -= self.rpos;
            self.rpos = 0;
            return;
        }

        let need = self.len() + n;
        let capacity = if need <= GROW_LINEAR_THRESHOLD {
            need.next_power_of_two()
        } else {
            need.div_ceil(GROW_LINEAR_THRESHOLD) * GROW_LINEAR_THRESHOLD
        };
        let mut core = vec![0; capacity];
        core[..self.len()].copy_from_slice(self.bytes());
        self.wpos = self.len();
        self.rpos = 0;
        self.core = core;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let mut b = Buffer::new(4);
        b.write(b"abc");
        assert_eq!(b.bytes(), b"abc");
        b.skip(1);
        assert_eq!(b.bytes(), b"bc");
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn skipping_everything_rewinds() {
        let mut b = Buffer::new(8);
        b.write(b"abcd");
        b.skip(100);
        assert!(b.is_empty());
        b.write(b"12345678");
        assert_eq!(b.capacity(), 8, "rewound buffer reuses its space");
    }

    #[test]
    fn slides_before_growing() {
        let mut b = Buffer::new(8);
        b.write(b"abcdef");
        b.skip(4);
        b.write(b"ghijk");
        assert_eq!(b.capacity(), 8);
        assert_eq!(b.bytes(), b"efghijk");
    }

    #[test]
    fn grows_to_power_of_two() {
        let mut b = Buffer::new(4);
        b.write(b"abcd");
        b.write(b"e");
        assert_eq!(b.capacity(), 8);
        b.write(&[0u8; 100]);
        assert_eq!(b.capacity(), 128);
        assert_eq!(&b.bytes()[..5], b"abcde");
    }

    #[test]
    fn grows_linearly_past_threshold() {
        let mut b = Buffer::new(0);
        b.write(&vec![1u8; GROW_LINEAR_THRESHOLD + 1]);
        assert_eq!(b.capacity(), 2 * GROW_LINEAR_THRESHOLD);
        b.write(&vec![2u8; GROW_LINEAR_THRESHOLD]);
        assert_eq!(b.capacity(), 3 * GROW_LINEAR_THRESHOLD);
    }

    #[test]
    fn reserve_and_flush() {
        let mut b = Buffer::new(2);
        let slot = b.reserve(3);
        slot.copy_from_slice(b"xyz");
        assert!(b.is_empty(), "reserved bytes are not readable yet");
        b.flush(3);
        assert_eq!(b.bytes(), b"xyz");
    }
}
